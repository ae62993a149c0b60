pub mod assignment;
pub mod batch;
pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod metrics_const;
pub mod offset_resolver;
pub mod pipeline;
pub mod types;

// Re-export commonly used types
pub use assignment::AssignmentContext;
pub use batch::MessageBatch;
pub use config::{Config, OffsetMode, SubscriptionPolicy};
pub use consumer::PipelineConsumer;
pub use error::{AssignmentError, ConfigError};
pub use message::{CommitFn, CommittableMessage, MessageOffset};
pub use offset_resolver::{BrokerOffsets, OffsetResolver};
pub use pipeline::{action_handler, ActionHandler, PipelineBuilder, RunningPipeline};
pub use types::{Partition, PartitionOffset, Watermark};
