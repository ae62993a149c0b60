// Metric name constants for the consumer pipeline.

/// Counter: records received from the broker and fed into a pipeline
pub const MESSAGES_CONSUMED: &str = "kafka_pipeline_messages_consumed";

/// Counter: records whose payload failed to deserialize (skipped)
pub const PARSE_FAILURES: &str = "kafka_pipeline_parse_failures";

/// Counter: user handler invocations that returned an error
pub const HANDLER_FAILURES: &str = "kafka_pipeline_handler_failures";

/// Counter: batches emitted, labeled by trigger ("size" or "time")
pub const BATCHES_EMITTED: &str = "kafka_pipeline_batches_emitted";

/// Counter: commit attempts at the terminal stage, labeled by status
pub const COMMITS: &str = "kafka_pipeline_commits";

/// Counter: partition assignments resolved, labeled by status
pub const ASSIGNMENTS_RESOLVED: &str = "kafka_pipeline_assignments_resolved";
