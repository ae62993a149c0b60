use rdkafka::error::KafkaError;
use thiserror::Error;

/// Invalid policy or stage parameters. Fatal at construction time,
/// never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("channel capacity must be at least 1, got {0}")]
    ChannelCapacity(usize),

    #[error("buffer size must be greater than 1, got {0}")]
    BufferSize(usize),

    #[error("batch size must be greater than 1, got {0}")]
    BatchSize(usize),

    #[error("unrecognized offset mode: {0}")]
    OffsetMode(String),

    #[error("invalid date offset: {0}")]
    DateOffset(String),
}

/// Errors that can occur while resolving starting offsets for a
/// partition assignment.
///
/// These allow callers to distinguish failure modes; any of them aborts
/// the whole assignment attempt and recovery is delegated to the broker
/// client's own rebalance/retry loop.
#[derive(Error, Debug)]
pub enum AssignmentError {
    /// Timeout occurred during a broker query
    #[error("timeout during {operation} for partition {partition}")]
    Timeout {
        operation: &'static str,
        partition: i32,
    },

    /// Broker returned an error
    #[error("kafka error during {operation} for partition {partition}: {source}")]
    Kafka {
        operation: &'static str,
        partition: i32,
        #[source]
        source: KafkaError,
    },
}

impl AssignmentError {
    pub(crate) fn from_kafka(operation: &'static str, partition: i32, source: KafkaError) -> Self {
        if is_timeout_error(&source) {
            AssignmentError::Timeout {
                operation,
                partition,
            }
        } else {
            AssignmentError::Kafka {
                operation,
                partition,
                source,
            }
        }
    }

    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            AssignmentError::Timeout { .. } => "timeout",
            AssignmentError::Kafka { .. } => "kafka_error",
        }
    }

    /// Returns true if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, AssignmentError::Timeout { .. })
    }
}

/// Check if a KafkaError represents a timeout condition
fn is_timeout_error(e: &KafkaError) -> bool {
    match e {
        KafkaError::Global(code) | KafkaError::MessageConsumption(code) => {
            matches!(
                code,
                rdkafka::types::RDKafkaErrorCode::RequestTimedOut
                    | rdkafka::types::RDKafkaErrorCode::OperationTimedOut
            )
        }
        _ => false,
    }
}
