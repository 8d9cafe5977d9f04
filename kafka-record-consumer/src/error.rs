use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the pool, its leases and the connections they borrow.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Invalid or contradictory static configuration. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A blocking broker call was cancelled through the lease's wakeup.
    #[error("interrupted while communicating with the broker")]
    Interrupted,

    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Broker unreachable, protocol errors and rebalance invalidation.
    #[error("transport fault: {0}")]
    Transport(String),

    /// The downstream sink refused a batch or a parse failure.
    #[error("sink failure: {0}")]
    Sink(#[source] BoxError),

    #[error("consumer pool is closed")]
    PoolClosed,
}

impl ConsumerError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the connection that produced this error must be discarded
    /// instead of returning to the pool.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Kafka(e) => is_fatal_kafka_error(e),
            Self::Transport(_) => true,
            Self::Configuration(_) | Self::Interrupted | Self::Sink(_) | Self::PoolClosed => false,
        }
    }
}

fn is_fatal_kafka_error(e: &KafkaError) -> bool {
    match e {
        KafkaError::MessageConsumption(code) => !matches!(
            code,
            RDKafkaErrorCode::PartitionEOF
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::OffsetOutOfRange
        ),
        KafkaError::Canceled => false,
        _ => true,
    }
}

/// Per-message failure to turn payload bytes into records.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message has no payload")]
    EmptyPayload,

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object or an array of objects, found {0}")]
    NotARecord(&'static str),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("unsupported character encoding: {0}")]
    Unsupported(String),

    #[error("bytes are not valid {0}")]
    Malformed(&'static str),
}
