// Kafka module - pooled connections and the types they hand out
pub mod config;
pub mod connection;
pub mod context;
pub mod message;
pub mod metrics_consts;
pub mod types;

// Public API
pub use config::ConsumerConfigBuilder;
pub use connection::{
    first_offsets, BrokerConnection, ConnectionFactory, InterruptSignal, KafkaConnection,
    KafkaConnectionFactory,
};
pub use message::{MessageHeader, RawMessage};
pub use types::{ConnectionId, LeaseId, Partition};
