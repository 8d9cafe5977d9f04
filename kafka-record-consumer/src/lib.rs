//! Kafka record consumer.
//!
//! A bounded pool of broker connections is lent out as leases to worker
//! tasks. Each lease polls its connection, groups messages into record
//! batches, streams sealed batches to a sink and commits offsets only once
//! everything it consumed has been handed off. Delivery is at least once.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use
//! `{e:#}` (one line) or `error = ?e` (structured, with `Caused by:` sections)
//! so root causes stay visible. Avoid `{}` / `%e` for errors.

pub mod assignment;
pub mod config;
pub mod error;
pub mod kafka;
pub mod lease;
pub mod metrics_server;
pub mod offsets;
pub mod pool;
pub mod records;
pub mod service;
pub mod sink;
pub mod test_utils;
pub mod trigger;

// Re-export commonly used types for convenience
pub use assignment::{PartitionAssignmentResolver, Subscription};
pub use error::ConsumerError;
pub use lease::{ConsumerLease, LeaseHandle, LeaseSettings, LeaseState};
pub use pool::{ConsumerPool, PoolSettings};
pub use sink::RecordSink;
pub use trigger::{ConsumeTrigger, ConsumerSettings, CycleOutcome};
