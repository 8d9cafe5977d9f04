use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::kafka::metrics_consts::CONNECTION_REBALANCE_EVENTS;
use crate::kafka::types::{ConnectionId, Partition};

/// librdkafka callback context for a pooled connection.
///
/// Counts partition revocations so the owning connection can refuse to commit
/// offsets for messages polled under an assignment that no longer holds.
pub struct ConnectionContext {
    connection_id: ConnectionId,
    revocations: Arc<AtomicU64>,
}

impl ConnectionContext {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            revocations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn revocations(&self) -> Arc<AtomicU64> {
        self.revocations.clone()
    }
}

fn partition_names(list: &TopicPartitionList) -> Vec<String> {
    list.elements()
        .into_iter()
        .map(|elem| Partition::from(elem).to_string())
        .collect()
}

impl ClientContext for ConnectionContext {}

impl ConsumerContext for ConnectionContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // cooperative-sticky sends these frequently without moving anything
                if partitions.count() == 0 {
                    debug!(connection = %self.connection_id, "Skipping empty revoke rebalance");
                    return;
                }

                info!(
                    connection = %self.connection_id,
                    partitions = ?partition_names(partitions),
                    "Revoking {} partitions",
                    partitions.count()
                );
                self.revocations.fetch_add(1, Ordering::SeqCst);
                metrics::counter!(CONNECTION_REBALANCE_EVENTS, "event_type" => "revoke")
                    .increment(1);
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    connection = %self.connection_id,
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!(connection = %self.connection_id, "Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!(connection = %self.connection_id, "Skipping empty assign rebalance");
                    return;
                }

                info!(
                    connection = %self.connection_id,
                    partitions = ?partition_names(partitions),
                    "Assigned {} partitions",
                    partitions.count()
                );
                metrics::counter!(CONNECTION_REBALANCE_EVENTS, "event_type" => "assign")
                    .increment(1);
            }
            Rebalance::Revoke(_) => {
                debug!(connection = %self.connection_id, "Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!(connection = %self.connection_id, "Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(_) => {
                debug!(
                    connection = %self.connection_id,
                    "Committed offsets for {} partitions",
                    offsets.count()
                );
            }
            Err(e) => {
                warn!(connection = %self.connection_id, "Failed to commit offsets: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revocation_counter_is_shared() {
        let context = ConnectionContext::new(ConnectionId(7));
        let counter = context.revocations();

        context.revocations.fetch_add(1, Ordering::SeqCst);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
