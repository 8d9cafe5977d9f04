//! Offset Ledger - offsets a lease has consumed but not yet committed
//!
//! Owned by a single lease, so no synchronization. Tracks, per partition, the
//! first uncommitted offset (where to rewind to when a cycle is abandoned) and
//! the next offset to consume (what to commit once the cycle succeeds).

use std::collections::HashMap;

use tracing::warn;

use crate::kafka::types::Partition;

#[derive(Debug, Clone, Copy)]
struct PartitionRange {
    first: i64,
    next: i64,
}

#[derive(Debug, Default)]
pub struct OffsetLedger {
    partitions: HashMap<Partition, PartitionRange>,
    message_count: usize,
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a consumed message. Offsets arrive in order per partition.
    pub fn record(&mut self, partition: &Partition, offset: i64) {
        self.message_count += 1;
        match self.partitions.get_mut(partition) {
            Some(range) => {
                if offset < range.next {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset = offset,
                        next = range.next,
                        "Message offset went backwards within a cycle"
                    );
                    range.first = range.first.min(offset);
                } else {
                    range.next = offset + 1;
                }
            }
            None => {
                self.partitions.insert(
                    partition.clone(),
                    PartitionRange {
                        first: offset,
                        next: offset + 1,
                    },
                );
            }
        }
    }

    /// Next offset to consume for each partition, the values to commit.
    pub fn committable(&self) -> HashMap<Partition, i64> {
        self.partitions
            .iter()
            .map(|(partition, range)| (partition.clone(), range.next))
            .collect()
    }

    /// First uncommitted offset for each partition, where to rewind to.
    pub fn rewind_positions(&self) -> HashMap<Partition, i64> {
        self.partitions
            .iter()
            .map(|(partition, range)| (partition.clone(), range.first))
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.message_count
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn clear(&mut self) {
        self.partitions.clear();
        self.message_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_partition(num: i32) -> Partition {
        Partition::new("test-topic", num)
    }

    #[test]
    fn test_committable_is_next_offset() {
        let mut ledger = OffsetLedger::new();
        ledger.record(&test_partition(0), 10);
        ledger.record(&test_partition(0), 11);
        ledger.record(&test_partition(1), 3);

        let offsets = ledger.committable();
        assert_eq!(offsets[&test_partition(0)], 12);
        assert_eq!(offsets[&test_partition(1)], 4);
        assert_eq!(ledger.message_count(), 3);
    }

    #[test]
    fn test_rewind_positions_are_first_offsets() {
        let mut ledger = OffsetLedger::new();
        ledger.record(&test_partition(0), 10);
        ledger.record(&test_partition(0), 11);

        assert_eq!(ledger.rewind_positions()[&test_partition(0)], 10);
    }

    #[test]
    fn test_backwards_offset_widens_rewind_but_not_commit() {
        let mut ledger = OffsetLedger::new();
        ledger.record(&test_partition(0), 10);
        ledger.record(&test_partition(0), 8);

        assert_eq!(ledger.committable()[&test_partition(0)], 11);
        assert_eq!(ledger.rewind_positions()[&test_partition(0)], 8);
    }

    #[test]
    fn test_clear() {
        let mut ledger = OffsetLedger::new();
        ledger.record(&test_partition(0), 1);
        ledger.clear();

        assert!(ledger.is_empty());
        assert_eq!(ledger.message_count(), 0);
        assert!(ledger.committable().is_empty());
    }
}
