//! Consumer Lease - exclusive borrow of one pooled connection for a cycle
//!
//! The lease is a scoped guard: however it goes out of scope, the connection
//! goes back to the pool (or is discarded when it faulted), partial batches
//! are dropped and the consume position is rewound to the first uncommitted
//! offset, so the next cycle sees the same messages again.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ConsumerError;
use crate::kafka::connection::{BrokerConnection, InterruptSignal};
use crate::kafka::metrics_consts::{
    BATCHES_EMITTED, BATCH_RECORD_COUNT, LEASE_COMMITS, LEASE_MESSAGES_DISCARDED, LEASE_WAKEUPS,
};
use crate::kafka::types::LeaseId;
use crate::offsets::OffsetLedger;
use crate::pool::PoolShared;
use crate::records::accumulator::BatchAccumulator;
use crate::records::output::Emission;
use crate::sink::RecordSink;

#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// Polling stops and a commit is due once this much time has passed
    /// since the lease was issued or last committed
    pub max_uncommitted_time: Duration,
    pub max_records_per_cycle: usize,
    /// Upper bound for a single broker poll
    pub poll_timeout: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            max_uncommitted_time: Duration::from_secs(1),
            max_records_per_cycle: 10_000,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Idle,
    Polling,
    ReadyToCommit,
    Faulted,
    Closed,
}

pub struct ConsumerLease {
    id: LeaseId,
    connection: Option<Box<dyn BrokerConnection>>,
    interrupt: Arc<InterruptSignal>,
    accumulator: BatchAccumulator,
    ledger: OffsetLedger,
    sink: Arc<dyn RecordSink>,
    settings: Arc<LeaseSettings>,
    state: LeaseState,
    commit_deadline: Instant,
    records_since_commit: usize,
    discard_connection: bool,
    pool: Arc<PoolShared>,
}

impl ConsumerLease {
    pub(crate) fn new(
        id: LeaseId,
        connection: Box<dyn BrokerConnection>,
        accumulator: BatchAccumulator,
        sink: Arc<dyn RecordSink>,
        settings: Arc<LeaseSettings>,
        pool: Arc<PoolShared>,
    ) -> Self {
        let interrupt = connection.interrupt_signal();
        let commit_deadline = Instant::now() + settings.max_uncommitted_time;
        Self {
            id,
            connection: Some(connection),
            interrupt,
            accumulator,
            ledger: OffsetLedger::new(),
            sink,
            settings,
            state: LeaseState::Idle,
            commit_deadline,
            records_since_commit: 0,
            discard_connection: false,
            pool,
        }
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    pub fn records_since_commit(&self) -> usize {
        self.records_since_commit
    }

    pub fn handle(&self) -> LeaseHandle {
        LeaseHandle {
            id: self.id,
            interrupt: self.interrupt.clone(),
        }
    }

    /// Whether another poll is worthwhile before committing.
    pub fn continue_polling(&mut self) -> bool {
        match self.state {
            LeaseState::Faulted | LeaseState::Closed | LeaseState::ReadyToCommit => return false,
            LeaseState::Idle | LeaseState::Polling => {}
        }

        if self.interrupt.is_requested() {
            return false;
        }

        let within_time = Instant::now() < self.commit_deadline;
        let within_records = self.records_since_commit < self.settings.max_records_per_cycle;
        if within_time && within_records {
            return true;
        }

        debug!(
            lease_id = %self.id,
            records = self.records_since_commit,
            time_exhausted = !within_time,
            "Lease is ready to commit"
        );
        self.state = LeaseState::ReadyToCommit;
        false
    }

    /// Polls the connection once and streams every batch that sealed to the
    /// sink. Returns the number of messages received.
    pub async fn poll(&mut self) -> Result<usize, ConsumerError> {
        self.ensure_active()?;
        self.state = LeaseState::Polling;

        let connection = self.connection.as_mut().ok_or(ConsumerError::PoolClosed)?;
        let result = connection.poll(self.settings.poll_timeout).await;
        let messages = match result {
            Ok(messages) => messages,
            Err(e) => return Err(self.fault(e)),
        };

        let now = Instant::now();
        let mut emissions = Vec::new();
        for message in &messages {
            self.ledger.record(message.partition(), message.offset());
            emissions.extend(self.accumulator.absorb(message, now));
        }
        self.records_since_commit += messages.len();
        emissions.extend(self.accumulator.take_expired(now));

        self.emit_all(emissions).await?;
        Ok(messages.len())
    }

    /// Flushes every partial batch, then commits the offsets of all messages
    /// absorbed since the last commit.
    ///
    /// `Ok(false)` means the broker refused the commit. Nothing is committed
    /// and the messages will be delivered again, so the caller should back off.
    pub async fn commit(&mut self) -> Result<bool, ConsumerError> {
        self.ensure_active()?;

        let remaining = self.accumulator.flush_all();
        self.emit_all(remaining).await?;

        // a wakeup that landed after the last poll still cancels the cycle
        if self.interrupt.is_requested() {
            return Err(self.fault(ConsumerError::Interrupted));
        }

        if self.ledger.is_empty() {
            self.start_next_cycle();
            return Ok(true);
        }

        let offsets = self.ledger.committable();
        let connection = self.connection.as_mut().ok_or(ConsumerError::PoolClosed)?;
        let result = connection.commit_offsets(&offsets).await;

        match result {
            Ok(()) => {
                metrics::counter!(LEASE_COMMITS, "status" => "success").increment(1);
                debug!(
                    lease_id = %self.id,
                    partitions = offsets.len(),
                    messages = self.ledger.message_count(),
                    "Committed offsets"
                );
                self.ledger.clear();
                self.start_next_cycle();
                Ok(true)
            }
            Err(ConsumerError::Interrupted) => {
                metrics::counter!(LEASE_COMMITS, "status" => "interrupted").increment(1);
                Err(self.fault(ConsumerError::Interrupted))
            }
            Err(e) => {
                metrics::counter!(LEASE_COMMITS, "status" => "failed").increment(1);
                warn!(
                    lease_id = %self.id,
                    messages = self.ledger.message_count(),
                    "Offset commit failed, messages will be redelivered: {e:#}"
                );
                self.fault(e);
                Ok(false)
            }
        }
    }

    /// Forces an in-flight broker call to abort. Only used on shutdown.
    pub fn wakeup(&self) {
        self.handle().wakeup();
    }

    /// Returns the connection to the pool. Dropping the lease does the same.
    pub fn close(mut self) {
        self.release();
    }

    fn ensure_active(&self) -> Result<(), ConsumerError> {
        match self.state {
            LeaseState::Faulted | LeaseState::Closed => Err(ConsumerError::Transport(format!(
                "{} can no longer be used",
                self.id
            ))),
            _ => Ok(()),
        }
    }

    fn start_next_cycle(&mut self) {
        self.records_since_commit = 0;
        self.commit_deadline = Instant::now() + self.settings.max_uncommitted_time;
        self.state = LeaseState::Idle;
    }

    fn fault(&mut self, error: ConsumerError) -> ConsumerError {
        if error.is_fatal() {
            self.discard_connection = true;
        }
        self.state = LeaseState::Faulted;
        error
    }

    async fn emit_all(&mut self, emissions: Vec<Emission>) -> Result<(), ConsumerError> {
        for emission in emissions {
            let result = match emission {
                Emission::Batch(batch) => {
                    let record_count = batch.records.len();
                    let result = self.sink.emit(batch).await;
                    if result.is_ok() {
                        metrics::counter!(BATCHES_EMITTED).increment(1);
                        metrics::histogram!(BATCH_RECORD_COUNT).record(record_count as f64);
                    }
                    result
                }
                Emission::ParseFailure(failure) => self.sink.emit_parse_failure(failure).await,
            };

            if let Err(e) = result {
                return Err(self.fault(ConsumerError::Sink(e.into())));
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.state == LeaseState::Closed {
            return;
        }

        let dropped_records = self.accumulator.discard();
        let mut discard_connection = self.discard_connection;

        if !self.ledger.is_empty() {
            metrics::counter!(LEASE_MESSAGES_DISCARDED).increment(self.ledger.message_count() as u64);
            info!(
                lease_id = %self.id,
                messages = self.ledger.message_count(),
                dropped_records = dropped_records,
                "Discarding uncommitted messages"
            );

            if let (Some(connection), false) = (self.connection.as_mut(), discard_connection) {
                if let Err(e) = connection.rewind(&self.ledger.rewind_positions()) {
                    warn!(
                        lease_id = %self.id,
                        connection_id = %connection.id(),
                        "Failed to rewind connection, discarding it: {e:#}"
                    );
                    discard_connection = true;
                }
            }
            self.ledger.clear();
        }

        self.state = LeaseState::Closed;
        self.pool
            .check_in(self.id, self.connection.take(), discard_connection);
    }
}

impl Drop for ConsumerLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Shutdown-side view of an outstanding lease.
#[derive(Debug, Clone)]
pub struct LeaseHandle {
    id: LeaseId,
    interrupt: Arc<InterruptSignal>,
}

impl LeaseHandle {
    pub(crate) fn new(id: LeaseId, interrupt: Arc<InterruptSignal>) -> Self {
        Self { id, interrupt }
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn wakeup(&self) {
        info!(lease_id = %self.id, "Waking up lease");
        metrics::counter!(LEASE_WAKEUPS).increment(1);
        self.interrupt.trigger();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::assignment::Subscription;
    use crate::pool::{ConsumerPool, PoolSettings};
    use crate::records::accumulator::AccumulatorConfig;
    use crate::records::reader::JsonRecordReader;
    use crate::test_utils::{InMemoryBroker, InMemoryConnectionFactory, RecordingSink};

    fn pool_with(broker: &Arc<InMemoryBroker>, settings: LeaseSettings) -> ConsumerPool {
        ConsumerPool::new(
            Subscription::ExplicitTopics(["events".to_string()].into()),
            Arc::new(InMemoryConnectionFactory::new(broker.clone())),
            PoolSettings::default(),
            Arc::new(settings),
            Arc::new(AccumulatorConfig::default()),
            Arc::new(JsonRecordReader),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_polling_stops_when_time_budget_elapses() {
        let broker = InMemoryBroker::new();
        let pool = pool_with(
            &broker,
            LeaseSettings {
                max_uncommitted_time: Duration::from_millis(500),
                max_records_per_cycle: 1_000,
                poll_timeout: Duration::from_millis(100),
            },
        );
        let sink = Arc::new(RecordingSink::new());

        let mut lease = pool.obtain_lease(sink).unwrap().unwrap();
        assert!(lease.continue_polling());

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(lease.continue_polling());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(!lease.continue_polling());
        assert_eq!(lease.state(), LeaseState::ReadyToCommit);
        assert_eq!(lease.records_since_commit(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_polling_stops_at_record_limit() {
        let broker = InMemoryBroker::new();
        for i in 0..3 {
            broker.produce_json("events", 0, &format!(r#"{{"id": {i}}}"#));
        }
        let pool = pool_with(
            &broker,
            LeaseSettings {
                max_uncommitted_time: Duration::from_secs(60),
                max_records_per_cycle: 3,
                poll_timeout: Duration::from_millis(100),
            },
        );
        let sink = Arc::new(RecordingSink::new());

        let mut lease = pool.obtain_lease(sink).unwrap().unwrap();
        assert!(lease.continue_polling());
        assert_eq!(lease.poll().await.unwrap(), 3);
        assert!(!lease.continue_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_resets_the_cycle() {
        let broker = InMemoryBroker::new();
        broker.produce_json("events", 0, r#"{"id": 1}"#);
        let pool = pool_with(&broker, LeaseSettings::default());
        let sink = Arc::new(RecordingSink::new());

        let mut lease = pool.obtain_lease(sink.clone()).unwrap().unwrap();
        lease.poll().await.unwrap();
        assert!(lease.commit().await.unwrap());

        assert_eq!(lease.state(), LeaseState::Idle);
        assert_eq!(lease.records_since_commit(), 0);
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(broker.committed_offset("events", 0), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wakeup_during_blocked_poll_never_commits() {
        let broker = InMemoryBroker::new();
        broker.produce_json("events", 0, r#"{"id": 1}"#);
        let pool = pool_with(&broker, LeaseSettings::default());
        let sink = Arc::new(RecordingSink::new());

        let mut lease = pool.obtain_lease(sink).unwrap().unwrap();
        assert_eq!(lease.poll().await.unwrap(), 1);

        // the connection now ignores its poll timeout
        broker.block_polls(true);
        let handle = lease.handle();
        let waker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            handle.wakeup();
        });

        let result = lease.poll().await;
        assert!(matches!(result, Err(ConsumerError::Interrupted)));
        assert_eq!(lease.state(), LeaseState::Faulted);
        assert!(!lease.continue_polling());
        assert!(lease.commit().await.is_err());
        drop(lease);
        waker.await.unwrap();

        assert!(broker.commit_calls().is_empty());
        // interruption is not fatal, the connection is reused
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_aborts_cycle_without_commit() {
        let broker = InMemoryBroker::new();
        broker.produce_json("events", 0, r#"{"id": 1}"#);
        let pool = pool_with(&broker, LeaseSettings::default());
        let sink = Arc::new(RecordingSink::new());
        sink.fail_emits(true);

        let mut lease = pool.obtain_lease(sink.clone()).unwrap().unwrap();
        lease.poll().await.unwrap();
        assert!(matches!(
            lease.commit().await,
            Err(ConsumerError::Sink(_))
        ));
        drop(lease);
        assert!(broker.commit_calls().is_empty());

        // the rewound connection delivers the message again
        sink.fail_emits(false);
        let mut lease = pool.obtain_lease(sink.clone()).unwrap().unwrap();
        assert_eq!(lease.poll().await.unwrap(), 1);
        assert!(lease.commit().await.unwrap());
        assert_eq!(broker.connections_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_commit_discards_fatal_connection() {
        let broker = InMemoryBroker::new();
        broker.produce_json("events", 0, r#"{"id": 1}"#);
        broker.fail_next_commits(1);
        let pool = pool_with(&broker, LeaseSettings::default());
        let sink = Arc::new(RecordingSink::new());

        let mut lease = pool.obtain_lease(sink).unwrap().unwrap();
        lease.poll().await.unwrap();
        assert!(!lease.commit().await.unwrap());
        assert_eq!(lease.state(), LeaseState::Faulted);
        lease.close();

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(broker.connections_closed(), 1);
        assert_eq!(broker.committed_offset("events", 0), None);
    }
}
