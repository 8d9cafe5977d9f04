//! Shared test utilities for the kafka-record-consumer crate.
//!
//! An in-memory stand-in for the cluster, connections over it, and a sink
//! that records what it was handed. Used by unit tests and by the
//! integration tests under `tests/`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::assignment::Subscription;
use crate::error::ConsumerError;
use crate::kafka::connection::{
    first_offsets, BrokerConnection, ConnectionFactory, InterruptSignal,
};
use crate::kafka::message::RawMessage;
use crate::kafka::types::{ConnectionId, Partition};
use crate::records::output::{ParseFailure, SealedBatch};
use crate::sink::RecordSink;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct BrokerState {
    logs: BTreeMap<Partition, Vec<RawMessage>>,
    committed: HashMap<Partition, i64>,
    commit_calls: Vec<HashMap<Partition, i64>>,
    partition_counts: HashMap<String, usize>,
    failing_commits: usize,
    failing_connects: usize,
    // polls left before one is interrupted midway
    interrupt_poll_after: Option<usize>,
    metadata_delay: Option<Duration>,
    connections_created: usize,
    connections_closed: usize,
}

/// Partitioned logs and committed offsets for one consumer group.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    block_polls: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends a message and returns its offset.
    pub fn produce_with(
        &self,
        topic: &str,
        partition: i32,
        payload: Option<&[u8]>,
        build: impl FnOnce(RawMessage) -> RawMessage,
    ) -> i64 {
        let partition = Partition::new(topic, partition);
        let mut state = lock(&self.state);
        let log = state.logs.entry(partition.clone()).or_default();
        let offset = log.len() as i64;
        log.push(build(RawMessage::new(
            partition,
            offset,
            payload.map(<[u8]>::to_vec),
        )));
        offset
    }

    pub fn produce(&self, topic: &str, partition: i32, payload: &[u8]) -> i64 {
        self.produce_with(topic, partition, Some(payload), |message| message)
    }

    pub fn produce_json(&self, topic: &str, partition: i32, json: &str) -> i64 {
        self.produce(topic, partition, json.as_bytes())
    }

    pub fn set_partition_count(&self, topic: &str, count: usize) {
        lock(&self.state)
            .partition_counts
            .insert(topic.to_string(), count);
    }

    /// The next `count` commits fail with a transport fault.
    pub fn fail_next_commits(&self, count: usize) {
        lock(&self.state).failing_commits = count;
    }

    /// The next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        lock(&self.state).failing_connects = count;
    }

    /// The poll after the next `skip` polls is interrupted once it has
    /// buffered messages, and seeks back over them like a real consumer.
    pub fn interrupt_poll_midway(&self, skip: usize) {
        lock(&self.state).interrupt_poll_after = Some(skip);
    }

    fn take_midway_interrupt(&self) -> bool {
        let mut state = lock(&self.state);
        match state.interrupt_poll_after {
            Some(0) => {
                state.interrupt_poll_after = None;
                true
            }
            Some(remaining) => {
                state.interrupt_poll_after = Some(remaining - 1);
                false
            }
            None => false,
        }
    }

    /// Partition count queries block their thread for `delay`.
    pub fn delay_metadata(&self, delay: Duration) {
        lock(&self.state).metadata_delay = Some(delay);
    }

    /// While set, polls wait for an interrupt and ignore their timeout.
    pub fn block_polls(&self, block: bool) {
        self.block_polls.store(block, Ordering::SeqCst);
    }

    pub fn committed_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        lock(&self.state)
            .committed
            .get(&Partition::new(topic, partition))
            .copied()
    }

    /// Every commit attempt, including the ones that failed.
    pub fn commit_calls(&self) -> Vec<HashMap<Partition, i64>> {
        lock(&self.state).commit_calls.clone()
    }

    pub fn connections_created(&self) -> usize {
        lock(&self.state).connections_created
    }

    pub fn connections_closed(&self) -> usize {
        lock(&self.state).connections_closed
    }

    fn fetch(
        &self,
        subscription: &Subscription,
        positions: &mut HashMap<Partition, i64>,
        max_records: usize,
    ) -> Vec<RawMessage> {
        let state = lock(&self.state);
        let mut messages = Vec::new();

        for (partition, log) in &state.logs {
            if !subscription.matches(partition.topic(), partition.partition_number()) {
                continue;
            }
            let position = positions
                .entry(partition.clone())
                .or_insert_with(|| state.committed.get(partition).copied().unwrap_or(0));

            while messages.len() < max_records {
                let Some(message) = usize::try_from(*position)
                    .ok()
                    .and_then(|index| log.get(index))
                else {
                    break;
                };
                messages.push(message.clone());
                *position += 1;
            }
        }
        messages
    }
}

pub struct InMemoryConnection {
    id: ConnectionId,
    broker: Arc<InMemoryBroker>,
    subscription: Subscription,
    interrupt: Arc<InterruptSignal>,
    positions: HashMap<Partition, i64>,
    max_poll_records: usize,
    closed: bool,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<RawMessage>, ConsumerError> {
        if self.closed {
            return Err(ConsumerError::Transport("connection is closed".to_string()));
        }
        if self.interrupt.take() {
            return Err(ConsumerError::Interrupted);
        }

        if self.broker.block_polls.load(Ordering::SeqCst) {
            self.interrupt.wait().await;
            self.interrupt.take();
            return Err(ConsumerError::Interrupted);
        }

        let interrupted_midway = self.broker.take_midway_interrupt();
        let messages = self
            .broker
            .fetch(&self.subscription, &mut self.positions, self.max_poll_records);
        if interrupted_midway {
            self.positions.extend(first_offsets(&messages));
            return Err(ConsumerError::Interrupted);
        }
        if !messages.is_empty() {
            return Ok(messages);
        }

        tokio::select! {
            _ = self.interrupt.wait() => {
                self.interrupt.take();
                Err(ConsumerError::Interrupted)
            }
            _ = tokio::time::sleep(timeout) => Ok(Vec::new()),
        }
    }

    async fn commit_offsets(
        &mut self,
        offsets: &HashMap<Partition, i64>,
    ) -> Result<(), ConsumerError> {
        let mut state = lock(&self.broker.state);
        state.commit_calls.push(offsets.clone());
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(ConsumerError::Transport(
                "simulated commit failure".to_string(),
            ));
        }
        state
            .committed
            .extend(offsets.iter().map(|(p, o)| (p.clone(), *o)));
        Ok(())
    }

    fn rewind(&mut self, positions: &HashMap<Partition, i64>) -> Result<(), ConsumerError> {
        self.positions
            .extend(positions.iter().map(|(p, o)| (p.clone(), *o)));
        Ok(())
    }

    fn partition_count(&self, topic: &str) -> Result<usize, ConsumerError> {
        let delay = lock(&self.broker.state).metadata_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        lock(&self.broker.state)
            .partition_counts
            .get(topic)
            .copied()
            .ok_or_else(|| ConsumerError::configuration(format!("unknown topic {topic}")))
    }

    fn interrupt_signal(&self) -> Arc<InterruptSignal> {
        self.interrupt.clone()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            lock(&self.broker.state).connections_closed += 1;
        }
    }
}

pub struct InMemoryConnectionFactory {
    broker: Arc<InMemoryBroker>,
    max_poll_records: usize,
}

impl InMemoryConnectionFactory {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            max_poll_records: 500,
        }
    }

    pub fn with_max_poll_records(mut self, max_poll_records: usize) -> Self {
        self.max_poll_records = max_poll_records;
        self
    }
}

impl ConnectionFactory for InMemoryConnectionFactory {
    fn create(
        &self,
        id: ConnectionId,
        subscription: &Subscription,
        interrupt: Arc<InterruptSignal>,
    ) -> Result<Box<dyn BrokerConnection>, ConsumerError> {
        {
            let mut state = lock(&self.broker.state);
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(ConsumerError::Transport(
                    "simulated connection failure".to_string(),
                ));
            }
            state.connections_created += 1;
        }

        Ok(Box::new(InMemoryConnection {
            id,
            broker: self.broker.clone(),
            subscription: subscription.clone(),
            interrupt,
            positions: HashMap::new(),
            max_poll_records: self.max_poll_records,
            closed: false,
        }))
    }
}

/// Keeps every unit it is handed.
#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<SealedBatch>>,
    parse_failures: Mutex<Vec<ParseFailure>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every emit fails.
    pub fn fail_emits(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<SealedBatch> {
        lock(&self.batches).clone()
    }

    pub fn parse_failures(&self) -> Vec<ParseFailure> {
        lock(&self.parse_failures).clone()
    }

    pub fn record_count(&self) -> usize {
        lock(&self.batches).iter().map(|b| b.records.len()).sum()
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn emit(&self, batch: SealedBatch) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("simulated sink failure");
        }
        lock(&self.batches).push(batch);
        Ok(())
    }

    async fn emit_parse_failure(&self, failure: ParseFailure) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("simulated sink failure");
        }
        lock(&self.parse_failures).push(failure);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_connection_resumes_from_committed_offsets() {
        let broker = InMemoryBroker::new();
        for i in 0..3 {
            broker.produce_json("events", 0, &format!(r#"{{"id": {i}}}"#));
        }
        let factory = InMemoryConnectionFactory::new(broker.clone());
        let subscription = Subscription::ExplicitTopics(["events".to_string()].into());

        let mut first = factory
            .create(ConnectionId(1), &subscription, InterruptSignal::new())
            .unwrap();
        let messages = first.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(messages.len(), 3);
        first
            .commit_offsets(&HashMap::from([(Partition::new("events", 0), 2)]))
            .await
            .unwrap();

        let mut second = factory
            .create(ConnectionId(2), &subscription, InterruptSignal::new())
            .unwrap();
        let messages = second.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].offset(), 2);
        assert!(second.poll(Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_interrupted_midway_redelivers_buffered_messages() {
        let broker = InMemoryBroker::new();
        broker.produce_json("events", 0, "{}");
        broker.produce_json("events", 1, "{}");
        broker.interrupt_poll_midway(0);
        let factory = InMemoryConnectionFactory::new(broker.clone());
        let subscription = Subscription::ExplicitTopics(["events".to_string()].into());

        let mut connection = factory
            .create(ConnectionId(1), &subscription, InterruptSignal::new())
            .unwrap();
        assert!(matches!(
            connection.poll(Duration::from_millis(10)).await,
            Err(ConsumerError::Interrupted)
        ));

        let messages = connection.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_partitions_filter_the_log() {
        let broker = InMemoryBroker::new();
        broker.produce_json("events", 0, "{}");
        broker.produce_json("events", 1, "{}");
        let factory = InMemoryConnectionFactory::new(broker.clone());
        let subscription = Subscription::ExplicitPartitions(BTreeMap::from([(
            "events".to_string(),
            [1].into(),
        )]));

        let mut connection = factory
            .create(ConnectionId(1), &subscription, InterruptSignal::new())
            .unwrap();
        let messages = connection.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].partition_number(), 1);
    }
}
