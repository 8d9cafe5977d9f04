use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::assignment::{anchored, Subscription};
use crate::error::ConsumerError;
use crate::kafka::context::ConnectionContext;
use crate::kafka::message::RawMessage;
use crate::kafka::metrics_consts::{CONNECTION_KAFKA_ERROR, CONNECTION_MESSAGES_POLLED};
use crate::kafka::types::{ConnectionId, Partition};

/// Out-of-band cancellation for a connection's blocking calls.
///
/// Triggering is sticky: a call that is in flight aborts with
/// `ConsumerError::Interrupted`, and when nothing is in flight the next call
/// aborts instead.
#[derive(Debug, Default)]
pub struct InterruptSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl InterruptSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Consumes a pending request, returning whether there was one
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    /// Resolves once an interrupt has been requested
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// One physical session with the cluster, bound to a single subscription.
///
/// A connection is only ever used by one lease at a time. The exception is the
/// interrupt signal, which the shutdown path may trigger concurrently with a
/// blocked `poll`.
#[async_trait]
pub trait BrokerConnection: Send {
    fn id(&self) -> ConnectionId;

    /// Waits up to `timeout` for messages. An empty result is not an error.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<RawMessage>, ConsumerError>;

    /// Synchronously commits the next offset to consume for each partition.
    async fn commit_offsets(
        &mut self,
        offsets: &HashMap<Partition, i64>,
    ) -> Result<(), ConsumerError>;

    /// Moves the consume position back so uncommitted messages are delivered
    /// again by the next poll.
    fn rewind(&mut self, positions: &HashMap<Partition, i64>) -> Result<(), ConsumerError>;

    fn partition_count(&self, topic: &str) -> Result<usize, ConsumerError>;

    fn interrupt_signal(&self) -> Arc<InterruptSignal>;

    fn interrupt(&self) {
        self.interrupt_signal().trigger();
    }

    /// Releases the session. Idempotent.
    fn close(&mut self);
}

/// Offset of the earliest message per partition, where a consumer has to seek
/// back to for `messages` to be delivered again.
pub fn first_offsets(messages: &[RawMessage]) -> HashMap<Partition, i64> {
    let mut firsts: HashMap<Partition, i64> = HashMap::new();
    for message in messages {
        firsts
            .entry(message.partition().clone())
            .and_modify(|first| *first = (*first).min(message.offset()))
            .or_insert(message.offset());
    }
    firsts
}

/// Opens new connections on pool misses.
pub trait ConnectionFactory: Send + Sync {
    fn create(
        &self,
        id: ConnectionId,
        subscription: &Subscription,
        interrupt: Arc<InterruptSignal>,
    ) -> Result<Box<dyn BrokerConnection>, ConsumerError>;
}

/// rdkafka backed connection.
pub struct KafkaConnection {
    id: ConnectionId,
    consumer: StreamConsumer<ConnectionContext>,
    interrupt: Arc<InterruptSignal>,

    // bumped by the context whenever partitions are revoked
    revocations: Arc<AtomicU64>,
    // revocation count when the first uncommitted message was polled
    uncommitted_since: Option<u64>,

    max_poll_records: usize,
    comms_timeout: Duration,
    closed: bool,
}

impl KafkaConnection {
    pub fn new(
        id: ConnectionId,
        client_config: &ClientConfig,
        subscription: &Subscription,
        interrupt: Arc<InterruptSignal>,
        max_poll_records: usize,
        comms_timeout: Duration,
    ) -> Result<Self, ConsumerError> {
        let context = ConnectionContext::new(id);
        let revocations = context.revocations();

        let consumer: StreamConsumer<ConnectionContext> =
            client_config.create_with_context(context)?;

        match subscription {
            Subscription::ExplicitTopics(topics) => {
                let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
                consumer.subscribe(&topics)?;
            }
            Subscription::TopicPattern(pattern) => {
                let pattern = anchored(pattern.as_str());
                consumer.subscribe(&[pattern.as_str()])?;
            }
            Subscription::ExplicitPartitions(assignment) => {
                let mut list = TopicPartitionList::new();
                for (topic, partitions) in assignment {
                    for partition in partitions {
                        list.add_partition_offset(topic, *partition, Offset::Stored)?;
                    }
                }
                consumer.assign(&list)?;
            }
        }

        info!(connection = %id, ?subscription, "Created Kafka connection");

        Ok(Self {
            id,
            consumer,
            interrupt,
            revocations,
            uncommitted_since: None,
            max_poll_records,
            comms_timeout,
            closed: false,
        })
    }

    fn seek_to(&self, positions: &HashMap<Partition, i64>) -> Result<(), ConsumerError> {
        for (partition, offset) in positions {
            self.consumer.seek(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*offset),
                self.comms_timeout,
            )?;
        }
        Ok(())
    }

    // Ok(()) for conditions the next poll recovers from on its own
    fn handle_kafka_error(&self, e: KafkaError) -> Result<(), ConsumerError> {
        match &e {
            KafkaError::MessageConsumption(code) => {
                match code {
                    RDKafkaErrorCode::PartitionEOF => {
                        metrics::counter!(
                            CONNECTION_KAFKA_ERROR,
                            &[("level", "info"), ("error", "partition_eof")]
                        )
                        .increment(1);
                    }
                    RDKafkaErrorCode::OperationTimedOut => {
                        metrics::counter!(
                            CONNECTION_KAFKA_ERROR,
                            &[("level", "info"), ("error", "op_timed_out")]
                        )
                        .increment(1);
                    }
                    RDKafkaErrorCode::OffsetOutOfRange => {
                        // auto.offset.reset seeks to the head or tail of the partition
                        warn!(connection = %self.id, "Offset out of range - seeking to configured offset reset policy");
                        metrics::counter!(
                            CONNECTION_KAFKA_ERROR,
                            &[("level", "info"), ("error", "offset_out_of_range")]
                        )
                        .increment(1);
                    }
                    _ => {
                        warn!(connection = %self.id, "Kafka consumer error: {code:?}");
                        metrics::counter!(
                            CONNECTION_KAFKA_ERROR,
                            &[("level", "warn"), ("error", "consumer")]
                        )
                        .increment(1);
                        return Err(e.into());
                    }
                }
                Ok(())
            }

            KafkaError::MessageConsumptionFatal(code) => {
                error!(connection = %self.id, "Fatal Kafka consumer error: {code:?}");
                metrics::counter!(
                    CONNECTION_KAFKA_ERROR,
                    &[("level", "fatal"), ("error", "consumer")]
                )
                .increment(1);
                Err(e.into())
            }

            KafkaError::Global(code) => {
                warn!(connection = %self.id, "Global Kafka error: {code:?}");
                metrics::counter!(
                    CONNECTION_KAFKA_ERROR,
                    &[("level", "warn"), ("error", "global")]
                )
                .increment(1);
                Err(e.into())
            }

            _ => {
                error!(connection = %self.id, "Unexpected Kafka error: {e:?}");
                metrics::counter!(
                    CONNECTION_KAFKA_ERROR,
                    &[("level", "fatal"), ("error", "unexpected")]
                )
                .increment(1);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl BrokerConnection for KafkaConnection {
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

        let interrupt = self.interrupt.clone();
        let deadline = Instant::now() + timeout;
        let mut messages = Vec::new();

        let outcome = loop {
            tokio::select! {
                biased;

                _ = interrupt.wait() => {
                    interrupt.take();
                    break Err(ConsumerError::Interrupted);
                }

                next = tokio::time::timeout_at(deadline, self.consumer.recv()) => {
                    match next {
                        // poll window elapsed
                        Err(_) => break Ok(()),
                        Ok(Ok(borrowed)) => {
                            messages.push(RawMessage::from_borrowed_message(&borrowed));
                            if messages.len() >= self.max_poll_records {
                                break Ok(());
                            }
                        }
                        Ok(Err(e)) => {
                            if let Err(e) = self.handle_kafka_error(e) {
                                break Err(e);
                            }
                        }
                    }
                }
            }
        };

        if let Err(e) = outcome {
            // the fetch position is already past the messages dropped here
            if !messages.is_empty() {
                let positions = first_offsets(&messages);
                if let Err(seek_err) = self.seek_to(&positions) {
                    warn!(
                        connection = %self.id,
                        dropped = messages.len(),
                        "Failed to seek back over an aborted poll: {seek_err}"
                    );
                    return Err(ConsumerError::Transport(format!(
                        "could not seek back over {} messages dropped by an aborted poll: {seek_err}",
                        messages.len()
                    )));
                }
                debug!(
                    connection = %self.id,
                    dropped = messages.len(),
                    ?positions,
                    "Sought back over an aborted poll"
                );
            }
            return Err(e);
        }

        if !messages.is_empty() {
            metrics::counter!(CONNECTION_MESSAGES_POLLED).increment(messages.len() as u64);
            if self.uncommitted_since.is_none() {
                self.uncommitted_since = Some(self.revocations.load(Ordering::SeqCst));
            }
        }

        Ok(messages)
    }

    async fn commit_offsets(
        &mut self,
        offsets: &HashMap<Partition, i64>,
    ) -> Result<(), ConsumerError> {
        if self.interrupt.take() {
            return Err(ConsumerError::Interrupted);
        }
        if offsets.is_empty() {
            return Ok(());
        }

        // partitions moved since these messages were polled, another member may own them now
        if let Some(since) = self.uncommitted_since {
            if self.revocations.load(Ordering::SeqCst) != since {
                self.uncommitted_since = None;
                return Err(ConsumerError::Transport(
                    "partition assignment was revoked since the messages were polled".to_string(),
                ));
            }
        }

        let mut list = TopicPartitionList::new();
        for (partition, next_offset) in offsets {
            list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*next_offset),
            )?;
        }

        self.consumer.commit(&list, CommitMode::Sync)?;
        self.uncommitted_since = None;
        Ok(())
    }

    fn rewind(&mut self, positions: &HashMap<Partition, i64>) -> Result<(), ConsumerError> {
        self.seek_to(positions)?;
        self.uncommitted_since = None;
        Ok(())
    }

    fn partition_count(&self, topic: &str) -> Result<usize, ConsumerError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), self.comms_timeout)?;

        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| ConsumerError::Transport(format!("no metadata for topic {topic}")))?;

        if let Some(e) = topic_metadata.error() {
            return Err(ConsumerError::Transport(format!(
                "metadata error for topic {topic}: {:?}",
                RDKafkaErrorCode::from(e)
            )));
        }

        Ok(topic_metadata.partitions().len())
    }

    fn interrupt_signal(&self) -> Arc<InterruptSignal> {
        self.interrupt.clone()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.consumer.unsubscribe();
        if let Err(e) = self.consumer.unassign() {
            debug!(connection = %self.id, "Failed to unassign partitions on close: {e}");
        }
        info!(connection = %self.id, "Closed Kafka connection");
    }
}

/// Creates `KafkaConnection`s from a shared client configuration.
pub struct KafkaConnectionFactory {
    client_config: ClientConfig,
    max_poll_records: usize,
    comms_timeout: Duration,
}

impl KafkaConnectionFactory {
    pub fn new(client_config: ClientConfig, max_poll_records: usize, comms_timeout: Duration) -> Self {
        Self {
            client_config,
            max_poll_records,
            comms_timeout,
        }
    }
}

impl ConnectionFactory for KafkaConnectionFactory {
    fn create(
        &self,
        id: ConnectionId,
        subscription: &Subscription,
        interrupt: Arc<InterruptSignal>,
    ) -> Result<Box<dyn BrokerConnection>, ConsumerError> {
        let connection = KafkaConnection::new(
            id,
            &self.client_config,
            subscription,
            interrupt,
            self.max_poll_records,
            self.comms_timeout,
        )?;
        Ok(Box::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interrupt_before_wait_is_sticky() {
        let signal = InterruptSignal::new();
        signal.trigger();

        // resolves immediately because the request is already pending
        signal.wait().await;
        assert!(signal.take());
        assert!(!signal.is_requested());
    }

    #[test]
    fn test_first_offsets_per_partition() {
        let messages = vec![
            RawMessage::new(Partition::new("events", 0), 7, None),
            RawMessage::new(Partition::new("events", 1), 3, None),
            RawMessage::new(Partition::new("events", 0), 5, None),
            RawMessage::new(Partition::new("events", 0), 8, None),
        ];

        let firsts = first_offsets(&messages);
        assert_eq!(firsts.len(), 2);
        assert_eq!(firsts[&Partition::new("events", 0)], 5);
        assert_eq!(firsts[&Partition::new("events", 1)], 3);
        assert!(first_offsets(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_wakes_waiter() {
        let signal = InterruptSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        tokio::task::yield_now().await;
        signal.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap();
    }
}
