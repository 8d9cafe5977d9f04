//! Consumer Pool - a bounded set of broker connections lent out as leases
//!
//! All bookkeeping (idle connections, outstanding leases, unclaimed
//! partitions, the closed flag) sits behind one mutex that is only held for
//! check-out and check-in. A connection is either idle in the pool or held by
//! exactly one lease, so the connections themselves need no locking.
//! Connections are opened and closed outside the critical section.
//!
//! With explicitly owned partitions every connection is bound to a single
//! partition, and a partition is bound to at most one connection. Leases on
//! the same pool then never read the same partition, and the partition that
//! has waited longest is served first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::assignment::Subscription;
use crate::error::ConsumerError;
use crate::kafka::connection::{BrokerConnection, ConnectionFactory, InterruptSignal};
use crate::kafka::metrics_consts::{
    POOL_CONNECTION_EVENTS, POOL_LEASE_MISSES, POOL_OUTSTANDING_LEASES,
};
use crate::kafka::types::{ConnectionId, LeaseId, Partition};
use crate::lease::{ConsumerLease, LeaseHandle, LeaseSettings};
use crate::records::accumulator::{AccumulatorConfig, BatchAccumulator};
use crate::records::reader::RecordReader;
use crate::sink::RecordSink;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Upper bound on outstanding leases, and so on open connections
    pub max_leases: usize,
    /// Idle connections older than this are closed on the next check-out
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_leases: 4,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

struct IdleConnection {
    connection: Box<dyn BrokerConnection>,
    partition: Option<Partition>,
    since: Instant,
}

struct Outstanding {
    interrupt: Arc<InterruptSignal>,
    partition: Option<Partition>,
}

/// An owned partition with no connection bound to it.
struct Unclaimed {
    partition: Partition,
    since: Instant,
}

#[derive(Clone, Copy)]
enum CloseReason {
    Evicted,
    Displaced,
    PoolClosed,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Evicted => "evicted",
            Self::Displaced => "displaced",
            Self::PoolClosed => "closed",
        }
    }
}

enum Checkout {
    Idle(IdleConnection),
    Open {
        id: ConnectionId,
        interrupt: Arc<InterruptSignal>,
        partition: Option<Partition>,
    },
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleConnection>,
    outstanding: HashMap<LeaseId, Outstanding>,
    unclaimed: VecDeque<Unclaimed>,
    closed: bool,
    next_lease_id: u64,
    next_connection_id: u64,
}

impl PoolState {
    fn take_expired(&mut self, now: Instant, idle_timeout: Duration) -> Vec<Box<dyn BrokerConnection>> {
        let (expired, fresh): (Vec<_>, Vec<_>) = self
            .idle
            .drain(..)
            .partition(|idle| now.duration_since(idle.since) >= idle_timeout);
        self.idle = fresh;
        expired
            .into_iter()
            .map(|idle| self.unbind(idle.connection, idle.partition, idle.since))
            .collect()
    }

    /// Hands a connection's partition back to the unclaimed queue.
    fn unbind(
        &mut self,
        connection: Box<dyn BrokerConnection>,
        partition: Option<Partition>,
        since: Instant,
    ) -> Box<dyn BrokerConnection> {
        if let Some(partition) = partition {
            self.unclaimed.push_back(Unclaimed { partition, since });
        }
        connection
    }

    fn open_connections(&self) -> usize {
        self.idle.len() + self.outstanding.len()
    }

    fn next_connection_id(&mut self) -> ConnectionId {
        self.next_connection_id += 1;
        ConnectionId(self.next_connection_id)
    }

    // most recently returned first, so rarely used connections age out
    fn take_newest_idle(&mut self) -> Option<IdleConnection> {
        self.idle.pop()
    }

    fn take_oldest_idle(&mut self) -> Option<IdleConnection> {
        let oldest = self
            .idle
            .iter()
            .enumerate()
            .min_by_key(|(_, idle)| idle.since)
            .map(|(index, _)| index)?;
        Some(self.idle.remove(oldest))
    }

    /// Picks the owned partition that has waited longest, whether it still
    /// has an idle connection or none at all. Opening a connection for an
    /// unclaimed partition at the connection limit closes the oldest idle one;
    /// that connection is returned so it can be closed outside the lock.
    fn check_out_partition(
        &mut self,
        max_connections: usize,
    ) -> Option<(Checkout, Option<Box<dyn BrokerConnection>>)> {
        let oldest_idle = self.idle.iter().map(|idle| idle.since).min();
        let serve_unclaimed = match (self.unclaimed.front(), oldest_idle) {
            (Some(unclaimed), Some(idle)) => unclaimed.since <= idle,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if !serve_unclaimed {
            return self.take_oldest_idle().map(|idle| (Checkout::Idle(idle), None));
        }

        let unclaimed = self.unclaimed.pop_front()?;
        let displaced = if self.open_connections() >= max_connections {
            self.take_oldest_idle()
                .map(|idle| self.unbind(idle.connection, idle.partition, idle.since))
        } else {
            None
        };
        let id = self.next_connection_id();
        Some((
            Checkout::Open {
                id,
                interrupt: InterruptSignal::new(),
                partition: Some(unclaimed.partition),
            },
            displaced,
        ))
    }
}

/// State shared between the pool and the leases it has issued.
pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    settings: PoolSettings,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // bookkeeping stays consistent across a panicking holder
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a lease's connection back. Faulted connections, and any
    /// connection returned after the pool closed, are closed instead and
    /// their partition becomes unclaimed.
    pub(crate) fn check_in(
        &self,
        lease_id: LeaseId,
        connection: Option<Box<dyn BrokerConnection>>,
        discard: bool,
    ) {
        let rejected = {
            let mut state = self.lock();
            let partition = state
                .outstanding
                .remove(&lease_id)
                .and_then(|outstanding| outstanding.partition);
            metrics::gauge!(POOL_OUTSTANDING_LEASES).set(state.outstanding.len() as f64);

            match connection {
                Some(connection) if !discard && !state.closed => {
                    // a wakeup that arrived after the lease finished must not
                    // abort the next borrower
                    connection.interrupt_signal().take();
                    state.idle.push(IdleConnection {
                        connection,
                        partition,
                        since: Instant::now(),
                    });
                    None
                }
                Some(connection) => Some(state.unbind(connection, partition, Instant::now())),
                None => {
                    if let Some(partition) = partition {
                        state.unclaimed.push_back(Unclaimed {
                            partition,
                            since: Instant::now(),
                        });
                    }
                    None
                }
            }
        };

        if let Some(mut connection) = rejected {
            let event = if discard { "discarded" } else { "closed" };
            info!(
                lease_id = %lease_id,
                connection_id = %connection.id(),
                "Connection {event} on check-in"
            );
            connection.close();
            metrics::counter!(POOL_CONNECTION_EVENTS, "event" => event).increment(1);
        } else {
            debug!(lease_id = %lease_id, "Lease returned to pool");
        }
    }
}

pub struct ConsumerPool {
    shared: Arc<PoolShared>,
    subscription: Subscription,
    // explicitly owned partitions are lent to one connection at a time
    lends_partitions: bool,
    factory: Arc<dyn ConnectionFactory>,
    lease_settings: Arc<LeaseSettings>,
    accumulator_config: Arc<AccumulatorConfig>,
    reader: Arc<dyn RecordReader>,
}

impl ConsumerPool {
    pub fn new(
        subscription: Subscription,
        factory: Arc<dyn ConnectionFactory>,
        settings: PoolSettings,
        lease_settings: Arc<LeaseSettings>,
        accumulator_config: Arc<AccumulatorConfig>,
        reader: Arc<dyn RecordReader>,
    ) -> Self {
        let lends_partitions = matches!(subscription, Subscription::ExplicitPartitions(_));
        let now = Instant::now();
        let state = PoolState {
            unclaimed: subscription
                .owned_partitions()
                .into_iter()
                .map(|partition| Unclaimed {
                    partition,
                    since: now,
                })
                .collect(),
            ..PoolState::default()
        };

        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(state),
                settings,
            }),
            subscription,
            lends_partitions,
            factory,
            lease_settings,
            accumulator_config,
            reader,
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn max_leases(&self) -> usize {
        self.shared.settings.max_leases
    }

    /// What a connection opened for `partition` subscribes to. Without a
    /// partition under explicit ownership it is bound to nothing.
    fn connection_subscription(&self, partition: Option<&Partition>) -> Subscription {
        if self.lends_partitions {
            Subscription::of_partitions(partition)
        } else {
            self.subscription.clone()
        }
    }

    /// Lends out a connection, reusing an idle one when possible.
    ///
    /// Returns `Ok(None)` when the pool is closed, every connection is already
    /// leased, or every explicitly owned partition is held by another lease;
    /// callers should back off and try again later.
    pub fn obtain_lease(
        &self,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Option<ConsumerLease>, ConsumerError> {
        let (lease_id, checkout, expired, displaced) = {
            let mut state = self.shared.lock();
            if state.closed {
                return Ok(None);
            }

            let expired = state.take_expired(Instant::now(), self.shared.settings.idle_timeout);

            let checkout = if state.outstanding.len() >= self.shared.settings.max_leases {
                None
            } else if self.lends_partitions {
                state.check_out_partition(self.shared.settings.max_leases)
            } else {
                let checkout = match state.take_newest_idle() {
                    Some(idle) => Checkout::Idle(idle),
                    None => Checkout::Open {
                        id: state.next_connection_id(),
                        interrupt: InterruptSignal::new(),
                        partition: None,
                    },
                };
                Some((checkout, None))
            };

            let Some((checkout, displaced)) = checkout else {
                drop(state);
                close_all(expired, CloseReason::Evicted);
                metrics::counter!(POOL_LEASE_MISSES).increment(1);
                return Ok(None);
            };

            state.next_lease_id += 1;
            let lease_id = LeaseId(state.next_lease_id);
            let (interrupt, partition) = match &checkout {
                Checkout::Idle(idle) => (idle.connection.interrupt_signal(), idle.partition.clone()),
                Checkout::Open {
                    interrupt,
                    partition,
                    ..
                } => (interrupt.clone(), partition.clone()),
            };
            state.outstanding.insert(
                lease_id,
                Outstanding {
                    interrupt,
                    partition,
                },
            );
            metrics::gauge!(POOL_OUTSTANDING_LEASES).set(state.outstanding.len() as f64);
            (lease_id, checkout, expired, displaced)
        };

        close_all(expired, CloseReason::Evicted);
        close_all(displaced.into_iter().collect(), CloseReason::Displaced);

        let connection = match checkout {
            Checkout::Idle(idle) => idle.connection,
            Checkout::Open {
                id,
                interrupt,
                partition,
            } => {
                let subscription = self.connection_subscription(partition.as_ref());
                match self.factory.create(id, &subscription, interrupt) {
                    Ok(connection) => {
                        info!(
                            lease_id = %lease_id,
                            connection_id = %id,
                            partition = ?partition,
                            "Opened new broker connection"
                        );
                        metrics::counter!(POOL_CONNECTION_EVENTS, "event" => "created")
                            .increment(1);
                        connection
                    }
                    Err(e) => {
                        self.shared.check_in(lease_id, None, true);
                        return Err(e);
                    }
                }
            }
        };

        let accumulator = BatchAccumulator::new(self.accumulator_config.clone(), self.reader.clone());
        Ok(Some(ConsumerLease::new(
            lease_id,
            connection,
            accumulator,
            sink,
            self.lease_settings.clone(),
            self.shared.clone(),
        )))
    }
    /// Live partition count of a subscribed topic, asked through an idle
    /// connection or a freshly opened one.
    pub fn get_partition_count(&self, topic: &str) -> Result<usize, ConsumerError> {
        let checkout = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(ConsumerError::PoolClosed);
            }
            match state.take_newest_idle() {
                Some(idle) => Checkout::Idle(idle),
                None => Checkout::Open {
                    id: state.next_connection_id(),
                    interrupt: InterruptSignal::new(),
                    partition: None,
                },
            }
        };

        let (mut connection, partition, since) = match checkout {
            Checkout::Idle(idle) => (idle.connection, idle.partition, idle.since),
            Checkout::Open {
                id,
                interrupt,
                partition,
            } => {
                let subscription = self.connection_subscription(partition.as_ref());
                let connection = self.factory.create(id, &subscription, interrupt)?;
                metrics::counter!(POOL_CONNECTION_EVENTS, "event" => "created").increment(1);
                (connection, partition, Instant::now())
            }
        };

        let count = connection.partition_count(topic);

        // keep the connection for the next lease if there is room for it
        let rejected = {
            let mut state = self.shared.lock();
            let unbound = self.lends_partitions && partition.is_none();
            if count.as_ref().is_err_and(|e| e.is_fatal())
                || unbound
                || state.closed
                || state.open_connections() >= self.shared.settings.max_leases
            {
                Some(state.unbind(connection, partition, since))
            } else {
                state.idle.push(IdleConnection {
                    connection,
                    partition,
                    since,
                });
                None
            }
        };
        if let Some(mut connection) = rejected {
            connection.close();
            metrics::counter!(POOL_CONNECTION_EVENTS, "event" => "closed").increment(1);
        }

        count
    }

    /// Partition counts for several topics, keyed by topic.
    pub fn partition_counts(&self, topics: &[String]) -> Result<HashMap<String, usize>, ConsumerError> {
        topics
            .iter()
            .map(|topic| Ok((topic.clone(), self.get_partition_count(topic)?)))
            .collect()
    }

    /// Closes idle connections past the idle timeout. Returns how many.
    pub fn evict_idle(&self) -> usize {
        let expired = {
            let mut state = self.shared.lock();
            state.take_expired(Instant::now(), self.shared.settings.idle_timeout)
        };
        let count = expired.len();
        close_all(expired, CloseReason::Evicted);
        count
    }

    /// Handles for every lease currently checked out, for forced wakeups.
    pub fn active_leases(&self) -> Vec<LeaseHandle> {
        self.shared
            .lock()
            .outstanding
            .iter()
            .map(|(id, outstanding)| LeaseHandle::new(*id, outstanding.interrupt.clone()))
            .collect()
    }

    pub fn outstanding_count(&self) -> usize {
        self.shared.lock().outstanding.len()
    }

    pub fn idle_count(&self) -> usize {
        self.shared.lock().idle.len()
    }

    /// Explicitly owned partitions that no connection is bound to.
    pub fn unclaimed_partitions(&self) -> Vec<Partition> {
        self.shared
            .lock()
            .unclaimed
            .iter()
            .map(|unclaimed| unclaimed.partition.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Closes every idle connection and refuses further leases. Outstanding
    /// leases are not interrupted; their connections are closed as they come
    /// back. Idempotent.
    pub fn close(&self) {
        let idle = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.idle)
        };

        info!(
            idle_connections = idle.len(),
            outstanding_leases = self.outstanding_count(),
            "Closing consumer pool"
        );
        close_all(
            idle.into_iter().map(|idle| idle.connection).collect(),
            CloseReason::PoolClosed,
        );
    }
}

impl Drop for ConsumerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn close_all(connections: Vec<Box<dyn BrokerConnection>>, reason: CloseReason) {
    for mut connection in connections {
        match reason {
            CloseReason::Evicted => {
                debug!(connection_id = %connection.id(), "Evicting idle connection")
            }
            CloseReason::Displaced => debug!(
                connection_id = %connection.id(),
                "Closing idle connection to serve a waiting partition"
            ),
            CloseReason::PoolClosed => {}
        }
        connection.close();
        metrics::counter!(POOL_CONNECTION_EVENTS, "event" => reason.as_str()).increment(1);
    }
}

impl std::fmt::Debug for ConsumerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ConsumerPool")
            .field("max_leases", &self.shared.settings.max_leases)
            .field("idle", &state.idle.len())
            .field("outstanding", &state.outstanding.len())
            .field("unclaimed", &state.unclaimed.len())
            .field("closed", &state.closed)
            .finish()
    }
}
