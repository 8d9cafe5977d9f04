use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assignment::PartitionAssignmentResolver;
use crate::error::ConsumerError;
use crate::kafka::connection::ConnectionFactory;
use crate::kafka::metrics_consts::TRIGGER_CYCLES;
use crate::kafka::types::LeaseId;
use crate::lease::LeaseSettings;
use crate::pool::{ConsumerPool, PoolSettings};
use crate::records::accumulator::AccumulatorConfig;
use crate::records::reader::RecordReader;
use crate::sink::RecordSink;

const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    WorkPerformed,
    /// Nothing could be done right now; wait before the next cycle
    Backoff,
}

impl CycleOutcome {
    fn as_label(self) -> &'static str {
        match self {
            Self::WorkPerformed => "work_performed",
            Self::Backoff => "backoff",
        }
    }
}

/// Everything the pool and its leases are configured with.
#[derive(Debug, Clone, Default)]
pub struct ConsumerSettings {
    pub pool: PoolSettings,
    pub lease: LeaseSettings,
    pub accumulator: AccumulatorConfig,
}

/// Runs one consume cycle at a time on behalf of a worker: obtain a lease,
/// poll while there is time and room, commit, return the lease.
///
/// The pool is built on the first cycle. When partitions are assigned
/// explicitly, the assignment is first checked against the partition counts
/// the cluster reports, and a mismatch closes the pool and backs off until a
/// later cycle tries again.
pub struct ConsumeTrigger {
    resolver: PartitionAssignmentResolver,
    factory: Arc<dyn ConnectionFactory>,
    reader: Arc<dyn RecordReader>,
    sink: Arc<dyn RecordSink>,
    pool_settings: PoolSettings,
    lease_settings: Arc<LeaseSettings>,
    accumulator_config: Arc<AccumulatorConfig>,
    pool: Mutex<Option<Arc<ConsumerPool>>>,
    scheduled: CancellationToken,
}

impl ConsumeTrigger {
    pub fn new(
        resolver: PartitionAssignmentResolver,
        factory: Arc<dyn ConnectionFactory>,
        reader: Arc<dyn RecordReader>,
        sink: Arc<dyn RecordSink>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            resolver,
            factory,
            reader,
            sink,
            pool_settings: settings.pool,
            lease_settings: Arc::new(settings.lease),
            accumulator_config: Arc::new(settings.accumulator),
            pool: Mutex::new(None),
            scheduled: CancellationToken::new(),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        !self.scheduled.is_cancelled()
    }

    /// Resolves once the trigger has been unscheduled.
    pub async fn unscheduled(&self) {
        self.scheduled.cancelled().await
    }

    /// Stops new cycles from starting and running ones from polling further.
    /// A cycle in progress returns its lease without committing.
    pub fn unschedule(&self) {
        self.scheduled.cancel();
    }

    /// The pool, when one has been built.
    pub fn current_pool(&self) -> Option<Arc<ConsumerPool>> {
        self.lock_pool().clone()
    }

    /// Runs a single cycle. Expected conditions such as no free lease or a
    /// refused commit become a backoff, never an error.
    pub async fn on_cycle(&self) -> CycleOutcome {
        let outcome = self.run_cycle().await;
        metrics::counter!(TRIGGER_CYCLES, "outcome" => outcome.as_label()).increment(1);
        outcome
    }

    async fn run_cycle(&self) -> CycleOutcome {
        if !self.is_scheduled() {
            return CycleOutcome::Backoff;
        }

        let Some(pool) = self.pool().await else {
            return CycleOutcome::Backoff;
        };

        let mut lease = match pool.obtain_lease(self.sink.clone()) {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!("No consumer lease available");
                return CycleOutcome::Backoff;
            }
            Err(e) => {
                error!(error = ?e, "Failed to obtain a consumer lease");
                return CycleOutcome::Backoff;
            }
        };
        let lease_id = lease.id();

        while self.is_scheduled() && lease.continue_polling() {
            if let Err(e) = lease.poll().await {
                log_cycle_error(lease_id, "polling", &e);
                return CycleOutcome::Backoff;
            }
        }

        if !self.is_scheduled() {
            info!(
                lease_id = %lease_id,
                "Unscheduled before commit, uncommitted messages will be redelivered"
            );
            return CycleOutcome::Backoff;
        }

        match lease.commit().await {
            Ok(true) => CycleOutcome::WorkPerformed,
            Ok(false) => CycleOutcome::Backoff,
            Err(e) => {
                log_cycle_error(lease_id, "committing", &e);
                CycleOutcome::Backoff
            }
        }
    }

    fn lock_pool(&self) -> MutexGuard<'_, Option<Arc<ConsumerPool>>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pool(&self) -> Option<Arc<ConsumerPool>> {
        if let Some(pool) = self.current_pool() {
            return Some(pool);
        }

        // no lock is held while building, the metadata query can block for
        // the whole comms timeout

        let pool = Arc::new(ConsumerPool::new(
            self.resolver.subscription().clone(),
            self.factory.clone(),
            self.pool_settings.clone(),
            self.lease_settings.clone(),
            self.accumulator_config.clone(),
            self.reader.clone(),
        ));

        if self.resolver.requires_partition_counts() {
            let topics = self.resolver.topics_to_verify();
            let counts = tokio::task::spawn_blocking({
                let pool = pool.clone();
                move || pool.partition_counts(&topics)
            })
            .await
            .unwrap_or_else(|e| {
                Err(ConsumerError::Transport(format!(
                    "partition count query did not complete: {e}"
                )))
            });

            if let Err(e) = counts.and_then(|counts| self.resolver.resolve(&counts)) {
                warn!(
                    error = ?e,
                    "Explicit partition assignment does not match the cluster, will retry"
                );
                pool.close();
                return None;
            }
        }

        let mut slot = self.lock_pool();
        if !self.is_scheduled() {
            pool.close();
            return None;
        }
        if let Some(existing) = slot.as_ref() {
            // another worker finished building first
            pool.close();
            return Some(existing.clone());
        }

        info!(
            max_leases = pool.max_leases(),
            subscription = ?pool.subscription(),
            "Created consumer pool"
        );
        *slot = Some(pool.clone());
        Some(pool)
    }

    /// Waits up to `grace` for outstanding leases to finish on their own,
    /// then wakes up whatever is still running. Does not wait for the woken
    /// leases to return.
    pub async fn interrupt_active_leases(&self, grace: Duration) {
        let Some(pool) = self.current_pool() else {
            return;
        };

        let deadline = Instant::now() + grace;
        while pool.outstanding_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_CHECK_INTERVAL).await;
        }

        let remaining = pool.active_leases();
        if remaining.is_empty() {
            return;
        }

        warn!(
            leases = remaining.len(),
            "Leases still active after {grace:?}, forcing wakeup"
        );
        for lease in &remaining {
            lease.wakeup();
        }
    }

    /// Unschedules and closes the pool. Leases still out close their
    /// connections as they come back.
    pub fn close(&self) {
        self.unschedule();
        if let Some(pool) = self.lock_pool().take() {
            pool.close();
        }
    }
}

fn log_cycle_error(lease_id: LeaseId, stage: &str, e: &ConsumerError) {
    match e {
        ConsumerError::Interrupted => warn!(
            lease_id = %lease_id,
            "Interrupted while {stage}, discarding partially received data"
        ),
        ConsumerError::Sink(_) => error!(
            lease_id = %lease_id,
            error = ?e,
            "Sink failed while {stage}, cycle aborted without commit"
        ),
        _ => error!(
            lease_id = %lease_id,
            error = ?e,
            "Failed while {stage}, cycle aborted without commit"
        ),
    }
}
