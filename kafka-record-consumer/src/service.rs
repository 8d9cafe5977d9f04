use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::kafka::KafkaConnectionFactory;
use crate::records::reader::JsonRecordReader;
use crate::sink::{JsonLinesSink, RecordSink};
use crate::trigger::{ConsumeTrigger, CycleOutcome};

/// Runs one worker task per lease, each driving the trigger cycle until
/// shutdown.
pub struct KafkaRecordConsumerService {
    trigger: Arc<ConsumeTrigger>,
    workers: usize,
    backoff: Duration,
    shutdown_grace: Duration,
}

impl KafkaRecordConsumerService {
    /// Create a new service from configuration, writing batches to stdout
    pub fn new(config: Config) -> Result<Self> {
        let sink: Arc<dyn RecordSink> = Arc::new(JsonLinesSink::new(std::io::stdout()));
        Self::with_sink(config, sink)
    }

    pub fn with_sink(config: Config, sink: Arc<dyn RecordSink>) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for service with consumer topic '{}' and group '{}'",
                config.kafka_consumer_topic, config.kafka_consumer_group
            )
        })?;

        let resolver = config.resolver()?;
        let settings = config.consumer_settings()?;
        let factory = Arc::new(KafkaConnectionFactory::new(
            config.client_config()?,
            config.max_poll_records,
            config.comms_timeout(),
        ));

        let trigger = ConsumeTrigger::new(
            resolver,
            factory,
            Arc::new(JsonRecordReader),
            sink,
            settings,
        );

        Ok(Self::with_trigger(
            Arc::new(trigger),
            config.max_leases,
            config.backoff(),
            config.shutdown_grace(),
        ))
    }

    /// Create a service around an existing trigger (useful for testing)
    pub fn with_trigger(
        trigger: Arc<ConsumeTrigger>,
        workers: usize,
        backoff: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            trigger,
            workers,
            backoff,
            shutdown_grace,
        }
    }

    pub fn trigger(&self) -> &Arc<ConsumeTrigger> {
        &self.trigger
    }

    /// Run the service until ctrl+c
    pub async fn run(self) -> Result<()> {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl+c signal: {e:#}");
            }
        };
        self.run_with_shutdown(ctrl_c).await
    }

    /// Run the service with a custom shutdown signal (useful for testing)
    pub async fn run_with_shutdown(self, shutdown_signal: impl Future<Output = ()>) -> Result<()> {
        info!(workers = self.workers, "Starting Kafka record consumer service");

        let handles: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|worker| tokio::spawn(run_worker(worker, self.trigger.clone(), self.backoff)))
            .collect();

        shutdown_signal.await;
        info!("Received shutdown signal, shutting down gracefully...");

        self.trigger.unschedule();
        self.trigger
            .interrupt_active_leases(self.shutdown_grace)
            .await;

        // woken leases unblock asynchronously, give them one more grace period
        match tokio::time::timeout(self.shutdown_grace, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Consumer worker panicked: {e:#}");
                    }
                }
                info!("Consumer workers stopped");
            }
            Err(_) => error!(
                "Consumer worker shutdown timed out after {:?}",
                self.shutdown_grace
            ),
        }

        self.trigger.close();
        info!("Kafka record consumer service stopped");
        Ok(())
    }
}

async fn run_worker(worker: usize, trigger: Arc<ConsumeTrigger>, backoff: Duration) {
    debug!(worker = worker, "Consumer worker started");

    while trigger.is_scheduled() {
        if trigger.on_cycle().await == CycleOutcome::WorkPerformed {
            continue;
        }

        tokio::select! {
            _ = trigger.unscheduled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    debug!(worker = worker, "Consumer worker stopped");
}
