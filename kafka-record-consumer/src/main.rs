use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kafka_record_consumer::{
    config::Config, metrics_server, service::KafkaRecordConsumerService,
};

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let handle = metrics_server::setup_metrics_recorder()?;
    let router = metrics_server::router(handle);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = metrics_server::serve(router, &bind).await {
            error!("Metrics server stopped: {e:#}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    // batches go to stdout, logs to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    info!("Starting Kafka record consumer");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let service = KafkaRecordConsumerService::new(config)
        .context("Failed to create Kafka record consumer service")?;

    // Run the service (this blocks until shutdown)
    service.run().await?;

    server_handle.abort();

    Ok(())
}
