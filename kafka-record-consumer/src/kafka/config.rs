use std::time::Duration;

use rdkafka::ClientConfig;
use tracing::warn;

/// Kafka client configuration builder with the defaults every pooled
/// connection needs.
///
/// Offsets are only ever committed by a lease after its batches were handed
/// downstream, so auto commit and auto offset store are always disabled.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Sets: enable.auto.commit=false, enable.auto.offset.store=false,
    /// enable.partition.eof=false, socket.timeout.ms.
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "60000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// earliest, latest or none (error when the group has no stored offset)
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        let policy = match policy {
            "none" => "error",
            other => other,
        };
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Honoring transactions reads with read_committed isolation, otherwise
    /// messages of aborted transactions are delivered as well.
    pub fn with_honor_transactions(mut self, honor: bool) -> Self {
        let level = if honor {
            "read_committed"
        } else {
            "read_uncommitted"
        };
        self.config.set("isolation.level", level);
        self
    }

    /// Timeout for broker round trips and metadata requests
    pub fn with_comms_timeout(mut self, timeout: Duration) -> Self {
        self.config
            .set("socket.timeout.ms", timeout.as_millis().to_string());
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.config.set("client.id", client_id);
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    /// Apply passthrough client properties last. A passthrough value wins over
    /// one already set by the builder, and the collision is logged.
    pub fn with_passthrough<'a>(
        mut self,
        properties: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        for (key, value) in properties {
            if let Some(existing) = self.config.get(key) {
                if existing != value {
                    warn!(
                        property = key,
                        previous = existing,
                        value = value,
                        "Passthrough Kafka property overrides a value set by the consumer pool"
                    );
                }
            }
            self.config.set(key, value);
        }
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
