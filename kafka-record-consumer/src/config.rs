use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use regex::Regex;

use crate::assignment::{PartitionAssignmentResolver, StaticAssignment, TopicSelection};
use crate::error::ConsumerError;
use crate::kafka::ConsumerConfigBuilder;
use crate::lease::LeaseSettings;
use crate::pool::PoolSettings;
use crate::records::accumulator::AccumulatorConfig;
use crate::records::encoding::{HeaderEncoding, KeyEncoding};
use crate::trigger::ConsumerSettings;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "kafka-record-consumer")]
    pub kafka_consumer_group: String,

    // Comma separated topic names, or a regex when KAFKA_TOPIC_TYPE=pattern
    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "names")]
    pub kafka_topic_type: String,

    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String,

    // Explicit partition ownership, e.g. "host-a=0,1;host-b=2,3"
    pub kafka_partition_assignments: Option<String>,

    // Identity of this node in KAFKA_PARTITION_ASSIGNMENTS
    pub hostname: Option<String>,

    // Passthrough client properties, e.g. "fetch.min.bytes=1024,check.crcs=true"
    pub kafka_consumer_properties: Option<String>,

    #[envconfig(default = "true")]
    pub honor_transactions: bool,

    #[envconfig(default = "60000")] // 1 minute
    pub comms_timeout_ms: u64,

    // Consumer processing configuration
    #[envconfig(default = "10000")]
    pub max_poll_records: usize,

    #[envconfig(default = "1000")]
    pub max_uncommitted_time_ms: u64,

    #[envconfig(default = "100")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "4")]
    pub max_leases: usize,

    #[envconfig(default = "300")] // 5 minutes
    pub connection_idle_timeout_secs: u64,

    #[envconfig(default = "1000")]
    pub backoff_ms: u64,

    #[envconfig(default = "5000")]
    pub shutdown_grace_ms: u64,

    // Batching configuration
    #[envconfig(default = "10000")]
    pub max_batch_records: usize,

    #[envconfig(default = "5000")]
    pub max_batch_wait_ms: u64,

    #[envconfig(default = "false")]
    pub separate_by_key: bool,

    #[envconfig(default = "utf-8")]
    pub key_attribute_encoding: String,

    pub header_name_regex: Option<String>,

    #[envconfig(default = "UTF-8")]
    pub header_encoding: String,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Checks everything that can be checked without a broker.
    pub fn validate(&self) -> Result<(), ConsumerError> {
        self.resolver()?;
        self.consumer_settings()?;
        self.passthrough_properties()?;

        if self.max_leases == 0 {
            return Err(ConsumerError::configuration("MAX_LEASES must be at least 1"));
        }
        if self.max_poll_records == 0 || self.max_batch_records == 0 {
            return Err(ConsumerError::configuration(
                "MAX_POLL_RECORDS and MAX_BATCH_RECORDS must be at least 1",
            ));
        }
        if !matches!(
            self.kafka_consumer_offset_reset.as_str(),
            "earliest" | "latest" | "none"
        ) {
            return Err(ConsumerError::configuration(format!(
                "unknown offset reset policy '{}', expected earliest, latest or none",
                self.kafka_consumer_offset_reset
            )));
        }
        Ok(())
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn local_host(&self) -> String {
        self.hostname
            .clone()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn comms_timeout(&self) -> Duration {
        Duration::from_millis(self.comms_timeout_ms)
    }

    pub fn resolver(&self) -> Result<PartitionAssignmentResolver, ConsumerError> {
        let topics = TopicSelection::parse(&self.kafka_topic_type, &self.kafka_consumer_topic)?;
        let assignment = match &self.kafka_partition_assignments {
            Some(declaration) => StaticAssignment::parse(declaration)?,
            None => None,
        };
        PartitionAssignmentResolver::new(topics, assignment, &self.local_host())
    }

    /// Parses KAFKA_CONSUMER_PROPERTIES into key/value pairs.
    pub fn passthrough_properties(&self) -> Result<Vec<(String, String)>, ConsumerError> {
        let Some(properties) = &self.kafka_consumer_properties else {
            return Ok(Vec::new());
        };

        properties
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (key, value) = entry.split_once('=').ok_or_else(|| {
                    ConsumerError::configuration(format!(
                        "invalid Kafka property '{entry}', expected key=value"
                    ))
                })?;
                Ok((key.trim().to_string(), value.trim().to_string()))
            })
            .collect()
    }

    pub fn client_config(&self) -> Result<ClientConfig, ConsumerError> {
        let passthrough = self.passthrough_properties()?;

        Ok(
            ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
                .with_tls(self.kafka_tls)
                .with_offset_reset(&self.kafka_consumer_offset_reset)
                .with_honor_transactions(self.honor_transactions)
                .with_comms_timeout(self.comms_timeout())
                .with_client_id(&self.local_host())
                .with_passthrough(passthrough.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .build(),
        )
    }

    pub fn consumer_settings(&self) -> Result<ConsumerSettings, ConsumerError> {
        let header_pattern = self
            .header_name_regex
            .as_deref()
            .filter(|pattern| !pattern.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| ConsumerError::configuration(format!("invalid HEADER_NAME_REGEX: {e}")))?;

        let header_encoding: HeaderEncoding = self
            .header_encoding
            .parse()
            .map_err(|e| ConsumerError::configuration(format!("invalid HEADER_ENCODING: {e}")))?;
        let key_encoding: KeyEncoding = self.key_attribute_encoding.parse().map_err(|e| {
            ConsumerError::configuration(format!("invalid KEY_ATTRIBUTE_ENCODING: {e}"))
        })?;

        Ok(ConsumerSettings {
            pool: PoolSettings {
                max_leases: self.max_leases,
                idle_timeout: Duration::from_secs(self.connection_idle_timeout_secs),
            },
            lease: LeaseSettings {
                max_uncommitted_time: Duration::from_millis(self.max_uncommitted_time_ms),
                max_records_per_cycle: self.max_poll_records,
                poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            },
            accumulator: AccumulatorConfig {
                max_batch_records: self.max_batch_records,
                max_batch_wait: Duration::from_millis(self.max_batch_wait_ms),
                separate_by_key: self.separate_by_key,
                key_encoding,
                header_pattern,
                header_encoding,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::assignment::Subscription;

    fn config(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = config(&[]);
        config.validate().unwrap();

        assert!(matches!(
            config.resolver().unwrap().subscription(),
            Subscription::ExplicitTopics(topics) if topics.contains("events")
        ));
        let settings = config.consumer_settings().unwrap();
        assert_eq!(settings.pool.max_leases, 4);
        assert_eq!(settings.lease.max_uncommitted_time, Duration::from_secs(1));
        assert_eq!(settings.accumulator.key_encoding, KeyEncoding::Utf8);
        assert!(settings.accumulator.header_pattern.is_none());
    }

    #[test]
    fn test_explicit_partitions_with_pattern_is_rejected() {
        let config = config(&[
            ("KAFKA_TOPIC_TYPE", "pattern"),
            ("KAFKA_CONSUMER_TOPIC", "events-.*"),
            ("KAFKA_PARTITION_ASSIGNMENTS", "node-a=0,1"),
            ("HOSTNAME", "node-a"),
        ]);

        let err = config.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains("explicit partitions incompatible with pattern subscription"));
    }

    #[test]
    fn test_passthrough_properties_override_builder_values() {
        let config = config(&[(
            "KAFKA_CONSUMER_PROPERTIES",
            "fetch.min.bytes=1024, isolation.level=read_uncommitted",
        )]);

        let client = config.client_config().unwrap();
        assert_eq!(client.get("fetch.min.bytes"), Some("1024"));
        assert_eq!(client.get("isolation.level"), Some("read_uncommitted"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        for vars in [
            vec![("KAFKA_CONSUMER_PROPERTIES", "no-equals-sign")],
            vec![("HEADER_NAME_REGEX", "(")],
            vec![("HEADER_ENCODING", "EBCDIC")],
            vec![("KEY_ATTRIBUTE_ENCODING", "base64")],
            vec![("KAFKA_CONSUMER_OFFSET_RESET", "smallest")],
            vec![("MAX_LEASES", "0")],
        ] {
            let err = config(&vars).validate().unwrap_err();
            assert!(
                matches!(err, ConsumerError::Configuration(_)),
                "{vars:?} gave {err:?}"
            );
        }
    }
}
