//! Groups decoded records into batches for the sink.
//!
//! Two records share a batch only when they agree on every part of the
//! grouping key: schema, partition, the message key (when separating by key)
//! and the values of the selected headers (when a header pattern is set).
//! A broad header pattern such as `.*` over per-message unique headers yields
//! one batch per message; that fragmentation is accepted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::kafka::message::RawMessage;
use crate::kafka::metrics_consts::{HEADER_DECODE_FAILURES, PARSE_FAILURES};
use crate::kafka::types::Partition;
use crate::records::encoding::{HeaderEncoding, KeyEncoding};
use crate::records::output::{Emission, ParseFailure, SealedBatch, UnitMetadata};
use crate::records::reader::{RecordReader, SchemaId};

#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    /// A batch is sealed as soon as it holds this many records
    pub max_batch_records: usize,
    /// A batch older than this is sealed on the next poll
    pub max_batch_wait: Duration,
    pub separate_by_key: bool,
    pub key_encoding: KeyEncoding,
    pub header_pattern: Option<Regex>,
    pub header_encoding: HeaderEncoding,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            max_batch_records: 10_000,
            max_batch_wait: Duration::from_secs(5),
            separate_by_key: false,
            key_encoding: KeyEncoding::Utf8,
            header_pattern: None,
            header_encoding: HeaderEncoding::Utf8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub schema: SchemaId,
    pub partition: Partition,
    pub key: Option<Vec<u8>>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug)]
struct PendingBatch {
    // creation order, used to emit batches oldest first
    seq: u64,
    created_at: Instant,
    records: Vec<Value>,
    offsets: Vec<i64>,
    max_timestamp: Option<i64>,
}

impl PendingBatch {
    fn new(seq: u64, created_at: Instant) -> Self {
        Self {
            seq,
            created_at,
            records: Vec::new(),
            offsets: Vec::new(),
            max_timestamp: None,
        }
    }

    fn push(&mut self, record: Value, offset: i64, timestamp: Option<i64>) {
        self.records.push(record);
        // several records of one message land here back to back
        if self.offsets.last() != Some(&offset) {
            self.offsets.push(offset);
        }
        self.max_timestamp = self.max_timestamp.max(timestamp);
    }
}

pub struct BatchAccumulator {
    config: Arc<AccumulatorConfig>,
    reader: Arc<dyn RecordReader>,
    pending: HashMap<BatchKey, PendingBatch>,
    next_seq: u64,
}

impl BatchAccumulator {
    pub fn new(config: Arc<AccumulatorConfig>, reader: Arc<dyn RecordReader>) -> Self {
        Self {
            config,
            reader,
            pending: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Adds one message and returns the batches it sealed, or its parse failure.
    pub fn absorb(&mut self, message: &RawMessage, now: Instant) -> Vec<Emission> {
        let headers = self.selected_headers(message);

        let records = match self.reader.read(message.payload()) {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    topic = message.topic(),
                    partition = message.partition_number(),
                    offset = message.offset(),
                    "Failed to parse message, routing it to parse failure: {e}"
                );
                metrics::counter!(PARSE_FAILURES).increment(1);
                return vec![Emission::ParseFailure(ParseFailure {
                    metadata: UnitMetadata {
                        topic: message.topic().to_string(),
                        partition: message.partition_number(),
                        timestamp: message.timestamp,
                        key: self.encoded_key(message.key.as_deref()),
                        header_attributes: headers,
                        record_count: 1,
                        first_offset: message.offset(),
                        last_offset: message.offset(),
                    },
                    error: e.to_string(),
                    raw: message.payload.clone().unwrap_or_default(),
                })];
            }
        };

        let key = if self.config.separate_by_key {
            message.key.clone()
        } else {
            None
        };

        let mut sealed = Vec::new();
        for record in records {
            let batch_key = BatchKey {
                schema: record.schema,
                partition: message.partition().clone(),
                key: key.clone(),
                headers: headers.clone(),
            };

            let seq = self.next_seq;
            self.next_seq += 1;

            let batch = self
                .pending
                .entry(batch_key.clone())
                .or_insert_with(|| PendingBatch::new(seq, now));
            batch.push(record.value, message.offset(), message.timestamp);

            if batch.records.len() >= self.config.max_batch_records {
                if let Some(batch) = self.pending.remove(&batch_key) {
                    sealed.push(Emission::Batch(self.seal(batch_key, batch)));
                }
            }
        }

        sealed
    }

    /// Seals every batch that has waited at least `max_batch_wait`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Emission> {
        let max_wait = self.config.max_batch_wait;
        let expired: Vec<BatchKey> = self
            .pending
            .iter()
            .filter(|(_, batch)| now.saturating_duration_since(batch.created_at) >= max_wait)
            .map(|(key, _)| key.clone())
            .collect();

        if !expired.is_empty() {
            debug!("Sealing {} batches that reached the max wait time", expired.len());
        }
        self.seal_keys(expired)
    }

    /// Seals everything regardless of size or age.
    pub fn flush_all(&mut self) -> Vec<Emission> {
        let keys: Vec<BatchKey> = self.pending.keys().cloned().collect();
        self.seal_keys(keys)
    }

    /// Drops all partial batches, returning how many records were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending_records();
        self.pending.clear();
        dropped
    }

    pub fn pending_records(&self) -> usize {
        self.pending.values().map(|b| b.records.len()).sum()
    }

    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }

    fn seal_keys(&mut self, keys: Vec<BatchKey>) -> Vec<Emission> {
        let mut batches: Vec<(BatchKey, PendingBatch)> = keys
            .into_iter()
            .filter_map(|key| self.pending.remove(&key).map(|batch| (key, batch)))
            .collect();
        batches.sort_by_key(|(_, batch)| batch.seq);

        batches
            .into_iter()
            .map(|(key, batch)| Emission::Batch(self.seal(key, batch)))
            .collect()
    }

    fn seal(&self, key: BatchKey, batch: PendingBatch) -> SealedBatch {
        let metadata = UnitMetadata {
            topic: key.partition.topic().to_string(),
            partition: key.partition.partition_number(),
            timestamp: batch.max_timestamp,
            key: self.encoded_key(key.key.as_deref()),
            header_attributes: key.headers,
            record_count: batch.records.len(),
            first_offset: batch.offsets.first().copied().unwrap_or_default(),
            last_offset: batch.offsets.last().copied().unwrap_or_default(),
        };

        SealedBatch {
            metadata,
            records: batch.records,
        }
    }

    fn encoded_key(&self, key: Option<&[u8]>) -> Option<String> {
        if !self.config.separate_by_key {
            return None;
        }
        key.and_then(|k| self.config.key_encoding.encode(k))
    }

    fn selected_headers(&self, message: &RawMessage) -> BTreeMap<String, String> {
        let Some(pattern) = &self.config.header_pattern else {
            return BTreeMap::new();
        };

        message
            .headers
            .iter()
            .filter(|header| pattern.is_match(&header.key))
            .map(|header| {
                let value = match &header.value {
                    None => String::new(),
                    Some(bytes) => self.config.header_encoding.decode(bytes).unwrap_or_else(|e| {
                        warn!(
                            topic = message.topic(),
                            partition = message.partition_number(),
                            offset = message.offset(),
                            header = header.key.as_str(),
                            "Failed to decode header value, using an empty value: {e}"
                        );
                        metrics::counter!(HEADER_DECODE_FAILURES).increment(1);
                        String::new()
                    }),
                };
                (header.key.clone(), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::reader::JsonRecordReader;

    fn accumulator(config: AccumulatorConfig) -> BatchAccumulator {
        BatchAccumulator::new(Arc::new(config), Arc::new(JsonRecordReader))
    }

    fn message(partition: i32, offset: i64, payload: &str) -> RawMessage {
        RawMessage::new(
            Partition::new("events", partition),
            offset,
            Some(payload.as_bytes().to_vec()),
        )
    }

    fn batches(emissions: Vec<Emission>) -> Vec<SealedBatch> {
        emissions
            .into_iter()
            .map(|e| match e {
                Emission::Batch(batch) => batch,
                other => panic!("expected a batch, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_same_key_fields_share_a_batch() {
        let mut acc = accumulator(AccumulatorConfig::default());
        let now = Instant::now();

        for offset in 0..3 {
            assert!(acc.absorb(&message(0, offset, r#"{"id": 1}"#), now).is_empty());
        }

        let sealed = batches(acc.flush_all());
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].records.len(), 3);
        assert_eq!(sealed[0].metadata.record_count, 3);
        assert_eq!(sealed[0].metadata.first_offset, 0);
        assert_eq!(sealed[0].metadata.last_offset, 2);
        assert_eq!(acc.pending_records(), 0);
    }

    #[test]
    fn test_schema_and_partition_split_batches() {
        let mut acc = accumulator(AccumulatorConfig::default());
        let now = Instant::now();

        acc.absorb(&message(0, 0, r#"{"id": 1}"#), now);
        acc.absorb(&message(0, 1, r#"{"name": "x"}"#), now);
        acc.absorb(&message(1, 0, r#"{"id": 2}"#), now);

        let sealed = batches(acc.flush_all());
        assert_eq!(sealed.len(), 3);
        // oldest first
        assert_eq!(sealed[0].metadata.partition, 0);
        assert_eq!(sealed[0].records[0]["id"], 1);
        assert_eq!(sealed[2].metadata.partition, 1);
    }

    #[test]
    fn test_key_separation() {
        let mut acc = accumulator(AccumulatorConfig {
            separate_by_key: true,
            key_encoding: KeyEncoding::Hex,
            ..Default::default()
        });
        let now = Instant::now();

        acc.absorb(&message(0, 0, r#"{"id": 1}"#).with_key("a"), now);
        acc.absorb(&message(0, 1, r#"{"id": 2}"#).with_key("b"), now);
        acc.absorb(&message(0, 2, r#"{"id": 3}"#).with_key("a"), now);
        acc.absorb(&message(0, 3, r#"{"id": 4}"#), now);

        let sealed = batches(acc.flush_all());
        assert_eq!(sealed.len(), 3);
        assert_eq!(sealed[0].metadata.key.as_deref(), Some("61"));
        assert_eq!(sealed[0].records.len(), 2);
        assert_eq!(sealed[1].metadata.key.as_deref(), Some("62"));
        assert_eq!(sealed[2].metadata.key, None);
    }

    #[test]
    fn test_keys_ignored_without_separation() {
        let mut acc = accumulator(AccumulatorConfig::default());
        let now = Instant::now();

        acc.absorb(&message(0, 0, r#"{"id": 1}"#).with_key("a"), now);
        acc.absorb(&message(0, 1, r#"{"id": 2}"#).with_key("b"), now);

        let sealed = batches(acc.flush_all());
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].metadata.key, None);
    }

    #[test]
    fn test_selected_headers_split_batches() {
        let mut acc = accumulator(AccumulatorConfig {
            header_pattern: Some(Regex::new("^source$").unwrap()),
            ..Default::default()
        });
        let now = Instant::now();

        acc.absorb(
            &message(0, 0, r#"{"id": 1}"#)
                .with_header("source", Some(b"web"))
                .with_header("trace", Some(b"1")),
            now,
        );
        acc.absorb(
            &message(0, 1, r#"{"id": 2}"#)
                .with_header("source", Some(b"web"))
                .with_header("trace", Some(b"2")),
            now,
        );
        acc.absorb(
            &message(0, 2, r#"{"id": 3}"#).with_header("source", Some(b"ios")),
            now,
        );

        let sealed = batches(acc.flush_all());
        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed[0].records.len(), 2);
        assert_eq!(
            sealed[0].metadata.header_attributes,
            BTreeMap::from([("source".to_string(), "web".to_string())])
        );
        assert_eq!(sealed[1].metadata.header_attributes["source"], "ios");
    }

    #[test]
    fn test_undecodable_header_becomes_empty_value() {
        let mut acc = accumulator(AccumulatorConfig {
            header_pattern: Some(Regex::new(".*").unwrap()),
            header_encoding: HeaderEncoding::Ascii,
            ..Default::default()
        });
        let now = Instant::now();

        acc.absorb(
            &message(0, 0, r#"{"id": 1}"#)
                .with_header("source", Some(b"caf\xe9"))
                .with_header("absent", None),
            now,
        );

        let sealed = batches(acc.flush_all());
        assert_eq!(sealed[0].metadata.header_attributes["source"], "");
        assert_eq!(sealed[0].metadata.header_attributes["absent"], "");
    }

    #[test]
    fn test_seals_at_max_records() {
        let mut acc = accumulator(AccumulatorConfig {
            max_batch_records: 2,
            ..Default::default()
        });
        let now = Instant::now();

        assert!(acc.absorb(&message(0, 0, r#"{"id": 1}"#), now).is_empty());
        let sealed = batches(acc.absorb(&message(0, 1, r#"{"id": 2}"#), now));
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].records.len(), 2);
        assert_eq!(acc.pending_batches(), 0);

        assert!(acc.absorb(&message(0, 2, r#"{"id": 3}"#), now).is_empty());
        assert_eq!(acc.pending_records(), 1);
    }

    #[test]
    fn test_multi_record_message_counts_offset_once() {
        let mut acc = accumulator(AccumulatorConfig::default());

        acc.absorb(
            &message(0, 7, r#"[{"id": 1}, {"id": 2}]"#),
            Instant::now(),
        );

        let sealed = batches(acc.flush_all());
        assert_eq!(sealed[0].records.len(), 2);
        assert_eq!(sealed[0].metadata.first_offset, 7);
        assert_eq!(sealed[0].metadata.last_offset, 7);
    }

    #[test]
    fn test_take_expired() {
        let mut acc = accumulator(AccumulatorConfig {
            max_batch_wait: Duration::from_secs(5),
            ..Default::default()
        });
        let start = Instant::now();

        acc.absorb(&message(0, 0, r#"{"id": 1}"#), start);
        acc.absorb(&message(1, 0, r#"{"id": 1}"#), start + Duration::from_secs(3));

        assert!(acc.take_expired(start + Duration::from_secs(4)).is_empty());

        let sealed = batches(acc.take_expired(start + Duration::from_secs(5)));
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].metadata.partition, 0);
        assert_eq!(acc.pending_batches(), 1);
    }

    #[test]
    fn test_parse_failure_is_routed_separately() {
        let mut acc = accumulator(AccumulatorConfig::default());
        let now = Instant::now();

        acc.absorb(&message(0, 0, r#"{"id": 1}"#), now);
        let emissions = acc.absorb(&message(0, 1, "not json").with_timestamp(99), now);

        assert_eq!(emissions.len(), 1);
        let Emission::ParseFailure(failure) = &emissions[0] else {
            panic!("expected a parse failure");
        };
        assert_eq!(failure.raw, b"not json");
        assert_eq!(failure.metadata.first_offset, 1);
        assert_eq!(failure.metadata.timestamp, Some(99));

        // the good record is untouched
        assert_eq!(acc.pending_records(), 1);
    }

    #[test]
    fn test_discard() {
        let mut acc = accumulator(AccumulatorConfig::default());
        let now = Instant::now();
        acc.absorb(&message(0, 0, r#"{"id": 1}"#), now);
        acc.absorb(&message(0, 1, r#"{"id": 2}"#), now);

        assert_eq!(acc.discard(), 2);
        assert!(acc.flush_all().is_empty());
    }
}
