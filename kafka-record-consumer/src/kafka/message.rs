use rdkafka::message::{BorrowedMessage, Headers, Message};

use crate::kafka::types::Partition;

/// A header carried on an inbound message, value kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl MessageHeader {
    pub fn new(key: impl Into<String>, value: Option<&[u8]>) -> Self {
        Self {
            key: key.into(),
            value: value.map(|v| v.to_vec()),
        }
    }
}

/// An owned copy of a message pulled from the log, before any decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    partition: Partition,
    offset: i64,

    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,

    /// Milliseconds since the epoch, when the broker reported one
    pub timestamp: Option<i64>,

    pub headers: Vec<MessageHeader>,
}

impl RawMessage {
    pub fn new(partition: Partition, offset: i64, payload: Option<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            payload,
            timestamp: None,
            headers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    pub fn with_header(mut self, key: &str, value: Option<&[u8]>) -> Self {
        self.headers.push(MessageHeader::new(key, value));
        self
    }

    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        let headers = msg
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| MessageHeader::new(h.key, h.value))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            partition: Partition::new(msg.topic(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|p| p.to_vec()),
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_helpers() {
        let msg = RawMessage::new(Partition::new("events", 3), 42, Some(b"{}".to_vec()))
            .with_key("user-1")
            .with_timestamp(1_700_000_000_000)
            .with_header("source", Some(b"web"))
            .with_header("empty", None);

        assert_eq!(msg.topic(), "events");
        assert_eq!(msg.partition_number(), 3);
        assert_eq!(msg.offset(), 42);
        assert_eq!(msg.key.as_deref(), Some(&b"user-1"[..]));
        assert_eq!(msg.payload(), Some(&b"{}"[..]));
        assert_eq!(msg.timestamp, Some(1_700_000_000_000));
        assert_eq!(msg.headers.len(), 2);
        assert_eq!(msg.headers[0].value.as_deref(), Some(&b"web"[..]));
        assert_eq!(msg.headers[1].value, None);
    }
}
