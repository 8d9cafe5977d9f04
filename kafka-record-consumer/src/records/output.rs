use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// Attributes attached to every unit handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitMetadata {
    pub topic: String,
    pub partition: i32,

    /// Latest message timestamp in the unit, milliseconds since the epoch
    pub timestamp: Option<i64>,

    /// Message key rendered with the configured key encoding, only when
    /// batches are separated by key
    pub key: Option<String>,

    /// Selected header values, decoded with the configured encoding
    pub header_attributes: BTreeMap<String, String>,

    pub record_count: usize,
    pub first_offset: i64,
    pub last_offset: i64,
}

/// A group of records sharing one grouping key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SealedBatch {
    pub metadata: UnitMetadata,
    pub records: Vec<Value>,
}

/// A message whose payload the record reader could not parse. The payload
/// is kept byte for byte and written out hex encoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseFailure {
    pub metadata: UnitMetadata,
    pub error: String,
    #[serde(rename = "raw_hex", serialize_with = "serialize_hex")]
    pub raw: Vec<u8>,
}

fn serialize_hex<S>(raw: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&hex::encode(raw))
}

/// What the accumulator hands back for the lease to emit.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Batch(SealedBatch),
    ParseFailure(ParseFailure),
}
