use std::hash::Hasher;

use serde::Serialize;
use serde_json::Value;
use siphasher::sip::SipHasher13;

use crate::error::DecodeError;

/// Fingerprint of a record's schema. Records with different fingerprints are
/// never written into the same batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SchemaId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub schema: SchemaId,
    pub value: Value,
}

/// Turns the payload of one message into zero or more records.
pub trait RecordReader: Send + Sync {
    fn read(&self, payload: Option<&[u8]>) -> Result<Vec<DecodedRecord>, DecodeError>;
}

/// Reads a JSON object, or an array of JSON objects, per message.
///
/// The schema of a record is its set of top-level field names together with
/// the JSON type of each value.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRecordReader;

impl RecordReader for JsonRecordReader {
    fn read(&self, payload: Option<&[u8]>) -> Result<Vec<DecodedRecord>, DecodeError> {
        let payload = payload.ok_or(DecodeError::EmptyPayload)?;
        if payload.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }

        match serde_json::from_slice::<Value>(payload)? {
            Value::Array(values) => values.into_iter().map(to_record).collect(),
            value => Ok(vec![to_record(value)?]),
        }
    }
}

fn to_record(value: Value) -> Result<DecodedRecord, DecodeError> {
    let Value::Object(fields) = &value else {
        return Err(DecodeError::NotARecord(type_name(&value)));
    };

    let mut names: Vec<(&str, &'static str)> = fields
        .iter()
        .map(|(name, field)| (name.as_str(), type_name(field)))
        .collect();
    names.sort_unstable();

    // fixed keys so fingerprints are stable across processes
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    for (name, kind) in names {
        hasher.write(name.as_bytes());
        hasher.write_u8(0);
        hasher.write(kind.as_bytes());
        hasher.write_u8(0);
    }

    Ok(DecodedRecord {
        schema: SchemaId(hasher.finish()),
        value,
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
