use std::io::Write;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::records::output::{ParseFailure, SealedBatch};

/// Downstream destination for sealed batches.
///
/// A successful return means the unit was durably handed off. Failures are
/// never retried by the lease: the cycle aborts without committing offsets.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn emit(&self, batch: SealedBatch) -> Result<()>;

    async fn emit_parse_failure(&self, failure: ParseFailure) -> Result<()>;
}

#[derive(Serialize)]
#[serde(tag = "relationship", rename_all = "snake_case")]
enum Line<'a> {
    Success(&'a SealedBatch),
    ParseFailure(&'a ParseFailure),
}

/// Writes each unit as one JSON line.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    fn write_line(&self, line: &Line<'_>) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("sink writer lock poisoned"))?;
        serde_json::to_writer(&mut *writer, line).context("Failed to serialize output unit")?;
        writer
            .write_all(b"\n")
            .and_then(|_| writer.flush())
            .context("Failed to write output unit")
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|_| anyhow!("sink writer lock poisoned"))
    }
}

#[async_trait]
impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    async fn emit(&self, batch: SealedBatch) -> Result<()> {
        self.write_line(&Line::Success(&batch))
    }

    async fn emit_parse_failure(&self, failure: ParseFailure) -> Result<()> {
        self.write_line(&Line::ParseFailure(&failure))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{json, Value};

    use super::*;
    use crate::records::output::UnitMetadata;

    fn metadata() -> UnitMetadata {
        UnitMetadata {
            topic: "events".to_string(),
            partition: 2,
            timestamp: Some(1_700_000_000_000),
            key: None,
            header_attributes: BTreeMap::from([("source".to_string(), "web".to_string())]),
            record_count: 1,
            first_offset: 5,
            last_offset: 5,
        }
    }

    #[tokio::test]
    async fn test_writes_one_line_per_unit() {
        let sink = JsonLinesSink::new(Vec::new());

        sink.emit(SealedBatch {
            metadata: metadata(),
            records: vec![json!({"id": 1})],
        })
        .await
        .unwrap();
        sink.emit_parse_failure(ParseFailure {
            metadata: metadata(),
            error: "bad".to_string(),
            raw: b"oops".to_vec(),
        })
        .await
        .unwrap();

        let output = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["relationship"], "success");
        assert_eq!(lines[0]["records"][0]["id"], 1);
        assert_eq!(lines[0]["metadata"]["header_attributes"]["source"], "web");
        assert_eq!(lines[1]["relationship"], "parse_failure");
        assert_eq!(lines[1]["raw_hex"], "6f6f7073");
    }

    #[tokio::test]
    async fn test_parse_failure_payload_survives_invalid_utf8() {
        let sink = JsonLinesSink::new(Vec::new());
        let payload = vec![0xff, 0xfe, b'{', 0x00, 0xc3];

        sink.emit_parse_failure(ParseFailure {
            metadata: metadata(),
            error: "invalid utf-8".to_string(),
            raw: payload.clone(),
        })
        .await
        .unwrap();

        let output = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert!(!output.contains('\u{fffd}'));
        let line: Value = serde_json::from_str(output.trim_end()).unwrap();
        let decoded = hex::decode(line["raw_hex"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }
}
