// Records module - decoding message payloads and grouping them into batches
pub mod accumulator;
pub mod encoding;
pub mod output;
pub mod reader;

pub use accumulator::{AccumulatorConfig, BatchAccumulator, BatchKey};
pub use encoding::{HeaderEncoding, KeyEncoding};
pub use output::{Emission, ParseFailure, SealedBatch, UnitMetadata};
pub use reader::{DecodedRecord, JsonRecordReader, RecordReader, SchemaId};
