//! Record and message types carried between the emitter and the materializer.

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use std::path::Path;

use crate::error::MessageError;
use crate::Result;

/// One parsed CSV row: field name to value, in header order.
pub type Record = IndexMap<String, String>;

/// Header naming the original file, extension included
pub const SOURCE_HEADER: &str = "source";

/// Header carrying the ISO-8601 produce time
pub const TIMESTAMP_HEADER: &str = "timestamp";

/// Record as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaRecord {
    /// Record key (optional)
    pub key: Option<Vec<u8>>,

    /// Record value (optional)
    pub value: Option<Vec<u8>>,

    /// Record headers
    pub headers: Vec<RecordHeader>,

    /// Record timestamp (epoch milliseconds)
    pub timestamp: i64,

    /// Offset in the partition; relative when producing
    pub offset: i64,
}

/// Record header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Header key
    pub key: String,

    /// Header value
    pub value: Vec<u8>,
}

impl KafkaRecord {
    /// Value of the first header with the given key
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_slice())
    }
}

/// A row addressed to the topic, before encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayMessage {
    /// Partition key: the source's logical name
    pub key: String,
    /// Original file name, extension included
    pub source: String,
    /// Row contents
    pub record: Record,
    /// Time the row was handed to the producer
    pub produced_at: DateTime<Utc>,
}

impl RelayMessage {
    /// Build a message for a row of `source`, keyed by its logical name.
    pub fn new(source: &str, record: Record, produced_at: DateTime<Utc>) -> Self {
        Self {
            key: logical_name(source).to_string(),
            source: source.to_string(),
            record,
            produced_at,
        }
    }

    /// Encode into the wire shape: JSON value plus `source`/`timestamp` headers.
    pub fn to_kafka_record(&self) -> Result<KafkaRecord> {
        let value = serde_json::to_vec(&self.record)?;
        let timestamp = self
            .produced_at
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        Ok(KafkaRecord {
            key: Some(self.key.as_bytes().to_vec()),
            value: Some(value),
            headers: vec![
                RecordHeader {
                    key: SOURCE_HEADER.to_string(),
                    value: self.source.as_bytes().to_vec(),
                },
                RecordHeader {
                    key: TIMESTAMP_HEADER.to_string(),
                    value: timestamp.into_bytes(),
                },
            ],
            timestamp: self.produced_at.timestamp_millis(),
            offset: 0,
        })
    }
}

/// A consumed message that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Output artifact name
    pub source: String,
    /// Row contents in payload order
    pub record: Record,
}

/// Validate and decode a consumed record.
pub fn decode_message(record: &KafkaRecord) -> std::result::Result<DecodedMessage, MessageError> {
    let source = record
        .header(SOURCE_HEADER)
        .ok_or(MessageError::MissingSource)?;
    let source = std::str::from_utf8(source)
        .map_err(|_| MessageError::InvalidSource(String::from_utf8_lossy(source).into_owned()))?;
    validate_source_name(source)?;

    let value = record.value.as_deref().ok_or(MessageError::EmptyPayload)?;
    let fields: IndexMap<String, serde_json::Value> =
        serde_json::from_slice(value).map_err(|e| MessageError::InvalidPayload(e.to_string()))?;
    if fields.is_empty() {
        return Err(MessageError::InvalidPayload("object has no fields".to_string()));
    }

    let record = fields
        .into_iter()
        .map(|(field, value)| (field, json_to_field(value)))
        .collect();

    Ok(DecodedMessage {
        source: source.to_string(),
        record,
    })
}

/// Logical name of a source file: its name without the extension.
pub fn logical_name(file_name: &str) -> &str {
    Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name)
}

/// Reject names that would escape the output directory.
fn validate_source_name(source: &str) -> std::result::Result<(), MessageError> {
    let invalid = source.is_empty()
        || source == "."
        || source == ".."
        || source.contains('/')
        || source.contains('\\')
        || source.contains('\0');

    if invalid {
        return Err(MessageError::InvalidSource(source.to_string()));
    }
    Ok(())
}

fn json_to_field(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
