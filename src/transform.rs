//! Per-record reshaping applied before a record enters the buffer.

use chrono::{DateTime, SecondsFormat};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::Value;

use crate::record::Record;

/// A record as it sits in the buffer, ready to be serialized into a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundRecord {
    Raw(Record),
    Formatted(FormattedRecord),
}

impl OutboundRecord {
    pub fn tags(&self) -> &[String] {
        match self {
            OutboundRecord::Raw(record) => record.tags.as_deref().unwrap_or_default(),
            OutboundRecord::Formatted(formatted) => &formatted.tags,
        }
    }
}

/// Normalized log-viewer shape: `{"timestamp": .., "tags": [..], "<event>": value}`.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedRecord {
    pub timestamp: String,
    pub tags: Vec<String>,
    pub event: String,
    pub value: Value,
}

impl Serialize for FormattedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // The event key wins over a fixed key of the same name.
        let shadowed = self.event == "timestamp" || self.event == "tags";
        let mut map = serializer.serialize_map(Some(if shadowed { 2 } else { 3 }))?;
        if self.event == "timestamp" {
            map.serialize_entry("timestamp", &self.value)?;
        } else {
            map.serialize_entry("timestamp", &self.timestamp)?;
        }
        if self.event == "tags" {
            map.serialize_entry("tags", &self.value)?;
        } else {
            map.serialize_entry("tags", &self.tags)?;
        }
        if !shadowed {
            map.serialize_entry(&self.event, &self.value)?;
        }
        map.end()
    }
}

/// Merge tags and, when `format` is set, reshape the record.
///
/// Record tags come first (falling back to the payload's own `tags`), followed
/// by `tags` configured on the writer. Never fails: anything unusable in the
/// payload or timestamp degrades to an empty string.
pub fn transform(record: Record, tags: &[String], format: bool) -> OutboundRecord {
    let mut merged = match record.tags.as_ref() {
        Some(own) => own.clone(),
        None => record.payload_tags(),
    };
    merged.extend(tags.iter().cloned());

    if !format {
        return OutboundRecord::Raw(Record {
            tags: Some(merged),
            ..record
        });
    }

    OutboundRecord::Formatted(FormattedRecord {
        timestamp: iso_timestamp(record.timestamp),
        tags: merged,
        value: event_value(record.data.as_ref()),
        event: record.event,
    })
}

fn iso_timestamp(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// message, then error, then the payload itself, then "".
fn event_value(data: Option<&Value>) -> Value {
    let Some(data) = data.filter(|d| is_truthy(d)) else {
        return Value::String(String::new());
    };
    ["message", "error"]
        .iter()
        .find_map(|key| data.get(key).filter(|v| is_truthy(v)))
        .unwrap_or(data)
        .clone()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
