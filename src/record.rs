use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One event as delivered by the upstream event source.
///
/// `event` is the kind label (`log`, `request`, `response`, `error`, ...),
/// `timestamp` is milliseconds since the unix epoch and `data` is whatever
/// payload the source attached. Unknown fields (pid, id, ...) are kept in
/// `extra` so they survive an unformatted pass-through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub event: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    pub fn new(event: impl Into<String>, timestamp: i64) -> Self {
        Self {
            event: event.into(),
            timestamp,
            tags: None,
            data: None,
            extra: Map::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Tags carried by the payload itself, used when the record has none of its own.
    pub(crate) fn payload_tags(&self) -> Vec<String> {
        self.data
            .as_ref()
            .and_then(|data| data.get("tags"))
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}
