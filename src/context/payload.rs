/// Payload and option types shared by RefValues and the run context store

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A materialized context value
///
/// Strings, numbers and maps travel as JSON; byte arrays stay as raw bytes so they
/// never get inflated into JSON arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Bytes(Bytes),
}

impl Payload {
    /// Rough size in bytes without serializing the value
    pub fn estimate_bytes(&self) -> u64 {
        match self {
            Payload::Json(value) => estimate_json_bytes(value),
            Payload::Bytes(bytes) => bytes.len() as u64,
        }
    }

    /// JSON view of the payload; bytes map to `None`
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Bytes(_) => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Bytes(_) => None,
        }
    }

    /// Maps, arrays, and strings that look like serialized JSON documents
    pub fn is_json_shaped(&self) -> bool {
        match self {
            Payload::Json(Value::Object(_)) | Payload::Json(Value::Array(_)) => true,
            Payload::Json(Value::String(s)) => looks_like_json_document(s),
            _ => false,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Json(Value::String(s.to_string()))
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Json(Value::String(s))
    }
}

pub(crate) fn estimate_json_bytes(value: &Value) -> u64 {
    match value {
        Value::Null => 0,
        Value::Bool(_) | Value::Number(_) => 8,
        Value::String(s) => s.len() as u64,
        Value::Array(items) => items.iter().map(estimate_json_bytes).sum(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| k.len() as u64 + estimate_json_bytes(v))
            .sum(),
    }
}

fn looks_like_json_document(s: &str) -> bool {
    let trimmed = s.trim_start();
    let Some(first) = trimmed.chars().next() else {
        return false;
    };
    let last = s.trim_end().chars().last();
    matches!((first, last), ('{', Some('}')) | ('[', Some(']')))
}

/// Physical storage of a RefValue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendKind {
    Memory,
    Json,
    File,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Json => "json",
            BackendKind::File => "file",
        }
    }
}

/// Caller hint for backend selection
///
/// The memory safety override always wins: anything above the memory threshold is
/// never kept as `Memory`, whatever the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoragePreference {
    #[default]
    Auto,
    Memory,
    Json,
    File,
}

/// Options attached to a context write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOptions {
    pub media_type: Option<String>,
    pub storage: StoragePreference,
    /// When false the value is committed even if nobody is registered to read it
    pub auto_cleanup: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            media_type: None,
            storage: StoragePreference::Auto,
            auto_cleanup: true,
        }
    }
}

impl WriteOptions {
    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn storage(mut self, storage: StoragePreference) -> Self {
        self.storage = storage;
        self
    }

    pub fn keep(mut self) -> Self {
        self.auto_cleanup = false;
        self
    }
}

/// Whether a media type marks its payload as base64 text
pub fn is_base64_media_type(media_type: &str) -> bool {
    let lower = media_type.to_ascii_lowercase();
    lower == "application/base64" || lower.ends_with(";base64") || lower.ends_with("+base64")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn estimates_walk_the_tree() {
        let payload = Payload::Json(json!({"ab": "xyz", "n": 1, "list": [true, null]}));
        // "ab"(2)+"xyz"(3) + "n"(1)+8 + "list"(4)+8+0
        assert_eq!(payload.estimate_bytes(), 26);
        assert_eq!(Payload::from(vec![0u8; 10]).estimate_bytes(), 10);
    }

    #[test]
    fn json_shape_detection() {
        assert!(Payload::Json(json!({"a": 1})).is_json_shaped());
        assert!(Payload::from("  [1, 2] ").is_json_shaped());
        assert!(!Payload::from("plain text").is_json_shaped());
        assert!(!Payload::from(vec![1u8, 2]).is_json_shaped());
    }

    #[test]
    fn base64_media_types() {
        assert!(is_base64_media_type("application/base64"));
        assert!(is_base64_media_type("image/png;base64"));
        assert!(!is_base64_media_type("application/json"));
    }
}
