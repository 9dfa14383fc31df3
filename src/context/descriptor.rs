/// Persisted descriptor format for context values
///
/// `{type, locator, mediaType, size, checksum, inlineValue, content}`. MEMORY and JSON
/// values round-trip through `inlineValue`. FILE descriptors only point at a temp file
/// and record how its bytes decode (`content`). That file may already be gone after a
/// restart, so restoring one is verified and logged as non-durable rather than trusted.
///
/// A temp file has one owner at a time. Use `RefValue::into_descriptor` to move a FILE
/// value into a descriptor; restoring it makes the restored value the new owner.

use crate::context::payload::{BackendKind, Payload};
use crate::context::ref_value::{file_checksum, FileContent, RefValue};
use crate::error::{ContextError, ContextResult};
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;

const INLINE_BYTES_KEY: &str = "$bytes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueDescriptor {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub locator: Option<String>,
    pub media_type: Option<String>,
    pub size: i64,
    pub checksum: Option<String>,
    pub inline_value: Option<Value>,
    /// Decoding of a FILE value's bytes; inferred from `mediaType` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<FileContent>,
}

impl ValueDescriptor {
    /// Inline JSON form of a memory payload; bytes become `{"$bytes": "<base64>"}`
    pub(crate) fn inline(payload: &Payload) -> Value {
        match payload {
            Payload::Json(value) => value.clone(),
            Payload::Bytes(bytes) => json!({
                INLINE_BYTES_KEY: base64::engine::general_purpose::STANDARD.encode(bytes)
            }),
        }
    }

    fn inline_payload(value: Value) -> ContextResult<Payload> {
        if let Value::Object(map) = &value {
            if map.len() == 1 {
                if let Some(Value::String(encoded)) = map.get(INLINE_BYTES_KEY) {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|e| ContextError::Decode(e.to_string()))?;
                    return Ok(Payload::Bytes(Bytes::from(bytes)));
                }
            }
        }
        Ok(Payload::Json(value))
    }

    /// True when restoring this descriptor depends on a temp file surviving
    pub fn is_file_backed(&self) -> bool {
        self.kind == BackendKind::File
    }
}

impl RefValue {
    /// Rebuild a RefValue from its persisted descriptor
    ///
    /// FILE descriptors require the file to still exist and, when a checksum was
    /// recorded, to still hash to it.
    pub async fn from_descriptor(descriptor: ValueDescriptor) -> ContextResult<Self> {
        match descriptor.kind {
            BackendKind::Memory => {
                let inline = descriptor.inline_value.unwrap_or(Value::Null);
                Ok(RefValue::memory(
                    ValueDescriptor::inline_payload(inline)?,
                    descriptor.media_type,
                ))
            }
            BackendKind::Json => Ok(RefValue::json(
                descriptor.inline_value.unwrap_or(Value::Null),
                descriptor.media_type,
            )),
            BackendKind::File => {
                let locator = descriptor.locator.ok_or_else(|| {
                    ContextError::Decode("file descriptor without locator".to_string())
                })?;
                let path = PathBuf::from(locator);
                tracing::warn!(
                    "⚠️ Restoring file-backed context value from {}; temp files are not durable across restarts",
                    path.display()
                );
                if let Some(expected) = descriptor.checksum {
                    let actual = file_checksum(&path).await?;
                    if actual != expected {
                        return Err(ContextError::ChecksumMismatch {
                            path,
                            expected,
                            actual,
                        });
                    }
                }
                let content = descriptor
                    .content
                    .unwrap_or_else(|| FileContent::infer(descriptor.media_type.as_deref()));
                RefValue::adopt_file(path, content, descriptor.media_type).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_bytes_survive_descriptor_round_trip() {
        let original = RefValue::memory(Payload::from(vec![0u8, 159, 255]), None);
        let descriptor = original.to_descriptor().unwrap();
        assert_eq!(descriptor.kind, BackendKind::Memory);
        assert!(descriptor.locator.is_none());

        let encoded = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(encoded["type"], "MEMORY");
        assert!(encoded.get("inlineValue").is_some());

        let restored = RefValue::from_descriptor(serde_json::from_value(encoded).unwrap())
            .await
            .unwrap();
        assert_eq!(restored.read().await.unwrap(), Payload::from(vec![0u8, 159, 255]));
    }

    #[tokio::test]
    async fn file_text_keeps_its_kind_under_custom_media_types() {
        let dir = tempfile::tempdir().unwrap();
        let text = Payload::from("<doc>".repeat(100));
        let original = RefValue::spool(dir.path(), "d", &text, Some("application/xml".into()))
            .await
            .unwrap();
        let path = original.file_path().unwrap().to_path_buf();

        let descriptor = original.into_descriptor().unwrap();
        assert_eq!(descriptor.content, Some(FileContent::Text));
        assert!(path.exists(), "handoff must not delete the file");

        let encoded = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(encoded["content"], "TEXT");
        let restored = RefValue::from_descriptor(serde_json::from_value(encoded).unwrap())
            .await
            .unwrap();
        assert_eq!(restored.read().await.unwrap(), text);
        assert_eq!(restored.media_type(), Some("application/xml"));

        assert!(restored.release());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn file_descriptor_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let original = RefValue::spool(dir.path(), "d", &Payload::from("payload"), None)
            .await
            .unwrap();
        let descriptor = original.to_descriptor().unwrap();
        assert!(descriptor.is_file_backed());
        assert_eq!(descriptor.size, 7);

        std::fs::write(original.file_path().unwrap(), b"tampered").unwrap();
        let err = RefValue::from_descriptor(descriptor).await.unwrap_err();
        assert!(matches!(err, ContextError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn file_descriptor_after_cleanup_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let original = RefValue::spool(dir.path(), "d", &Payload::from("payload"), None)
            .await
            .unwrap();
        let descriptor = original.to_descriptor().unwrap();
        original.release();

        let err = RefValue::from_descriptor(descriptor).await.unwrap_err();
        assert!(matches!(err, ContextError::NotFound { .. }));
    }
}
