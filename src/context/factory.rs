/// RefValue factory: picks a backend from size / media-type heuristics
///
/// AUTO selection:
/// 1. base64-tagged text is decoded; decoded size over the base64 threshold goes to a
///    file, otherwise memory
/// 2. below the memory threshold stays in memory
/// 3. JSON-shaped payloads up to the JSON threshold become parsed trees
/// 4. everything else is spooled to disk
///
/// Construction never fails: on any error the raw payload is kept in memory.

use crate::config::ContextConfig;
use crate::context::payload::{is_base64_media_type, BackendKind, Payload, StoragePreference};
use crate::context::ref_value::{FileContent, RefValue};
use crate::error::ContextResult;
use base64::Engine;
use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone)]
pub struct RefValueFactory {
    config: ContextConfig,
}

impl RefValueFactory {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Backend AUTO would pick for a payload of this shape and size
    pub fn auto_backend(&self, payload: &Payload, size: u64) -> BackendKind {
        if size < self.config.memory_threshold {
            BackendKind::Memory
        } else if payload.is_json_shaped() && size <= self.config.json_threshold {
            BackendKind::Json
        } else {
            BackendKind::File
        }
    }

    /// Apply the caller preference on top of AUTO, keeping the memory safety override
    pub fn choose_backend(&self, payload: &Payload, preference: StoragePreference) -> BackendKind {
        let size = payload.estimate_bytes();
        let auto = self.auto_backend(payload, size);
        match preference {
            StoragePreference::Auto => auto,
            StoragePreference::Memory if size > self.config.memory_threshold => {
                tracing::debug!(
                    "🛡️ Memory storage refused for {} byte payload, using {:?}",
                    size,
                    auto
                );
                auto
            }
            StoragePreference::Memory => BackendKind::Memory,
            StoragePreference::Json if payload.is_json_shaped() && size <= self.config.json_threshold => {
                BackendKind::Json
            }
            StoragePreference::Json => {
                if size > self.config.json_threshold {
                    tracing::debug!("🛡️ JSON storage refused for {} byte payload, using {:?}", size, auto);
                }
                auto
            }
            StoragePreference::File => BackendKind::File,
        }
    }

    /// Build a RefValue, degrading to memory on any construction failure
    pub async fn create(
        &self,
        payload: Payload,
        preference: StoragePreference,
        media_type: Option<String>,
    ) -> RefValue {
        let base64_tagged = media_type.as_deref().map(is_base64_media_type).unwrap_or(false);
        if base64_tagged {
            if let Payload::Json(Value::String(text)) = &payload {
                return match base64::engine::general_purpose::STANDARD.decode(text.trim()) {
                    Ok(decoded) => self.create_decoded(decoded, media_type).await,
                    Err(e) => {
                        tracing::warn!("⚠️ Invalid base64 payload, keeping raw text in memory: {}", e);
                        RefValue::memory(payload, media_type)
                    }
                };
            }
        }

        match self.choose_backend(&payload, preference) {
            BackendKind::Memory => RefValue::memory(payload, media_type),
            BackendKind::Json => match payload {
                Payload::Json(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
                    Ok(tree) => RefValue::json(tree, media_type),
                    Err(e) if text.len() as u64 > self.config.memory_threshold => {
                        tracing::debug!("📄 Text only looked like JSON ({}), spooling to disk", e);
                        self.spool_or_memory(Payload::Json(Value::String(text)), media_type).await
                    }
                    Err(e) => {
                        tracing::warn!("⚠️ JSON parse failed, falling back to memory: {}", e);
                        RefValue::memory(Payload::Json(Value::String(text)), media_type)
                    }
                },
                Payload::Json(tree) => RefValue::json(tree, media_type),
                bytes @ Payload::Bytes(_) => RefValue::memory(bytes, media_type),
            },
            BackendKind::File => self.spool_or_memory(payload, media_type).await,
        }
    }

    /// Spool to disk; memory is only the fallback when the spool itself fails
    async fn spool_or_memory(&self, payload: Payload, media_type: Option<String>) -> RefValue {
        match RefValue::spool(
            &self.config.spool_dir,
            &self.config.spool_prefix,
            &payload,
            media_type.clone(),
        )
        .await
        {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("⚠️ Spooling to {} failed, falling back to memory: {}",
                    self.config.spool_dir.display(), e);
                RefValue::memory(payload, media_type)
            }
        }
    }

    async fn create_decoded(&self, decoded: Vec<u8>, media_type: Option<String>) -> RefValue {
        if decoded.len() as u64 > self.config.base64_threshold {
            self.spool_or_memory(Payload::Bytes(Bytes::from(decoded)), media_type).await
        } else {
            RefValue::memory(Payload::Bytes(Bytes::from(decoded)), media_type)
        }
    }

    /// Build a RefValue straight from a stream
    ///
    /// MEMORY buffers the stream (spilling to disk past the memory threshold); every other
    /// preference spools it. A stream can only be read once, so errors here are returned
    /// instead of degraded.
    pub async fn create_from_stream<R>(
        &self,
        reader: &mut R,
        preference: StoragePreference,
        media_type: Option<String>,
    ) -> ContextResult<RefValue>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if preference != StoragePreference::Memory {
            return RefValue::spool_reader(
                &self.config.spool_dir,
                &self.config.spool_prefix,
                reader,
                FileContent::Bytes,
                media_type,
            )
            .await;
        }

        let limit = self.config.memory_threshold;
        let mut buffered = Vec::new();
        let mut limited = (&mut *reader).take(limit + 1);
        limited.read_to_end(&mut buffered).await?;

        if buffered.len() as u64 <= limit {
            return Ok(RefValue::memory(Payload::Bytes(Bytes::from(buffered)), media_type));
        }

        tracing::debug!("🛡️ Stream exceeded memory threshold, spooling to disk");
        let mut chained = (&buffered[..]).chain(reader);
        RefValue::spool_reader(
            &self.config.spool_dir,
            &self.config.spool_prefix,
            &mut chained,
            FileContent::Bytes,
            media_type,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn factory(dir: &std::path::Path) -> RefValueFactory {
        RefValueFactory::new(ContextConfig {
            memory_threshold: 1024,
            json_threshold: 2048,
            base64_threshold: 512,
            spool_dir: dir.to_path_buf(),
            spool_prefix: "test".to_string(),
        })
    }

    #[tokio::test]
    async fn memory_preference_cannot_override_safety_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path());
        let big = Payload::from("x".repeat(4096));
        let value = f.create(big.clone(), StoragePreference::Memory, None).await;
        assert_eq!(value.backend_kind(), BackendKind::File);
        assert_eq!(value.read().await.unwrap(), big);
    }

    #[tokio::test]
    async fn json_string_in_json_band_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path());
        let doc = json!({"rows": "y".repeat(1500)});
        let text = serde_json::to_string(&doc).unwrap();
        let value = f.create(Payload::from(text), StoragePreference::Auto, None).await;
        assert_eq!(value.backend_kind(), BackendKind::Json);
        assert_eq!(value.select("/rows").await.unwrap(), Some(doc["rows"].clone()));
    }

    #[tokio::test]
    async fn brace_wrapped_text_that_is_not_json_is_spooled() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path());
        let text = format!("{{ not json {} }}", "x".repeat(1500));
        let value = f.create(Payload::from(text.clone()), StoragePreference::Auto, None).await;
        assert_eq!(value.backend_kind(), BackendKind::File);
        assert_eq!(value.read().await.unwrap(), Payload::from(text));

        let small = f.create(Payload::from("{ nope }"), StoragePreference::Json, None).await;
        assert_eq!(small.backend_kind(), BackendKind::Memory);
    }

    #[tokio::test]
    async fn json_preference_is_bounded_by_the_json_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path());
        let small = Payload::from(json!({"rows": [1, 2, 3]}));
        let value = f.create(small.clone(), StoragePreference::Json, None).await;
        assert_eq!(value.backend_kind(), BackendKind::Json);

        let big = Payload::from(json!({"rows": "r".repeat(4096)}));
        let value = f.create(big.clone(), StoragePreference::Json, None).await;
        assert_eq!(value.backend_kind(), BackendKind::File);
        assert_eq!(value.read().await.unwrap(), big);
    }

    #[tokio::test]
    async fn base64_payloads_are_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path());
        let small = base64::engine::general_purpose::STANDARD.encode(vec![7u8; 100]);
        let value = f
            .create(Payload::from(small), StoragePreference::Auto, Some("application/base64".into()))
            .await;
        assert_eq!(value.backend_kind(), BackendKind::Memory);
        assert_eq!(value.read().await.unwrap(), Payload::from(vec![7u8; 100]));

        let large = base64::engine::general_purpose::STANDARD.encode(vec![9u8; 600]);
        let value = f
            .create(Payload::from(large), StoragePreference::Auto, Some("image/png;base64".into()))
            .await;
        assert_eq!(value.backend_kind(), BackendKind::File);
        assert_eq!(value.read().await.unwrap(), Payload::from(vec![9u8; 600]));
    }

    #[tokio::test]
    async fn invalid_base64_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path());
        let value = f
            .create(Payload::from("not base64!!"), StoragePreference::Auto, Some("application/base64".into()))
            .await;
        assert_eq!(value.backend_kind(), BackendKind::Memory);
        assert_eq!(value.read().await.unwrap(), Payload::from("not base64!!"));
    }

    #[tokio::test]
    async fn unwritable_spool_dir_degrades_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let f = factory(&blocker);
        let big = Payload::from(vec![1u8; 4096]);
        let value = f.create(big.clone(), StoragePreference::Auto, None).await;
        assert_eq!(value.backend_kind(), BackendKind::Memory);
        assert_eq!(value.read().await.unwrap(), big);
    }

    #[tokio::test]
    async fn memory_stream_spills_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path());
        let data = vec![3u8; 3000];
        let mut reader = &data[..];
        let value = f
            .create_from_stream(&mut reader, StoragePreference::Memory, None)
            .await
            .unwrap();
        assert_eq!(value.backend_kind(), BackendKind::File);
        assert_eq!(value.size(), 3000);
        assert_eq!(value.read().await.unwrap(), Payload::from(data));
    }
}
