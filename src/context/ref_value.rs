/// RefValue: uniform wrapper over where a context payload physically lives
///
/// Three backends:
/// - Memory: the payload itself (JSON value or raw bytes)
/// - Json: a parsed JSON tree, projected by pointer/JSONPath without re-serializing
/// - File: a spooled temp file owned exclusively by this instance
///
/// `release` is one-shot. The first call frees the payload / deletes the file, later calls
/// are no-ops. Reads after release fail with `ContextError::Released`.

use crate::context::descriptor::ValueDescriptor;
use crate::context::payload::{is_base64_media_type, BackendKind, Payload};
use crate::error::{ContextError, ContextResult};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;

/// Raw byte stream over a context value
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ContextError>> + Send>>;

const STREAM_CHUNK: usize = 64 * 1024;

/// How the bytes of a spooled file map back to a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileContent {
    /// Serialized JSON document
    Json,
    /// UTF-8 text, materialized as a JSON string
    Text,
    /// Opaque bytes
    Bytes,
}

impl FileContent {
    fn of(payload: &Payload) -> Self {
        match payload {
            Payload::Json(Value::String(_)) => FileContent::Text,
            Payload::Json(_) => FileContent::Json,
            Payload::Bytes(_) => FileContent::Bytes,
        }
    }

    /// Recover the content kind from a persisted media type
    pub fn infer(media_type: Option<&str>) -> Self {
        match media_type.map(|m| m.to_ascii_lowercase()) {
            Some(m) if is_base64_media_type(&m) => FileContent::Bytes,
            Some(m) if m.contains("json") => FileContent::Json,
            Some(m) if m.starts_with("text/") => FileContent::Text,
            _ => FileContent::Bytes,
        }
    }

    fn default_media_type(&self) -> &'static str {
        match self {
            FileContent::Json => "application/json",
            FileContent::Text => "text/plain; charset=utf-8",
            FileContent::Bytes => "application/octet-stream",
        }
    }
}

#[derive(Debug)]
struct FileBacking {
    path: PathBuf,
    content: FileContent,
}

#[derive(Debug)]
enum Backend {
    Memory(RwLock<Option<Payload>>),
    Json(RwLock<Option<Value>>),
    File(FileBacking),
}

/// A context value with exactly one active backend
#[derive(Debug)]
pub struct RefValue {
    backend: Backend,
    size: u64,
    media_type: Option<String>,
    checksum: Option<String>,
    released: AtomicBool,
}

impl RefValue {
    /// Keep the payload in memory as-is
    pub fn memory(payload: Payload, media_type: Option<String>) -> Self {
        let size = payload.estimate_bytes();
        Self {
            backend: Backend::Memory(RwLock::new(Some(payload))),
            size,
            media_type,
            checksum: None,
            released: AtomicBool::new(false),
        }
    }

    /// Keep a parsed JSON tree for selective reads
    pub fn json(tree: Value, media_type: Option<String>) -> Self {
        let size = crate::context::payload::estimate_json_bytes(&tree);
        Self {
            backend: Backend::Json(RwLock::new(Some(tree))),
            size,
            media_type: media_type.or_else(|| Some("application/json".to_string())),
            checksum: None,
            released: AtomicBool::new(false),
        }
    }

    /// Spool an in-memory payload to a fresh temp file under `dir`
    pub async fn spool(
        dir: &Path,
        prefix: &str,
        payload: &Payload,
        media_type: Option<String>,
    ) -> ContextResult<Self> {
        let content = FileContent::of(payload);
        let encoded: Vec<u8>;
        let bytes: &[u8] = match payload {
            Payload::Json(Value::String(s)) => s.as_bytes(),
            Payload::Json(value) => {
                encoded = serde_json::to_vec(value)?;
                &encoded
            }
            Payload::Bytes(b) => b.as_ref(),
        };
        let mut reader = bytes;
        Self::spool_reader(dir, prefix, &mut reader, content, media_type).await
    }

    /// Spool everything an async reader yields to a fresh temp file
    ///
    /// A failed copy removes the partial file before returning the error.
    pub async fn spool_reader<R>(
        dir: &Path,
        prefix: &str,
        reader: &mut R,
        content: FileContent,
        media_type: Option<String>,
    ) -> ContextResult<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(spool_file_name(prefix));

        match copy_hashed(reader, &path).await {
            Ok((size, checksum)) => {
                tracing::debug!("💾 Spooled {} bytes to {}", size, path.display());
                Ok(Self {
                    backend: Backend::File(FileBacking { path, content }),
                    size,
                    media_type: media_type
                        .or_else(|| Some(content.default_media_type().to_string())),
                    checksum: Some(checksum),
                    released: AtomicBool::new(false),
                })
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                    tracing::debug!("🧹 No partial spool file to remove at {}: {}", path.display(), cleanup);
                }
                Err(e)
            }
        }
    }

    /// Adopt an existing file; this instance deletes it on release
    ///
    /// The content kind is inferred from the media type.
    pub async fn from_file(path: impl Into<PathBuf>, media_type: Option<String>) -> ContextResult<Self> {
        let content = FileContent::infer(media_type.as_deref());
        Self::adopt_file(path.into(), content, media_type).await
    }

    /// Adopt an existing file whose content kind is already known
    pub async fn adopt_file(path: PathBuf, content: FileContent, media_type: Option<String>) -> ContextResult<Self> {
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContextError::NotFound { path });
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            backend: Backend::File(FileBacking { path, content }),
            size: metadata.len(),
            media_type,
            checksum: None,
            released: AtomicBool::new(false),
        })
    }

    pub fn backend_kind(&self) -> BackendKind {
        match self.backend {
            Backend::Memory(_) => BackendKind::Memory,
            Backend::Json(_) => BackendKind::Json,
            Backend::File(_) => BackendKind::File,
        }
    }

    /// Estimated size in bytes (exact for files)
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    /// SHA-256 hex digest of the spooled bytes, file backend only
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    /// Path of the backing file, file backend only
    pub fn file_path(&self) -> Option<&Path> {
        match &self.backend {
            Backend::File(file) => Some(&file.path),
            _ => None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> ContextResult<()> {
        if self.is_released() {
            return Err(ContextError::Released {
                backend: self.backend_kind().as_str(),
            });
        }
        Ok(())
    }

    /// Fully materialize the value
    pub async fn read(&self) -> ContextResult<Payload> {
        self.ensure_live()?;
        match &self.backend {
            Backend::Memory(slot) => slot.read().clone().ok_or(ContextError::Released {
                backend: "memory",
            }),
            Backend::Json(slot) => slot
                .read()
                .clone()
                .map(Payload::Json)
                .ok_or(ContextError::Released { backend: "json" }),
            Backend::File(file) => {
                let bytes = read_file(&file.path).await?;
                decode_file(bytes, file.content)
            }
        }
    }

    /// Materialize into a typed value
    pub async fn read_as<T: DeserializeOwned>(&self) -> ContextResult<T> {
        match self.read().await? {
            Payload::Json(value) => Ok(serde_json::from_value(value)?),
            Payload::Bytes(bytes) => Ok(serde_json::from_slice(&bytes)?),
        }
    }

    /// Project part of the value without handing the whole document back
    ///
    /// Accepts a JSON pointer (`/a/0/b`), a JSONPath expression (`$.a[0].b`) or a
    /// dotted path (`a.0.b`). Returns `None` when nothing matches.
    pub async fn select(&self, selector: &str) -> ContextResult<Option<Value>> {
        self.ensure_live()?;
        match &self.backend {
            Backend::Json(slot) => {
                let guard = slot.read();
                let tree = guard.as_ref().ok_or(ContextError::Released { backend: "json" })?;
                select_json(tree, selector)
            }
            Backend::Memory(slot) => {
                let guard = slot.read();
                match guard.as_ref() {
                    Some(Payload::Json(value)) => select_json(value, selector),
                    Some(Payload::Bytes(_)) => Err(ContextError::Selector {
                        selector: selector.to_string(),
                        message: "binary payloads cannot be projected".to_string(),
                    }),
                    None => Err(ContextError::Released { backend: "memory" }),
                }
            }
            Backend::File(file) => {
                if file.content == FileContent::Bytes {
                    return Err(ContextError::Selector {
                        selector: selector.to_string(),
                        message: "binary payloads cannot be projected".to_string(),
                    });
                }
                let bytes = read_file(&file.path).await?;
                match decode_file(bytes, file.content)? {
                    Payload::Json(value) => select_json(&value, selector),
                    Payload::Bytes(_) => Ok(None),
                }
            }
        }
    }

    /// Raw bytes of the value; files are streamed in chunks
    pub async fn open_stream(&self) -> ContextResult<ByteStream> {
        self.ensure_live()?;
        match &self.backend {
            Backend::File(file) => {
                let handle = match tokio::fs::File::open(&file.path).await {
                    Ok(h) => h,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(ContextError::NotFound {
                            path: file.path.clone(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                };
                let stream = ReaderStream::with_capacity(handle, STREAM_CHUNK)
                    .map(|chunk| chunk.map_err(ContextError::Io));
                Ok(Box::pin(stream))
            }
            _ => {
                let bytes = match self.read().await? {
                    Payload::Bytes(b) => b,
                    Payload::Json(Value::String(s)) => Bytes::from(s),
                    Payload::Json(value) => Bytes::from(serde_json::to_vec(&value)?),
                };
                Ok(Box::pin(futures::stream::once(async move { Ok(bytes) })))
            }
        }
    }

    /// Serializable descriptor for run-state persistence
    pub fn to_descriptor(&self) -> ContextResult<ValueDescriptor> {
        self.ensure_live()?;
        let (locator, inline_value) = match &self.backend {
            Backend::Memory(slot) => {
                let guard = slot.read();
                let payload = guard.as_ref().ok_or(ContextError::Released { backend: "memory" })?;
                (None, Some(ValueDescriptor::inline(payload)))
            }
            Backend::Json(slot) => {
                let guard = slot.read();
                let tree = guard.as_ref().ok_or(ContextError::Released { backend: "json" })?;
                (None, Some(tree.clone()))
            }
            Backend::File(file) => (Some(file.path.to_string_lossy().into_owned()), None),
        };
        let content = match &self.backend {
            Backend::File(file) => Some(file.content),
            _ => None,
        };
        Ok(ValueDescriptor {
            kind: self.backend_kind(),
            locator,
            media_type: self.media_type.clone(),
            size: self.size as i64,
            checksum: self.checksum.clone(),
            inline_value,
            content,
        })
    }

    /// Persist this value and hand its backing file over to the descriptor
    ///
    /// A FILE value stays exclusively owned: after the handoff this instance no longer
    /// deletes the file, and whoever restores the descriptor becomes its only owner.
    /// `to_descriptor` is a snapshot that keeps ownership here.
    pub fn into_descriptor(self) -> ContextResult<ValueDescriptor> {
        let descriptor = self.to_descriptor()?;
        if let Backend::File(file) = &self.backend {
            self.released.store(true, Ordering::Release);
            tracing::debug!("📦 Handed {} over to its descriptor", file.path.display());
        }
        Ok(descriptor)
    }

    /// Free the payload or delete the backing file
    ///
    /// Returns true only for the call that actually performed cleanup. Delete failures
    /// are logged, never raised.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        match &self.backend {
            Backend::Memory(slot) => {
                slot.write().take();
            }
            Backend::Json(slot) => {
                slot.write().take();
            }
            Backend::File(file) => match std::fs::remove_file(&file.path) {
                Ok(()) => tracing::debug!("🗑️ Deleted spool file {}", file.path.display()),
                Err(e) => tracing::warn!(
                    "⚠️ Failed to delete spool file {}: {}",
                    file.path.display(),
                    e
                ),
            },
        }
        true
    }
}

impl Drop for RefValue {
    fn drop(&mut self) {
        self.release();
    }
}

/// Evaluate a pointer, JSONPath or dotted selector against a JSON tree
pub fn select_json(value: &Value, selector: &str) -> ContextResult<Option<Value>> {
    let selector = selector.trim();
    if selector.is_empty() || selector.starts_with('/') {
        return Ok(value.pointer(selector).cloned());
    }
    if selector.starts_with('$') {
        let matches = jsonpath_lib::select(value, selector).map_err(|e| ContextError::Selector {
            selector: selector.to_string(),
            message: format!("{:?}", e),
        })?;
        return Ok(matches.first().map(|v| (*v).clone()));
    }
    Ok(value.pointer(&dotted_to_pointer(selector)).cloned())
}

fn dotted_to_pointer(path: &str) -> String {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect()
}

fn spool_file_name(prefix: &str) -> String {
    format!("{}-{}-{}.ctx", prefix, std::process::id(), uuid::Uuid::new_v4().simple())
}

async fn copy_hashed<R>(reader: &mut R, path: &Path) -> ContextResult<(u64, String)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; STREAM_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    file.flush().await?;
    Ok((total, hex::encode(hasher.finalize())))
}

async fn read_file(path: &Path) -> ContextResult<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ContextError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ContextError::Io(e)
        }
    })
}

fn decode_file(bytes: Vec<u8>, content: FileContent) -> ContextResult<Payload> {
    match content {
        FileContent::Json => Ok(Payload::Json(serde_json::from_slice(&bytes)?)),
        FileContent::Text => String::from_utf8(bytes)
            .map(|s| Payload::Json(Value::String(s)))
            .map_err(|e| ContextError::Decode(e.to_string())),
        FileContent::Bytes => Ok(Payload::Bytes(Bytes::from(bytes))),
    }
}

/// SHA-256 of a file on disk, hex encoded
pub(crate) async fn file_checksum(path: &Path) -> ContextResult<String> {
    let bytes = read_file(path).await?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn selectors() {
        let doc = json!({"user": {"name": "ada", "tags": ["a", "b"]}});
        assert_eq!(select_json(&doc, "/user/name").unwrap(), Some(json!("ada")));
        assert_eq!(select_json(&doc, "$.user.tags[1]").unwrap(), Some(json!("b")));
        assert_eq!(select_json(&doc, "user.tags.0").unwrap(), Some(json!("a")));
        assert_eq!(select_json(&doc, "/missing").unwrap(), None);
        assert_eq!(select_json(&doc, "").unwrap(), Some(doc.clone()));
    }

    #[tokio::test]
    async fn memory_release_is_one_shot() {
        let value = RefValue::memory(Payload::from("hello"), None);
        assert_eq!(value.read().await.unwrap(), Payload::from("hello"));
        assert!(value.release());
        assert!(!value.release());
        assert!(matches!(value.read().await, Err(ContextError::Released { .. })));
    }

    #[tokio::test]
    async fn spooled_text_streams_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let value = RefValue::spool(dir.path(), "t", &Payload::from("abc"), None)
            .await
            .unwrap();
        assert_eq!(value.backend_kind(), BackendKind::File);
        assert_eq!(value.size(), 3);

        let mut stream = value.open_stream().await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"abc");
        assert_eq!(
            value.checksum().unwrap(),
            hex::encode(Sha256::digest(b"abc"))
        );
    }

    #[tokio::test]
    async fn spool_file_name_carries_prefix_and_pid() {
        let dir = tempfile::tempdir().unwrap();
        let value = RefValue::spool(dir.path(), "runx", &Payload::from(vec![1u8, 2, 3]), None)
            .await
            .unwrap();
        let name = value.file_path().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("runx-{}-", std::process::id())));
    }

    #[tokio::test]
    async fn adopting_missing_file_is_not_found() {
        let err = RefValue::from_file("/definitely/not/here.ctx", None).await.unwrap_err();
        assert!(matches!(err, ContextError::NotFound { .. }));
    }
}
