//! Blob storage for custom resource content
//!
//! Blobs are content-addressed: the id is the lowercase hex SHA-256 of the
//! bytes, so storing the same file twice yields one blob.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Error, Result};

/// Where custom resource bytes live
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes, returning the blob id
    async fn put(&self, bytes: Vec<u8>, filename: &str, content_type: &str) -> Result<String>;

    /// Bytes and content type for a blob id
    async fn get(&self, blob_id: &str) -> Result<(Vec<u8>, String)>;
}

/// Content address of `bytes`
#[must_use]
pub fn blob_id(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// MIME type from a file extension
#[must_use]
pub fn guess_content_type(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("txt" | "log") => "text/plain",
        Some("md" | "markdown") => "text/markdown",
        Some("csv") => "text/csv",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("yaml" | "yml") => "application/yaml",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Whether content of this type can be spliced into prompt text
#[must_use]
pub fn is_textual(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("text/")
        || matches!(
            essence.as_str(),
            "application/json" | "application/yaml" | "application/xml" | "application/x-yaml"
        )
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlobMeta {
    filename: String,
    content_type: String,
}

/// Process-local blob store
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, (Vec<u8>, BlobMeta)>,
}

impl MemoryBlobStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>, filename: &str, content_type: &str) -> Result<String> {
        let id = blob_id(&bytes);
        let meta = BlobMeta {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
        };
        self.blobs.insert(id.clone(), (bytes, meta));
        Ok(id)
    }

    async fn get(&self, blob_id: &str) -> Result<(Vec<u8>, String)> {
        self.blobs
            .get(blob_id)
            .map(|entry| (entry.0.clone(), entry.1.content_type.clone()))
            .ok_or_else(|| Error::ResourceNotFound(blob_id.to_string()))
    }
}

/// Filesystem blob store: `<dir>/<id>` plus a `<dir>/<id>.json` sidecar
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    /// Open (and create) the store directory
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Blob store ready");
        Ok(Self { dir })
    }

    fn paths(&self, blob_id: &str) -> Result<(PathBuf, PathBuf)> {
        if blob_id.len() != 64 || !blob_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::ResourceNotFound(blob_id.to_string()));
        }
        Ok((
            self.dir.join(blob_id),
            self.dir.join(format!("{blob_id}.json")),
        ))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: Vec<u8>, filename: &str, content_type: &str) -> Result<String> {
        let id = blob_id(&bytes);
        let (data_path, meta_path) = self.paths(&id)?;
        let meta = BlobMeta {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
        };
        tokio::fs::write(&data_path, &bytes).await?;
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?).await?;
        debug!(blob_id = %id, size = bytes.len(), "Stored blob");
        Ok(id)
    }

    async fn get(&self, blob_id: &str) -> Result<(Vec<u8>, String)> {
        let (data_path, meta_path) = self.paths(blob_id)?;
        let bytes = match tokio::fs::read(&data_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ResourceNotFound(blob_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let content_type = match tokio::fs::read(&meta_path).await {
            Ok(raw) => serde_json::from_slice::<BlobMeta>(&raw)?.content_type,
            Err(_) => "application/octet-stream".to_string(),
        };
        Ok((bytes, content_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_ids_are_sha256_hex() {
        assert_eq!(
            blob_id(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn content_type_guessing() {
        assert_eq!(guess_content_type("notes.MD"), "text/markdown");
        assert_eq!(guess_content_type("photo.jpeg"), "image/jpeg");
        assert_eq!(guess_content_type("noext"), "application/octet-stream");
    }

    #[test]
    fn textual_types() {
        assert!(is_textual("text/plain; charset=utf-8"));
        assert!(is_textual("application/json"));
        assert!(is_textual("application/ld+json"));
        assert!(!is_textual("image/png"));
        assert!(!is_textual("application/octet-stream"));
    }

    #[tokio::test]
    async fn memory_store_roundtrip_and_missing() {
        let store = MemoryBlobStore::new();
        let id = store
            .put(b"body".to_vec(), "a.txt", "text/plain")
            .await
            .unwrap();
        let (bytes, content_type) = store.get(&id).await.unwrap();
        assert_eq!(bytes, b"body");
        assert_eq!(content_type, "text/plain");
        assert!(matches!(
            store.get("missing").await,
            Err(Error::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn fs_store_writes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        let id = store
            .put(b"# Title".to_vec(), "readme.md", "text/markdown")
            .await
            .unwrap();

        assert!(dir.path().join(&id).exists());
        let sidecar = std::fs::read_to_string(dir.path().join(format!("{id}.json"))).unwrap();
        assert!(sidecar.contains("readme.md"));

        let (bytes, content_type) = store.get(&id).await.unwrap();
        assert_eq!(bytes, b"# Title");
        assert_eq!(content_type, "text/markdown");
    }

    #[tokio::test]
    async fn fs_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.get("../etc/passwd").await,
            Err(Error::ResourceNotFound(_))
        ));
    }
}
