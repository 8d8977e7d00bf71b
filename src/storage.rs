//! Object storage for original, processed and thumbnail images.
//!
//! Keys are slash-separated and book-scoped (`books/{book_id}/...`). The
//! filesystem store maps a key to a path under its root directory.
use crate::error::PipelineError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::instrument;
use uuid::Uuid;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub fn book_prefix(book_id: i64) -> String {
    format!("books/{}/", book_id)
}

/// Permanent key for a newly imported original image.
pub fn original_key(book_id: i64, extension: &str) -> String {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    let ext = if ext.is_empty() || !ext.bytes().all(|b| b.is_ascii_alphanumeric()) {
        "jpg".to_string()
    } else {
        ext
    };
    format!("{}{}.{}", book_prefix(book_id), Uuid::new_v4().simple(), ext)
}

fn io_error(err: std::io::Error, key: &str) -> anyhow::Error {
    match err.kind() {
        ErrorKind::NotFound => PipelineError::NotFound(key.to_string()).into(),
        ErrorKind::PermissionDenied => PipelineError::AccessDenied(key.to_string()).into(),
        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
            PipelineError::Transient(format!("{}: {}", key, err)).into()
        }
        _ => anyhow::Error::new(err).context(format!("storage error for {}", key)),
    }
}

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let safe = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(PipelineError::Invalid(format!("invalid object key {:?}", key)).into());
        }
        Ok(self.root.join(rel))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        fs::read(&path).await.map_err(|e| io_error(e, key))
    }

    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        // Write to a sibling temp file first so readers never see a partial object.
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        fs::write(&tmp, bytes).await.map_err(|e| io_error(e, key))?;
        fs::rename(&tmp, &path).await.map_err(|e| io_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e, key)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        fs::try_exists(&path).await.map_err(|e| io_error(e, key))
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(anyhow!(e).context(format!("failed to list {}", dir.display()))),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) && !key.contains(".tmp-") {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
