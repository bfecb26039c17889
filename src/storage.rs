use crate::error::StorageError;
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

/// Persistence for generated artifacts. Sessions hold only handles; the
/// store is what makes results durable.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key` and return its canonical URL.
    async fn put(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError>;

    /// Time-limited URL for an existing key.
    async fn get_presigned(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}

static KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]*(/[A-Za-z0-9][A-Za-z0-9._\-]*)*$")
        .expect("blob key regex compiles")
});

pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if !KEY_RE.is_match(key) || key.split('/').any(|part| part == "..") {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

pub fn clip_key(session_id: &str, index: usize) -> String {
    format!("sessions/{session_id}/clips/clip_{index:03}.mp4")
}

pub fn narration_key(session_id: &str, index: usize) -> String {
    format!("sessions/{session_id}/narration/narration_{index:03}.wav")
}

pub fn final_key(session_id: &str) -> String {
    format!("sessions/{session_id}/final.mp4")
}

/// Blob store backed by a local directory. URLs are `file://` paths; presigned
/// URLs carry an expiry query the way S3-style stores do.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn url_for(path: &Path) -> String {
        format!("file://{}", path.display())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let size = bytes.len();
        fs::write(&path, bytes).await?;
        info!(key, size, "stored blob");
        Ok(Self::url_for(&path))
    }

    async fn get_presigned(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        debug!(key, expires, "presigned local blob");
        Ok(format!("{}?expires={expires}", Self::url_for(&path)))
    }
}

/// Process-memory blob store for ephemeral runs and tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let guard = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = guard.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let guard = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError> {
        validate_key(key)?;
        let mut guard = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(key.to_string(), bytes);
        Ok(format!("mem://{key}"))
    }

    async fn get_presigned(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        validate_key(key)?;
        let guard = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.contains_key(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(format!("mem://{key}?ttl={}", ttl.as_secs()))
    }
}
