//! Previous-upload storage
//!
//! Remembers which upload URL belongs to which local file so an interrupted
//! upload can be resumed by a later run. Files are identified by a
//! fingerprint over their name, size and the target endpoint.

use super::ClientError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Fingerprint of a local file for one endpoint (sha256, lowercase hex)
pub fn fingerprint(name: &str, size: u64, endpoint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    hasher.update(size.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(endpoint.trim_end_matches('/').as_bytes());
    hex::encode(hasher.finalize())
}

/// An upload started earlier for some fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousUpload {
    pub fingerprint: String,
    pub upload_url: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Where previous uploads are remembered
#[async_trait]
pub trait UrlStorage: Send + Sync {
    /// Uploads recorded for `fingerprint`, newest first
    async fn find_uploads(&self, fingerprint: &str) -> Result<Vec<PreviousUpload>, ClientError>;

    async fn add_upload(&self, upload: PreviousUpload) -> Result<(), ClientError>;

    /// Forget an upload URL
    async fn remove_upload(&self, upload_url: &str) -> Result<(), ClientError>;
}

fn newest_first(all: &[PreviousUpload], fingerprint: &str) -> Vec<PreviousUpload> {
    let mut found: Vec<_> = all
        .iter()
        .filter(|u| u.fingerprint == fingerprint)
        .cloned()
        .collect();
    found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    found
}

/// Storage that lives as long as the process
#[derive(Default)]
pub struct MemoryUrlStorage {
    uploads: Mutex<Vec<PreviousUpload>>,
}

impl MemoryUrlStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.uploads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.lock().is_empty()
    }
}

#[async_trait]
impl UrlStorage for MemoryUrlStorage {
    async fn find_uploads(&self, fingerprint: &str) -> Result<Vec<PreviousUpload>, ClientError> {
        Ok(newest_first(&self.uploads.lock(), fingerprint))
    }

    async fn add_upload(&self, upload: PreviousUpload) -> Result<(), ClientError> {
        self.uploads.lock().push(upload);
        Ok(())
    }

    async fn remove_upload(&self, upload_url: &str) -> Result<(), ClientError> {
        self.uploads.lock().retain(|u| u.upload_url != upload_url);
        Ok(())
    }
}

/// Storage kept in a JSON file
pub struct FileUrlStorage {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    guard: tokio::sync::Mutex<()>,
}

impl FileUrlStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: tokio::sync::Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<PreviousUpload>, ClientError> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) if raw.is_empty() => Ok(Vec::new()),
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| ClientError::Storage(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, uploads: &[PreviousUpload]) -> Result<(), ClientError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec_pretty(uploads)
            .map_err(|e| ClientError::Storage(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl UrlStorage for FileUrlStorage {
    async fn find_uploads(&self, fingerprint: &str) -> Result<Vec<PreviousUpload>, ClientError> {
        let _guard = self.guard.lock().await;
        Ok(newest_first(&self.load().await?, fingerprint))
    }

    async fn add_upload(&self, upload: PreviousUpload) -> Result<(), ClientError> {
        let _guard = self.guard.lock().await;
        let mut uploads = self.load().await?;
        uploads.retain(|u| u.upload_url != upload.upload_url);
        uploads.push(upload);
        self.save(&uploads).await
    }

    async fn remove_upload(&self, upload_url: &str) -> Result<(), ClientError> {
        let _guard = self.guard.lock().await;
        let mut uploads = self.load().await?;
        let before = uploads.len();
        uploads.retain(|u| u.upload_url != upload_url);
        if uploads.len() == before {
            return Ok(());
        }
        self.save(&uploads).await
    }
}
