//! Filesystem chunk store
//!
//! Each upload is a single file `<root>/<id>` holding the bytes received so
//! far, next to an optional `<root>/<id>.info` sidecar with the serialized
//! session snapshot used to recover sessions after a restart.

use super::{ChunkStore, EntryReader, StoreError};
use crate::session::UploadId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

const INFO_EXTENSION: &str = "info";

/// Chunk store backed by plain files in one directory
pub struct DiskStore {
    root: PathBuf,
    /// Per-entry write locks; makes the length check and the write one step
    locks: DashMap<UploadId, Arc<Mutex<()>>>,
}

impl DiskStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        tracing::info!(root = %root.display(), "Opened disk chunk store");

        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    /// Directory holding the entries
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, id: &UploadId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn info_path(&self, id: &UploadId) -> PathBuf {
        self.root.join(format!("{}.{}", id.as_str(), INFO_EXTENSION))
    }

    fn lock_for(&self, id: &UploadId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn open_for_write(&self, id: &UploadId) -> Result<File, StoreError> {
        OpenOptions::new()
            .write(true)
            .open(self.entry_path(id))
            .await
            .map_err(|e| not_found_or_io(e, id))
    }
}

fn not_found_or_io(e: std::io::Error, id: &UploadId) -> StoreError {
    if e.kind() == ErrorKind::NotFound {
        StoreError::NotFound(id.clone())
    } else {
        StoreError::Io(e)
    }
}

async fn write_durably(file: &mut File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_data().await
}

#[async_trait]
impl ChunkStore for DiskStore {
    async fn create_entry(&self, id: &UploadId) -> Result<(), StoreError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.entry_path(id))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StoreError::AlreadyExists(id.clone()),
                _ => StoreError::Io(e),
            })?;
        file.sync_all().await?;
        Ok(())
    }

    async fn append(
        &self,
        id: &UploadId,
        expected_offset: u64,
        data: Bytes,
    ) -> Result<u64, StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut file = self.open_for_write(id).await?;
        let actual = file.metadata().await?.len();
        if actual != expected_offset {
            return Err(StoreError::OffsetMismatch {
                expected: expected_offset,
                actual,
            });
        }

        if let Err(e) = write_durably(&mut file, expected_offset, &data).await {
            // Leave the entry exactly as long as it was before the call
            if let Err(truncate_err) = file.set_len(expected_offset).await {
                tracing::error!(
                    upload_id = %id,
                    offset = expected_offset,
                    error = %truncate_err,
                    "Failed to roll back partial write"
                );
            }
            return Err(StoreError::Io(e));
        }

        Ok(expected_offset + data.len() as u64)
    }

    async fn length(&self, id: &UploadId) -> Result<u64, StoreError> {
        let meta = fs::metadata(self.entry_path(id))
            .await
            .map_err(|e| not_found_or_io(e, id))?;
        Ok(meta.len())
    }

    async fn read(&self, id: &UploadId) -> Result<EntryReader, StoreError> {
        let file = File::open(self.entry_path(id))
            .await
            .map_err(|e| not_found_or_io(e, id))?;
        Ok(Box::pin(file))
    }

    async fn delete(&self, id: &UploadId) -> Result<(), StoreError> {
        let lock = self.lock_for(id);
        {
            let _guard = lock.lock().await;
            for path in [self.entry_path(id), self.info_path(id)] {
                match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(StoreError::Io(e)),
                }
            }
        }
        self.locks.remove(id);
        Ok(())
    }

    async fn concatenate(&self, target: &UploadId, parts: &[UploadId]) -> Result<u64, StoreError> {
        let lock = self.lock_for(target);
        let _guard = lock.lock().await;

        let mut out = self.open_for_write(target).await?;
        // Discard leftovers of an earlier merge that did not finish
        out.set_len(0).await?;
        out.seek(SeekFrom::Start(0)).await?;

        let mut total = 0u64;
        for part in parts {
            let mut input = File::open(self.entry_path(part))
                .await
                .map_err(|e| not_found_or_io(e, part))?;
            match tokio::io::copy(&mut input, &mut out).await {
                Ok(n) => total += n,
                Err(e) => {
                    let _ = out.set_len(0).await;
                    return Err(StoreError::Io(e));
                }
            }
        }

        out.flush().await?;
        if let Err(e) = out.sync_data().await {
            let _ = out.set_len(0).await;
            return Err(StoreError::Io(e));
        }

        Ok(total)
    }

    async fn put_info(&self, id: &UploadId, info: Bytes) -> Result<(), StoreError> {
        // Write-then-rename so a crash never leaves a torn snapshot behind
        let tmp = self.root.join(format!(".{}.{}.tmp", id.as_str(), INFO_EXTENSION));
        let mut file = File::create(&tmp).await?;
        file.write_all(&info).await?;
        file.sync_all().await?;
        fs::rename(&tmp, self.info_path(id)).await?;
        Ok(())
    }

    async fn list_infos(&self) -> Result<Vec<(UploadId, Bytes)>, StoreError> {
        let mut infos = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(INFO_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<UploadId>().ok())
            else {
                continue;
            };
            let content = fs::read(&path).await?;
            infos.push((id, Bytes::from(content)));
        }

        Ok(infos)
    }

    fn path(&self, id: &UploadId) -> Option<PathBuf> {
        Some(self.entry_path(id))
    }
}
