//! In-memory chunk store
//!
//! Keeps every entry in a `Vec<u8>`. Nothing survives the process; used by
//! tests and for throwaway servers.

use super::{ChunkStore, EntryReader, StoreError};
use crate::session::UploadId;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Cursor;

#[derive(Default)]
struct Inner {
    entries: HashMap<UploadId, Vec<u8>>,
    infos: HashMap<UploadId, Bytes>,
}

/// Chunk store held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn create_entry(&self, id: &UploadId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.clone()));
        }
        inner.entries.insert(id.clone(), Vec::new());
        Ok(())
    }

    async fn append(
        &self,
        id: &UploadId,
        expected_offset: u64,
        data: Bytes,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let actual = entry.len() as u64;
        if actual != expected_offset {
            return Err(StoreError::OffsetMismatch {
                expected: expected_offset,
                actual,
            });
        }

        entry.extend_from_slice(&data);
        Ok(entry.len() as u64)
    }

    async fn length(&self, id: &UploadId) -> Result<u64, StoreError> {
        self.inner
            .lock()
            .entries
            .get(id)
            .map(|e| e.len() as u64)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn read(&self, id: &UploadId) -> Result<EntryReader, StoreError> {
        let data = self
            .inner
            .lock()
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn delete(&self, id: &UploadId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.entries.remove(id);
        inner.infos.remove(id);
        Ok(())
    }

    async fn concatenate(&self, target: &UploadId, parts: &[UploadId]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();

        let mut merged = Vec::new();
        for part in parts {
            let bytes = inner
                .entries
                .get(part)
                .ok_or_else(|| StoreError::NotFound(part.clone()))?;
            merged.extend_from_slice(bytes);
        }

        let entry = inner
            .entries
            .get_mut(target)
            .ok_or_else(|| StoreError::NotFound(target.clone()))?;
        *entry = merged;
        Ok(entry.len() as u64)
    }

    async fn put_info(&self, id: &UploadId, info: Bytes) -> Result<(), StoreError> {
        self.inner.lock().infos.insert(id.clone(), info);
        Ok(())
    }

    async fn list_infos(&self) -> Result<Vec<(UploadId, Bytes)>, StoreError> {
        Ok(self
            .inner
            .lock()
            .infos
            .iter()
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect())
    }
}
