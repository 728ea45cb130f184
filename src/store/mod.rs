//! Chunk store module
//!
//! Durable, append-only storage for in-progress upload bytes keyed by upload
//! identifier. An append only lands when the caller's expected offset equals
//! the length the store has recorded for that entry; anything else is rejected
//! without touching the stored bytes.

use crate::session::UploadId;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;

pub mod disk;
pub mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// Reader over the bytes of one store entry
pub type EntryReader = Pin<Box<dyn AsyncRead + Send>>;

/// Chunk store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Entry not found: {0}")]
    NotFound(UploadId),

    #[error("Entry already exists: {0}")]
    AlreadyExists(UploadId),

    #[error("Offset mismatch: expected {expected}, stored length is {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl StoreError {
    /// Whether the failed operation may be retried.
    ///
    /// A timed out append can still land after the error is reported, and a
    /// streamed body may have stored earlier buffers before a later one
    /// failed. Callers re-query the stored length before retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Timeout(_))
    }
}

/// Storage backend for upload bytes
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Create an empty entry for a new upload
    async fn create_entry(&self, id: &UploadId) -> Result<(), StoreError>;

    /// Append `data` at `expected_offset`, returning the new stored length.
    ///
    /// The offset check and the write happen atomically. Success is only
    /// reported once the bytes are durable.
    async fn append(
        &self,
        id: &UploadId,
        expected_offset: u64,
        data: Bytes,
    ) -> Result<u64, StoreError>;

    /// Current stored length of an entry
    async fn length(&self, id: &UploadId) -> Result<u64, StoreError>;

    /// Open a reader over the full contents of an entry
    async fn read(&self, id: &UploadId) -> Result<EntryReader, StoreError>;

    /// Remove an entry. Removing a missing entry is not an error.
    async fn delete(&self, id: &UploadId) -> Result<(), StoreError>;

    /// Replace the contents of `target` with the contents of `parts`, in order.
    ///
    /// Returns the merged length.
    async fn concatenate(&self, target: &UploadId, parts: &[UploadId]) -> Result<u64, StoreError>;

    /// Persist an opaque session snapshot next to the entry
    async fn put_info(&self, id: &UploadId, info: Bytes) -> Result<(), StoreError>;

    /// All snapshots previously written with `put_info`
    async fn list_infos(&self) -> Result<Vec<(UploadId, Bytes)>, StoreError>;

    /// Filesystem location of an entry, for backends that have one
    fn path(&self, _id: &UploadId) -> Option<PathBuf> {
        None
    }
}
