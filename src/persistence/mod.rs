//! Persistence layer for completion records
//!
//! Consulted only by the completion dispatcher: it looks up the owning entity
//! of an upload and stores one [`CompletionRecord`] per finished upload.

use crate::completion::CompletionRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;

/// Persistence errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Entity that completed uploads are filed under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    pub id: uuid::Uuid,
    /// Drive or directory holding this owner's `CompletedFiles` folder
    pub storage_root: PathBuf,
}

/// Durable datastore for completion records
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn add_record(&self, record: &CompletionRecord) -> Result<(), PersistenceError>;

    async fn find_owner_by_id(&self, id: uuid::Uuid) -> Result<Option<Owner>, PersistenceError>;

    /// Records filed under `entity_id`, oldest first
    async fn list_records(
        &self,
        entity_id: Option<uuid::Uuid>,
    ) -> Result<Vec<CompletionRecord>, PersistenceError>;
}
