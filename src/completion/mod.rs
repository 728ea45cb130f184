//! Completion dispatch
//!
//! Runs once per finished upload: files the assembled bytes under their final
//! name and persists a [`CompletionRecord`].

use crate::persistence::PersistenceError;
use crate::session::{Metadata, UploadId};
use crate::store::EntryReader;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub mod folder;
pub mod naming;

pub use folder::FolderDispatcher;

/// Completion errors
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Upload has no usable file name")]
    MissingFilename,

    #[error("Unknown owning entity: {0}")]
    UnknownEntity(uuid::Uuid),

    #[error("No free file name for '{name}' after {attempts} attempts")]
    CollisionResolutionExhausted { name: String, attempts: u32 },

    #[error("Failed to persist completion record for {path:?} (file rolled back: {rolled_back}): {source}")]
    PersistenceFailure {
        path: PathBuf,
        rolled_back: bool,
        #[source]
        source: PersistenceError,
    },

    #[error("Persistence lookup failed: {0}")]
    Lookup(#[source] PersistenceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A finished upload handed to the dispatcher
pub struct CompletedUpload {
    pub id: UploadId,
    pub metadata: Metadata,
    pub size: u64,
    /// Authenticated identity that created the upload
    pub owner: Option<String>,
    pub content: EntryReader,
}

/// Durable record of one completed upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub id: uuid::Uuid,
    pub upload_id: String,
    /// Final (possibly disambiguated) file name
    pub file_name: String,
    /// Name the client sent
    pub original_name: String,
    pub url: String,
    pub path: PathBuf,
    pub size: u64,
    /// Owning entity the file was filed under
    pub entity_id: Option<uuid::Uuid>,
    pub uploaded_by: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// Post-processing hook invoked by the session manager
#[async_trait]
pub trait CompletionDispatcher: Send + Sync {
    async fn dispatch(&self, upload: CompletedUpload) -> Result<CompletionRecord, DispatchError>;
}
