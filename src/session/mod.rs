//! Upload session module
//!
//! Tracks per-upload state (declared length, bytes received, metadata,
//! concatenation role) and enforces the protocol invariants on top of a
//! [`ChunkStore`](crate::store::ChunkStore).

use crate::completion::{naming, CompletionRecord};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub mod manager;
pub mod metadata;

pub use manager::SessionManager;
pub use metadata::{Metadata, MetadataError};

/// Opaque upload identifier (32 lowercase hex characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UploadId(String);

impl UploadId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UploadId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 32 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            Ok(Self(s.to_string()))
        } else {
            Err(SessionError::Validation(format!("Invalid upload id '{}'", s)))
        }
    }
}

impl TryFrom<String> for UploadId {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UploadId> for String {
    fn from(value: UploadId) -> Self {
        value.0
    }
}

/// Concatenation role of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "parts", rename_all = "lowercase")]
pub enum ConcatRole {
    #[default]
    None,
    /// A fragment that will be joined into a final upload
    Partial,
    /// Joins the listed partial uploads, in this order
    Final(Vec<UploadId>),
}

impl ConcatRole {
    pub fn is_partial(&self) -> bool {
        matches!(self, ConcatRole::Partial)
    }

    pub fn is_final(&self) -> bool {
        matches!(self, ConcatRole::Final(_))
    }
}

/// Protocol state of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Receiving,
    Complete,
}

/// Outcome of post-upload processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompletionState {
    /// Upload still in progress
    Pending,
    /// Partial uploads are fragments and never dispatched
    Skipped,
    Dispatched { record: CompletionRecord },
    /// Bytes are safe in the store; processing needs reconciliation
    Failed { reason: String },
}

/// One resumable upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: UploadId,
    /// `None` while the client defers the length
    pub declared_length: Option<u64>,
    pub bytes_received: u64,
    pub metadata: Metadata,
    pub concat: ConcatRole,
    /// Authenticated identity that created the upload, if any
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completion: CompletionState,
    /// A timed out store write may still land after the session gave up on it
    #[serde(skip)]
    pub(crate) offset_unsettled: bool,
}

impl UploadSession {
    pub fn is_complete(&self) -> bool {
        self.declared_length == Some(self.bytes_received)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn state(&self) -> SessionState {
        if self.is_complete() {
            SessionState::Complete
        } else if self.bytes_received == 0 {
            SessionState::Created
        } else {
            SessionState::Receiving
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id.clone(),
            bytes_received: self.bytes_received,
            declared_length: self.declared_length,
            complete: self.is_complete(),
            state: self.state(),
            metadata: self.metadata.clone(),
            concat: self.concat.clone(),
            expires_at: self.expires_at,
            completion: self.completion.clone(),
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub id: UploadId,
    pub bytes_received: u64,
    pub declared_length: Option<u64>,
    pub complete: bool,
    pub state: SessionState,
    pub metadata: Metadata,
    pub concat: ConcatRole,
    pub expires_at: DateTime<Utc>,
    pub completion: CompletionState,
}

/// Parameters for creating a session
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub declared_length: Option<u64>,
    pub metadata: Metadata,
    pub concat: ConcatRole,
    pub owner: Option<String>,
}

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Offset mismatch: client sent {expected}, server has {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("Partial upload {0} is not complete")]
    IncompleteDependency(UploadId),

    #[error("Upload not found: {0}")]
    NotFound(UploadId),

    #[error("Invalid concatenation: {0}")]
    InvalidConcat(String),

    #[error("Operation not allowed: {0}")]
    Forbidden(String),

    #[error("Upload of {declared} bytes cannot hold {attempted} bytes")]
    ExceedsLength { declared: u64, attempted: u64 },

    #[error("Upload size {size} exceeds maximum of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("Request body interrupted: {0}")]
    Interrupted(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl SessionError {
    /// Whether a client may retry the same operation after re-querying status
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::OffsetMismatch { .. } | SessionError::Interrupted(_) => true,
            SessionError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::OffsetMismatch { expected, actual } => {
                SessionError::OffsetMismatch { expected, actual }
            }
            StoreError::NotFound(id) => SessionError::NotFound(id),
            other => SessionError::Store(other),
        }
    }
}

impl From<MetadataError> for SessionError {
    fn from(e: MetadataError) -> Self {
        SessionError::Validation(e.to_string())
    }
}

/// Rules applied to every session
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Keys that non-partial uploads must carry with a non-empty value
    pub required_metadata: Vec<String>,
    /// Metadata key holding the original file name
    pub filename_key: String,
    /// Metadata key holding the owning entity id, if uploads are filed per entity
    pub entity_key: Option<String>,
    pub max_size: Option<u64>,
    /// Idle time after which an upload is evicted
    pub expiration: Duration,
    /// Bound on each store operation
    pub io_timeout: Duration,
    /// Body bytes buffered before each durable append
    pub write_buffer_size: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            required_metadata: vec!["filename".into()],
            filename_key: "filename".into(),
            entity_key: Some("postid".into()),
            max_size: None,
            expiration: Duration::from_secs(24 * 60 * 60),
            io_timeout: Duration::from_secs(30),
            write_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl SessionPolicy {
    /// Validate metadata for a new session.
    ///
    /// Partial uploads are fragments and carry no final metadata, so they
    /// skip every check.
    pub fn validate(&self, metadata: &Metadata, concat: &ConcatRole) -> Result<(), SessionError> {
        if concat.is_partial() {
            return Ok(());
        }

        for key in &self.required_metadata {
            if metadata.has_empty_value(key) {
                return Err(SessionError::Validation(format!(
                    "{} metadata must be specified",
                    key
                )));
            }
        }

        if let Some(raw) = metadata.get(&self.filename_key) {
            let name = std::str::from_utf8(raw).map_err(|_| {
                SessionError::Validation(format!("{} metadata must be UTF-8", self.filename_key))
            })?;
            if naming::sanitize_filename(name).is_none() {
                return Err(SessionError::Validation(format!(
                    "'{}' is not a usable file name",
                    name
                )));
            }
        }

        if let Some(entity_key) = &self.entity_key {
            if let Some(raw) = metadata.get(entity_key) {
                let valid = std::str::from_utf8(raw)
                    .ok()
                    .and_then(|s| uuid::Uuid::parse_str(s.trim()).ok())
                    .is_some();
                if !valid {
                    return Err(SessionError::Validation(format!(
                        "{} metadata must be a UUID",
                        entity_key
                    )));
                }
            }
        }

        Ok(())
    }
}
