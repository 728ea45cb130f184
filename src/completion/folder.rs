//! Folder dispatcher
//!
//! Files finished uploads under `<root>/CompletedFiles/<entity>/<name>` and
//! records them through a [`RecordStore`].
//!
//! # Flow
//!
//! 1. Resolve the destination folder from the entity id in the metadata
//! 2. Stream the content into a hidden staging file in that folder
//! 3. Reserve the final name with a no-clobber hard link, stepping through
//!    `name`, `name-1`, `name-2`, ... on collisions
//! 4. Insert the record; on failure unlink the reserved name again
//! 5. Drop the staging file
//!
//! A crash between steps 3 and 4 leaves the `.staging` file behind, which
//! marks the upload for reconciliation.

use super::naming::{candidate_name, sanitize_filename};
use super::{CompletedUpload, CompletionDispatcher, CompletionRecord, DispatchError};
use crate::metrics;
use crate::persistence::RecordStore;
use crate::session::Metadata;
use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Folder under each storage root that holds completed files
pub const COMPLETED_FOLDER: &str = "CompletedFiles";

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct FolderDispatcherConfig {
    /// Root used for uploads that name no owning entity
    pub default_root: PathBuf,
    pub filename_key: String,
    pub entity_key: Option<String>,
    pub max_collision_attempts: u32,
}

impl Default for FolderDispatcherConfig {
    fn default() -> Self {
        Self {
            default_root: PathBuf::from("./data"),
            filename_key: "filename".into(),
            entity_key: Some("postid".into()),
            max_collision_attempts: 10_000,
        }
    }
}

/// Moves completed uploads into their owner's folder
pub struct FolderDispatcher {
    config: FolderDispatcherConfig,
    records: Arc<dyn RecordStore>,
}

impl FolderDispatcher {
    pub fn new(config: FolderDispatcherConfig, records: Arc<dyn RecordStore>) -> Self {
        Self { config, records }
    }

    /// Destination folder, relative url prefix and entity id for an upload
    async fn resolve_destination(
        &self,
        metadata: &Metadata,
    ) -> Result<(PathBuf, String, Option<uuid::Uuid>), DispatchError> {
        let entity = self
            .config
            .entity_key
            .as_deref()
            .and_then(|key| metadata.get_str(key))
            .and_then(|raw| uuid::Uuid::parse_str(raw.trim()).ok());

        match entity {
            Some(entity_id) => {
                let owner = self
                    .records
                    .find_owner_by_id(entity_id)
                    .await
                    .map_err(DispatchError::Lookup)?
                    .ok_or(DispatchError::UnknownEntity(entity_id))?;
                let dir = owner
                    .storage_root
                    .join(COMPLETED_FOLDER)
                    .join(entity_id.to_string());
                Ok((dir, format!("/{}/{}", COMPLETED_FOLDER, entity_id), Some(entity_id)))
            }
            None => Ok((
                self.config.default_root.join(COMPLETED_FOLDER),
                format!("/{}", COMPLETED_FOLDER),
                None,
            )),
        }
    }

    /// Link `staging` under the first free candidate name in `dir`
    async fn reserve_name(
        &self,
        staging: &Path,
        dir: &Path,
        name: &str,
    ) -> Result<String, DispatchError> {
        for attempt in 0..self.config.max_collision_attempts {
            let candidate = candidate_name(name, attempt);
            match fs::hard_link(staging, dir.join(&candidate)).await {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(DispatchError::Io(e)),
            }
        }

        Err(DispatchError::CollisionResolutionExhausted {
            name: name.to_string(),
            attempts: self.config.max_collision_attempts,
        })
    }
}

async fn stage_content(upload: &mut CompletedUpload, staging: &Path) -> std::io::Result<u64> {
    let mut file = fs::File::create(staging).await?;
    let written = tokio::io::copy(&mut upload.content, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

async fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => true,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to remove file");
            false
        }
    }
}

#[async_trait]
impl CompletionDispatcher for FolderDispatcher {
    #[tracing::instrument(
        name = "completion.dispatch",
        skip(self, upload),
        fields(upload_id = %upload.id, upload.bytes = upload.size),
        err
    )]
    async fn dispatch(
        &self,
        mut upload: CompletedUpload,
    ) -> Result<CompletionRecord, DispatchError> {
        let start = Instant::now();

        let original_name = upload
            .metadata
            .get_str(&self.config.filename_key)
            .map(str::to_string)
            .ok_or(DispatchError::MissingFilename)?;
        let name = sanitize_filename(&original_name).ok_or(DispatchError::MissingFilename)?;

        let (dir, url_prefix, entity_id) = self.resolve_destination(&upload.metadata).await?;
        fs::create_dir_all(&dir).await?;

        let staging = dir.join(format!(".{}.staging", upload.id));
        let size = match stage_content(&mut upload, &staging).await {
            Ok(size) => size,
            Err(e) => {
                remove_quietly(&staging).await;
                return Err(DispatchError::Io(e));
            }
        };

        let file_name = match self.reserve_name(&staging, &dir, &name).await {
            Ok(file_name) => file_name,
            Err(e) => {
                remove_quietly(&staging).await;
                return Err(e);
            }
        };
        let path = dir.join(&file_name);

        if file_name != name {
            tracing::info!(original = %name, renamed = %file_name, "Resolved file name collision");
        }

        let record = CompletionRecord {
            id: uuid::Uuid::new_v4(),
            upload_id: upload.id.to_string(),
            file_name: file_name.clone(),
            original_name,
            url: format!("{}/{}", url_prefix, file_name),
            path: path.clone(),
            size,
            entity_id,
            uploaded_by: upload.owner.clone(),
            uploaded_at: Utc::now(),
        };

        if let Err(source) = self.records.add_record(&record).await {
            let rolled_back = remove_quietly(&path).await;
            remove_quietly(&staging).await;
            metrics::record_error("persistence");
            return Err(DispatchError::PersistenceFailure {
                path,
                rolled_back,
                source,
            });
        }

        remove_quietly(&staging).await;

        tracing::info!(
            path = %record.path.display(),
            url = %record.url,
            size = record.size,
            duration_ms = start.elapsed().as_millis(),
            "Completed upload filed"
        );

        Ok(record)
    }
}
