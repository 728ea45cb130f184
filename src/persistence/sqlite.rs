//! SQLite-backed record store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite library is
//! required. Calls run on the blocking pool with the connection behind a
//! mutex.

use super::{Owner, PersistenceError, RecordStore};
use crate::completion::CompletionRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Record store backed by a single SQLite database file
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_db()?;
        tracing::info!(database = %path.display(), "Opened completion record database");
        Ok(store)
    }

    /// Idempotent; safe to run on every startup
    fn init_db(&self) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS owners (
                id            TEXT PRIMARY KEY,
                storage_root  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS completion_records (
                id             TEXT PRIMARY KEY,
                upload_id      TEXT NOT NULL UNIQUE,
                file_name      TEXT NOT NULL,
                original_name  TEXT NOT NULL,
                url            TEXT NOT NULL,
                path           TEXT NOT NULL,
                size           INTEGER NOT NULL,
                entity_id      TEXT REFERENCES owners(id),
                uploaded_by    TEXT,
                uploaded_at    TEXT NOT NULL,
                downloads      INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_records_entity
                ON completion_records(entity_id);
            ",
        )?;
        Ok(())
    }

    /// Register or update an owner and its storage root
    pub fn upsert_owner(&self, owner: &Owner) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO owners (id, storage_root) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET storage_root = excluded.storage_root",
            params![owner.id.to_string(), owner.storage_root.to_string_lossy().into_owned()],
        )?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, PersistenceError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| PersistenceError::Task(e.to_string()))?
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        upload_id: row.get(1)?,
        file_name: row.get(2)?,
        original_name: row.get(3)?,
        url: row.get(4)?,
        path: row.get(5)?,
        size: row.get(6)?,
        entity_id: row.get(7)?,
        uploaded_by: row.get(8)?,
        uploaded_at: row.get(9)?,
    })
}

/// Row as stored, before parsing ids and timestamps
struct RawRecord {
    id: String,
    upload_id: String,
    file_name: String,
    original_name: String,
    url: String,
    path: String,
    size: i64,
    entity_id: Option<String>,
    uploaded_by: Option<String>,
    uploaded_at: String,
}

impl TryFrom<RawRecord> for CompletionRecord {
    type Error = PersistenceError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        let parse_uuid = |s: &str| {
            uuid::Uuid::parse_str(s).map_err(|e| PersistenceError::Corrupt(e.to_string()))
        };

        Ok(CompletionRecord {
            id: parse_uuid(&raw.id)?,
            upload_id: raw.upload_id,
            file_name: raw.file_name,
            original_name: raw.original_name,
            url: raw.url,
            path: PathBuf::from(raw.path),
            size: u64::try_from(raw.size).map_err(|e| PersistenceError::Corrupt(e.to_string()))?,
            entity_id: raw.entity_id.as_deref().map(parse_uuid).transpose()?,
            uploaded_by: raw.uploaded_by,
            uploaded_at: DateTime::parse_from_rfc3339(&raw.uploaded_at)
                .map_err(|e| PersistenceError::Corrupt(e.to_string()))?
                .with_timezone(&Utc),
        })
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn add_record(&self, record: &CompletionRecord) -> Result<(), PersistenceError> {
        let record = record.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO completion_records
                    (id, upload_id, file_name, original_name, url, path, size,
                     entity_id, uploaded_by, uploaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id.to_string(),
                    record.upload_id,
                    record.file_name,
                    record.original_name,
                    record.url,
                    record.path.to_string_lossy().into_owned(),
                    record.size as i64,
                    record.entity_id.map(|id| id.to_string()),
                    record.uploaded_by,
                    record.uploaded_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn find_owner_by_id(&self, id: uuid::Uuid) -> Result<Option<Owner>, PersistenceError> {
        self.blocking(move |conn| {
            let root: Option<String> = conn
                .query_row(
                    "SELECT storage_root FROM owners WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(root.map(|root| Owner {
                id,
                storage_root: PathBuf::from(root),
            }))
        })
        .await
    }

    async fn list_records(
        &self,
        entity_id: Option<uuid::Uuid>,
    ) -> Result<Vec<CompletionRecord>, PersistenceError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, upload_id, file_name, original_name, url, path, size,
                        entity_id, uploaded_by, uploaded_at
                 FROM completion_records
                 WHERE entity_id IS ?1
                 ORDER BY uploaded_at, rowid",
            )?;
            let rows = stmt
                .query_map(params![entity_id.map(|id| id.to_string())], record_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(CompletionRecord::try_from).collect()
        })
        .await
    }
}
