//! In-memory record store

use super::{Owner, PersistenceError, RecordStore};
use crate::completion::CompletionRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Record store held in memory, for tests and throwaway servers
#[derive(Default)]
pub struct MemoryRecordStore {
    owners: Mutex<HashMap<uuid::Uuid, Owner>>,
    records: Mutex<Vec<CompletionRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_owner(&self, owner: Owner) {
        self.owners.lock().insert(owner.id, owner);
    }

    /// Snapshot of every stored record
    pub fn records(&self) -> Vec<CompletionRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn add_record(&self, record: &CompletionRecord) -> Result<(), PersistenceError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn find_owner_by_id(&self, id: uuid::Uuid) -> Result<Option<Owner>, PersistenceError> {
        Ok(self.owners.lock().get(&id).cloned())
    }

    async fn list_records(
        &self,
        entity_id: Option<uuid::Uuid>,
    ) -> Result<Vec<CompletionRecord>, PersistenceError> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.entity_id == entity_id)
            .cloned()
            .collect())
    }
}
