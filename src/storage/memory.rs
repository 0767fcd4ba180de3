//! In-Memory Message Store
//!
//! Information Hiding:
//! - Record vector hidden behind the store trait
//! - Thread-safe access via RwLock hidden behind async interface
//! - Suitable for testing and dry runs

use super::{merge_records, LoadedStore, MessageRecord, MessageStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory store. Data is lost when the process terminates.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    records: Arc<RwLock<Vec<MessageRecord>>>,
    saves: Arc<RwLock<usize>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<MessageRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
            saves: Arc::default(),
        }
    }

    pub async fn snapshot(&self) -> Vec<MessageRecord> {
        self.records.read().await.clone()
    }

    /// Number of `save` calls observed so far.
    pub async fn save_count(&self) -> usize {
        *self.saves.read().await
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn load(&self) -> Result<LoadedStore, StoreError> {
        let records = self.records.read().await.clone();
        tracing::debug!("[InMemoryStore] Loaded {} records", records.len());
        Ok(LoadedStore::from_records(records))
    }

    async fn save(
        &self,
        existing: &[MessageRecord],
        new: &[MessageRecord],
    ) -> Result<(), StoreError> {
        let merged = merge_records(existing, new);
        tracing::debug!("[InMemoryStore] Saved {} records", merged.len());
        *self.records.write().await = merged;
        *self.saves.write().await += 1;
        Ok(())
    }
}
