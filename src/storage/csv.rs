//! CSV File Message Store
//!
//! Information Hiding:
//! - File path, header layout and date format hidden from users
//! - Whole-file replacement via a sibling temp file and rename
//! - Parse failures mapped to a single corruption error

use super::{merge_records, LoadedStore, MessageRecord, MessageStore, StoreError, COLUMNS};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

/// File-backed store: one header row then one row per message.
pub struct CsvStore {
    path: PathBuf,
}

impl CsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, detail: impl Into<String>) -> StoreError {
        StoreError::Corrupt {
            path: self.path.clone(),
            detail: detail.into(),
        }
    }

    fn encode(&self, detail: impl Into<String>) -> StoreError {
        StoreError::Encode {
            path: self.path.clone(),
            detail: detail.into(),
        }
    }

    fn io(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<MessageRecord>, StoreError> {
        let mut reader = ::csv::Reader::from_reader(bytes);

        let headers = reader
            .headers()
            .map_err(|e| self.corrupt(format!("unreadable header: {}", e)))?
            .clone();
        for column in COLUMNS {
            if !headers.iter().any(|h| h == column) {
                return Err(self.corrupt(format!("missing column '{}'", column)));
            }
        }

        let mut records = Vec::new();
        for (index, row) in reader.deserialize::<MessageRecord>().enumerate() {
            // +2: header is line 1
            let record = row.map_err(|e| self.corrupt(format!("line {}: {}", index + 2, e)))?;
            records.push(record);
        }

        Ok(records)
    }

    fn render(&self, rows: &[MessageRecord]) -> Result<Vec<u8>, StoreError> {
        let mut writer = ::csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());

        writer
            .write_record(COLUMNS)
            .map_err(|e| self.encode(format!("header: {}", e)))?;
        for row in rows {
            writer
                .serialize(row)
                .map_err(|e| self.encode(format!("message {}: {}", row.message_id, e)))?;
        }

        writer
            .into_inner()
            .map_err(|e| self.encode(format!("flush: {}", e)))
    }
}

#[async_trait]
impl MessageStore for CsvStore {
    async fn load(&self) -> Result<LoadedStore, StoreError> {
        if !fs::try_exists(&self.path)
            .await
            .map_err(|e| self.io(&self.path, e))?
        {
            tracing::debug!("[CsvStore] {:?} does not exist, starting empty", self.path);
            return Ok(LoadedStore::default());
        }

        let bytes = fs::read(&self.path)
            .await
            .map_err(|e| self.io(&self.path, e))?;
        let records = self.parse(&bytes)?;
        let store = LoadedStore::from_records(records);

        if store.ids.len() != store.records.len() {
            tracing::warn!(
                "[CsvStore] {:?} holds {} rows but only {} distinct message ids",
                self.path,
                store.records.len(),
                store.ids.len()
            );
        }

        tracing::debug!(
            "[CsvStore] Loaded {} records from {:?}",
            store.records.len(),
            self.path
        );
        Ok(store)
    }

    async fn save(
        &self,
        existing: &[MessageRecord],
        new: &[MessageRecord],
    ) -> Result<(), StoreError> {
        let merged = merge_records(existing, new);
        let bytes = self.render(&merged)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io(parent, e))?;
        }

        let temp = self.temp_path();
        fs::write(&temp, bytes)
            .await
            .map_err(|e| self.io(&temp, e))?;
        fs::rename(&temp, &self.path)
            .await
            .map_err(|e| self.io(&self.path, e))?;

        tracing::debug!("[CsvStore] Wrote {} records to {:?}", merged.len(), self.path);
        Ok(())
    }
}
