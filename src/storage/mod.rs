//! Message Store Abstraction
//!
//! Information Hiding:
//! - Storage backend implementation details hidden behind trait
//! - Allows swapping between the CSV file and an in-memory set without touching the fetcher
//! - Merge logic is a pure function, independent of any backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

pub mod csv;
pub mod memory;

pub use self::csv::CsvStore;
pub use self::memory::InMemoryStore;

/// One persisted message. Column order matches the file header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(deserialize_with = "serde_lenient::int")]
    pub message_id: i64,
    #[serde(deserialize_with = "serde_lenient::opt_int")]
    pub sender_id: Option<i64>,
    pub message: String,
    #[serde(with = "serde_date")]
    pub date: DateTime<Utc>,
}

/// Column names of the persisted file, in order.
pub const COLUMNS: [&str; 4] = ["message_id", "sender_id", "message", "date"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store file {} is corrupt: {detail}", path.display())]
    Corrupt { path: PathBuf, detail: String },

    #[error("store I/O failed on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode records for {}: {detail}", path.display())]
    Encode { path: PathBuf, detail: String },
}

impl StoreError {
    /// True only when the persisted data itself cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Snapshot of the store taken at the start of a cycle.
#[derive(Debug, Clone, Default)]
pub struct LoadedStore {
    pub ids: HashSet<i64>,
    pub records: Vec<MessageRecord>,
}

impl LoadedStore {
    pub fn from_records(records: Vec<MessageRecord>) -> Self {
        let ids = records.iter().map(|r| r.message_id).collect();
        Self { ids, records }
    }

    pub fn contains(&self, message_id: i64) -> bool {
        self.ids.contains(&message_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn summary(&self) -> StoreSummary {
        let min = self.ids.iter().min().copied();
        let max = self.ids.iter().max().copied();

        StoreSummary {
            records: self.records.len(),
            distinct_ids: self.ids.len(),
            id_range: min.zip(max),
            latest: self.records.iter().map(|r| r.date).max(),
        }
    }
}

/// Counts and ranges shown by the `stats` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSummary {
    pub records: usize,
    pub distinct_ids: usize,
    pub id_range: Option<(i64, i64)>,
    pub latest: Option<DateTime<Utc>>,
}

/// Existing records first, then the new ones in fetch order.
///
/// New records whose id is already present (in `existing` or earlier in
/// `new`) are dropped, so the result never gains a duplicate id.
pub fn merge_records(existing: &[MessageRecord], new: &[MessageRecord]) -> Vec<MessageRecord> {
    let mut seen: HashSet<i64> = existing.iter().map(|r| r.message_id).collect();
    let mut merged = Vec::with_capacity(existing.len() + new.len());
    merged.extend_from_slice(existing);

    for record in new {
        if seen.insert(record.message_id) {
            merged.push(record.clone());
        }
    }

    merged
}

/// Trait defining the message store interface
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Load every persisted record.
    /// Returns an empty store if nothing has been persisted yet.
    async fn load(&self) -> Result<LoadedStore, StoreError>;

    /// Replace the persisted contents with `existing` followed by `new`.
    async fn save(
        &self,
        existing: &[MessageRecord],
        new: &[MessageRecord],
    ) -> Result<(), StoreError>;
}

/// Integer columns may come back as `"42.0"` when a nullable integer column
/// was written by a float-typed writer.
mod serde_lenient {
    use serde::{de, Deserialize, Deserializer};

    fn parse(raw: &str) -> Option<i64> {
        let raw = raw.trim();
        if let Ok(value) = raw.parse::<i64>() {
            return Some(value);
        }
        let float = raw.parse::<f64>().ok()?;
        if float.fract() == 0.0 && float.is_finite() && float.abs() < 9.0e15 {
            Some(float as i64)
        } else {
            None
        }
    }

    pub fn int<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("'{}' is not an integer", raw)))
    }

    pub fn opt_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        parse(&raw)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("'{}' is not an integer", raw)))
    }
}

mod serde_date {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let raw = raw.trim();

        DateTime::parse_from_str(raw, FORMAT)
            .or_else(|_| DateTime::parse_from_rfc3339(raw))
            .map(|d| d.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|n| n.and_utc())
            })
            .map_err(|_| de::Error::custom(format!("'{}' is not a timestamp", raw)))
    }
}
