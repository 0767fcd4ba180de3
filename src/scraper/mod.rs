//! Fetch Cycle
//!
//! Information Hiding:
//! - Connect/resolve/load/fetch/persist sequencing hidden behind `run_cycle`
//! - Recoverable conditions returned as tagged outcomes, not errors
//! - Pacing and backoff waits applied internally

pub mod pacing;

use crate::config::ScraperConfig;
use crate::core::{GroupHandle, MessageSource, ResolveError};
use crate::storage::{LoadedStore, MessageRecord, MessageStore, StoreError};
use futures::StreamExt;
use pacing::Pacer;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration};

/// Result of pulling one batch from the remote source.
#[derive(Debug)]
pub enum FetchOutcome {
    Ok(Vec<MessageRecord>),
    RateLimited(u64),
    TransientError(String),
}

/// How a cycle ended, for every path that does not indicate local data damage.
#[derive(Debug)]
pub enum CycleOutcome {
    Saved(usize),
    NoNewMessages,
    GroupUnavailable(ResolveError),
    RateLimited(u64),
    Failed(String),
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Saved(count) => write!(f, "{} new messages saved", count),
            Self::NoNewMessages => write!(f, "no new messages"),
            Self::GroupUnavailable(e) => write!(f, "group unavailable: {}", e),
            Self::RateLimited(secs) => write!(f, "rate limited for {}s", secs),
            Self::Failed(detail) => write!(f, "failed: {}", detail),
        }
    }
}

/// Surfaced to the caller; the schedule keeps running.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("store integrity error: {0}")]
    Store(#[from] StoreError),
}

pub struct Fetcher<S, St> {
    source: Arc<S>,
    store: St,
    group: String,
    batch_limit: usize,
    pacer: Pacer,
}

impl<S, St> Fetcher<S, St>
where
    S: MessageSource,
    St: MessageStore,
{
    pub fn new(source: Arc<S>, store: St, group: impl Into<String>, config: &ScraperConfig) -> Self {
        Self {
            source,
            store,
            group: group.into(),
            batch_limit: config.max_messages_per_batch,
            pacer: Pacer::from_config(config),
        }
    }

    pub fn with_pacer(mut self, pacer: Pacer) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    /// One complete cycle including its trailing wait.
    ///
    /// Rate limits wait exactly the remote-specified time and generic failures
    /// wait the fixed backoff. Every other ending waits a randomized
    /// post-cycle pause. Nothing is retried within the cycle.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        let result = self.cycle().await;

        let wait = match &result {
            Ok(CycleOutcome::RateLimited(secs)) => {
                tracing::warn!("[Fetcher] Rate limited, waiting {}s as requested", secs);
                Duration::from_secs(*secs)
            }
            Ok(CycleOutcome::Failed(detail)) => {
                let backoff = self.pacer.error_backoff();
                tracing::error!(
                    "[Fetcher] Cycle failed: {}; backing off {}s",
                    detail,
                    backoff.as_secs()
                );
                backoff
            }
            _ => self.pacer.cycle_pause(),
        };

        tracing::debug!("[Fetcher] Sleeping {:?} before ending cycle", wait);
        sleep(wait).await;
        result
    }

    async fn cycle(&self) -> Result<CycleOutcome, CycleError> {
        if let Err(e) = self.source.connect().await {
            return Ok(match e.retry_after() {
                Some(secs) => CycleOutcome::RateLimited(secs),
                None => CycleOutcome::Failed(format!("connecting: {}", e)),
            });
        }

        let group = match self.source.resolve_group(&self.group).await {
            Ok(group) => group,
            Err(ResolveError::RateLimited(secs)) => return Ok(CycleOutcome::RateLimited(secs)),
            Err(e) => {
                log_resolve_failure(&self.group, &e);
                return Ok(CycleOutcome::GroupUnavailable(e));
            }
        };

        let loaded = match self.store.load().await {
            Ok(loaded) => loaded,
            Err(e) if e.is_corruption() => return Err(CycleError::Store(e)),
            Err(e) => return Ok(CycleOutcome::Failed(format!("loading store: {}", e))),
        };

        let new = match self.fetch_new(&group, &loaded).await {
            FetchOutcome::Ok(new) => new,
            FetchOutcome::RateLimited(secs) => return Ok(CycleOutcome::RateLimited(secs)),
            FetchOutcome::TransientError(detail) => return Ok(CycleOutcome::Failed(detail)),
        };

        if new.is_empty() {
            self.source.acknowledge().await;
            tracing::info!("[Fetcher] No new messages found");
            return Ok(CycleOutcome::NoNewMessages);
        }

        if let Err(e) = self.store.save(&loaded.records, &new).await {
            return Ok(CycleOutcome::Failed(format!("saving store: {}", e)));
        }
        self.source.acknowledge().await;

        tracing::info!(
            "[Fetcher] {} new messages saved ({} total)",
            new.len(),
            loaded.len() + new.len()
        );
        Ok(CycleOutcome::Saved(new.len()))
    }

    /// Pull one batch, newest first, keeping only unseen messages with text.
    pub async fn fetch_new(&self, group: &GroupHandle, known: &LoadedStore) -> FetchOutcome {
        let mut stream = self.source.iter_messages(group, self.batch_limit);
        let mut new = Vec::new();
        let mut batch_ids = HashSet::new();
        let mut delivered = 0usize;

        while let Some(item) = stream.next().await {
            let message = match item {
                Ok(message) => message,
                Err(e) => {
                    return match e.retry_after() {
                        Some(secs) => FetchOutcome::RateLimited(secs),
                        None => FetchOutcome::TransientError(format!("fetching messages: {}", e)),
                    };
                }
            };

            delivered += 1;
            if delivered > self.batch_limit {
                break;
            }
            if known.contains(message.id) || !batch_ids.insert(message.id) {
                continue;
            }
            let Some(text) = message.text() else {
                continue;
            };

            new.push(MessageRecord {
                message_id: message.id,
                sender_id: message.sender_id,
                message: text.to_string(),
                date: message.date,
            });

            if self.pacer.should_pause(new.len()) {
                sleep(self.pacer.message_pause()).await;
            }
        }

        tracing::debug!(
            "[Fetcher] {} messages delivered, {} new",
            delivered.min(self.batch_limit),
            new.len()
        );
        FetchOutcome::Ok(new)
    }
}

fn log_resolve_failure(identifier: &str, error: &ResolveError) {
    match error {
        ResolveError::NotConfigured => {
            tracing::error!("[Fetcher] Group identifier is not configured; set TELEGRAM_GROUP_USERNAME")
        }
        ResolveError::NotFound(_) => {
            tracing::error!("[Fetcher] No such group '{}'", identifier)
        }
        ResolveError::NotAGroup { kind, .. } => tracing::error!(
            "[Fetcher] '{}' is a {} chat and cannot be scraped as a group",
            identifier,
            kind
        ),
        other => tracing::error!("[Fetcher] Resolving group '{}' failed: {}", identifier, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::core::source::fake::{message, FakeSource};
    use crate::core::SourceError;
    use crate::storage::test_support::record;
    use crate::storage::{CsvStore, InMemoryStore};
    use tempfile::TempDir;
    use tokio::time::Instant;

    const BACKOFF: Duration = Duration::from_secs(30);

    fn fetcher<St: MessageStore>(source: Arc<FakeSource>, store: St) -> Fetcher<FakeSource, St> {
        let settings = Settings::defaults().unwrap();
        Fetcher::new(source, store, "@group", &settings.scraper).with_pacer(Pacer::immediate(BACKOFF))
    }

    async fn stored_ids(store: &InMemoryStore) -> Vec<i64> {
        store.snapshot().await.iter().map(|r| r.message_id).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_start_saves_in_delivery_order() {
        let source = Arc::new(FakeSource::with_messages(vec![
            message(3, Some("c")),
            message(2, Some("b")),
            message(1, Some("a")),
        ]));
        let store = InMemoryStore::new();
        let fetcher = fetcher(source.clone(), store.clone());

        let outcome = fetcher.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Saved(3)));
        assert_eq!(stored_ids(&store).await, vec![3, 2, 1]);
        assert_eq!(source.acknowledged(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_overlap_appends_only_new() {
        let source = Arc::new(FakeSource::with_messages(vec![
            message(4, Some("d")),
            message(3, Some("c")),
            message(2, Some("b")),
            message(1, Some("a")),
        ]));
        let store = InMemoryStore::with_records(vec![record(1, "a"), record(2, "b")]);
        let fetcher = fetcher(source, store.clone());

        let outcome = fetcher.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Saved(2)));
        assert_eq!(stored_ids(&store).await, vec![1, 2, 4, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_cycle_is_idempotent() {
        let source = Arc::new(FakeSource::with_messages(vec![
            message(2, Some("b")),
            message(1, Some("a")),
        ]));
        let store = InMemoryStore::new();
        let fetcher = fetcher(source.clone(), store.clone());

        fetcher.run_cycle().await.unwrap();
        let outcome = fetcher.run_cycle().await.unwrap();

        assert!(matches!(outcome, CycleOutcome::NoNewMessages));
        assert_eq!(store.snapshot().await.len(), 2);
        assert_eq!(store.save_count().await, 1);
        assert_eq!(source.state.lock().unwrap().connects, 1);
        assert_eq!(source.acknowledged(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_without_text_are_skipped() {
        let source = Arc::new(FakeSource::with_messages(vec![
            message(2, Some("")),
            message(1, Some("hello")),
            message(0, None),
        ]));
        let store = InMemoryStore::new();
        let fetcher = fetcher(source, store.clone());

        fetcher.run_cycle().await.unwrap();
        let records = store.snapshot().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message_id, 1);
        assert_eq!(records[0].message, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_cap_is_requested_and_enforced() {
        let messages = (1..=250).rev().map(|id| message(id, Some("x"))).collect();
        let source = Arc::new(FakeSource::with_messages(messages));
        let store = InMemoryStore::new();

        let mut settings = Settings::defaults().unwrap();
        settings.scraper.max_messages_per_batch = 40;
        let fetcher = Fetcher::new(source.clone(), store.clone(), "@group", &settings.scraper)
            .with_pacer(Pacer::immediate(BACKOFF));

        fetcher.run_cycle().await.unwrap();
        assert_eq!(source.requested_limits(), vec![40]);
        assert_eq!(store.snapshot().await.len(), 40);

        // the same newest batch comes back and adds nothing
        fetcher.run_cycle().await.unwrap();
        assert_eq!(store.snapshot().await.len(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_and_does_not_retry() {
        let source = Arc::new(FakeSource::with_messages(vec![
            message(3, Some("c")),
            message(2, Some("b")),
            message(1, Some("a")),
        ]));
        source.fail_after(1, || SourceError::RateLimited { retry_after_secs: 42 });
        let store = InMemoryStore::new();
        let fetcher = fetcher(source.clone(), store.clone());

        let start = Instant::now();
        let outcome = fetcher.run_cycle().await.unwrap();

        assert!(matches!(outcome, CycleOutcome::RateLimited(42)));
        assert!(start.elapsed() >= Duration::from_secs(42));
        assert_eq!(source.requested_limits().len(), 1);
        assert_eq!(store.save_count().await, 0);
        assert_eq!(source.acknowledged(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_backs_off_without_writing() {
        let source = Arc::new(FakeSource::with_messages(vec![
            message(2, Some("b")),
            message(1, Some("a")),
        ]));
        source.fail_after(1, || SourceError::Decode("truncated body".to_string()));
        let store = InMemoryStore::with_records(vec![record(9, "old")]);
        let fetcher = fetcher(source.clone(), store.clone());

        let start = Instant::now();
        let outcome = fetcher.run_cycle().await.unwrap();

        match outcome {
            CycleOutcome::Failed(detail) => assert!(detail.contains("truncated body")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(start.elapsed() >= BACKOFF);
        assert_eq!(stored_ids(&store).await, vec![9]);
        assert_eq!(store.save_count().await, 0);
        assert_eq!(source.acknowledged(), 0);
    }

    struct ReadOnlyStore;

    #[async_trait::async_trait]
    impl MessageStore for ReadOnlyStore {
        async fn load(&self) -> Result<LoadedStore, StoreError> {
            Ok(LoadedStore::default())
        }

        async fn save(&self, _: &[MessageRecord], _: &[MessageRecord]) -> Result<(), StoreError> {
            Err(StoreError::Io {
                path: "messages.csv".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_leaves_batch_unacknowledged() {
        let source = Arc::new(FakeSource::with_messages(vec![message(1, Some("a"))]));
        let fetcher = fetcher(source.clone(), ReadOnlyStore);

        let outcome = fetcher.run_cycle().await.unwrap();

        match outcome {
            CycleOutcome::Failed(detail) => assert!(detail.contains("saving store")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(source.acknowledged(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_failure_leaves_store_untouched() {
        let source = Arc::new(FakeSource::with_messages(vec![message(1, Some("a"))]));
        source.fail_resolve(|| ResolveError::NotFound("@group".to_string()));
        let store = InMemoryStore::with_records(vec![record(5, "kept")]);
        let fetcher = fetcher(source.clone(), store.clone());

        let outcome = fetcher.run_cycle().await.unwrap();

        assert!(matches!(
            outcome,
            CycleOutcome::GroupUnavailable(ResolveError::NotFound(_))
        ));
        assert!(source.requested_limits().is_empty());
        assert_eq!(stored_ids(&store).await, vec![5]);
        assert_eq!(store.save_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_group_is_diagnosed() {
        let source = Arc::new(FakeSource::with_messages(vec![message(1, Some("a"))]));
        let settings = Settings::defaults().unwrap();
        let fetcher = Fetcher::new(source, InMemoryStore::new(), "", &settings.scraper)
            .with_pacer(Pacer::immediate(BACKOFF));

        let outcome = fetcher.run_cycle().await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::GroupUnavailable(ResolveError::NotConfigured)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_store_is_surfaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("messages.csv");
        std::fs::write(&path, "id,text\n1,hello\n").unwrap();

        let source = Arc::new(FakeSource::with_messages(vec![message(2, Some("b"))]));
        let fetcher = fetcher(source.clone(), CsvStore::new(&path));

        let err = fetcher.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Store(StoreError::Corrupt { .. })));
        assert!(source.requested_limits().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "id,text\n1,hello\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_every_fifth_new_record() {
        let messages = (1..=12).rev().map(|id| message(id, Some("x"))).collect();
        let source = Arc::new(FakeSource::with_messages(messages));

        let mut settings = Settings::defaults().unwrap();
        settings.scraper.pace_min_ms = 1000;
        settings.scraper.pace_max_ms = 1000;
        let fetcher = Fetcher::new(source, InMemoryStore::new(), "@group", &settings.scraper);

        let group = GroupHandle {
            chat_id: -1,
            title: None,
            kind: "group".to_string(),
        };
        let start = Instant::now();
        let outcome = fetcher.fetch_new(&group, &LoadedStore::default()).await;

        assert!(matches!(outcome, FetchOutcome::Ok(ref new) if new.len() == 12));
        // pauses after the 5th and 10th record
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_ids_never_repeat_across_cycles() {
        let source = Arc::new(FakeSource::with_messages(vec![
            message(2, Some("b")),
            message(1, Some("a")),
        ]));
        let store = InMemoryStore::new();
        let fetcher = fetcher(source.clone(), store.clone());

        fetcher.run_cycle().await.unwrap();
        source.set_messages(vec![
            message(4, Some("d")),
            message(3, Some("c")),
            message(3, Some("c duplicate")),
            message(2, Some("b")),
        ]);
        fetcher.run_cycle().await.unwrap();

        let ids = stored_ids(&store).await;
        assert_eq!(ids, vec![2, 1, 4, 3]);
        let unique: HashSet<i64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
    }
}
