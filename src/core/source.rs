//! Remote Message Source
//!
//! Information Hiding:
//! - Platform protocol hidden behind the `MessageSource` trait
//! - Session state (connected or not) owned by the implementation
//! - Rate limiting surfaced as a typed error, never as a panic or string match

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;

/// A group that resolved successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupHandle {
    pub chat_id: i64,
    pub title: Option<String>,
    pub kind: String,
}

/// A message as delivered by the remote iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub id: i64,
    pub sender_id: Option<i64>,
    pub text: Option<String>,
    pub date: DateTime<Utc>,
}

impl RemoteMessage {
    /// Text content, if there is any worth keeping.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("API error: {0}")]
    Api(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("response decode error: {0}")]
    Decode(String),

    #[error("invalid API base URL '{0}'")]
    InvalidApiUrl(String),
}

impl SourceError {
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Why a group identifier did not yield a usable group.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("group identifier is not configured")]
    NotConfigured,

    #[error("no such group: {0}")]
    NotFound(String),

    #[error("'{identifier}' resolves to a {kind} chat, not a group")]
    NotAGroup { identifier: String, kind: String },

    #[error("'{0}' is an invite link; use the group's @username or numeric chat id")]
    InviteLink(String),

    #[error("rate limited while resolving group, retry after {0}s")]
    RateLimited(u64),

    #[error("failed to resolve group: {0}")]
    Other(String),
}

impl From<SourceError> for ResolveError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::RateLimited { retry_after_secs } => Self::RateLimited(retry_after_secs),
            other => Self::Other(other.to_string()),
        }
    }
}

/// The remote service a fetch cycle pulls messages from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Establish the session. A no-op when already connected.
    async fn connect(&self) -> Result<(), SourceError>;

    async fn is_connected(&self) -> bool;

    async fn resolve_group(&self, identifier: &str) -> Result<GroupHandle, ResolveError>;

    /// Up to `limit` most recent messages of `group`, newest first.
    fn iter_messages<'a>(
        &'a self,
        group: &'a GroupHandle,
        limit: usize,
    ) -> BoxStream<'a, Result<RemoteMessage, SourceError>>;

    /// Mark the batch delivered by the last `iter_messages` as processed so
    /// the next batch starts after it. Only call once that batch is persisted.
    async fn acknowledge(&self);

    async fn disconnect(&self);
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use chrono::TimeZone;
    use futures::stream::{self, StreamExt};
    use std::sync::Mutex;

    pub fn message(id: i64, text: Option<&str>) -> RemoteMessage {
        RemoteMessage {
            id,
            sender_id: Some(500 + id),
            text: text.map(str::to_string),
            date: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(id),
        }
    }

    #[derive(Default)]
    pub struct FakeState {
        pub connects: usize,
        pub resolves: usize,
        pub requested_limits: Vec<usize>,
        pub acknowledged: usize,
    }

    /// Scripted source: serves `messages` (already newest first) on every call.
    #[derive(Default)]
    pub struct FakeSource {
        pub messages: Mutex<Vec<RemoteMessage>>,
        pub resolve_error: Mutex<Option<fn() -> ResolveError>>,
        /// Fail after delivering this many messages.
        pub fail_after: Mutex<Option<(usize, fn() -> SourceError)>>,
        pub state: Mutex<FakeState>,
        connected: Mutex<bool>,
    }

    impl FakeSource {
        pub fn with_messages(messages: Vec<RemoteMessage>) -> Self {
            let source = Self::default();
            *source.messages.lock().unwrap() = messages;
            source
        }

        pub fn set_messages(&self, messages: Vec<RemoteMessage>) {
            *self.messages.lock().unwrap() = messages;
        }

        pub fn fail_resolve(&self, make: fn() -> ResolveError) {
            *self.resolve_error.lock().unwrap() = Some(make);
        }

        pub fn fail_after(&self, delivered: usize, make: fn() -> SourceError) {
            *self.fail_after.lock().unwrap() = Some((delivered, make));
        }

        pub fn requested_limits(&self) -> Vec<usize> {
            self.state.lock().unwrap().requested_limits.clone()
        }

        pub fn acknowledged(&self) -> usize {
            self.state.lock().unwrap().acknowledged
        }
    }

    #[async_trait]
    impl MessageSource for FakeSource {
        async fn connect(&self) -> Result<(), SourceError> {
            let mut connected = self.connected.lock().unwrap();
            if !*connected {
                *connected = true;
                self.state.lock().unwrap().connects += 1;
            }
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            *self.connected.lock().unwrap()
        }

        async fn resolve_group(&self, identifier: &str) -> Result<GroupHandle, ResolveError> {
            self.state.lock().unwrap().resolves += 1;
            if let Some(make) = *self.resolve_error.lock().unwrap() {
                return Err(make());
            }
            if identifier.is_empty() {
                return Err(ResolveError::NotConfigured);
            }
            Ok(GroupHandle {
                chat_id: -1,
                title: Some(identifier.to_string()),
                kind: "supergroup".to_string(),
            })
        }

        fn iter_messages<'a>(
            &'a self,
            _group: &'a GroupHandle,
            limit: usize,
        ) -> BoxStream<'a, Result<RemoteMessage, SourceError>> {
            self.state.lock().unwrap().requested_limits.push(limit);

            let mut items: Vec<Result<RemoteMessage, SourceError>> = self
                .messages
                .lock()
                .unwrap()
                .iter()
                .take(limit)
                .cloned()
                .map(Ok)
                .collect();
            if let Some((delivered, make)) = *self.fail_after.lock().unwrap() {
                items.truncate(delivered);
                items.push(Err(make()));
            }
            stream::iter(items).boxed()
        }

        async fn acknowledge(&self) {
            self.state.lock().unwrap().acknowledged += 1;
        }

        async fn disconnect(&self) {
            *self.connected.lock().unwrap() = false;
        }
    }
}
