//! Telegram Bot API Session
//!
//! Information Hiding:
//! - Bot API transport and payload types hidden behind `teloxide::Bot`
//! - Update queue position tracked here and advanced only on acknowledgement
//! - Request failures classified into rate limits, API errors and transport errors

use super::source::{GroupHandle, MessageSource, RemoteMessage, ResolveError, SourceError};
use crate::config::{TelegramConfig, BOT_API_MAX_LIMIT};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use teloxide::{
    prelude::*,
    types::{AllowedUpdate, Chat, ChatId, Message, Recipient, UpdateKind},
    ApiError, RequestError,
};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub id: u64,
    pub username: Option<String>,
    /// False while privacy mode is on; the bot then only sees commands and replies.
    pub reads_all_group_messages: bool,
}

/// Position in the bot's update queue.
#[derive(Debug, Default)]
struct UpdateCursor {
    /// Sent as `offset`; the server drops every update below it.
    confirmed: Option<i32>,
    /// One past the newest update of the last delivered page.
    delivered: Option<i32>,
}

/// Long-lived Bot API session, shared by every fetch cycle.
pub struct TelegramSession {
    bot: Bot,
    token: SecretString,
    identity: Mutex<Option<BotIdentity>>,
    cursor: Mutex<UpdateCursor>,
}

impl TelegramSession {
    pub fn new(config: &TelegramConfig, token: SecretString) -> Result<Self, SourceError> {
        let client = teloxide::net::default_reqwest_settings()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let base = format!("{}/", config.api_base.trim_end_matches('/'));
        let api_url = reqwest::Url::parse(&base)
            .map_err(|_| SourceError::InvalidApiUrl(config.api_base.clone()))?;

        let bot = Bot::with_client(token.expose_secret(), client).set_api_url(api_url);

        Ok(Self {
            bot,
            token,
            identity: Mutex::new(None),
            cursor: Mutex::new(UpdateCursor::default()),
        })
    }

    pub async fn identity(&self) -> Option<BotIdentity> {
        self.identity.lock().await.clone()
    }

    fn redact(&self, text: String) -> String {
        text.replace(self.token.expose_secret().as_str(), "<token>")
    }

    fn source_error(&self, err: RequestError) -> SourceError {
        match err {
            RequestError::RetryAfter(wait) => SourceError::RateLimited {
                retry_after_secs: wait.duration().as_secs(),
            },
            RequestError::Api(api) => SourceError::Api(api.to_string()),
            err @ RequestError::InvalidJson { .. } => SourceError::Decode(self.redact(err.to_string())),
            other => SourceError::Network(self.redact(other.to_string())),
        }
    }

    /// The next page of the update queue, reduced to `chat_id`'s messages,
    /// newest first. The page is redelivered until acknowledged.
    async fn next_page(&self, chat_id: ChatId, limit: usize) -> Result<Vec<RemoteMessage>, SourceError> {
        let offset = {
            let mut cursor = self.cursor.lock().await;
            cursor.delivered = None;
            cursor.confirmed
        };

        let page_size = u8::try_from(limit.min(BOT_API_MAX_LIMIT)).unwrap_or(u8::MAX);
        let mut request = self
            .bot
            .get_updates()
            .limit(page_size)
            .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::ChannelPost]);
        if let Some(offset) = offset {
            request = request.offset(offset);
        }

        let updates = request.await.map_err(|e| self.source_error(e))?;
        let received = updates.len();
        let next_offset = updates.iter().map(|u| u.id.as_offset()).max();

        let mut messages: Vec<RemoteMessage> = updates
            .into_iter()
            .filter_map(|update| match update.kind {
                UpdateKind::Message(message) | UpdateKind::ChannelPost(message) => Some(message),
                UpdateKind::Error(raw) => {
                    tracing::warn!("[Telegram] Skipping undecodable update {:?}: {}", update.id, raw);
                    None
                }
                _ => None,
            })
            .filter(|message| message.chat.id == chat_id)
            .map(remote_message)
            .collect();
        messages.sort_by(|a, b| b.id.cmp(&a.id));

        self.cursor.lock().await.delivered = next_offset;

        tracing::debug!(
            "[Telegram] {} of {} updates (offset {:?}) belong to chat {}",
            messages.len(),
            received,
            offset,
            chat_id.0
        );
        Ok(messages)
    }
}

fn remote_message(message: Message) -> RemoteMessage {
    let sender_id = message
        .from
        .as_ref()
        .and_then(|user| i64::try_from(user.id.0).ok())
        .or_else(|| message.sender_chat.as_ref().map(|chat| chat.id.0));

    RemoteMessage {
        id: i64::from(message.id.0),
        sender_id,
        text: message.text().or_else(|| message.caption()).map(str::to_string),
        date: message.date,
    }
}

fn chat_kind(chat: &Chat) -> &'static str {
    if chat.is_private() {
        "private"
    } else if chat.is_channel() {
        "channel"
    } else if chat.is_supergroup() {
        "supergroup"
    } else {
        "group"
    }
}

/// `@name`, `name`, `t.me/name` and numeric ids all name a chat; invite links do not.
fn recipient(identifier: &str) -> Result<Recipient, ResolveError> {
    if let Ok(id) = identifier.parse::<i64>() {
        return Ok(Recipient::Id(ChatId(id)));
    }

    let name = identifier
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.")
        .trim_start_matches("t.me/")
        .trim_start_matches("telegram.me/")
        .trim_end_matches('/');

    if name.starts_with('+') || name.starts_with("joinchat/") {
        return Err(ResolveError::InviteLink(identifier.to_string()));
    }

    Ok(Recipient::ChannelUsername(format!(
        "@{}",
        name.trim_start_matches('@')
    )))
}

#[async_trait]
impl MessageSource for TelegramSession {
    async fn connect(&self) -> Result<(), SourceError> {
        let mut identity = self.identity.lock().await;
        if identity.is_some() {
            return Ok(());
        }

        let me = self.bot.get_me().await.map_err(|e| self.source_error(e))?;
        let me = BotIdentity {
            id: me.user.id.0,
            username: me.user.username.clone(),
            reads_all_group_messages: me.can_read_all_group_messages,
        };

        tracing::info!(
            "[Telegram] Connected as @{} ({})",
            me.username.as_deref().unwrap_or("<unnamed>"),
            me.id
        );
        if !me.reads_all_group_messages {
            tracing::warn!("[Telegram] Privacy mode is on; only commands and replies to the bot will be seen");
        }

        *identity = Some(me);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.identity.lock().await.is_some()
    }

    async fn resolve_group(&self, identifier: &str) -> Result<GroupHandle, ResolveError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(ResolveError::NotConfigured);
        }

        let chat = match self.bot.get_chat(recipient(identifier)?).await {
            Ok(chat) => chat,
            Err(RequestError::Api(ApiError::ChatNotFound)) => {
                return Err(ResolveError::NotFound(identifier.to_string()));
            }
            Err(e) => return Err(self.source_error(e).into()),
        };

        let kind = chat_kind(&chat);
        if chat.is_private() {
            return Err(ResolveError::NotAGroup {
                identifier: identifier.to_string(),
                kind: kind.to_string(),
            });
        }

        Ok(GroupHandle {
            chat_id: chat.id.0,
            title: chat.title().map(str::to_string),
            kind: kind.to_string(),
        })
    }

    fn iter_messages<'a>(
        &'a self,
        group: &'a GroupHandle,
        limit: usize,
    ) -> BoxStream<'a, Result<RemoteMessage, SourceError>> {
        stream::once(self.next_page(ChatId(group.chat_id), limit))
            .map(|page| match page {
                Ok(messages) => stream::iter(messages.into_iter().map(Ok::<_, SourceError>)).left_stream(),
                Err(e) => stream::once(futures::future::ready(Err(e))).right_stream(),
            })
            .flatten()
            .boxed()
    }

    async fn acknowledge(&self) {
        let mut cursor = self.cursor.lock().await;
        if let Some(next) = cursor.delivered.take() {
            if cursor.confirmed.map_or(true, |confirmed| next > confirmed) {
                tracing::debug!("[Telegram] Updates below {} confirmed", next);
                cursor.confirmed = Some(next);
            }
        }
    }

    async fn disconnect(&self) {
        if self.identity.lock().await.take().is_some() {
            tracing::info!("[Telegram] Session closed");
        }
    }
}
