//! tgscrape - periodic Telegram group archiver
//!
//! Pulls the newest messages of one group on a jittered schedule and appends
//! the ones not seen before to a CSV file, riding out rate limits and
//! transient failures without duplicating rows.

pub mod actors;
mod config;
pub mod core;
pub mod scraper;
pub mod storage;
pub mod utils;

pub mod cli;

pub use crate::config::{
    LoggingConfig, ScheduleConfig, ScraperConfig, Settings, TelegramConfig, BOT_API_MAX_LIMIT,
    MAX_INTERVAL_MINUTES,
};

pub use actors::SchedulerHandle;
pub use crate::core::{GroupHandle, MessageSource, RemoteMessage, ResolveError, SourceError, TelegramSession};
pub use scraper::pacing::Pacer;
pub use scraper::{CycleError, CycleOutcome, FetchOutcome, Fetcher};
pub use storage::{CsvStore, InMemoryStore, LoadedStore, MessageRecord, MessageStore, StoreError};

use anyhow::Context;
use secrecy::SecretString;
use std::future::Future;
use std::sync::Arc;

/// Owns the long-lived session and the settings every cycle is built from.
pub struct Scraper {
    settings: Settings,
    session: Arc<TelegramSession>,
}

impl Scraper {
    /// Validate settings and open (but do not yet connect) the session.
    pub fn init(settings: Settings, token: SecretString) -> anyhow::Result<Self> {
        settings.validate()?;
        let session = TelegramSession::new(&settings.telegram, token)
            .context("Failed to build Telegram HTTP client")?;

        tracing::info!(
            "tgscrape initialized: group '{}', store {:?}",
            settings.telegram.group,
            settings.scraper.output_file
        );
        Ok(Self {
            settings,
            session: Arc::new(session),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn session(&self) -> &Arc<TelegramSession> {
        &self.session
    }

    pub fn store(&self) -> CsvStore {
        CsvStore::new(&self.settings.scraper.output_file)
    }

    pub fn fetcher(&self) -> Fetcher<TelegramSession, CsvStore> {
        Fetcher::new(
            self.session.clone(),
            self.store(),
            self.settings.telegram.group.clone(),
            &self.settings.scraper,
        )
    }

    /// Run the schedule (immediate cycle first) until `interrupt` resolves.
    pub async fn run_until(&self, interrupt: impl Future<Output = ()>) -> anyhow::Result<()> {
        let scheduler = SchedulerHandle::spawn(self.fetcher(), self.settings.schedule.clone());

        interrupt.await;
        tracing::info!("Interrupt received, terminating");

        scheduler.shutdown().await
    }

    /// Disconnect the session.
    pub async fn shutdown(&self) {
        self.session.disconnect().await;
        tracing::info!("tgscrape shutdown complete");
    }
}
