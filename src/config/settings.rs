use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Telegram Bot API hard cap for `getUpdates`.
pub const BOT_API_MAX_LIMIT: usize = 100;

/// User-account login settings from the interactive client; a bot session has no use for them.
pub const USER_LOGIN_VARS: [&str; 3] = [
    "TELEGRAM_API_ID",
    "TELEGRAM_API_HASH",
    "TELEGRAM_PHONE_NUMBER",
];

/// Longest accepted schedule interval (one week). Pending updates expire after a day anyway.
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub telegram: TelegramConfig,
    pub scraper: ScraperConfig,
    pub schedule: ScheduleConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub api_base: String,
    /// `@username`, bare username or numeric chat id of the target group.
    pub group: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    pub output_file: PathBuf,
    pub max_messages_per_batch: usize,
    pub pace_every: usize,
    pub pace_min_ms: u64,
    pub pace_max_ms: u64,
    pub min_delay_between_batches: u64,
    pub max_delay_between_batches: u64,
    pub error_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub interval_minutes: u64,
    pub jitter_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_env = env::var("CONFIG_ENV").unwrap_or_else(|_| "default".to_string());

        let config = Self::with_defaults(Config::builder())?
            .add_source(File::with_name(&format!("config/{}", config_env)).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .set_override_option("telegram.group", env::var("TELEGRAM_GROUP_USERNAME").ok())?
            .build()?;

        config.try_deserialize()
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("telegram.api_base", "https://api.telegram.org")?
            .set_default("telegram.group", "")?
            .set_default("telegram.request_timeout_secs", 30)?
            .set_default("scraper.output_file", "telegram_messages.csv")?
            .set_default("scraper.max_messages_per_batch", 100)?
            .set_default("scraper.pace_every", 5)?
            .set_default("scraper.pace_min_ms", 500)?
            .set_default("scraper.pace_max_ms", 1500)?
            .set_default("scraper.min_delay_between_batches", 2)?
            .set_default("scraper.max_delay_between_batches", 5)?
            .set_default("scraper.error_backoff_secs", 30)?
            .set_default("schedule.interval_minutes", 60)?
            .set_default("schedule.jitter_secs", 60)?
            .set_default("logging.level", "info")
    }

    /// Built-in defaults only, ignoring files and the environment.
    pub fn defaults() -> Result<Self, ConfigError> {
        Self::with_defaults(Config::builder())?
            .build()?
            .try_deserialize()
    }

    pub fn bot_token() -> Result<SecretString> {
        Self::bot_token_from(|key| env::var(key).ok())
    }

    fn bot_token_from(lookup: impl Fn(&str) -> Option<String>) -> Result<SecretString> {
        let legacy: Vec<&str> = USER_LOGIN_VARS
            .iter()
            .copied()
            .filter(|key| lookup(*key).is_some())
            .collect();

        match lookup("TELEGRAM_BOT_TOKEN").filter(|token| !token.trim().is_empty()) {
            Some(token) => {
                if !legacy.is_empty() {
                    tracing::warn!(
                        "[Settings] Ignoring {}: the scraper signs in with TELEGRAM_BOT_TOKEN",
                        legacy.join(", ")
                    );
                }
                Ok(SecretString::new(token))
            }
            None if legacy.is_empty() => {
                anyhow::bail!("TELEGRAM_BOT_TOKEN environment variable not set")
            }
            None => anyhow::bail!(
                "TELEGRAM_BOT_TOKEN environment variable not set ({} belong to a user-account login, \
                 which is not supported; create a bot with @BotFather, add it to the group and set TELEGRAM_BOT_TOKEN)",
                legacy.join(", ")
            ),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let scraper = &self.scraper;

        if scraper.max_messages_per_batch == 0 || scraper.max_messages_per_batch > BOT_API_MAX_LIMIT
        {
            anyhow::bail!(
                "scraper.max_messages_per_batch must be between 1 and {}, got {}",
                BOT_API_MAX_LIMIT,
                scraper.max_messages_per_batch
            );
        }
        if scraper.pace_every == 0 {
            anyhow::bail!("scraper.pace_every must be at least 1");
        }
        if scraper.pace_min_ms > scraper.pace_max_ms {
            anyhow::bail!(
                "scraper.pace_min_ms ({}) exceeds scraper.pace_max_ms ({})",
                scraper.pace_min_ms,
                scraper.pace_max_ms
            );
        }
        if scraper.min_delay_between_batches > scraper.max_delay_between_batches {
            anyhow::bail!(
                "scraper.min_delay_between_batches ({}) exceeds scraper.max_delay_between_batches ({})",
                scraper.min_delay_between_batches,
                scraper.max_delay_between_batches
            );
        }
        let schedule = &self.schedule;
        if schedule.interval_minutes == 0 || schedule.interval_minutes > MAX_INTERVAL_MINUTES {
            anyhow::bail!(
                "schedule.interval_minutes must be between 1 and {}, got {}",
                MAX_INTERVAL_MINUTES,
                schedule.interval_minutes
            );
        }
        if schedule.jitter_secs > schedule.interval_minutes * 60 {
            anyhow::bail!(
                "schedule.jitter_secs ({}) exceeds the {} minute interval",
                schedule.jitter_secs,
                schedule.interval_minutes
            );
        }

        Ok(())
    }
}
