mod settings;

pub use settings::{
    LoggingConfig, ScheduleConfig, ScraperConfig, Settings, TelegramConfig, BOT_API_MAX_LIMIT,
    MAX_INTERVAL_MINUTES,
};
