//! Randomized pacing between requests and cycles.

use crate::config::ScraperConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Pacer {
    pace_every: usize,
    pace_min: Duration,
    pace_max: Duration,
    cycle_min: Duration,
    cycle_max: Duration,
    error_backoff: Duration,
}

impl Pacer {
    pub fn from_config(config: &ScraperConfig) -> Self {
        Self {
            pace_every: config.pace_every.max(1),
            pace_min: Duration::from_millis(config.pace_min_ms),
            pace_max: Duration::from_millis(config.pace_max_ms),
            cycle_min: Duration::from_secs(config.min_delay_between_batches),
            cycle_max: Duration::from_secs(config.max_delay_between_batches),
            error_backoff: Duration::from_secs(config.error_backoff_secs),
        }
    }

    /// No waits at all apart from the error backoff.
    pub fn immediate(error_backoff: Duration) -> Self {
        Self {
            pace_every: usize::MAX,
            pace_min: Duration::ZERO,
            pace_max: Duration::ZERO,
            cycle_min: Duration::ZERO,
            cycle_max: Duration::ZERO,
            error_backoff,
        }
    }

    /// True after every `pace_every`-th accumulated record.
    pub fn should_pause(&self, accumulated: usize) -> bool {
        accumulated > 0 && accumulated % self.pace_every == 0
    }

    pub fn message_pause(&self) -> Duration {
        uniform(self.pace_min, self.pace_max)
    }

    pub fn cycle_pause(&self) -> Duration {
        uniform(self.cycle_min, self.cycle_max)
    }

    pub fn error_backoff(&self) -> Duration {
        self.error_backoff
    }
}

fn uniform(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let ms = rand::rng().random_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

/// `interval` shifted by a uniform offset in `[-jitter, +jitter]`, never negative.
pub fn jittered(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let bound = jitter.as_millis() as i64;
    let offset = rand::rng().random_range(-bound..=bound);
    if offset >= 0 {
        interval.saturating_add(Duration::from_millis(offset as u64))
    } else {
        interval.saturating_sub(Duration::from_millis(offset.unsigned_abs()))
    }
}
