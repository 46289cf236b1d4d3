use chrono::{Duration, NaiveDateTime};

use crate::config::DeliveryConfig;

/// Upper bound for any single backoff step (30 days).
pub const MAX_BACKOFF_SECONDS: u64 = 30 * 24 * 3600;

/// Exponential backoff shared by the retry and digest sweepers.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial_seconds: u64,
    pub max_seconds: u64,
}

impl Backoff {
    pub fn from_config(cfg: &DeliveryConfig) -> Self {
        Self {
            initial_seconds: cfg.initial_backoff_seconds,
            max_seconds: cfg.max_backoff_seconds,
        }
    }

    /// Delay after attempt `attempt`: `min(max, initial * 2^attempt)`, never
    /// above `MAX_BACKOFF_SECONDS`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let cap = self.max_seconds.min(MAX_BACKOFF_SECONDS);
        let delay = 2u64
            .checked_pow(attempt)
            .and_then(|factor| self.initial_seconds.checked_mul(factor))
            .map_or(cap, |d| d.min(cap));
        Duration::seconds(delay as i64)
    }

    /// When attempt `attempt + 1` becomes eligible.
    pub fn next_attempt_at(&self, attempt: u32, now: NaiveDateTime) -> NaiveDateTime {
        now + self.delay(attempt)
    }
}
