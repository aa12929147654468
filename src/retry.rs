//! Conflict retry for pool updates
//!
//! The allocator never retries on its own. A lost optimistic-concurrency
//! race is handled here by re-running the whole operation after a jittered
//! exponential backoff.

use crate::error::Result;
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use log::warn;
use rand::rng;
use serde::Deserialize;
use std::thread;
use std::time::Duration;

/// Backoff settings for conflict retries
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Base delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum number of attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Jitter factor (0.0 - 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    2000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u8 {
    10
}

fn default_jitter_factor() -> f64 {
    0.5
}

fn backoff_from_config(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoff::new()
        .base_delay_ms(config.base_delay_ms)
        .max_delay_ms(config.max_delay_ms)
        .multiplier(config.multiplier)
        .max_attempts(config.max_attempts)
        .jitter_factor(config.jitter_factor)
}

/// Run `op` until it succeeds, fails with something other than a
/// conflict, or the backoff gives up
pub fn on_conflict<T, F>(config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let backoff = backoff_from_config(config);
    let mut rng = rng();
    let mut attempt: u8 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        match op() {
            Err(e) if e.is_conflict() => match backoff.delay(attempt, &mut rng) {
                Some(delay_ms) => {
                    warn!("{} (attempt {}), retrying in {}ms", e, attempt, delay_ms);
                    thread::sleep(Duration::from_millis(delay_ms));
                }
                None => return Err(e),
            },
            result => return result,
        }
    }
}
