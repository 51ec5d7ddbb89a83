//! Exponential backoff for tunnel reconnection

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Poll/backoff parameters for a connection's retry loop.
///
/// `reset_duration` and `max_backoff` are independent knobs on purpose;
/// nothing derives one from the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// First backoff delay after a failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the backoff delay.
    pub max_backoff: Duration,
    /// Backoff resets to `initial_backoff` after this long without one.
    pub reset_duration: Duration,
    /// Multiplier applied to the delay after each backoff.
    pub backoff_factor: f64,
    /// Jitter as a fraction of the delay: 1.0 means a uniform pick from
    /// zero to twice the delay.
    pub jitter_ratio: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(5 * 60),
            reset_duration: Duration::from_secs(10 * 60),
            backoff_factor: 2.0,
            jitter_ratio: 1.0,
        }
    }
}

/// Outcome of one connection attempt, deciding how the poll loop proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    /// Re-establish the tunnel immediately.
    ContinueImmediately,
    /// Wait out the backoff delay before reconnecting.
    Backoff,
}

/// Exponential backoff with jitter and reset-after-quiet-period.
#[derive(Debug)]
pub struct BackoffPolicy {
    config: PollConfig,
    next: Duration,
    last_backoff: Option<Instant>,
}

impl BackoffPolicy {
    pub fn new(config: PollConfig) -> Self {
        Self {
            next: config.initial_backoff,
            config,
            last_backoff: None,
        }
    }

    /// The delay to sleep before the next attempt; advances the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let now = Instant::now();
        if let Some(last) = self.last_backoff {
            if now.duration_since(last) > self.config.reset_duration {
                self.next = self.config.initial_backoff;
            }
        }
        self.last_backoff = Some(now);

        let base = self.next;
        let grown = base.as_secs_f64() * self.config.backoff_factor;
        self.next = Duration::from_secs_f64(grown.min(self.config.max_backoff.as_secs_f64()));

        jittered(base, self.config.jitter_ratio)
    }
}

fn jittered(base: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 {
        return base;
    }
    let spread = rand::thread_rng().gen_range(-ratio..=ratio);
    Duration::from_secs_f64((base.as_secs_f64() * (1.0 + spread)).max(0.0))
}
