// retry.rs
// description: Exponential backoff with jitter and the transient-failure classification shared by store calls.

use rand::Rng;
use std::time::Duration;

use crate::config::{secs_to_duration, Retry};

const TRANSIENT_MARKERS: [&str; 8] = [
    "timeout",
    "timed out",
    "reset",
    "temporarily unavailable",
    "eof",
    "pool",
    "disconnect",
    "remoteprotocolerror",
];

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from_config(&Retry::default())
    }
}

impl RetryPolicy {
    pub fn from_config(retry: &Retry) -> Self {
        RetryPolicy {
            max_attempts: retry.max_attempts.value.max(1),
            initial_backoff: secs_to_duration(retry.initial_backoff_secs.value),
            multiplier: if retry.multiplier.value.is_finite() {
                retry.multiplier.value.max(1.0)
            } else {
                1.0
            },
            max_backoff: secs_to_duration(retry.max_backoff_secs.value),
            jitter: if retry.jitter.value.is_nan() {
                0.0
            } else {
                retry.jitter.value.clamp(0.0, 1.0)
            },
        }
    }

    /// Backoff before retrying after failed attempt `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        secs_to_duration(capped)
    }

    /// Base delay stretched by up to `jitter` so parallel callers spread out.
    pub fn delay_with_jitter<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rng.gen_range(0.0..self.jitter);
        base.mul_f64(factor)
    }

    /// Largest sleep any single retry can take.
    pub fn max_single_delay(&self) -> Duration {
        self.max_backoff.mul_f64(1.0 + self.jitter)
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 500 | 502 | 503 | 504)
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
