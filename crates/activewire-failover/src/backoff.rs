//! Reconnect backoff and attempt limits.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many reconnect attempts a cycle may make.
///
/// An attempt is one full pass over the candidate URIs. The configured value
/// counts *retries*, so `Retries(n)` allows the initial pass plus `n` more.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptLimit {
    /// Keep trying forever.
    #[default]
    Unlimited,
    /// Give up after the initial attempt plus this many retries.
    Retries(u32),
}

impl AttemptLimit {
    /// Maps the URI option convention: negative means unlimited.
    pub fn from_option(value: i64) -> Self {
        if value < 0 {
            Self::Unlimited
        } else {
            Self::Retries(u32::try_from(value).unwrap_or(u32::MAX))
        }
    }

    /// Whether another attempt may start after `completed` attempts failed.
    pub fn allows_retry(&self, completed: u32) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Retries(max) => completed <= *max,
        }
    }

    /// Total attempts permitted, `None` when unlimited.
    pub fn total_attempts(&self) -> Option<u32> {
        match self {
            Self::Unlimited => None,
            Self::Retries(max) => Some(max.saturating_add(1)),
        }
    }
}

impl fmt::Display for AttemptLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => write!(f, "unlimited"),
            Self::Retries(max) => write!(f, "{max}"),
        }
    }
}

/// Delay schedule between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Grow the delay geometrically instead of keeping it constant
    pub exponential: bool,
    /// Growth factor per retry when `exponential` is set
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(30),
            exponential: true,
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// The delay to wait before retry number `retry` (1-based).
    ///
    /// Exponential: `min(initial * multiplier^(retry-1), max_delay)`.
    /// Constant: `initial_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if !self.exponential {
            return self.initial_delay;
        }
        if retry <= 1 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= cap {
            self.max_delay
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}
