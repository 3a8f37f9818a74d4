//! Exponential backoff with bounded additive jitter.

use std::time::Duration;

/// Parameters of an exponential backoff schedule.
///
/// The delay before attempt `n` (starting at 0) is
/// `min(max, min * factor^n)` plus a random jitter in `[0, jitter]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first attempt
    pub min: Duration,
    /// Upper bound of the deterministic part of the delay
    pub max: Duration,
    /// Growth factor per attempt
    pub factor: f64,
    /// Maximum random delay added on top
    pub jitter: Duration,
}

impl BackoffPolicy {
    /// Reconnect schedule of the duplex connection.
    pub const CONNECTION: Self = Self::from_millis(3_000, 30_000, 1.25, 100);

    /// Retry schedule inside a single heartbeat cycle.
    pub const HEARTBEAT: Self = Self::from_millis(1_000, 10_000, 1.5, 200);

    /// Schedule of full client reconnects.
    pub const RECONNECT: Self = Self::from_millis(500, 10_000, 1.5, 200);

    /// Build a policy from millisecond values.
    pub const fn from_millis(min: u64, max: u64, factor: f64, jitter: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
            factor,
            jitter: Duration::from_millis(jitter),
        }
    }

    /// The delay for an attempt, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max_ms = self.max.as_millis() as f64;
        let ms = self.min.as_millis() as f64 * self.factor.powf(f64::from(attempt));

        if !ms.is_finite() || ms >= max_ms {
            return self.max;
        }
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// A fresh backoff following this policy.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(*self)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::CONNECTION
    }
}

/// Attempt counter over a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff with no recorded attempts.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// The delay before the next attempt. Counts the attempt.
    pub fn duration(&mut self) -> Duration {
        let base = self.policy.base_delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        base + jitter(self.policy.jitter)
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start over from the minimum delay.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// The policy this backoff follows.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

fn jitter(amplitude: Duration) -> Duration {
    let millis = u64::try_from(amplitude.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=millis))
}
