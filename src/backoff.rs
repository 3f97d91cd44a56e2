//! Capped exponential backoff shared by every reconnecting loop

use std::time::Duration;

/// Shape of a retry schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// First delay handed out after a failure
    pub initial: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Growth factor applied after each failure
    pub factor: f64,
}

impl BackoffPolicy {
    pub const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self { initial, max, factor }
    }

    /// Input device reopen schedule: 0.1 s doubling up to 5 s.
    pub const fn input_reopen() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5), 2.0)
    }

    /// Video session retry schedule: 0.75 s growing by 1.5x up to 5 s.
    pub const fn video_retry() -> Self {
        Self::new(Duration::from_millis(750), Duration::from_secs(5), 1.5)
    }

    /// Transport reconnect schedule: 0.25 s doubling up to 2 s.
    pub const fn reconnect() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(2), 2.0)
    }

    pub fn start(self) -> Backoff {
        Backoff { policy: self, current: self.initial.min(self.max), attempts: 0 }
    }
}

/// Running backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    /// Delay to wait before the next attempt; grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts = self.attempts.saturating_add(1);
        let grown = self.current.mul_f64(self.policy.factor.max(1.0));
        self.current = grown.max(self.current).min(self.policy.max);
        delay
    }

    /// Forget previous failures after a success.
    pub fn reset(&mut self) {
        self.current = self.policy.initial.min(self.policy.max);
        self.attempts = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }
}
