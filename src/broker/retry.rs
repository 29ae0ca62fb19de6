//! Pure backoff state machine: data in, data out, no I/O.
//!
//! The broker owns one [`RetryState`] per transport candidate and drives it
//! with the current time, so the machine stays independently testable and
//! works under paused test time.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Delay before reattempt number `attempt` (1-based):
    /// `clamp(base * 2^(attempt-1), base, max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.base_delay;
        }
        let shift = (attempt - 1).min(20);
        let multiplied = self
            .base_delay
            .saturating_mul(1_u32.checked_shl(shift).unwrap_or(u32::MAX));
        multiplied.clamp(self.base_delay, self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300), None)
    }
}

/// Backoff bookkeeping for one candidate. `current_delay` never decreases
/// across consecutive failures until `reset()`.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt_count: u32,
    last_attempt: Option<Instant>,
    next_attempt: Option<Instant>,
    current_delay: Duration,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt_count: 0,
            last_attempt: None,
            next_attempt: None,
            current_delay: Duration::ZERO,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.attempt_count += 1;
        self.current_delay = self.policy.delay_for_attempt(self.attempt_count);
        self.last_attempt = Some(now);
        self.next_attempt = Some(now + self.current_delay);
    }

    /// Invoked by the broker on any successful connect for this candidate.
    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.last_attempt = None;
        self.next_attempt = None;
        self.current_delay = Duration::ZERO;
    }

    pub fn is_backed_off(&self, now: Instant) -> bool {
        matches!(self.next_attempt, Some(at) if now < at)
    }

    pub fn has_reached_max_attempts(&self) -> bool {
        matches!(self.policy.max_attempts, Some(max) if self.attempt_count >= max)
    }

    pub fn can_retry(&self, now: Instant) -> bool {
        !self.has_reached_max_attempts() && !self.is_backed_off(now)
    }
}
