//! Relay reconnection with exponential backoff

use crate::config::SignalingOptions;
use std::time::Duration;

/// Reconnection policy for the relay link
///
/// The delay before attempt `n` (1-indexed) is `min(base * 2^(n-1), cap)`.
/// No jitter is applied so retry timing is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&SignalingOptions::default())
    }
}

impl From<&SignalingOptions> for ReconnectPolicy {
    fn from(options: &SignalingOptions) -> Self {
        Self {
            base_delay: Duration::from_millis(options.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(options.reconnect_max_delay_ms),
            max_attempts: options.max_reconnect_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Calculate the delay before a given attempt (1-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Check if more attempts are allowed after `attempts` have been made
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Attempt counter for one outage
///
/// Dropped (or [`Backoff::reset`]) once the relay is reachable again, so the
/// next outage starts from the base delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Advance to the next attempt
    ///
    /// Returns the attempt number and the delay to wait before it, or `None`
    /// once `max_attempts` have been used.
    pub fn next_delay(&mut self) -> Option<(u32, Duration)> {
        if !self.policy.should_retry(self.attempt) {
            return None;
        }
        self.attempt += 1;
        Some((self.attempt, self.policy.delay_for(self.attempt)))
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
