//! Retry policy for draining the queue.
//!
//! Two levels:
//! - per pass: exponential backoff between drain passes after a failed pass
//! - per request: a bounded number of attempts for one operation within a pass
//!
//! Both are pure functions of their inputs; the orchestrator carries the
//! counters.

use crate::config::SyncConfig;
use crate::transport::TransportError;
use std::time::Duration;
use tokio::time::Instant;

/// What to do after a request attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    Retry(Duration),
    /// Stop and report the failure.
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_exponent: u32,
    pub request_attempts: u32,
    pub request_retry_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            max_exponent: config.max_backoff_exponent,
            request_attempts: config.request_attempts.max(1),
            request_retry_delay: config.request_retry_delay,
        }
    }

    /// Backoff after `failures` consecutive failed passes:
    /// `min(max_delay, base_delay * 2^failures)`, exponent capped.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.min(self.max_exponent).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether to retry a request that failed on `attempt` (1-based).
    pub fn decide(&self, attempt: u32, error: &TransportError) -> RetryDecision {
        if error.is_retryable() && attempt < self.request_attempts {
            RetryDecision::Retry(self.request_retry_delay)
        } else {
            RetryDecision::GiveUp
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Consecutive-failure counter and the retry window it implies.
#[derive(Debug, Default, Clone)]
pub struct Backoff {
    failures: u32,
    next_retry_at: Option<Instant>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }

    /// Whether `now` is still inside the backoff window.
    pub fn is_waiting(&self, now: Instant) -> bool {
        self.next_retry_at.is_some_and(|at| now < at)
    }

    /// Count a failed pass and open the next window. Returns its length.
    pub fn record_failure(&mut self, now: Instant, policy: &RetryPolicy) -> Duration {
        self.failures = (self.failures + 1).min(policy.max_exponent);
        let delay = policy.delay_for(self.failures);
        self.next_retry_at = Some(now + delay);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.next_retry_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn test_delay_grows_then_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_secs(1));
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(8));
        assert_eq!(p.delay_for(5), Duration::from_secs(32));
        assert_eq!(p.delay_for(6), Duration::from_secs(60));
        assert_eq!(p.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_custom_policy() {
        let p = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_exponent: 10,
            request_attempts: 3,
            request_retry_delay: Duration::from_millis(5),
        };
        assert_eq!(p.delay_for(2), Duration::from_millis(400));
        assert_eq!(p.delay_for(3), Duration::from_millis(500));
    }

    #[test]
    fn test_decide_retries_only_retryable_errors() {
        let p = policy();
        assert_eq!(
            p.decide(1, &TransportError::Timeout),
            RetryDecision::Retry(Duration::from_millis(250))
        );
        assert_eq!(p.decide(2, &TransportError::Timeout), RetryDecision::GiveUp);
        assert_eq!(
            p.decide(1, &TransportError::Rejected("bad update".into())),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_backoff_windows_never_shrink() {
        let p = policy();
        let mut backoff = Backoff::new();
        let now = Instant::now();

        let mut previous = Duration::ZERO;
        for _ in 0..10 {
            let delay = backoff.record_failure(now, &p);
            assert!(delay >= previous);
            previous = delay;
        }
        assert_eq!(backoff.failures(), p.max_exponent);
        assert!(backoff.is_waiting(now));
        assert!(!backoff.is_waiting(now + Duration::from_secs(61)));

        backoff.reset();
        assert!(!backoff.is_waiting(now));
        assert_eq!(backoff.next_retry_at(), None);
    }
}
