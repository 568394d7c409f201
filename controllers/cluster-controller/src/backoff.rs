//! # Fibonacci Backoff
//!
//! Requeue delays for keys whose reconciliation failed.
//! Grows more slowly than exponential backoff so a flapping dependency
//! (a workload cluster that is briefly unreachable) is retried reasonably soon.
//!
//! Sequence in seconds for the first retries: 1s, 2s, 3s, 5s, 8s, ... capped at 300s.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Fibonacci backoff calculator for reconcile retries.
#[derive(Debug, Clone, Copy)]
pub struct FibonacciBackoff {
    /// First two delays in seconds
    min_seconds: u64,
    /// Cap in seconds
    max_seconds: u64,
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(1, 300)
    }
}

impl FibonacciBackoff {
    /// Create a backoff whose sequence starts at `min_seconds` and never exceeds `max_seconds`.
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self { min_seconds, max_seconds }
    }

    /// Delay before retry number `attempt` (1 for the first failure).
    ///
    /// Attempts 0 and 1 both return the minimum; after that each delay is the
    /// sum of the previous two, capped at the maximum.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut prev = self.min_seconds;
        let mut current = self.min_seconds;

        for _ in 2..=attempt {
            if current >= self.max_seconds {
                break;
            }
            let next = prev.saturating_add(current);
            prev = current;
            current = next;
        }

        Duration::from_secs(current.min(self.max_seconds))
    }
}

/// Consecutive reconcile failures per object, turned into requeue delays.
#[derive(Debug, Default)]
pub struct Retries {
    backoff: FibonacciBackoff,
    failures: Mutex<HashMap<String, u32>>,
}

impl Retries {
    /// Records another failure for `key` and returns how long to wait before retrying it.
    pub fn failed(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let attempt = failures.entry(key.to_string()).or_insert(0);
        *attempt = attempt.saturating_add(1);
        self.backoff.delay_for_attempt(*attempt)
    }

    /// Resets `key` after a successful reconcile.
    pub fn succeeded(&self, key: &str) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let backoff = FibonacciBackoff::new(1, 300);
        let delays: Vec<u64> = (1..=8).map(|n| backoff.delay_for_attempt(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 3, 5, 8, 13, 21, 34]);
        assert_eq!(backoff.delay_for_attempt(0).as_secs(), 1);
    }

    #[test]
    fn test_fibonacci_backoff_max_cap() {
        let backoff = FibonacciBackoff::new(1, 10);
        assert_eq!(backoff.delay_for_attempt(6).as_secs(), 10); // 13 capped
        assert_eq!(backoff.delay_for_attempt(50).as_secs(), 10);
        // No overflow on absurd attempt counts
        assert_eq!(backoff.delay_for_attempt(u32::MAX).as_secs(), 10);
    }

    #[test]
    fn test_default_caps_at_five_minutes() {
        assert_eq!(FibonacciBackoff::default().delay_for_attempt(100), Duration::from_secs(300));
    }

    #[test]
    fn test_retries_grow_per_key_and_reset_on_success() {
        let retries = Retries::default();
        assert_eq!(retries.failed("east"), Duration::from_secs(1));
        assert_eq!(retries.failed("east"), Duration::from_secs(2));
        assert_eq!(retries.failed("east"), Duration::from_secs(3));
        // Other keys keep their own count
        assert_eq!(retries.failed("west"), Duration::from_secs(1));

        retries.succeeded("east");
        assert_eq!(retries.failed("east"), Duration::from_secs(1));
    }
}
