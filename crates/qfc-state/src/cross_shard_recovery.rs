// Cross-shard recovery: bounded retry with exponential backoff
//
// SAFETY INVARIANTS:
// 1. Retries are bounded (max_attempts), never infinite
// 2. Backoff never exceeds max_backoff_ms
// 3. Exhaustion is surfaced to the caller, never swallowed

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry budget for operations that may time out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts (tests and simulations).
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    pub fn should_give_up(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            next_ms: self.initial_backoff_ms,
            max_ms: self.max_backoff_ms,
        }
    }
}

/// Doubling delays capped at the policy maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    next_ms: u64,
    max_ms: u64,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next_ms.min(self.max_ms);
        self.next_ms = self.next_ms.saturating_mul(2).min(self.max_ms);
        Some(Duration::from_millis(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
        };
        let delays: Vec<u64> = policy.backoff().take(5).map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_give_up_after_budget() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_give_up(4));
        assert!(policy.should_give_up(5));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 2}"#).unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.initial_backoff_ms, 50);
        assert_eq!(policy.max_backoff_ms, 2_000);
    }
}
