use log::info;
use serde::{Deserialize, Serialize};

/// Persistable retarget state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultySnapshot {
    pub current: u32,
    pub previous: u32,
    pub window: Vec<u64>,
}

/// Windowed difficulty retargeting.
///
/// Samples accumulate until `interval` exist; then the mean is compared with
/// the target: faster raises difficulty by one, slower lowers it by one
/// (never below 1), equal leaves it. The window is cleared either way.
#[derive(Debug, Clone)]
pub struct DifficultyController {
    current: u32,
    previous: u32,
    target_ms: u64,
    interval: usize,
    window: Vec<u64>,
}

impl DifficultyController {
    pub fn new(initial: u32, target_ms: u64, interval: usize) -> Self {
        DifficultyController {
            current: initial,
            previous: initial,
            target_ms,
            interval: interval.max(1),
            window: Vec::with_capacity(interval.max(1)),
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Lowest difficulty a block may carry: blocks mined just before a
    /// retarget still verify.
    pub fn accepted_floor(&self) -> u32 {
        self.current.min(self.previous)
    }

    /// Record one block duration. Returns the new difficulty when a window closes.
    pub fn record(&mut self, duration_ms: u64) -> Option<u32> {
        self.window.push(duration_ms);
        if self.window.len() < self.interval {
            return None;
        }

        let total: u128 = self.window.iter().map(|&d| u128::from(d)).sum();
        let mean = total / self.window.len() as u128;
        let target = u128::from(self.target_ms);
        self.window.clear();
        self.previous = self.current;

        if mean < target {
            self.current += 1;
            info!("Difficulty increased to {} (mean {} ms < target {} ms)", self.current, mean, target);
        } else if mean > target && self.current > 1 {
            self.current -= 1;
            info!("Difficulty decreased to {} (mean {} ms > target {} ms)", self.current, mean, target);
        }
        Some(self.current)
    }

    pub fn snapshot(&self) -> DifficultySnapshot {
        DifficultySnapshot {
            current: self.current,
            previous: self.previous,
            window: self.window.clone(),
        }
    }
}
