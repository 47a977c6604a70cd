//! Bounded polling.
//!
//! Every wait in gpuswap is a fixed number of attempts separated by a fixed
//! interval. Both the eviction holder checks and the rebind confirmations go
//! through [`RetryPolicy::poll`].

use crate::error::Result;
use std::time::Duration;

/// Attempt budget and spacing for a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Same attempt count with no sleeping, for tests.
    pub const fn immediate(attempts: u32) -> Self {
        Self { attempts, interval: Duration::ZERO }
    }

    /// Sleep, then evaluate `check`, up to `attempts` times.
    ///
    /// Returns `Ok(true)` as soon as the predicate holds and `Ok(false)` once
    /// the budget is exhausted. Predicate errors abort the poll.
    pub fn poll<F>(&self, mut check: F) -> Result<bool>
    where
        F: FnMut() -> Result<bool>,
    {
        for _ in 0..self.attempts {
            if !self.interval.is_zero() {
                std::thread::sleep(self.interval);
            }
            if check()? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
