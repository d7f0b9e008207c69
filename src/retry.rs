//! Whole-run retry with linearly growing, capped delays.
//!
//! Attempts are unbounded: a run either eventually reports success or the
//! process is terminated from outside.

use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::error::HarvestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// `min(initial * attempt, max)`; attempt 0 is immediate.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay
            .checked_mul(attempt)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Runs `run` until it returns `Ok(true)`, sleeping with [`thread::sleep`].
/// Returns the number of attempts made.
pub fn run_with_retry<F>(policy: RetryPolicy, run: F) -> u32
where
    F: FnMut(u32) -> Result<bool, HarvestError>,
{
    run_with_retry_using(policy, thread::sleep, run)
}

pub fn run_with_retry_using<S, F>(policy: RetryPolicy, mut sleep: S, mut run: F) -> u32
where
    S: FnMut(Duration),
    F: FnMut(u32) -> Result<bool, HarvestError>,
{
    let mut attempt = 0u32;
    loop {
        let delay = policy.delay_for(attempt);
        info!(secs = delay.as_secs_f64(), "sleeping before next attempt");
        sleep(delay);
        attempt = attempt.saturating_add(1);
        // Structural errors are retried too; a broken config keeps looping here.
        match run(attempt) {
            Ok(true) => {
                info!(attempt, "all done");
                return attempt;
            }
            Ok(false) => info!(attempt, "run reported unfinished work"),
            Err(err) => error!(attempt, error = %err, "attempt failed"),
        }
    }
}
