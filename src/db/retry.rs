//! Lock-retry policy.
//!
//! Absorbs "database is locked" failures by re-running the failed operation
//! after a short bounded pause. Statements and transaction boundaries have
//! separate entry points: a failed statement is re-run as a whole, while a
//! failed COMMIT or ROLLBACK is re-attempted on its own without replaying the
//! work inside the transaction.

use std::time::Duration;

use super::error::DriverError;
use crate::config::RetryConfig;

/// Physical transaction boundary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Begin,
    Commit,
    Rollback,
}

impl Boundary {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Boundary::Begin => "BEGIN",
            Boundary::Commit => "COMMIT",
            Boundary::Rollback => "ROLLBACK",
        }
    }
}

/// A failure that retrying did not absorb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    pub error: DriverError,
    /// Attempts made, including the first.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Delays are clamped so a retry never spins and never stalls unboundedly.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        let base_delay = base_delay.max(Duration::from_millis(1));
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn should_retry(&self, error: &DriverError, retries_remaining: u32) -> bool {
        error.is_lock() && retries_remaining > 0
    }

    /// Pause before retry number `attempt` (1-based): linear, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }

    /// Run a statement, re-running it while it fails on a lock.
    pub fn retry_statement<T>(
        &self,
        sql: &str,
        op: impl FnMut() -> Result<T, DriverError>,
    ) -> Result<T, RetryFailure> {
        self.run(sql, op)
    }

    /// Re-attempt a single transaction boundary while it fails on a lock.
    pub fn retry_boundary<T>(
        &self,
        boundary: Boundary,
        op: impl FnMut() -> Result<T, DriverError>,
    ) -> Result<T, RetryFailure> {
        self.run(boundary.as_sql(), op)
    }

    fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, DriverError>,
    ) -> Result<T, RetryFailure> {
        let mut retries_remaining = self.max_retries;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match op() {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::debug!("{} succeeded after {} attempts", what, attempts);
                    }
                    return Ok(value);
                }
                Err(error) if self.should_retry(&error, retries_remaining) => {
                    retries_remaining -= 1;
                    let delay = self.delay_for(attempts);
                    tracing::debug!(
                        "Database locked during {} (attempt {}), retrying in {:?}",
                        what,
                        attempts,
                        delay
                    );
                    std::thread::sleep(delay);
                }
                Err(error) => {
                    if error.is_lock() {
                        tracing::warn!(
                            "Giving up on {} after {} attempts: {}",
                            what,
                            attempts,
                            error
                        );
                    }
                    return Err(RetryFailure { error, attempts });
                }
            }
        }
    }
}
