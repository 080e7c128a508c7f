//! Retry wrapper for registry calls
//!
//! Transient failures (network, unexpected registry status) are retried with a
//! fixed delay. Unauthorized, not-found, validation and explicitly non-retryable
//! errors are returned immediately.

use crate::error::Result;
use crate::logging::Logger;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_ATTEMPTS: usize = 5;
pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: usize, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// A policy that calls the operation exactly once
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// the attempts are exhausted. The last error is returned.
    pub async fn run<T, F, Fut>(&self, logger: &Logger, description: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    logger.warning(&format!(
                        "{} failed (attempt {}/{}): {}",
                        description, attempt, attempts, err
                    ));
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
