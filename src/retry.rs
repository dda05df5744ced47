//! Fixed-delay retry for operations that hit the filesystem or process table.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of attempts made when no policy is configured.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Pause between attempts when no policy is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Bounded retry with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Pause after each failed attempt except the last.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy making `attempts` tries spaced by `delay`.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Sets the number of attempts.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Sets the pause between attempts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Runs `op` until it succeeds or the attempts are used up.
    ///
    /// The error of the last attempt is returned unchanged. `label` only
    /// appears in log output.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        operation = %label,
                        attempt,
                        attempts,
                        error = %e,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        operation = %label,
                        attempt,
                        error = %e,
                        "operation failed, giving up"
                    );
                    return Err(e);
                }
            }
        }
    }
}
