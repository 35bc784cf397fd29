//! Bounded retry with a fixed pause between attempts
//!
//! Used around reference creation, directory registration and outbound
//! remote calls. Only retryable errors (see [`RuntimeError::is_retryable`])
//! are retried; a transport failure that survives every attempt is reported
//! as a `Timeout`.

use crate::error::{Result, RuntimeError};
use plant_config::RuntimeConfig;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    pause: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, pause: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            pause,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.attempts(), config.repeat_timeout())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. `f` receives the 1-based attempt number.
    pub fn run<T>(&self, operation: &str, mut f: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            match f(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Retryable failure"
                    );
                    last_error = Some(e);
                    if attempt < self.attempts {
                        thread::sleep(self.pause);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(match last_error {
            Some(RuntimeError::Timeout {
                operation,
                timeout_ms,
            }) => RuntimeError::Timeout {
                operation,
                timeout_ms,
            },
            _ => RuntimeError::timeout(operation, self.budget_ms()),
        })
    }

    /// Total pause time spent across all attempts
    fn budget_ms(&self) -> u64 {
        self.pause.as_millis() as u64 * u64::from(self.attempts.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}
