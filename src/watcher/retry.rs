//! Bounded retries around mirror and dispatch operations.
//!
//! Errors that cannot change on a second try ([`EngineError::is_retryable`]
//! returns false) are propagated immediately without consuming attempts.

use std::time::Duration;

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};

/// Back-off schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Same wait between every attempt.
    Fixed { attempts: u32, wait: Duration },
    /// Wait grows by `step` after each failure, capped at `max`.
    Incrementing {
        attempts: u32,
        start: Duration,
        step: Duration,
        max: Duration,
    },
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, wait: Duration) -> Self {
        RetryPolicy::Fixed {
            attempts: attempts.max(1),
            wait,
        }
    }

    pub fn incrementing(attempts: u32, start: Duration, step: Duration, max: Duration) -> Self {
        RetryPolicy::Incrementing {
            attempts: attempts.max(1),
            start,
            step,
            max,
        }
    }

    /// Single attempt, no waiting.
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        match *self {
            RetryPolicy::Fixed { attempts, .. } | RetryPolicy::Incrementing { attempts, .. } => {
                attempts
            }
        }
    }

    /// Wait after the `failed`-th failed attempt (1 based).
    pub fn wait_after(&self, failed: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed { wait, .. } => wait,
            RetryPolicy::Incrementing {
                start, step, max, ..
            } => (start + step * failed.saturating_sub(1)).min(max),
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1 based attempt number.
    pub fn run<T, F>(&self, clock: &dyn Clock, what: &str, mut op: F) -> EngineResult<T>
    where
        F: FnMut(u32) -> EngineResult<T>,
    {
        let attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(exhausted(e, what, attempts));
                }
                Err(e) => {
                    let wait = self.wait_after(attempt);
                    crate::debug_event!(
                        "retry",
                        "attempt failed",
                        "{what} ({attempt}/{attempts}), retrying in {wait:?}: {e}"
                    );
                    clock.sleep(wait);
                    attempt += 1;
                }
            }
        }
    }
}

fn exhausted(e: EngineError, what: &str, attempts: u32) -> EngineError {
    tracing::warn!("[retry] {what} failed after {attempts} attempts: {e}");
    e
}
