// Bounded retry-with-delay executor shared by lock acquisition, saves, and closes.
// Only transient kinds are retried; data, hook, and lock-loss failures surface at once.
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub warn: bool,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            warn: false,
        }
    }

    pub fn with_warnings(mut self, warn: bool) -> Self {
        self.warn = warn;
        self
    }

    /// Runs `attempt` until it succeeds, fails with a non-retryable kind, or
    /// the attempt budget is spent. The last error carries the attempt count.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, Error>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let attempts = self.attempts.max(1);
        let mut number = 1;
        loop {
            let err = match attempt(number).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !is_retryable(err.kind()) {
                return Err(err);
            }
            if number >= attempts {
                return Err(err.with_attempts(number));
            }
            if self.warn {
                warn!(operation, attempt = number, attempts, error = %err, "retrying");
            } else {
                debug!(operation, attempt = number, attempts, error = %err, "retrying");
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            number += 1;
        }
    }
}

pub fn is_retryable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Remote | ErrorKind::LockUnavailable | ErrorKind::Io
    )
}
