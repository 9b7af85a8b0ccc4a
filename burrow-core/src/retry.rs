//! Retry policies consulted by `Command` when a statement fails

use crate::error::Error;
use std::fmt;
use std::time::Duration;

/// What the command should do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Give up and propagate the error
    No,
    /// Try again on the same connection
    Retry,
    /// Discard the connection, reconnect and try again
    Reconnect,
}

/// Decides whether a failed statement is attempted again.
///
/// `attempt` counts from 1 and is the attempt that just failed.
pub trait RetryHandler: Send + Sync + fmt::Debug {
    fn handle(&self, err: &Error, attempt: u32) -> RetryAction;

    /// Pause before the next attempt
    fn backoff(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Reconnect until `total` attempts have been made.
///
/// Sleeps before every reconnect except the first.
#[derive(Debug, Clone)]
pub struct MaxAttemptsRetry {
    total: u32,
    sleep: Duration,
}

impl MaxAttemptsRetry {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            sleep: Duration::from_secs(1),
        }
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}

impl Default for MaxAttemptsRetry {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryHandler for MaxAttemptsRetry {
    fn handle(&self, _err: &Error, attempt: u32) -> RetryAction {
        if attempt < self.total {
            RetryAction::Reconnect
        } else {
            RetryAction::No
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        if attempt > 1 {
            self.sleep
        } else {
            Duration::ZERO
        }
    }
}

/// Never retry
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryHandler for NoRetry {
    fn handle(&self, _err: &Error, _attempt: u32) -> RetryAction {
        RetryAction::No
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_attempts_decisions() {
        let handler = MaxAttemptsRetry::new(3);
        let err = Error::database("gone away");
        assert_eq!(handler.handle(&err, 1), RetryAction::Reconnect);
        assert_eq!(handler.handle(&err, 2), RetryAction::Reconnect);
        assert_eq!(handler.handle(&err, 3), RetryAction::No);
    }

    #[test]
    fn test_max_attempts_backoff() {
        let handler = MaxAttemptsRetry::default().with_sleep(Duration::from_millis(5));
        assert_eq!(handler.total(), 3);
        assert_eq!(handler.backoff(1), Duration::ZERO);
        assert_eq!(handler.backoff(2), Duration::from_millis(5));
    }

    #[test]
    fn test_no_retry() {
        assert_eq!(NoRetry.handle(&Error::database("x"), 1), RetryAction::No);
    }
}
