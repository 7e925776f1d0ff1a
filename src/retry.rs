//! Retry strategies decide whether, and when, a failed attempt is retried.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::Duration;

use super::error::{Error, Result};

/// Decide what to do after a failed attempt.
///
/// Return `Ok(delay)` to retry after `delay`, or `Err(error)` to give up, in which
/// case `error` becomes the terminal error of the operation.
///
/// `attempt` starts at 1 and increases by one for each failed attempt.
pub trait RetryStrategy: Send + Sync {
    fn retry(&self, error: &Error, attempt: usize, path: &Path) -> Result<Duration>;
}

impl<F> RetryStrategy for F
where
    F: Fn(&Error, usize, &Path) -> Result<Duration> + Send + Sync,
{
    fn retry(&self, error: &Error, attempt: usize, path: &Path) -> Result<Duration> {
        (self)(error, attempt, path)
    }
}

/// Return `true` if `path` names a device file.
pub fn is_device_path(path: &Path) -> bool {
    path.starts_with("/dev/")
}

/// The default strategy for a path which does not exist yet.
///
/// Only "not found" errors are retried. Device paths back off by
/// `device_base * min(attempt, 5)` for up to `device_attempts`,
/// other paths by `base * attempt` for up to `attempts`.
#[derive(Clone, Debug)]
pub struct ExistsRetry {
    base: Duration,
    attempts: usize,
    device_base: Duration,
    device_attempts: usize,
}

impl Default for ExistsRetry {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            attempts: 5,
            device_base: Duration::from_millis(2000),
            device_attempts: 10,
        }
    }
}

impl ExistsRetry {
    /// Override the backoff unit and attempt ceiling for regular paths.
    pub fn with_base(mut self, base: Duration, attempts: usize) -> Self {
        self.base = base;
        self.attempts = attempts;
        self
    }

    /// Override the backoff unit and attempt ceiling for device paths.
    pub fn with_device_base(mut self, base: Duration, attempts: usize) -> Self {
        self.device_base = base;
        self.device_attempts = attempts;
        self
    }
}

impl RetryStrategy for ExistsRetry {
    fn retry(&self, error: &Error, attempt: usize, path: &Path) -> Result<Duration> {
        if !error.is_not_found() {
            return Err(error.clone());
        }

        let (delay, ceiling) = if is_device_path(path) {
            let factor = attempt.min(5) as u32;
            (self.device_base * factor, self.device_attempts)
        } else {
            (self.base * attempt as u32, self.attempts)
        };

        if attempt >= ceiling {
            Err(exhausted(error, attempt, path))
        } else {
            Ok(delay)
        }
    }
}

/// The default strategy for a failure after a stream was opened:
/// a fixed delay, up to a fixed number of attempts.
///
/// A read timeout is not retried, since it means the stream has gone quiet.
#[derive(Clone, Debug)]
pub struct StreamRetry {
    delay: Duration,
    attempts: usize,
}

impl Default for StreamRetry {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(100),
            attempts: 5,
        }
    }
}

impl StreamRetry {
    /// Construct a new [`StreamRetry`] with the given `delay` and attempt ceiling.
    pub fn new(delay: Duration, attempts: usize) -> Self {
        Self { delay, attempts }
    }
}

impl RetryStrategy for StreamRetry {
    fn retry(&self, error: &Error, attempt: usize, path: &Path) -> Result<Duration> {
        if error.is_timeout() {
            Err(error.clone())
        } else if attempt >= self.attempts {
            Err(exhausted(error, attempt, path))
        } else {
            Ok(self.delay)
        }
    }
}

/// Consult `strategy`, reporting a panic in the strategy as a terminal error.
pub(crate) fn decide(
    strategy: &dyn RetryStrategy,
    error: &Error,
    attempt: usize,
    path: &Path,
) -> Result<Duration> {
    match panic::catch_unwind(AssertUnwindSafe(|| strategy.retry(error, attempt, path))) {
        Ok(decision) => decision,
        Err(_) => Err(Error::Custom(format!(
            "retry strategy for {} panicked on attempt {}",
            path.display(),
            attempt
        ))),
    }
}

fn exhausted(error: &Error, attempt: usize, path: &Path) -> Error {
    Error::RetryExhausted {
        path: path.to_path_buf(),
        attempts: attempt,
        cause: Box::new(error.clone()),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    fn not_found(path: &str) -> Error {
        Error::not_accessible(Path::new(path), io::ErrorKind::NotFound.into())
    }

    #[test]
    fn test_exists_backoff_regular() {
        let strategy = ExistsRetry::default();
        let path = Path::new("/tmp/missing");
        let error = not_found("/tmp/missing");

        for attempt in 1..5 {
            let delay = strategy.retry(&error, attempt, path).expect("delay");
            assert_eq!(delay, Duration::from_millis(1000 * attempt as u64));
        }

        let cause = strategy.retry(&error, 5, path).expect_err("exhausted");
        match &cause {
            Error::RetryExhausted { attempts, .. } => assert_eq!(*attempts, 5),
            other => panic!("unexpected error: {other}"),
        }

        let message = cause.to_string();
        assert!(message.contains("retries"));
        assert!(message.contains("/tmp/missing"));
        assert!(message.contains('5'));
    }

    #[test]
    fn test_exists_backoff_device() {
        let strategy = ExistsRetry::default();
        let path = Path::new("/dev/ttyUSB7");
        let error = not_found("/dev/ttyUSB7");

        assert_eq!(strategy.retry(&error, 1, path).unwrap(), Duration::from_millis(2000));
        assert_eq!(strategy.retry(&error, 3, path).unwrap(), Duration::from_millis(6000));
        assert_eq!(strategy.retry(&error, 7, path).unwrap(), Duration::from_millis(10000));
        assert_eq!(strategy.retry(&error, 9, path).unwrap(), Duration::from_millis(10000));
        assert!(strategy.retry(&error, 10, path).is_err());
    }

    #[test]
    fn test_exists_other_kind_is_fatal() {
        let strategy = ExistsRetry::default();
        let path = Path::new("/tmp/forbidden");
        let error = Error::not_accessible(path, io::ErrorKind::PermissionDenied.into());

        let cause = strategy.retry(&error, 1, path).expect_err("fatal");
        assert_eq!(cause.io_kind(), Some(io::ErrorKind::PermissionDenied));
        assert!(!matches!(cause, Error::RetryExhausted { .. }));
    }

    #[test]
    fn test_stream_retry() {
        let strategy = StreamRetry::default();
        let path = Path::new("/tmp/stream");
        let error = Error::stream(path, io::ErrorKind::BrokenPipe.into());

        for attempt in 1..5 {
            assert_eq!(
                strategy.retry(&error, attempt, path).unwrap(),
                Duration::from_millis(100)
            );
        }

        assert!(strategy.retry(&error, 5, path).is_err());
    }

    #[test]
    fn test_stream_retry_gives_up_on_timeout() {
        let strategy = StreamRetry::default();
        let path = Path::new("/tmp/quiet");
        let error = Error::Timeout {
            path: path.to_path_buf(),
            timeout: Duration::from_millis(1),
        };

        let cause = strategy.retry(&error, 1, path).expect_err("timeout");
        assert!(cause.is_timeout());
        assert!(!matches!(cause, Error::RetryExhausted { .. }));
    }

    #[test]
    fn test_decide_catches_panic() {
        let strategy = |_: &Error, _: usize, _: &Path| -> Result<Duration> { panic!("bug") };
        let path = Path::new("/tmp/panic");
        let error = Error::Custom("cause".into());

        let cause = decide(&strategy, &error, 2, path).expect_err("panicked");
        assert!(cause.to_string().contains("panicked"));
    }

    #[test]
    fn test_closure_strategy() {
        let strategy = |_: &Error, attempt: usize, _: &Path| -> Result<Duration> {
            Ok(Duration::from_millis(attempt as u64))
        };

        let path = Path::new("/tmp/closure");
        let error = Error::Custom("boom".into());
        assert_eq!(
            RetryStrategy::retry(&strategy, &error, 3, path).unwrap(),
            Duration::from_millis(3)
        );
    }
}
