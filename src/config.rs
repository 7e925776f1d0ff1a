use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::retry::{ExistsRetry, RetryStrategy, StreamRetry};

/// Options shared by every read and write operation on a [`crate::File`].
#[derive(Clone)]
pub struct Config {
    pub(crate) read_timeout: Duration,
    pub(crate) read_exists_retry: Arc<dyn RetryStrategy>,
    pub(crate) write_exists_retry: Arc<dyn RetryStrategy>,
    pub(crate) read_retry: Arc<dyn RetryStrategy>,
    pub(crate) write_retry: Arc<dyn RetryStrategy>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_timeout: Duration::ZERO,
            read_exists_retry: Arc::new(ExistsRetry::default()),
            write_exists_retry: Arc::new(ExistsRetry::default()),
            read_retry: Arc::new(StreamRetry::default()),
            write_retry: Arc::new(StreamRetry::default()),
        }
    }
}

impl Config {
    /// Fail a read stream which is still open `timeout` after it was opened.
    /// Zero disables the timeout.
    ///
    /// With a timeout, the end of a regular file or device does not end the read:
    /// data appended later is delivered, until the timeout fails the stream.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the strategy used while a path to read does not exist or is not readable.
    pub fn read_exists_retry<R: RetryStrategy + 'static>(mut self, strategy: R) -> Self {
        self.read_exists_retry = Arc::new(strategy);
        self
    }

    /// Set the strategy used while a path to write does not exist or is not writable.
    pub fn write_exists_retry<R: RetryStrategy + 'static>(mut self, strategy: R) -> Self {
        self.write_exists_retry = Arc::new(strategy);
        self
    }

    /// Set the strategy used when a read stream fails.
    pub fn read_retry<R: RetryStrategy + 'static>(mut self, strategy: R) -> Self {
        self.read_retry = Arc::new(strategy);
        self
    }

    /// Set the strategy used when a write stream fails.
    pub fn write_retry<R: RetryStrategy + 'static>(mut self, strategy: R) -> Self {
        self.write_retry = Arc::new(strategy);
        self
    }

    /// The configured read timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        if self.read_timeout.is_zero() {
            None
        } else {
            Some(self.read_timeout)
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}
