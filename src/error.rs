use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The result of a `resfs` operation.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by read and write operations.
///
/// I/O causes are reference-counted so that a retry strategy can hand the
/// error it was given back as the terminal error of an operation.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The path does not exist or is not accessible in the required mode.
    #[error("{} is not accessible: {cause}", .path.display())]
    NotAccessible {
        path: PathBuf,
        #[source]
        cause: Arc<io::Error>,
    },

    /// Opening, reading, or writing the stream failed.
    #[error("stream error on {}: {cause}", .path.display())]
    Stream {
        path: PathBuf,
        #[source]
        cause: Arc<io::Error>,
    },

    /// A read stream produced no terminal event within the configured timeout.
    #[error("read of {} timed out after {timeout:?}", .path.display())]
    Timeout { path: PathBuf, timeout: Duration },

    /// A retry strategy gave up.
    #[error("giving up on {} after {attempts} retries: {cause}", .path.display())]
    RetryExhausted {
        path: PathBuf,
        attempts: usize,
        #[source]
        cause: Box<Error>,
    },

    /// Invalid construction arguments.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A terminal error raised by a caller-supplied strategy or handler.
    #[error("{0}")]
    Custom(String),
}

impl Error {
    pub(crate) fn not_accessible(path: &Path, cause: io::Error) -> Self {
        Self::NotAccessible {
            path: path.to_path_buf(),
            cause: Arc::new(cause),
        }
    }

    pub(crate) fn stream(path: &Path, cause: io::Error) -> Self {
        Self::Stream {
            path: path.to_path_buf(),
            cause: Arc::new(cause),
        }
    }

    /// The [`io::ErrorKind`] underlying this error, if it was caused by I/O.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::NotAccessible { cause, .. } | Self::Stream { cause, .. } => Some(cause.kind()),
            Self::Timeout { .. } => Some(io::ErrorKind::TimedOut),
            Self::RetryExhausted { cause, .. } => cause.io_kind(),
            Self::Config(_) | Self::Custom(_) => None,
        }
    }

    /// Return `true` if this error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        self.io_kind() == Some(io::ErrorKind::NotFound)
    }

    /// Return `true` if this error was caused by a read timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::RetryExhausted { cause, .. } => cause.is_timeout(),
            _ => false,
        }
    }
}
