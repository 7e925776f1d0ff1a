//! `resfs` provides resilient, continuous reads and serialized writes over paths which
//! may not behave like ordinary files: regular files, character and block devices,
//! and named pipes (FIFOs).
//!
//! A read operation waits for its path to exist, retries after I/O failures, and keeps
//! reading a FIFO across writer disconnections until it's finished. A write operation
//! holds a per-path lock for its whole lifetime, including its retries, so concurrent
//! writes to one path never interleave and complete in the order they were started.
//!
//! Retries are decided by a [`RetryStrategy`]; see [`Config`] for the defaults.
//!
//! This crate assumes a Unix host and a running [`tokio`] runtime.
//!
//! ```no_run
//! use resfs::{File, ReadEvent};
//!
//! # async fn example() -> resfs::Result<()> {
//! let file = File::new("/tmp/resfs/greeting.txt")?;
//! file.write("Hello, world!").await?;
//!
//! let contents = file.read_to_end().await?;
//! assert_eq!(&contents[..], b"Hello, world!");
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

mod config;
mod error;
mod kind;
mod read;
mod registry;
mod retry;
mod write;

pub use config::Config;
pub use error::{Error, Result};
pub use kind::{check_access, Access, PathKind};
pub use read::{Finish, ReadEvent, ReadHandle, ReadHandler, READ_BUFFER_SIZE, RECONNECT_DELAY};
pub use registry::{normalize, LockRegistry, PendingLock, WriteGuard};
pub use retry::{is_device_path, ExistsRetry, RetryStrategy, StreamRetry};
pub use write::{Payload, WriteHandle};

/// A path to read from and write to, with the options its operations share.
#[derive(Clone, Debug)]
pub struct File {
    path: PathBuf,
    config: Arc<Config>,
    registry: Arc<LockRegistry>,
}

impl File {
    /// Construct a new [`File`] with the default [`Config`].
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self> {
        Self::with_config(path, Config::default())
    }

    /// Construct a new [`File`] with the given `config`.
    pub fn with_config<P: Into<PathBuf>>(path: P, config: Config) -> Result<Self> {
        let path = path.into();

        if path.as_os_str().is_empty() {
            return Err(Error::Config("the path must not be empty".into()));
        }

        Ok(Self {
            path,
            config: Arc::new(config),
            registry: LockRegistry::global(),
        })
    }

    /// Serialize writes through `registry` instead of the process-wide one.
    pub fn with_registry(mut self, registry: Arc<LockRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Borrow the [`Path`] of this [`File`].
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Borrow the [`Config`] of this [`File`].
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start reading this file, delivering its events to `handler`.
    pub fn read<H: ReadHandler>(&self, handler: H) -> ReadHandle {
        read::spawn(&self.path, self.config.clone(), handler)
    }

    /// Start reading this file, delivering its events over a channel.
    ///
    /// Dropping the receiver finishes the read at its next chunk.
    pub fn read_events(&self) -> (ReadHandle, UnboundedReceiver<ReadEvent>) {
        read::spawn_events(&self.path, self.config.clone())
    }

    /// Read this file until its stream ends.
    ///
    /// The stream of a FIFO does not end, so this never resolves for a FIFO.
    /// With a read timeout, the stream is followed until the timeout fails it.
    pub async fn read_to_end(&self) -> Result<Bytes> {
        read::read_to_end(&self.path, self.config.clone()).await
    }

    /// Start writing `payload` to this file.
    ///
    /// Writes through the same [`LockRegistry`] to the same path run one at a time,
    /// in the order this method was called.
    pub fn write<P: Into<Payload>>(&self, payload: P) -> WriteHandle {
        write::spawn(
            &self.path,
            self.config.clone(),
            &self.registry,
            payload.into(),
        )
    }
}
