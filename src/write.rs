//! The serialized write engine.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use log::{debug, warn};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use super::config::Config;
use super::error::{Error, Result};
use super::kind::{self, Access, PathKind};
use super::registry::{LockRegistry, PendingLock};
use super::retry::{self, is_device_path, RetryStrategy};

/// The data to write.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    /// Text, written as UTF-8.
    Text(String),
    /// Bytes, written as-is.
    Binary(Bytes),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl<'a> From<&'a str> for Payload {
    fn from(text: &'a str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes.into())
    }
}

impl<'a> From<&'a [u8]> for Payload {
    fn from(bytes: &'a [u8]) -> Self {
        Self::Binary(Bytes::copy_from_slice(bytes))
    }
}

/// Resolves when a write operation has finished, or failed permanently.
///
/// The write proceeds whether or not this handle is awaited.
#[derive(Debug)]
pub struct WriteHandle {
    task: JoinHandle<Result<()>>,
}

impl Future for WriteHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.task).poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(cause) => Poll::Ready(Err(Error::Custom(format!(
                "write task failed: {}",
                cause
            )))),
        }
    }
}

struct WriteOperation {
    path: PathBuf,
    config: Arc<Config>,
    payload: Payload,
    attempt: usize,
}

impl WriteOperation {
    async fn run(mut self, lock: PendingLock) -> Result<()> {
        let guard = lock.await;
        let result = self.execute().await;

        // release before reporting, so a failed write never blocks the next one
        drop(guard);

        match &result {
            Ok(()) => debug!("wrote {} bytes to {}", self.payload.len(), self.path.display()),
            Err(cause) => debug!("gave up writing {}: {}", self.path.display(), cause),
        }

        result
    }

    async fn execute(&mut self) -> Result<()> {
        self.wait_for_destination().await?;

        loop {
            match self.write_once().await {
                Ok(()) => return Ok(()),
                Err(cause) => {
                    let error = Error::stream(&self.path, cause);
                    let strategy = self.config.write_retry.clone();
                    self.retry(&*strategy, error).await?;
                }
            }
        }
    }

    async fn wait_for_destination(&mut self) -> Result<()> {
        loop {
            let ready = match destination_kind(&self.path).await {
                Ok(PathKind::Regular) => create_parent(&self.path).await,
                Ok(_) => kind::check_access(&self.path, Access::Write).await,
                Err(cause) => Err(cause),
            };

            match ready {
                Ok(()) => return Ok(()),
                Err(cause) => {
                    let error = Error::not_accessible(&self.path, cause);
                    let strategy = self.config.write_exists_retry.clone();
                    self.retry(&*strategy, error).await?;
                }
            }
        }
    }

    async fn write_once(&self) -> io::Result<()> {
        let kind = destination_kind(&self.path).await?;
        debug!("writing {} ({})", self.path.display(), kind);

        let mut file = kind::open_write(&self.path, kind).await?;
        file.write_all(self.payload.as_bytes()).await?;
        file.flush().await
    }

    async fn retry(&mut self, strategy: &dyn RetryStrategy, error: Error) -> Result<()> {
        let delay = retry::decide(strategy, &error, self.attempt, &self.path)?;
        warn!("{} (attempt {}), retrying in {:?}", error, self.attempt, delay);

        self.attempt += 1;
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

// a path which does not exist yet is a regular file to be created, unless it's a device
async fn destination_kind(path: &Path) -> io::Result<PathKind> {
    match PathKind::of(path).await {
        Ok(kind) => Ok(kind),
        Err(cause) if cause.kind() == io::ErrorKind::NotFound && !is_device_path(path) => {
            Ok(PathKind::Regular)
        }
        Err(cause) => Err(cause),
    }
}

async fn create_parent(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };

    match fs::create_dir_all(parent).await {
        Ok(()) => Ok(()),
        Err(cause) if cause.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(cause) => {
            if fs::metadata(parent).await.map(|meta| meta.is_dir()).unwrap_or(false) {
                Ok(())
            } else {
                Err(io::Error::new(
                    cause.kind(),
                    format!("failed to create directory {}: {}", parent.display(), cause),
                ))
            }
        }
    }
}

/// Queue a write of `payload` to `path` and start it.
///
/// The place in the queue for the path's lock is taken before this function returns.
pub(crate) fn spawn(
    path: &Path,
    config: Arc<Config>,
    registry: &LockRegistry,
    payload: Payload,
) -> WriteHandle {
    let lock = registry.acquire(path);

    let operation = WriteOperation {
        path: path.to_path_buf(),
        config,
        payload,
        attempt: 1,
    };

    WriteHandle {
        task: tokio::spawn(operation.run(lock)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_conversions() {
        assert_eq!(Payload::from("abc"), Payload::Text("abc".into()));
        assert_eq!(Payload::from(vec![1u8, 2]).as_bytes(), &[1, 2]);
        assert_eq!(Payload::from(&b"xyz"[..]).len(), 3);
        assert!(Payload::from(String::new()).is_empty());
    }

    #[tokio::test]
    async fn test_destination_kind() {
        let dir = tempfile::tempdir().expect("tempdir");

        let missing = dir.path().join("new.txt");
        assert_eq!(destination_kind(&missing).await.expect("kind"), PathKind::Regular);

        let device = Path::new("/dev/resfs-missing-device");
        let cause = destination_kind(device).await.expect_err("missing device");
        assert_eq!(cause.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_create_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a").join("b").join("c.txt");

        create_parent(&path).await.expect("create");
        create_parent(&path).await.expect("already exists");
        assert!(path.parent().expect("parent").is_dir());

        create_parent(Path::new("relative.txt")).await.expect("no parent");
    }
}
