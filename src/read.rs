//! The continuous read engine.
//!
//! A read operation waits for its path to become readable, opens it, and streams chunks
//! to a [`ReadHandler`] until the stream ends, the operation is finished, or a retry
//! strategy gives up. The end of a FIFO stream only means that its writer went away,
//! so a FIFO is reopened and read until [`Finish::finish`] is called.
//!
//! With a read timeout, any stream is read until the timeout or [`Finish::finish`],
//! picking up data appended after the end of a regular file.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::{self, Future};
use futures::stream::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::config::Config;
use super::error::{Error, Result};
use super::kind::{self, Access, PathKind};
use super::retry::{self, RetryStrategy};

/// The capacity of the buffer each read is made into.
pub const READ_BUFFER_SIZE: usize = 4096;

/// How long to wait before reopening a FIFO whose writer disconnected.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(50);

// how often a followed stream is checked for data written after its end
const FOLLOW_INTERVAL: Duration = Duration::from_millis(50);

/// Receives the events of a read operation.
///
/// Exactly one of [`ReadHandler::on_finish`] or [`ReadHandler::on_error`] is called,
/// once, and no data is delivered after either.
#[async_trait]
pub trait ReadHandler: Send + 'static {
    /// Handle one chunk of data. Call `finish.finish()` to stop reading.
    async fn on_data(&mut self, chunk: Bytes, finish: &Finish, attempt: usize);

    /// Called when the operation ends without an error.
    async fn on_finish(&mut self) {}

    /// Called when a retry strategy gives up.
    async fn on_error(&mut self, error: Error);
}

/// Stops a read operation. Cloning a [`Finish`] returns a handle to the same operation.
#[derive(Clone, Debug, Default)]
pub struct Finish {
    token: CancellationToken,
}

impl Finish {
    /// Stop the read operation. Calling this more than once has no further effect.
    pub fn finish(&self) {
        self.token.cancel()
    }

    /// Return `true` if [`Finish::finish`] has been called.
    pub fn is_finished(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A handle to a running read operation.
#[derive(Debug)]
pub struct ReadHandle {
    finish: Finish,
    task: JoinHandle<()>,
}

impl ReadHandle {
    /// Stop the read operation.
    pub fn finish(&self) {
        self.finish.finish()
    }

    /// Borrow a [`Finish`] which can stop this operation from elsewhere.
    pub fn finisher(&self) -> Finish {
        self.finish.clone()
    }

    /// Return `true` if the operation has ended and its handler has been called.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the operation to end.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|cause| Error::Custom(format!("read task failed: {}", cause)))
    }
}

/// An event of a read operation, as delivered by [`crate::File::read_events`].
#[derive(Clone, Debug)]
pub enum ReadEvent {
    Data { chunk: Bytes, attempt: usize },
    Finished,
    Error(Error),
}

struct EventSender {
    tx: UnboundedSender<ReadEvent>,
}

#[async_trait]
impl ReadHandler for EventSender {
    async fn on_data(&mut self, chunk: Bytes, finish: &Finish, attempt: usize) {
        if self.tx.send(ReadEvent::Data { chunk, attempt }).is_err() {
            // nobody is listening anymore
            finish.finish();
        }
    }

    async fn on_finish(&mut self) {
        let _ = self.tx.send(ReadEvent::Finished);
    }

    async fn on_error(&mut self, error: Error) {
        let _ = self.tx.send(ReadEvent::Error(error));
    }
}

enum State {
    WaitingForExistence,
    Reading,
    Reconnecting,
    Finished,
    Errored(Error),
}

struct ReadOperation<H> {
    path: PathBuf,
    config: Arc<Config>,
    handler: H,
    finish: Finish,
    attempt: usize,
    kind: Option<PathKind>,
}

impl<H: ReadHandler> ReadOperation<H> {
    async fn run(mut self) {
        let result = self.execute().await;

        if self.finish.is_finished() && self.kind.map(|kind| kind.is_fifo()).unwrap_or(false) {
            kind::release_writers(&self.path);
        }

        match result {
            Ok(()) => {
                debug!("finished reading {}", self.path.display());
                self.handler.on_finish().await
            }
            Err(cause) => {
                debug!("gave up reading {}: {}", self.path.display(), cause);
                self.handler.on_error(cause).await
            }
        }
    }

    async fn execute(&mut self) -> Result<()> {
        let mut state = State::WaitingForExistence;

        loop {
            state = match state {
                State::WaitingForExistence => self.wait_for_existence().await,
                State::Reading => self.read().await,
                State::Reconnecting => {
                    if sleep(&self.finish, RECONNECT_DELAY).await {
                        State::Reading
                    } else {
                        State::Finished
                    }
                }
                State::Finished => return Ok(()),
                State::Errored(cause) => return Err(cause),
            };
        }
    }

    async fn wait_for_existence(&mut self) -> State {
        match unless_finished(&self.finish, kind::check_access(&self.path, Access::Read)).await {
            None => State::Finished,
            Some(Ok(())) => State::Reading,
            Some(Err(cause)) => {
                let error = Error::not_accessible(&self.path, cause);
                let strategy = self.config.read_exists_retry.clone();
                self.retry(&*strategy, error, State::WaitingForExistence).await
            }
        }
    }

    async fn read(&mut self) -> State {
        let path = &self.path;
        let opened = unless_finished(&self.finish, async move {
            let kind = PathKind::of(path).await?;
            let stream = kind::open_read(path, kind).await?;
            Ok::<_, io::Error>((kind, stream))
        })
        .await;

        let (kind, mut stream) = match opened {
            None => return State::Finished,
            Some(Ok(opened)) => opened,
            Some(Err(cause)) => return self.stream_failed(Error::stream(&self.path, cause)).await,
        };

        debug!("reading {} ({})", self.path.display(), kind);
        self.kind = Some(kind);

        let deadline = self.config.timeout().map(|timeout| (Instant::now() + timeout, timeout));
        let mut first = true;

        // with a deadline, the end of a regular file or device is not the end of the read:
        // the stream is followed for further data until the deadline or `finish`
        let ended = loop {
            let mut chunks = ReaderStream::with_capacity(&mut stream, READ_BUFFER_SIZE);

            let ended = loop {
                let next = tokio::select! {
                    biased;
                    () = self.finish.token.cancelled() => return State::Finished,
                    timeout = expire(deadline) => Err(Error::Timeout {
                        path: self.path.clone(),
                        timeout,
                    }),
                    chunk = chunks.next() => match chunk {
                        Some(Ok(chunk)) => Ok(Some(chunk)),
                        Some(Err(cause)) => Err(Error::stream(&self.path, cause)),
                        None => Ok(None),
                    },
                };

                match next {
                    Ok(Some(chunk)) => {
                        if self.finish.is_finished() {
                            return State::Finished;
                        }

                        if first {
                            // data on a fresh stream means the connection succeeded
                            self.attempt = 1;
                            first = false;
                        }

                        self.handler.on_data(chunk, &self.finish, self.attempt).await;

                        if self.finish.is_finished() {
                            return State::Finished;
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(cause) => break Err(cause),
                }
            };

            if ended.is_err() || kind.reconnects() || deadline.is_none() {
                break ended;
            }

            let idle = tokio::select! {
                biased;
                () = self.finish.token.cancelled() => return State::Finished,
                timeout = expire(deadline) => Some(timeout),
                () = tokio::time::sleep(FOLLOW_INTERVAL) => None,
            };

            if let Some(timeout) = idle {
                break Err(Error::Timeout {
                    path: self.path.clone(),
                    timeout,
                });
            }
        };

        drop(stream);

        match ended {
            Ok(()) if kind.reconnects() => {
                debug!("writer of {} disconnected", self.path.display());
                State::Reconnecting
            }
            Ok(()) => State::Finished,
            Err(cause) => self.stream_failed(cause).await,
        }
    }

    async fn stream_failed(&mut self, error: Error) -> State {
        let strategy = self.config.read_retry.clone();
        self.retry(&*strategy, error, State::Reading).await
    }

    async fn retry(&mut self, strategy: &dyn RetryStrategy, error: Error, next: State) -> State {
        match retry::decide(strategy, &error, self.attempt, &self.path) {
            Ok(delay) => {
                warn!("{} (attempt {}), retrying in {:?}", error, self.attempt, delay);
                self.attempt += 1;

                if sleep(&self.finish, delay).await {
                    next
                } else {
                    State::Finished
                }
            }
            Err(cause) => State::Errored(cause),
        }
    }
}

// returns `false` if the operation was finished while sleeping
async fn sleep(finish: &Finish, delay: Duration) -> bool {
    unless_finished(finish, tokio::time::sleep(delay)).await.is_some()
}

async fn unless_finished<F: Future>(finish: &Finish, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = finish.token.cancelled() => None,
        output = future => Some(output),
    }
}

async fn expire(deadline: Option<(Instant, Duration)>) -> Duration {
    match deadline {
        Some((deadline, timeout)) => {
            tokio::time::sleep_until(deadline).await;
            timeout
        }
        None => future::pending().await,
    }
}

/// Start reading `path`, delivering events to `handler`.
pub(crate) fn spawn<H: ReadHandler>(path: &Path, config: Arc<Config>, handler: H) -> ReadHandle {
    let finish = Finish::default();

    let operation = ReadOperation {
        path: path.to_path_buf(),
        config,
        handler,
        finish: finish.clone(),
        attempt: 1,
        kind: None,
    };

    ReadHandle {
        finish,
        task: tokio::spawn(operation.run()),
    }
}

/// Start reading `path`, delivering events over a channel.
pub(crate) fn spawn_events(
    path: &Path,
    config: Arc<Config>,
) -> (ReadHandle, UnboundedReceiver<ReadEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = spawn(path, config, EventSender { tx });
    (handle, rx)
}

/// Read `path` until its stream ends and return everything read.
pub(crate) async fn read_to_end(path: &Path, config: Arc<Config>) -> Result<Bytes> {
    let (_handle, mut events) = spawn_events(path, config);
    let mut contents = BytesMut::new();

    while let Some(event) = events.recv().await {
        match event {
            ReadEvent::Data { chunk, .. } => contents.extend_from_slice(&chunk),
            ReadEvent::Finished => return Ok(contents.freeze()),
            ReadEvent::Error(cause) => return Err(cause),
        }
    }

    Err(Error::Custom(format!(
        "read of {} ended without a result",
        path.display()
    )))
}
