//! Classify a path by the kind of file it names, and open it accordingly.

use std::fmt;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::pin::Pin;

use log::debug;
use nix::unistd::AccessFlags;
use tokio::fs;
use tokio::io::AsyncRead;
use tokio::net::unix::pipe;

/// A boxed read half of any supported kind of path.
pub(crate) type ReadStream = Pin<Box<dyn AsyncRead + Send>>;

/// The kind of file a path names.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PathKind {
    Regular,
    CharacterDevice,
    BlockDevice,
    Fifo,
}

impl PathKind {
    /// Query the filesystem for the kind of file at `path`.
    ///
    /// Symbolic links are followed. Anything which is not a device or a FIFO
    /// is treated as a regular file.
    pub async fn of(path: &Path) -> io::Result<Self> {
        let file_type = fs::metadata(path).await?.file_type();

        let kind = if file_type.is_fifo() {
            Self::Fifo
        } else if file_type.is_char_device() {
            Self::CharacterDevice
        } else if file_type.is_block_device() {
            Self::BlockDevice
        } else {
            Self::Regular
        };

        Ok(kind)
    }

    pub fn is_fifo(&self) -> bool {
        matches!(self, Self::Fifo)
    }

    /// Return `true` if reaching the end of a stream of this kind means that
    /// the writer went away, rather than that there is no more data.
    pub fn reconnects(&self) -> bool {
        self.is_fifo()
    }
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Regular => "regular file",
            Self::CharacterDevice => "character device",
            Self::BlockDevice => "block device",
            Self::Fifo => "FIFO",
        })
    }
}

/// The access mode to check with [`check_access`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

/// Check that `path` exists and the current process may open it in the given `mode`.
pub async fn check_access(path: &Path, mode: Access) -> io::Result<()> {
    let flags = match mode {
        Access::Read => AccessFlags::R_OK,
        Access::Write => AccessFlags::W_OK,
    };

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || nix::unistd::access(&path, flags))
        .await
        .map_err(|cause| io::Error::new(io::ErrorKind::Other, cause))?
        .map_err(io::Error::from)
}

/// Open `path` for continuous reading.
pub(crate) async fn open_read(path: &Path, kind: PathKind) -> io::Result<ReadStream> {
    let stream: ReadStream = match kind {
        PathKind::Regular | PathKind::BlockDevice => Box::pin(fs::File::open(path).await?),
        PathKind::CharacterDevice => {
            let read_write = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .await;

            match read_write {
                Ok(file) => Box::pin(file),
                Err(cause) => {
                    debug!(
                        "read-write open of {} failed ({}), opening read-only",
                        path.display(),
                        cause
                    );

                    Box::pin(fs::File::open(path).await?)
                }
            }
        }
        PathKind::Fifo => Box::pin(fifo_receiver(path)?),
    };

    Ok(stream)
}

/// Open `path` for writing one payload.
pub(crate) async fn open_write(path: &Path, kind: PathKind) -> io::Result<fs::File> {
    match kind {
        PathKind::Regular => {
            fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .await
        }
        PathKind::CharacterDevice => {
            let read_write = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .await;

            match read_write {
                Ok(file) => Ok(file),
                Err(cause) => {
                    debug!(
                        "read-write open of {} failed ({}), opening write-only",
                        path.display(),
                        cause
                    );

                    fs::OpenOptions::new().write(true).open(path).await
                }
            }
        }
        // a FIFO blocks here until a reader attaches
        PathKind::BlockDevice | PathKind::Fifo => {
            fs::OpenOptions::new().write(true).open(path).await
        }
    }
}

/// Release any writer blocked in `open` waiting for a reader of the FIFO at `path`.
pub(crate) fn release_writers(path: &Path) {
    match pipe::OpenOptions::new().open_receiver(path) {
        Ok(receiver) => drop(receiver),
        Err(cause) => debug!("could not release writers of {}: {}", path.display(), cause),
    }
}

#[cfg(target_os = "linux")]
fn fifo_receiver(path: &Path) -> io::Result<pipe::Receiver> {
    // holding the write end too means the stream never sees a spurious end-of-file
    // while no writer is attached, and writers never block waiting for a reader
    pipe::OpenOptions::new().read_write(true).open_receiver(path)
}

#[cfg(not(target_os = "linux"))]
fn fifo_receiver(path: &Path) -> io::Result<pipe::Receiver> {
    pipe::OpenOptions::new().open_receiver(path)
}
