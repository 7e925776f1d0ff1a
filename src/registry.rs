//! A process-wide registry of per-path write locks.
//!
//! Each path has a fair [`tokio::sync::Mutex`]. [`LockRegistry::acquire`] joins the
//! mutex's queue before it returns, so the lock is granted in the order `acquire` was
//! called, regardless of when the returned [`PendingLock`] is first polled.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::task::{ready, Context, Poll};

use futures::task::noop_waker_ref;
use futures::FutureExt;
use log::debug;
use tokio::sync::{Mutex as PathLock, OwnedMutexGuard};

type Request = Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send>>;

/// A registry of per-path write locks.
///
/// Entries are created on first use and never evicted.
pub struct LockRegistry {
    locks: Mutex<HashMap<PathBuf, Arc<PathLock<()>>>>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    /// Construct a new, empty [`LockRegistry`].
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The registry shared by every [`crate::File`] which was not given its own.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<LockRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Self::new())).clone()
    }

    #[inline]
    fn locks(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<PathLock<()>>>> {
        self.locks.lock().expect("lock registry")
    }

    /// Take the next place in the queue for the lock on `path`.
    ///
    /// Await the returned [`PendingLock`] to wait for the lock to be granted.
    pub fn acquire(&self, path: &Path) -> PendingLock {
        let path = normalize(path);

        let lock = {
            let mut locks = self.locks();
            locks
                .entry(path.clone())
                .or_insert_with(|| Arc::new(PathLock::new(())))
                .clone()
        };

        // polling once enqueues the request, or takes the lock if it's free;
        // the poll must not be refused by the task's cooperative budget
        let mut request: Request = Box::pin(tokio::task::unconstrained(lock.lock_owned()));
        let granted = match request.poll_unpin(&mut Context::from_waker(noop_waker_ref())) {
            Poll::Ready(guard) => Some(guard),
            Poll::Pending => {
                debug!("queued for the write lock on {}", path.display());
                None
            }
        };

        PendingLock {
            path,
            granted,
            request,
        }
    }

    /// Return `true` if the lock on `path` is held or has waiters.
    pub fn is_locked(&self, path: &Path) -> bool {
        let lock = self.locks().get(&normalize(path)).cloned();
        lock.map(|lock| lock.try_lock().is_err()).unwrap_or(false)
    }

    /// The number of paths with a lock entry.
    pub fn len(&self) -> usize {
        self.locks().len()
    }

    /// Return `true` if no lock has ever been requested from this registry.
    pub fn is_empty(&self) -> bool {
        self.locks().is_empty()
    }
}

impl fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a lock registry with {} entries", self.len())
    }
}

/// A place in the queue for a path's write lock.
///
/// Dropping a [`PendingLock`] before it resolves gives up its place.
pub struct PendingLock {
    path: PathBuf,
    granted: Option<OwnedMutexGuard<()>>,
    request: Request,
}

impl Future for PendingLock {
    type Output = WriteGuard;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let guard = match self.granted.take() {
            Some(guard) => guard,
            None => ready!(self.request.poll_unpin(cx)),
        };

        debug!("acquired the write lock on {}", self.path.display());

        Poll::Ready(WriteGuard {
            path: self.path.clone(),
            _guard: guard,
        })
    }
}

/// Exclusive write access to a path. The lock is released when this guard is dropped.
pub struct WriteGuard {
    path: PathBuf,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        debug!("released the write lock on {}", self.path.display());
    }
}

impl fmt::Debug for WriteGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "write lock on {}", self.path.display())
    }
}

/// Normalize `path` lexically: drop `.` components and resolve `..` where possible.
pub fn normalize(path: &Path) -> PathBuf {
    let mut normal = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normal.components().next_back() {
                Some(Component::Normal(_)) => {
                    normal.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => normal.push(component),
            },
            other => normal.push(other),
        }
    }

    if normal.as_os_str().is_empty() {
        normal.push(".");
    }

    normal
}
