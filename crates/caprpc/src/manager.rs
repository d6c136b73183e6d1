//! Connection task supervisor
//!
//! Owns the connection's background tasks, the root cancellation signal,
//! and the terminal error. Shutdown is first-caller-wins: the first
//! `shutdown` records the terminal error and cancels every supervised
//! task; `wait` resolves only after all of them have returned.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::Error;

#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    /// Root cancellation signal; fires as soon as shutdown begins.
    token: CancellationToken,
    /// Fires once every supervised task has returned.
    done: CancellationToken,
    tracker: TaskTracker,
    err: Mutex<Option<Error>>,
}

impl Manager {
    pub fn new() -> Self {
        let inner = Arc::new(ManagerInner {
            token: CancellationToken::new(),
            done: CancellationToken::new(),
            tracker: TaskTracker::new(),
            err: Mutex::new(None),
        });
        // Supervisor: once shutdown begins, wait for the tracked tasks to
        // drain, then signal full termination.
        let supervised = Arc::clone(&inner);
        tokio::spawn(async move {
            supervised.token.cancelled().await;
            supervised.tracker.close();
            supervised.tracker.wait().await;
            supervised.done.cancel();
        });
        Self { inner }
    }

    /// Run a task under this manager. The task is expected to observe
    /// [`Manager::cancelled`] and return promptly once shutdown begins.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.tracker.spawn(future);
    }

    /// Begin shutdown with `err` as the terminal error. Returns `true` for
    /// the first caller; later callers observe that shutdown has already
    /// happened and their error is discarded.
    pub fn shutdown(&self, err: Error) -> bool {
        {
            let mut slot = self.inner.err.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(err);
        }
        self.inner.token.cancel();
        true
    }

    /// Resolves when shutdown has begun.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Block until every supervised task has returned.
    pub async fn wait(&self) {
        self.inner.done.cancelled().await;
    }

    /// The terminal error. Meaningful once shutdown has begun; before that
    /// it reports the connection as closed.
    pub fn error(&self) -> Error {
        self.inner.err.lock().clone().unwrap_or(Error::ConnClosed)
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_shutdown_wins() {
        let manager = Manager::new();
        assert!(manager.shutdown(Error::NoMainInterface));
        assert!(!manager.shutdown(Error::ConnClosed));
        assert!(matches!(manager.error(), Error::NoMainInterface));
    }

    #[tokio::test]
    async fn wait_joins_supervised_tasks() {
        let manager = Manager::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        {
            let manager2 = manager.clone();
            manager.spawn(async move {
                manager2.cancelled().await;
                let _ = tx.send(());
            });
        }
        manager.shutdown(Error::ConnClosed);
        manager.wait().await;
        // The task observed cancellation before wait() resolved.
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn error_defaults_to_closed() {
        let manager = Manager::new();
        assert!(matches!(manager.error(), Error::ConnClosed));
    }
}
