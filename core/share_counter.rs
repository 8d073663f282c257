//! Generic refcounted handle for a resource that multiple callers want to
//! keep alive concurrently (an active download, a live capture): the
//! underlying resource is started on the first acquire and torn down once
//! the last handle drops, without a second caller racing a fresh start.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::{FutureExt, Shared};
use tokio::sync::Mutex as AsyncMutex;

type StartFut<T, E> = Shared<Pin<Box<dyn Future<Output = Result<Arc<T>, Arc<E>>> + Send>>>;

enum Slot<T, E> {
    Empty,
    Starting(StartFut<T, E>),
    Ready(Arc<T>),
}

/// Shares one `T` between any number of holders, starting it lazily and
/// stopping it once the last [`Handle`] is dropped. A second caller that
/// arrives while a start is in flight awaits the same start future rather
/// than racing a second one.
pub struct SharedHandle<T, E> {
    inner: Arc<AsyncMutex<Inner<T, E>>>,
}

struct Inner<T, E> {
    slot: Slot<T, E>,
    refs: usize,
}

impl<T, E> Default for SharedHandle<T, E> {
    fn default() -> Self {
        SharedHandle {
            inner: Arc::new(AsyncMutex::new(Inner {
                slot: Slot::Empty,
                refs: 0,
            })),
        }
    }
}

impl<T, E> Clone for SharedHandle<T, E> {
    fn clone(&self) -> Self {
        SharedHandle {
            inner: self.inner.clone(),
        }
    }
}

/// A live reference to the shared resource. Dropping the last outstanding
/// `Handle` releases the slot so the next `acquire` starts fresh.
pub struct Handle<T, E> {
    inner: Arc<AsyncMutex<Inner<T, E>>>,
    value: Arc<T>,
}

impl<T, E> std::ops::Deref for Handle<T, E> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T, E> Drop for Handle<T, E> {
    fn drop(&mut self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut g = inner.lock().await;
            g.refs -= 1;
            if g.refs == 0 {
                g.slot = Slot::Empty;
            }
        });
    }
}

impl<T: Send + Sync + 'static, E: Send + Sync + 'static> SharedHandle<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of outstanding handles right now. Exposed for tests and for
    /// the janitor's "has an active downloader" check.
    pub async fn refcount(&self) -> usize {
        self.inner.lock().await.refs
    }

    /// Returns the existing handle if the resource is already running, or
    /// starts it via `start` if not.
    pub async fn acquire<F, Fut>(&self, start: F) -> Result<Handle<T, E>, Arc<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let fut: StartFut<T, E> = {
            let mut g = self.inner.lock().await;
            match &g.slot {
                Slot::Ready(v) => {
                    g.refs += 1;
                    return Ok(Handle {
                        inner: self.inner.clone(),
                        value: v.clone(),
                    });
                }
                Slot::Starting(f) => f.clone(),
                Slot::Empty => {
                    let fut: Pin<Box<dyn Future<Output = Result<Arc<T>, Arc<E>>> + Send>> =
                        Box::pin(async move { start().await.map(Arc::new).map_err(Arc::new) });
                    let shared = fut.shared();
                    g.slot = Slot::Starting(shared.clone());
                    shared
                }
            }
        };

        let result = fut.await;
        let mut g = self.inner.lock().await;
        match result {
            Ok(v) => {
                // Another waiter may have already installed `Ready` first;
                // either way the value is the same `Arc`.
                g.slot = Slot::Ready(v.clone());
                g.refs += 1;
                Ok(Handle {
                    inner: self.inner.clone(),
                    value: v,
                })
            }
            Err(e) => {
                if matches!(g.slot, Slot::Starting(_)) {
                    g.slot = Slot::Empty;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn second_acquire_reuses_the_first() {
        let shared: SharedHandle<u32, std::convert::Infallible> = SharedHandle::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let starts2 = starts.clone();
        let h1 = shared
            .acquire(|| async move {
                starts2.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await
            .unwrap();
        let h2 = shared.acquire(|| async { Ok(0) }).await.unwrap();
        assert_eq!(*h1, 42);
        assert_eq!(*h2, 42);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(shared.refcount().await, 2);
        drop(h1);
        drop(h2);
        // Drop spawns a task to release the slot; give it a chance to run.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(shared.refcount().await, 0);
    }

    #[tokio::test]
    async fn restarts_after_fully_released() {
        let shared: SharedHandle<u32, std::convert::Infallible> = SharedHandle::new();
        let h1 = shared.acquire(|| async { Ok(1) }).await.unwrap();
        drop(h1);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let h2 = shared.acquire(|| async { Ok(2) }).await.unwrap();
        assert_eq!(*h2, 2);
    }
}
