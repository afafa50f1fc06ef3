use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{timeout, Instant};
use tracing::trace;

/// Asynchronous mutual exclusion around a value
///
/// Waiting for the lock suspends the calling task instead of parking an OS thread. Waiters are
/// served in FIFO order and at most one [`AsyncMutexGuard`] exists at any time. The lock is
/// released when the guard is dropped, which covers every exit path including `?` returns and
/// panics unwinding through the critical section.
///
/// The mutex is **not** re-entrant. Acquiring it again while holding a guard from the same
/// logical flow deadlocks.
pub struct AsyncMutex<T> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> AsyncMutex<T> {
    /// Creates a new, unlocked instance protecting the given value
    pub fn new(value: T) -> Self {
        Self::named("anonymous", value)
    }

    /// Creates a new instance with a name that is attached to trace logs
    pub fn named(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: Mutex::new(value),
        }
    }

    /// Waits until the lock is available and takes it
    pub async fn acquire(&self) -> AsyncMutexGuard<'_, T> {
        let requested = Instant::now();
        let guard = self.inner.lock().await;
        self.wrap(guard, requested)
    }

    /// Takes the lock if nobody else is holding it right now
    pub fn try_acquire(&self) -> Option<AsyncMutexGuard<'_, T>> {
        let requested = Instant::now();
        self.inner
            .try_lock()
            .ok()
            .map(|guard| self.wrap(guard, requested))
    }

    /// Waits at most `duration` for the lock, giving up the place in the queue afterwards
    pub async fn acquire_timeout(&self, duration: Duration) -> Option<AsyncMutexGuard<'_, T>> {
        let requested = Instant::now();
        match timeout(duration, self.inner.lock()).await {
            Ok(guard) => Some(self.wrap(guard, requested)),
            Err(_) => {
                trace!(mutex = self.name, ?duration, "Gave up waiting for lock");
                None
            }
        }
    }

    /// Consumes the mutex and returns the protected value
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    fn wrap<'a>(&'a self, guard: MutexGuard<'a, T>, requested: Instant) -> AsyncMutexGuard<'a, T> {
        let acquired = Instant::now();
        trace!(
            mutex = self.name,
            waited = ?acquired.duration_since(requested),
            "Lock acquired"
        );

        AsyncMutexGuard {
            name: self.name,
            acquired,
            guard,
        }
    }
}

impl<T: Default> Default for AsyncMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for AsyncMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncMutex")
            .field("name", &self.name)
            .field("locked", &self.inner.try_lock().is_err())
            .finish()
    }
}

/// Scoped ownership of an [`AsyncMutex`], releases the lock when dropped
pub struct AsyncMutexGuard<'a, T> {
    name: &'static str,
    acquired: Instant,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for AsyncMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for AsyncMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<T> Drop for AsyncMutexGuard<'_, T> {
    fn drop(&mut self) {
        trace!(mutex = self.name, held = ?self.acquired.elapsed(), "Lock released");
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use futures::poll;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::task::{spawn, yield_now};
    use tokio::time::sleep;

    #[tokio::test]
    async fn hand_out_one_guard_at_a_time() {
        let mutex = Arc::new(AsyncMutex::new(()));
        let holders = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles = (0..100)
            .map(|_| {
                let mutex = mutex.clone();
                let holders = holders.clone();
                let peak = peak.clone();

                spawn(async move {
                    let _guard = mutex.acquire().await;
                    let current = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    yield_now().await;
                    holders.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn serialize_critical_sections() {
        let mutex = Arc::new(AsyncMutex::new(0usize));
        let start = Instant::now();

        let handles = (0..100)
            .map(|_| {
                let mutex = mutex.clone();
                spawn(async move {
                    let mut guard = mutex.acquire().await;
                    sleep(Duration::from_millis(10)).await;
                    *guard += 1;
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(*mutex.acquire().await, 100);
    }

    #[tokio::test]
    async fn release_on_drop() {
        let mutex = Arc::new(AsyncMutex::new(()));
        let guard = mutex.acquire().await;

        let waiter = {
            let mutex = mutex.clone();
            spawn(async move {
                let _guard = mutex.acquire().await;
            })
        };

        yield_now().await;
        assert!(mutex.try_acquire().is_none());

        drop(guard);
        waiter.await.unwrap();
        assert!(mutex.try_acquire().is_some());
    }

    #[tokio::test]
    async fn release_on_error_path() {
        async fn failing(mutex: &AsyncMutex<u8>) -> Result<(), &'static str> {
            let mut guard = mutex.acquire().await;
            *guard = 1;
            if *guard == 1 {
                return Err("bail");
            }
            *guard = 2;
            Ok(())
        }

        let mutex = AsyncMutex::new(0);
        assert!(failing(&mutex).await.is_err());
        assert_eq!(*mutex.try_acquire().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn give_up_after_timeout() {
        let mutex = AsyncMutex::new(());
        let _guard = mutex.acquire().await;

        let attempt = mutex.acquire_timeout(Duration::from_millis(50));
        futures::pin_mut!(attempt);
        assert!(poll!(attempt.as_mut()).is_pending());

        assert!(attempt.await.is_none());
    }
}
