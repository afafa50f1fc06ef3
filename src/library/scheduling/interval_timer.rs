use crate::library::EmptyResult;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type TimerCallback = Arc<dyn Fn() -> BoxFuture<'static, EmptyResult> + Send + Sync>;

struct RunningTimer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically invokes an asynchronous callback
///
/// The interval measures idle time since the previous invocation completed, not wall-clock ticks.
/// A callback that takes longer than the interval therefore never overlaps with the next one and
/// invocations do not pile up. Errors returned by the callback are logged and swallowed.
///
/// Stopping the timer prevents further invocations but lets a currently running callback finish.
/// Dropping the timer stops it.
pub struct IntervalTimer {
    name: &'static str,
    interval: Duration,
    callback: TimerCallback,
    running: Mutex<Option<RunningTimer>>,
}

impl IntervalTimer {
    /// Creates a new, stopped timer
    pub fn new<F, Fut>(name: &'static str, interval: Duration, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EmptyResult> + Send + 'static,
    {
        Self {
            name,
            interval,
            callback: Arc::new(move || callback().boxed()),
            running: Mutex::new(None),
        }
    }

    /// Duration of idle time between two invocations
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts firing the callback, does nothing if the timer is already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.lock_running();

        let previous = match running.take() {
            Some(timer) if !timer.token.is_cancelled() => {
                *running = Some(timer);
                return;
            }
            Some(timer) => Some(timer.handle),
            None => None,
        };

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.name,
            self.interval,
            self.callback.clone(),
            token.clone(),
            previous,
        ));

        debug!(timer = self.name, interval = ?self.interval, "Timer started");
        *running = Some(RunningTimer { token, handle });
    }

    /// Prevents further invocations without interrupting one that is currently executing
    pub fn stop(&self) {
        if let Some(timer) = self.lock_running().as_ref() {
            if !timer.token.is_cancelled() {
                debug!(timer = self.name, "Timer stopped");
                timer.token.cancel();
            }
        }
    }

    /// Whether the timer will fire again
    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .map(|timer| !timer.token.is_cancelled() && !timer.handle.is_finished())
            .unwrap_or(false)
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<RunningTimer>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    name: &'static str,
    interval: Duration,
    callback: TimerCallback,
    token: CancellationToken,
    previous: Option<JoinHandle<()>>,
) {
    // A restarted timer must not overlap with a callback of the previous run
    if let Some(previous) = previous {
        previous.await.ok();
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(interval) => {}
        }

        if let Err(error) = callback().await {
            warn!(timer = name, %error, "Timer callback failed");
        }

        if token.is_cancelled() {
            break;
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::BoxedError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::yield_now;

    fn counting_timer(interval: Duration, work: Duration) -> (IntervalTimer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let timer = IntervalTimer::new("test", interval, move || {
            let counter = counter.clone();
            async move {
                sleep(work).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxedError>(())
            }
        });

        (timer, count)
    }

    #[tokio::test(start_paused = true)]
    async fn fire_repeatedly() {
        let (timer, count) = counting_timer(Duration::from_millis(100), Duration::ZERO);

        timer.start();
        sleep(Duration::from_millis(350)).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn measure_interval_from_completion() {
        let (timer, count) = counting_timer(Duration::from_millis(100), Duration::from_millis(100));

        timer.start();
        // Invocations complete at 200, 400 and 600 ms
        sleep(Duration::from_millis(650)).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn never_overlap_slow_callbacks() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let invocations = Arc::new(AtomicUsize::new(0));

        let timer = {
            let (active, peak, invocations) = (active.clone(), peak.clone(), invocations.clone());
            IntervalTimer::new("slow", Duration::from_millis(10), move || {
                let (active, peak, invocations) =
                    (active.clone(), peak.clone(), invocations.clone());
                async move {
                    let current = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxedError>(())
                }
            })
        };

        timer.start();
        sleep(Duration::from_millis(1000)).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(invocations.load(Ordering::SeqCst) >= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_firing_after_stop() {
        let (timer, count) = counting_timer(Duration::from_millis(100), Duration::ZERO);

        timer.start();
        sleep(Duration::from_millis(150)).await;
        timer.stop();
        sleep(Duration::from_millis(500)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn let_running_callback_finish() {
        let (timer, count) = counting_timer(Duration::from_millis(10), Duration::from_millis(100));

        timer.start();
        // Callback is now in the middle of its work
        sleep(Duration::from_millis(50)).await;
        timer.stop();
        sleep(Duration::from_millis(200)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn survive_failing_callbacks() {
        let count = Arc::new(AtomicUsize::new(0));
        let timer = {
            let count = count.clone();
            IntervalTimer::new("failing", Duration::from_millis(10), move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err::<(), BoxedError>("nope".into())
                }
            })
        };

        timer.start();
        sleep(Duration::from_millis(55)).await;

        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop() {
        let (timer, count) = counting_timer(Duration::from_millis(100), Duration::ZERO);

        timer.start();
        timer.stop();
        yield_now().await;
        timer.start();
        sleep(Duration::from_millis(150)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_when_dropped() {
        let (timer, count) = counting_timer(Duration::from_millis(100), Duration::ZERO);

        timer.start();
        drop(timer);
        sleep(Duration::from_millis(500)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
