use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RegistryState {
    in_flight: usize,
    draining: bool,
}

/// Keeps count of tasks that are currently processing messages
///
/// Tasks register themselves through [`try_admit`](RunningTaskRegistry::try_admit) and hold the
/// returned [`RunningTask`] for as long as they run. Dropping the ticket releases it. A call to
/// [`drain`](RunningTaskRegistry::drain) stops admission once every admitted task has been
/// released and resolves at that moment.
///
/// Admission is not a hard barrier: while a drain is pending but tasks are still running, new
/// tasks are still admitted. This race only occurs during disconnects and is tolerated.
#[derive(Clone)]
pub struct RunningTaskRegistry {
    state: Arc<watch::Sender<RegistryState>>,
}

impl RunningTaskRegistry {
    /// Creates an empty registry that admits new tasks
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RegistryState::default());
        Self { state: Arc::new(tx) }
    }

    /// Registers a new task unless the registry has been fully drained
    pub fn try_admit(&self) -> Option<RunningTask> {
        let mut admitted = false;

        self.state.send_if_modified(|state| {
            if state.draining && state.in_flight == 0 {
                false
            } else {
                state.in_flight += 1;
                admitted = true;
                true
            }
        });

        if admitted {
            Some(RunningTask {
                registry: self.clone(),
            })
        } else {
            None
        }
    }

    /// Requests a drain and waits until no task is in flight anymore
    pub async fn drain(&self) {
        self.state.send_modify(|state| state.draining = true);

        let mut rx = self.state.subscribe();
        let in_flight = rx.borrow().in_flight;
        debug!(in_flight, "Draining running tasks");

        // The sender lives inside `self` so the channel can not close while we wait
        rx.wait_for(|state| state.in_flight == 0).await.ok();

        debug!("All running tasks drained");
    }

    /// Clears a previous drain request so that new tasks are admitted again
    pub fn resume(&self) {
        self.state.send_if_modified(|state| {
            let was_draining = state.draining;
            state.draining = false;
            was_draining
        });
    }

    /// Number of tasks currently admitted
    pub fn in_flight(&self) -> usize {
        self.state.borrow().in_flight
    }

    /// Whether a drain has been requested and not yet cleared
    pub fn is_draining(&self) -> bool {
        self.state.borrow().draining
    }

    fn release(&self) {
        self.state.send_modify(|state| {
            state.in_flight = state.in_flight.saturating_sub(1);
        });
    }
}

impl Default for RunningTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Ticket of an admitted task, releases the task from its registry when dropped
pub struct RunningTask {
    registry: RunningTaskRegistry,
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        self.registry.release();
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use tokio::task::{spawn, yield_now};

    #[tokio::test]
    async fn count_admitted_tasks() {
        let registry = RunningTaskRegistry::new();

        let first = registry.try_admit().unwrap();
        let second = registry.try_admit().unwrap();
        assert_eq!(registry.in_flight(), 2);

        drop(first);
        drop(second);
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn drain_immediately_when_idle() {
        let registry = RunningTaskRegistry::new();

        registry.drain().await;

        assert!(registry.is_draining());
        assert!(registry.try_admit().is_none());
    }

    #[tokio::test]
    async fn wait_for_every_admitted_task() {
        let registry = RunningTaskRegistry::new();
        let first = registry.try_admit().unwrap();
        let second = registry.try_admit().unwrap();

        let drain = {
            let registry = registry.clone();
            spawn(async move { registry.drain().await })
        };

        yield_now().await;
        assert!(!drain.is_finished());

        drop(first);
        yield_now().await;
        assert!(!drain.is_finished());

        drop(second);
        drain.await.unwrap();
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn tolerate_admission_while_draining() {
        let registry = RunningTaskRegistry::new();
        let running = registry.try_admit().unwrap();

        let drain = {
            let registry = registry.clone();
            spawn(async move { registry.drain().await })
        };
        yield_now().await;

        // Still finishing other work, late arrivals are let in
        let late = registry.try_admit();
        assert!(late.is_some());

        drop(running);
        yield_now().await;
        assert!(!drain.is_finished());

        drop(late);
        drain.await.unwrap();
        assert!(registry.try_admit().is_none());
    }

    #[tokio::test]
    async fn admit_again_after_resume() {
        let registry = RunningTaskRegistry::new();
        registry.drain().await;
        assert!(registry.try_admit().is_none());

        registry.resume();

        assert!(!registry.is_draining());
        assert!(registry.try_admit().is_some());
    }
}
