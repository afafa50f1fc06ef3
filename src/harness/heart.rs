//! Keeps the process alive until it is asked to stop

use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use std::fmt;
use tokio::signal::ctrl_c;
use tracing::{debug, error, warn};

/// Reason why the heart stopped beating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathReason {
    /// Internal kill signal has been sent
    Killed(String),
    /// SIGTERM, SIGINT or every [`HeartStone`] has been dropped
    Terminated,
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeathReason::Killed(reason) => write!(f, "Killed ({})", reason),
            DeathReason::Terminated => write!(f, "Terminated due to external signal"),
        }
    }
}

/// Lifecycle handle that resolves once the process should shut down
pub struct Heart {
    rx: Receiver<String>,
    signals: bool,
}

impl Heart {
    /// Creates a heart that dies on SIGTERM/SIGINT or when the linked stone kills it
    pub fn new() -> (Self, HeartStone) {
        Self::internal_new(true)
    }

    /// Creates a heart that ignores process signals and only dies through its stone
    pub fn detached() -> (Self, HeartStone) {
        Self::internal_new(false)
    }

    fn internal_new(signals: bool) -> (Self, HeartStone) {
        let (tx, rx) = channel(2);
        (Self { rx, signals }, HeartStone { remote: tx })
    }

    /// Waits until the heart dies and returns the reason
    pub async fn death(&mut self) -> DeathReason {
        debug!("Heart starts beating");

        let signals = self.signals;
        let termination = async move {
            if signals {
                termination_signal().await
            } else {
                futures::future::pending().await
            }
        };

        tokio::select! {
            reason = self.rx.next() => match reason {
                Some(reason) => DeathReason::Killed(reason),
                None => DeathReason::Terminated,
            },
            () = termination => DeathReason::Terminated,
        }
    }
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {},
                _ = ctrl_c() => {},
            }
        }
        Err(error) => {
            warn!(%error, "Unable to listen for SIGTERM, only reacting to SIGINT");
            ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    ctrl_c().await.ok();
}

/// Remote controller for the heart
#[derive(Clone)]
pub struct HeartStone {
    remote: Sender<String>,
}

impl HeartStone {
    /// Kills the associated heart
    pub async fn kill(&mut self, reason: impl Into<String>) {
        if let Err(e) = self.remote.send(reason.into()).await {
            error!("Failed to interact with Heart: {}", e);
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use futures::poll;
    use std::time::Duration;
    use tokio::task::{spawn, yield_now};
    use tokio::time::sleep;

    #[tokio::test]
    async fn live_until_killed() {
        let (mut heart, _stone) = Heart::detached();

        let handle = spawn(async move { heart.death().await });
        sleep(Duration::from_millis(50)).await;
        yield_now().await;

        assert!(!poll!(handle).is_ready());
    }

    #[tokio::test]
    async fn die_when_killed() {
        let (mut heart, mut stone) = Heart::detached();

        let handle = spawn(async move { heart.death().await });
        stone.kill("Testing").await;

        assert_eq!(
            handle.await.unwrap(),
            DeathReason::Killed("Testing".to_owned())
        );
    }

    #[tokio::test]
    async fn die_when_stones_are_gone() {
        let (mut heart, stone) = Heart::detached();
        drop(stone);

        assert_eq!(heart.death().await, DeathReason::Terminated);
    }
}
