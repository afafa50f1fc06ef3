use super::{lock, MockChannel};
use crate::library::communication::{ChannelError, ConsumerChannel, Transport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// Transport handing out [`MockChannel`]s
///
/// Keeps every channel it opened so that tests can inspect and manipulate them later on.
pub struct MockTransport {
    channels: Mutex<Vec<Arc<MockChannel>>>,
    opened: watch::Sender<usize>,
    attempts: AtomicUsize,
    failing_opens: AtomicUsize,
}

impl MockTransport {
    /// Creates a transport that opens channels successfully
    pub fn new() -> Self {
        let (opened, _) = watch::channel(0);

        Self {
            channels: Mutex::new(Vec::new()),
            opened,
            attempts: AtomicUsize::new(0),
            failing_opens: AtomicUsize::new(0),
        }
    }

    /// All channels opened so far, oldest first
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        lock(&self.channels).clone()
    }

    /// Most recently opened channel
    pub fn latest_channel(&self) -> Option<Arc<MockChannel>> {
        lock(&self.channels).last().cloned()
    }

    /// Channels that have neither been closed nor disconnected
    pub fn open_channels(&self) -> usize {
        lock(&self.channels)
            .iter()
            .filter(|channel| channel.is_open())
            .count()
    }

    /// Number of times a channel has been requested, including failed attempts
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Lets the next `count` attempts to open a channel fail
    pub fn fail_next_opens(&self, count: usize) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Waits until `count` channels have been opened and returns the last of them
    pub async fn wait_for_channels(&self, count: usize) -> Option<Arc<MockChannel>> {
        let mut opened = self.opened.subscribe();
        let reached = opened.wait_for(|opened| *opened >= count).await.is_ok();

        if reached && count > 0 {
            lock(&self.channels).get(count - 1).cloned()
        } else {
            None
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Channel = MockChannel;

    async fn open_channel(&self) -> Result<Arc<MockChannel>, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();

        if failing {
            debug!("Refusing to open mock channel");
            return Err(ChannelError::Transport("connection refused".into()));
        }

        let mut channels = lock(&self.channels);
        let channel = Arc::new(MockChannel::new(channels.len() + 1));
        channels.push(channel.clone());
        self.opened.send_replace(channels.len());

        Ok(channel)
    }
}
