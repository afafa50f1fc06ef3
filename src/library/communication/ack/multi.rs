use super::{AckError, Acknowledger};
use crate::library::communication::{
    AckChannel, AckOptions, ConfigurationError, DeliveryOutcome, DeliveryTag,
};
use crate::library::scheduling::IntervalTimer;
use crate::library::sync::AsyncMutex;
use crate::library::BoxedError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Diagnostic view of the acknowledgement window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckWindowSnapshot {
    /// Every tag up to and including this one has been settled with the broker
    pub window_start: DeliveryTag,
    /// Every tag up to and including this one has been resolved by a handler
    pub biggest_ackable: DeliveryTag,
    /// Resolved tags waiting for a gap below them to close
    pub out_of_order: usize,
    /// Acknowledgements that have not been sent to the broker yet
    pub pending: usize,
    /// Last time acknowledgements were sent as a batch or flushed
    pub last_flush: Option<Instant>,
}

#[derive(Debug, Default)]
struct AckWindow {
    window_start: DeliveryTag,
    biggest_ackable: DeliveryTag,
    out_of_order: BTreeSet<DeliveryTag>,
    pending: BTreeMap<DeliveryTag, Instant>,
    last_flush: Option<Instant>,
    warned_level: usize,
    closed: bool,
}

impl AckWindow {
    /// Records that a handler finished and advances the contiguous watermark
    fn observe(&mut self, tag: DeliveryTag) {
        self.out_of_order.insert(tag);

        while self.out_of_order.remove(&(self.biggest_ackable + 1)) {
            self.biggest_ackable += 1;
        }
    }

    /// Removes and returns every pending tag up to and including `tag`, in increasing order
    fn take_up_to(&mut self, tag: DeliveryTag) -> Vec<DeliveryTag> {
        let remaining = match tag.checked_add(1) {
            Some(next) => self.pending.split_off(&next),
            None => BTreeMap::new(),
        };

        let taken = std::mem::replace(&mut self.pending, remaining);
        taken.into_keys().collect()
    }

    fn oldest_pending(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    fn snapshot(&self) -> AckWindowSnapshot {
        AckWindowSnapshot {
            window_start: self.window_start,
            biggest_ackable: self.biggest_ackable,
            out_of_order: self.out_of_order.len(),
            pending: self.pending.len(),
            last_flush: self.last_flush,
        }
    }
}

struct MultiAckShared {
    multiple_count: u16,
    staleness: Duration,
    out_of_order_warning: usize,
    channel: Arc<dyn AckChannel>,
    window: AsyncMutex<AckWindow>,
}

impl MultiAckShared {
    async fn resolve(&self, tag: DeliveryTag, outcome: DeliveryOutcome) -> Result<(), AckError> {
        let mut window = self.window.acquire().await;

        if window.closed {
            return Err(AckError::Closed);
        }

        window.observe(tag);
        self.check_out_of_order(&mut window);

        match outcome {
            DeliveryOutcome::Ack if tag <= window.window_start => {
                trace!(tag, "Late acknowledgement below window");
                self.channel.ack(tag, false).await?;
            }
            DeliveryOutcome::Ack => {
                window.pending.insert(tag, Instant::now());

                let threshold = window
                    .window_start
                    .saturating_add(u64::from(self.multiple_count));

                if window.biggest_ackable >= threshold {
                    let upper = window.biggest_ackable;
                    trace!(tag = upper, "Acknowledging batch");

                    self.channel.ack(upper, true).await?;
                    window.take_up_to(upper);
                    window.window_start = upper;
                    window.last_flush = Some(Instant::now());
                }
            }
            outcome => {
                if tag > window.window_start {
                    window.window_start = tag;

                    for pending in window.take_up_to(tag) {
                        self.channel.ack(pending, false).await?;
                    }
                }

                self.channel.reject(tag, outcome.requeue()).await?;
            }
        }

        Ok(())
    }

    async fn flush_stale(&self) -> Result<(), AckError> {
        let mut window = self.window.acquire().await;

        if window.closed {
            return Ok(());
        }

        let stale = window
            .oldest_pending()
            .map(|oldest| oldest.elapsed() > self.staleness)
            .unwrap_or(false);

        if stale {
            debug!(pending = window.pending.len(), "Flushing stale acknowledgements");
            self.flush_all(&mut window).await?;
        }

        Ok(())
    }

    async fn flush_all(&self, window: &mut AckWindow) -> Result<(), AckError> {
        let upper = match window.pending.keys().next_back() {
            Some(upper) => *upper,
            None => return Ok(()),
        };

        if upper > window.window_start {
            window.window_start = upper;
        }

        for tag in window.take_up_to(upper) {
            self.channel.ack(tag, false).await?;
        }

        window.last_flush = Some(Instant::now());
        Ok(())
    }

    fn check_out_of_order(&self, window: &mut AckWindow) {
        if self.out_of_order_warning == 0 {
            return;
        }

        let level = window.out_of_order.len() / self.out_of_order_warning;

        if level > window.warned_level {
            warn!(
                out_of_order = window.out_of_order.len(),
                biggest_ackable = window.biggest_ackable,
                "Many deliveries are waiting for an earlier one to finish"
            );
        }

        window.warned_level = level;
    }
}

/// Batches contiguous acknowledgements into cumulative multi-acks
///
/// Handlers finish in arbitrary order. The strategy tracks the highest tag up to which every
/// delivery has been resolved and sends a single `ack(tag, multiple)` once that watermark moved
/// `multiple_count` tags past the last settled one. Rejections and retries are always sent
/// individually. Since a cumulative ack would otherwise cover them, every acknowledgement below
/// a rejected tag is settled individually beforehand.
///
/// Acknowledgements that are held back longer than the staleness threshold are flushed by a
/// background timer so that slow trickles of messages do not wait indefinitely.
pub struct MultiAck {
    shared: Arc<MultiAckShared>,
    timer: IntervalTimer,
}

impl MultiAck {
    /// Creates the strategy and starts its flush timer
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        multiple_count: u16,
        channel: Arc<dyn AckChannel>,
        options: &AckOptions,
    ) -> Result<Self, ConfigurationError> {
        if multiple_count < 2 {
            return Err(ConfigurationError::MultipleCountTooSmall(multiple_count));
        }

        let shared = Arc::new(MultiAckShared {
            multiple_count,
            staleness: options.multi_ack_staleness,
            out_of_order_warning: options.out_of_order_warning,
            channel,
            window: AsyncMutex::named("multi-ack window", AckWindow::default()),
        });

        let timer_shared = shared.clone();
        let timer = IntervalTimer::new(
            "multi-ack flush",
            options.multi_ack_flush_interval,
            move || {
                let shared = timer_shared.clone();
                async move { shared.flush_stale().await.map_err(BoxedError::from) }
            },
        );
        timer.start();

        Ok(Self { shared, timer })
    }

    /// Number of contiguous acknowledgements sent as one batch
    pub fn multiple_count(&self) -> u16 {
        self.shared.multiple_count
    }

    /// Current state of the window
    pub async fn snapshot(&self) -> AckWindowSnapshot {
        self.shared.window.acquire().await.snapshot()
    }
}

#[async_trait]
impl Acknowledger for MultiAck {
    async fn resolve(&self, tag: DeliveryTag, outcome: DeliveryOutcome) -> Result<(), AckError> {
        self.shared.resolve(tag, outcome).await
    }

    async fn flush(&self) -> Result<(), AckError> {
        let mut window = self.shared.window.acquire().await;

        if window.closed {
            return Err(AckError::Closed);
        }

        self.shared.flush_all(&mut window).await
    }

    async fn shutdown(&self) {
        self.timer.stop();

        let mut window = self.shared.window.acquire().await;
        if !window.closed {
            debug!(
                pending = window.pending.len(),
                out_of_order = window.out_of_order.len(),
                "Multi-ack strategy shut down"
            );
            window.closed = true;
        }
    }
}
