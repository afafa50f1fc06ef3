use crate::library::communication::DeliveryOutcome;
use crate::library::EmptyResult;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{error::SendError, unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::trace;

/// Records how long deliveries take and how they end
pub trait MetricsRecorder: Send + Sync {
    /// Marks the start of processing a delivery
    fn start_consuming(&self) -> Instant;

    /// Counts a delivery of the given message type
    fn record_message_type(&self, message_type: &str);

    /// Marks the end of processing a delivery that started at `started`
    fn end_consuming(&self, started: Instant, outcome: DeliveryOutcome) -> EmptyResult;
}

/// Recorder that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn start_consuming(&self) -> Instant {
        Instant::now()
    }

    fn record_message_type(&self, _message_type: &str) {}

    fn end_consuming(&self, _started: Instant, _outcome: DeliveryOutcome) -> EmptyResult {
        Ok(())
    }
}

/// Single observation submitted to a [`MetricsProcessor`]
#[derive(Debug)]
pub enum MetricsEntry {
    /// A delivery of the given type has been received
    MessageType(String),
    /// A delivery finished processing
    Consumed {
        #[allow(missing_docs)]
        outcome: DeliveryOutcome,
        #[allow(missing_docs)]
        duration: Duration,
    },
}

/// Aggregated view of everything a [`MetricsProcessor`] has seen
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumptionStatistics {
    /// Deliveries that ended with [`DeliveryOutcome::Ack`]
    pub acked: u64,
    /// Deliveries that ended with [`DeliveryOutcome::Reject`]
    pub rejected: u64,
    /// Deliveries that ended with [`DeliveryOutcome::Retry`]
    pub retried: u64,
    /// Sum of the processing time of all deliveries
    pub total_duration: Duration,
    /// Number of deliveries per message type
    pub message_types: BTreeMap<String, u64>,
}

impl ConsumptionStatistics {
    /// Number of deliveries that finished processing
    pub fn consumed(&self) -> u64 {
        self.acked + self.rejected + self.retried
    }

    fn apply(&mut self, entry: MetricsEntry) {
        match entry {
            MetricsEntry::MessageType(message_type) => {
                *self.message_types.entry(message_type).or_insert(0) += 1;
            }
            MetricsEntry::Consumed { outcome, duration } => {
                match outcome {
                    DeliveryOutcome::Ack => self.acked += 1,
                    DeliveryOutcome::Reject => self.rejected += 1,
                    DeliveryOutcome::Retry => self.retried += 1,
                }

                self.total_duration += duration;
            }
        }
    }
}

/// Recorder that aggregates entries in a background task
///
/// Recording only enqueues an entry so that the hot path never waits for the aggregation. The
/// entries are processed by [`run`](MetricsProcessor::run), which has to be spawned once.
#[derive(Clone)]
pub struct MetricsProcessor {
    tx: UnboundedSender<MetricsEntry>,
    rx: Arc<tokio::sync::Mutex<UnboundedReceiver<MetricsEntry>>>,
    statistics: Arc<Mutex<ConsumptionStatistics>>,
}

impl Default for MetricsProcessor {
    fn default() -> Self {
        let (tx, rx) = unbounded_channel();

        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            statistics: Arc::new(Mutex::new(ConsumptionStatistics::default())),
        }
    }
}

impl MetricsProcessor {
    /// Enqueues an entry for aggregation
    pub fn submit(&self, entry: MetricsEntry) -> Result<(), SendError<MetricsEntry>> {
        self.tx.send(entry)
    }

    /// Aggregates submitted entries, never returns
    pub async fn run(&self) {
        let rx = self.rx.clone();
        let mut rx_lock = rx.lock().await;

        while let Some(entry) = rx_lock.recv().await {
            trace!(?entry, "Processing metrics entry");
            self.statistics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .apply(entry);
        }
    }

    /// Copy of the statistics aggregated so far
    pub fn statistics(&self) -> ConsumptionStatistics {
        self.statistics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MetricsRecorder for MetricsProcessor {
    fn start_consuming(&self) -> Instant {
        Instant::now()
    }

    fn record_message_type(&self, message_type: &str) {
        self.submit(MetricsEntry::MessageType(message_type.to_owned()))
            .ok();
    }

    fn end_consuming(&self, started: Instant, outcome: DeliveryOutcome) -> EmptyResult {
        self.submit(MetricsEntry::Consumed {
            outcome,
            duration: started.elapsed(),
        })?;

        Ok(())
    }
}
