use super::{AckError, Acknowledger};
use crate::library::communication::{AckChannel, DeliveryOutcome, DeliveryTag};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Settles every delivery with a dedicated broker call
pub struct SingleAck {
    channel: Arc<dyn AckChannel>,
    closed: AtomicBool,
}

impl SingleAck {
    /// Creates a new instance settling on the given channel
    pub fn new(channel: Arc<dyn AckChannel>) -> Self {
        Self {
            channel,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Acknowledger for SingleAck {
    async fn resolve(&self, tag: DeliveryTag, outcome: DeliveryOutcome) -> Result<(), AckError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AckError::Closed);
        }

        trace!(tag, %outcome, "Settling delivery");

        match outcome {
            DeliveryOutcome::Ack => self.channel.ack(tag, false).await?,
            outcome => self.channel.reject(tag, outcome.requeue()).await?,
        }

        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
