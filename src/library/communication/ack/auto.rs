use super::{AckError, Acknowledger};
use crate::library::communication::{DeliveryOutcome, DeliveryTag};
use async_trait::async_trait;
use tracing::{error, warn};

/// Strategy for consumers that let the broker acknowledge on delivery
///
/// The broker forgot about the message by the time it is processed. Failures can therefore only
/// be logged.
#[derive(Debug, Default)]
pub struct AutoAck;

impl AutoAck {
    /// Creates a new instance
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Acknowledger for AutoAck {
    async fn resolve(&self, tag: DeliveryTag, outcome: DeliveryOutcome) -> Result<(), AckError> {
        match outcome {
            DeliveryOutcome::Ack => {}
            DeliveryOutcome::Retry => {
                warn!(tag, "Delivery asked for retry but has been auto-acknowledged, it is lost")
            }
            DeliveryOutcome::Reject => {
                error!(tag, "Delivery was rejected but has been auto-acknowledged, it is lost")
            }
        }

        Ok(())
    }
}
