use super::lock;
use crate::library::communication::{Delivery, DeliveryOutcome, DeliveryTag, MessageDistributor};
use crate::library::BoxedError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// How the [`MockDistributor`] handles a delivery
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Returns the outcome right away
    Outcome(DeliveryOutcome),
    /// Returns an error with the given message
    Fail(String),
    /// Panics
    Panic,
    /// Returns the outcome after the given time
    Delay(Duration, DeliveryOutcome),
    /// Returns the outcome once processing has been cancelled
    WaitForCancellation(DeliveryOutcome),
}

/// Distributor with scripted behaviour per delivery tag
pub struct MockDistributor {
    fallback: MockBehaviour,
    behaviours: Mutex<HashMap<DeliveryTag, MockBehaviour>>,
    seen: Mutex<Vec<DeliveryTag>>,
    cancelled: Mutex<Vec<DeliveryTag>>,
}

impl MockDistributor {
    /// Handles every delivery without a dedicated behaviour with `fallback`
    pub fn new(fallback: MockBehaviour) -> Self {
        Self {
            fallback,
            behaviours: Mutex::new(HashMap::new()),
            seen: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    /// Acknowledges every delivery
    pub fn acking() -> Self {
        Self::new(MockBehaviour::Outcome(DeliveryOutcome::Ack))
    }

    /// Scripts the behaviour for deliveries with the given tag
    pub fn on(&self, tag: DeliveryTag, behaviour: MockBehaviour) -> &Self {
        lock(&self.behaviours).insert(tag, behaviour);
        self
    }

    /// Tags of all deliveries that have been handed to the distributor
    pub fn seen(&self) -> Vec<DeliveryTag> {
        lock(&self.seen).clone()
    }

    /// Tags of all deliveries that observed their cancellation
    pub fn cancelled(&self) -> Vec<DeliveryTag> {
        lock(&self.cancelled).clone()
    }
}

#[async_trait]
impl MessageDistributor for MockDistributor {
    async fn distribute(
        &self,
        delivery: &Delivery,
        cancellation: CancellationToken,
    ) -> Result<DeliveryOutcome, BoxedError> {
        lock(&self.seen).push(delivery.tag);

        let behaviour = lock(&self.behaviours)
            .get(&delivery.tag)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());

        match behaviour {
            MockBehaviour::Outcome(outcome) => Ok(outcome),
            MockBehaviour::Fail(message) => Err(message.into()),
            MockBehaviour::Panic => panic!("mock distributor panicked on {}", delivery.tag),
            MockBehaviour::Delay(duration, outcome) => {
                sleep(duration).await;
                Ok(outcome)
            }
            MockBehaviour::WaitForCancellation(outcome) => {
                cancellation.cancelled().await;
                lock(&self.cancelled).push(delivery.tag);
                Ok(outcome)
            }
        }
    }
}
