use super::{Delivery, DeliveryOutcome};
use crate::library::BoxedError;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Turns a raw delivery into an outcome
///
/// Implementations look up the handler for the message, run it through whatever middleware is
/// configured and deserialize the body. All of that is opaque to the consumer which only cares
/// about the resulting [`DeliveryOutcome`].
///
/// The token is cancelled once the processing timeout of the queue expires. Implementations are
/// expected to observe it and return a terminal outcome instead of running on indefinitely.
/// Returning an error settles the delivery with [`DeliveryOutcome::Reject`].
#[async_trait]
pub trait MessageDistributor: Send + Sync {
    /// Processes the delivery and reports how it should be settled
    async fn distribute(
        &self,
        delivery: &Delivery,
        cancellation: CancellationToken,
    ) -> Result<DeliveryOutcome, BoxedError>;
}
