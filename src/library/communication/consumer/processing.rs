use super::ConsumerCollaborators;
use crate::library::communication::{Delivery, DeliveryOutcome};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Runs the distributor on a delivery and determines how it is settled
///
/// Errors and panics of the distributor settle the delivery with [`DeliveryOutcome::Reject`].
/// Exceeding the processing timeout only cancels the token handed to the distributor, the
/// distributor still decides the outcome.
pub(super) async fn settle_outcome(
    collaborators: &ConsumerCollaborators,
    delivery: &Delivery,
    processing_timeout: Duration,
) -> DeliveryOutcome {
    let metrics = &collaborators.metrics;
    let started = metrics.start_consuming();
    metrics.record_message_type(delivery.message_type());

    let mut trace = collaborators.tracing.start(delivery);

    let cancellation = CancellationToken::new();
    let distribution = AssertUnwindSafe(
        collaborators
            .distributor
            .distribute(delivery, cancellation.clone()),
    )
    .catch_unwind();
    let deadline = sleep(processing_timeout);
    tokio::pin!(distribution, deadline);

    let result = loop {
        tokio::select! {
            result = &mut distribution => break result,
            _ = &mut deadline, if !cancellation.is_cancelled() => {
                warn!(
                    tag = delivery.tag,
                    message_id = delivery.message_id(),
                    message_type = delivery.message_type(),
                    timeout = ?processing_timeout,
                    "Processing timed out, requesting cancellation"
                );
                cancellation.cancel();
            }
        }
    };

    let outcome = match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(cause)) => {
            error!(
                tag = delivery.tag,
                message_id = delivery.message_id(),
                message_type = delivery.message_type(),
                error = %cause,
                "Failed to process delivery"
            );
            trace.record_error(&cause.to_string());
            DeliveryOutcome::Reject
        }
        Err(panic) => {
            let message = panic_message(&*panic);
            error!(
                tag = delivery.tag,
                message_id = delivery.message_id(),
                message_type = delivery.message_type(),
                panic = %message,
                "Processing delivery panicked"
            );
            trace.record_error(&message);
            DeliveryOutcome::Reject
        }
    };

    if let Err(cause) = metrics.end_consuming(started, outcome) {
        warn!(tag = delivery.tag, error = %cause, "Failed to record consumption metrics");
    }

    trace.record_outcome(outcome);
    outcome
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
