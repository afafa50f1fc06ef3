//! In-memory doubles of the broker and the message distributor
//!
//! Every interaction with the broker is recorded as a [`BrokerCall`] so that tests can assert on
//! the exact sequence a component produced. Disconnects and failing settlements can be injected
//! at any time.

mod channel;
mod distributor;
mod transport;

pub use channel::*;
pub use distributor::*;
pub use transport::*;

use crate::library::communication::DeliveryTag;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Operation a component performed on a [`MockChannel`]
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Qos(u16),
    DeclareQueue(String),
    BindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Consume { queue: String, no_ack: bool },
    Cancel,
    Close,
    Ack { tag: DeliveryTag, multiple: bool },
    Reject { tag: DeliveryTag, requeue: bool },
}

impl BrokerCall {
    /// Whether the call settles deliveries
    pub fn is_settlement(&self) -> bool {
        matches!(self, BrokerCall::Ack { .. } | BrokerCall::Reject { .. })
    }
}

// A panicking test thread must not take the other assertions down with it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
