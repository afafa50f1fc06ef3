use super::{Delivery, DeliveryTag, QueueBinding, QueueDeclaration};
use crate::library::BoxedError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a broker channel
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Channel has been closed, either locally or by the broker
    #[error("channel is closed")]
    Closed,
    /// Broker refused to carry out the operation
    #[error("broker refused operation: {0}")]
    Refused(String),
    /// Underlying connection failed
    #[error("transport failure")]
    Transport(#[source] BoxedError),
}

/// Reason why a channel stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request of this process
    Requested,
    /// Connection to the broker has been lost
    ConnectionLost(String),
    /// Broker closed the channel with an error code
    ClosedByBroker {
        /// AMQP reply code
        code: u16,
        /// Human readable explanation sent by the broker
        text: String,
    },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => write!(f, "closed on request"),
            CloseReason::ConnectionLost(reason) => write!(f, "connection lost ({})", reason),
            CloseReason::ClosedByBroker { code, text } => {
                write!(f, "closed by broker ({} {})", code, text)
            }
        }
    }
}

/// Stream of deliveries for one consumer registration, ends when consumption stops
pub type DeliveryStream = BoxStream<'static, Result<Delivery, ChannelError>>;

/// Settlement primitives of a channel
///
/// The broker applies settlements in the order they have been sent on a channel. The
/// acknowledgement strategies rely on this.
#[async_trait]
pub trait AckChannel: Send + Sync {
    /// Acknowledges the delivery, or every unsettled delivery up to and including it if `multiple` is set
    async fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<(), ChannelError>;

    /// Rejects the delivery, asking the broker to put it back into the queue if `requeue` is set
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), ChannelError>;
}

/// Declaration primitives of a channel
#[async_trait]
pub trait TopologyChannel: Send + Sync {
    /// Creates the queue if it does not exist
    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), ChannelError>;

    /// Binds a queue to an exchange
    async fn bind_queue(&self, queue: &str, binding: &QueueBinding) -> Result<(), ChannelError>;
}

/// Channel which may consume a queue
#[async_trait]
pub trait ConsumerChannel: AckChannel + TopologyChannel {
    /// Whether the channel is still usable
    fn is_open(&self) -> bool;

    /// Limits the number of unacknowledged deliveries the broker sends ahead
    async fn qos(&self, prefetch: u16) -> Result<(), ChannelError>;

    /// Registers a consumer on the queue and returns its deliveries
    ///
    /// With `no_ack` set, the broker considers deliveries acknowledged as soon as they are sent.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, ChannelError>;

    /// Stops the consumer registration, ending its delivery stream
    async fn cancel(&self, consumer_tag: &str) -> Result<(), ChannelError>;

    /// Closes the channel, unsettled deliveries are redelivered by the broker
    async fn close(&self) -> Result<(), ChannelError>;

    /// Resolves once the channel has been closed for whatever reason
    async fn closed(&self) -> CloseReason;
}

/// Source of broker channels
#[async_trait]
pub trait Transport: Send + Sync {
    /// Channel implementation handed out by this transport
    type Channel: ConsumerChannel + 'static;

    /// Opens a new channel, connecting to the broker first if required
    async fn open_channel(&self) -> Result<Arc<Self::Channel>, ChannelError>;
}
