use super::{lock, BrokerCall};
use crate::library::communication::{
    AckChannel, ChannelError, CloseReason, ConsumerChannel, Delivery, DeliveryStream, DeliveryTag,
    QueueBinding, QueueDeclaration, TopologyChannel,
};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::trace;

type DeliveryItem = Result<Delivery, ChannelError>;

/// Channel that records every call and hands out injected deliveries
pub struct MockChannel {
    id: usize,
    calls: Mutex<Vec<BrokerCall>>,
    open: AtomicBool,
    fail_acks: AtomicBool,
    sender: Mutex<Option<UnboundedSender<DeliveryItem>>>,
    receiver: Mutex<Option<UnboundedReceiver<DeliveryItem>>>,
    closed: watch::Sender<Option<CloseReason>>,
}

impl MockChannel {
    /// Creates an open channel, the id only shows up in logs
    pub fn new(id: usize) -> Self {
        let (sender, receiver) = unbounded();
        let (closed, _) = watch::channel(None);

        Self {
            id,
            calls: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
            fail_acks: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            closed,
        }
    }

    /// Identifier passed on creation
    pub fn id(&self) -> usize {
        self.id
    }

    /// Every successful call in the order it was made
    pub fn calls(&self) -> Vec<BrokerCall> {
        lock(&self.calls).clone()
    }

    /// Successful acks and rejects in the order they were made
    pub fn acknowledgements(&self) -> Vec<BrokerCall> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.is_settlement())
            .cloned()
            .collect()
    }

    /// Queues a delivery for the consumer, returns false if consumption has already stopped
    pub fn deliver(&self, delivery: Delivery) -> bool {
        match lock(&self.sender).as_ref() {
            Some(sender) => sender.unbounded_send(Ok(delivery)).is_ok(),
            None => false,
        }
    }

    /// Simulates the broker or the network closing the channel
    pub fn disconnect(&self, reason: CloseReason) {
        trace!(channel = self.id, %reason, "Simulating disconnect");
        self.shut(reason);
    }

    /// Makes subsequent acks and rejects fail with a transport error
    pub fn fail_acknowledgements(&self, fail: bool) {
        self.fail_acks.store(fail, Ordering::SeqCst);
    }

    fn shut(&self, reason: CloseReason) {
        self.open.store(false, Ordering::SeqCst);
        lock(&self.sender).take();
        self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    fn record(&self, call: BrokerCall) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }

        lock(&self.calls).push(call);
        Ok(())
    }

    fn settle(&self, call: BrokerCall) -> Result<(), ChannelError> {
        if self.is_open() && self.fail_acks.load(Ordering::SeqCst) {
            return Err(ChannelError::Transport("injected settlement failure".into()));
        }

        self.record(call)
    }
}

#[async_trait]
impl AckChannel for MockChannel {
    async fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<(), ChannelError> {
        self.settle(BrokerCall::Ack { tag, multiple })
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), ChannelError> {
        self.settle(BrokerCall::Reject { tag, requeue })
    }
}

#[async_trait]
impl TopologyChannel for MockChannel {
    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), ChannelError> {
        self.record(BrokerCall::DeclareQueue(queue.name().to_owned()))
    }

    async fn bind_queue(&self, queue: &str, binding: &QueueBinding) -> Result<(), ChannelError> {
        self.record(BrokerCall::BindQueue {
            queue: queue.to_owned(),
            exchange: binding.exchange.clone(),
            routing_key: binding.routing_key.clone(),
        })
    }
}

#[async_trait]
impl ConsumerChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn qos(&self, prefetch: u16) -> Result<(), ChannelError> {
        self.record(BrokerCall::Qos(prefetch))
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, ChannelError> {
        let receiver = lock(&self.receiver)
            .take()
            .ok_or_else(|| ChannelError::Refused("channel is already consuming".into()))?;

        self.record(BrokerCall::Consume {
            queue: queue.to_owned(),
            no_ack,
        })?;

        Ok(receiver.boxed())
    }

    async fn cancel(&self, _consumer_tag: &str) -> Result<(), ChannelError> {
        self.record(BrokerCall::Cancel)?;
        lock(&self.sender).take();
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.record(BrokerCall::Close)?;
        self.shut(CloseReason::Requested);
        Ok(())
    }

    async fn closed(&self) -> CloseReason {
        let mut receiver = self.closed.subscribe();

        let reason = receiver
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| reason.clone());

        reason.unwrap_or(CloseReason::Requested)
    }
}
