use super::TopologyChannel;
use crate::library::EmptyResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Replication model of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Single node queue
    Classic,
    /// Replicated, consensus based queue
    Quorum,
}

/// Describes a queue and the arguments it is created with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    name: String,
    durable: bool,
    kind: QueueKind,
    dead_letter_exchange: Option<String>,
    message_ttl: Option<Duration>,
}

impl QueueDeclaration {
    /// Durable classic queue without any additional arguments
    pub fn classic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            kind: QueueKind::Classic,
            dead_letter_exchange: None,
            message_ttl: None,
        }
    }

    /// Quorum queue, which is always durable
    pub fn quorum(name: impl Into<String>) -> Self {
        Self {
            kind: QueueKind::Quorum,
            ..Self::classic(name)
        }
    }

    /// Makes a classic queue transient, ignored for quorum queues
    pub fn transient(mut self) -> Self {
        self.durable = self.kind == QueueKind::Quorum;
        self
    }

    /// Rejected and expired messages are routed to the given exchange
    pub fn dead_letter_to(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    /// Messages expire after the given duration
    pub fn message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Name of the queue
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the queue survives a broker restart
    pub fn durable(&self) -> bool {
        self.durable
    }

    /// Replication model
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Broker specific arguments derived from the declaration
    pub fn arguments(&self) -> BTreeMap<&'static str, String> {
        let mut arguments = BTreeMap::new();

        if self.kind == QueueKind::Quorum {
            arguments.insert("x-queue-type", "quorum".to_owned());
        }

        if let Some(exchange) = &self.dead_letter_exchange {
            arguments.insert("x-dead-letter-exchange", exchange.clone());
        }

        if let Some(ttl) = self.message_ttl {
            arguments.insert("x-message-ttl", ttl.as_millis().to_string());
        }

        arguments
    }
}

/// Routes messages from an exchange into a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    /// Exchange to bind to
    pub exchange: String,
    /// Routing key pattern
    pub routing_key: String,
}

impl QueueBinding {
    /// Creates a new binding
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Applies queue and binding declarations on a freshly opened channel
///
/// Called on every channel (re-)start so that declarations survive broker restarts.
#[async_trait]
pub trait TopologyDeclarer: Send + Sync {
    /// Declares everything the consumer relies upon
    async fn declare(&self, channel: &dyn TopologyChannel) -> EmptyResult;
}

/// Declares one queue together with its bindings
#[derive(Debug, Clone)]
pub struct QueueTopology {
    queue: QueueDeclaration,
    bindings: Vec<QueueBinding>,
}

impl QueueTopology {
    /// Creates a topology with no bindings
    pub fn new(queue: QueueDeclaration) -> Self {
        Self {
            queue,
            bindings: Vec::new(),
        }
    }

    /// Adds a binding to the queue
    pub fn bind(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }
}

#[async_trait]
impl TopologyDeclarer for QueueTopology {
    async fn declare(&self, channel: &dyn TopologyChannel) -> EmptyResult {
        debug!(queue = self.queue.name(), kind = ?self.queue.kind(), "Declaring queue");
        channel.declare_queue(&self.queue).await?;

        for binding in &self.bindings {
            debug!(
                queue = self.queue.name(),
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                "Binding queue"
            );
            channel.bind_queue(self.queue.name(), binding).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::implementation::mock::{BrokerCall, MockChannel};
    use pretty_assertions::assert_eq;

    #[test]
    fn derive_quorum_arguments() {
        let queue = QueueDeclaration::quorum("orders")
            .dead_letter_to("orders.dlx")
            .message_ttl(Duration::from_secs(60))
            .transient();

        let arguments = queue.arguments();

        assert!(queue.durable());
        assert_eq!(arguments.get("x-queue-type").unwrap(), "quorum");
        assert_eq!(arguments.get("x-dead-letter-exchange").unwrap(), "orders.dlx");
        assert_eq!(arguments.get("x-message-ttl").unwrap(), "60000");
    }

    #[test]
    fn keep_classic_queues_plain() {
        let queue = QueueDeclaration::classic("audit").transient();

        assert!(!queue.durable());
        assert!(queue.arguments().is_empty());
    }

    #[tokio::test]
    async fn declare_queue_before_bindings() {
        let channel = MockChannel::new(1);
        let topology = QueueTopology::new(QueueDeclaration::classic("orders"))
            .bind(QueueBinding::new("commerce", "order.*"))
            .bind(QueueBinding::new("commerce", "refund.*"));

        topology.declare(&channel).await.unwrap();

        assert_eq!(
            channel.calls(),
            vec![
                BrokerCall::DeclareQueue("orders".into()),
                BrokerCall::BindQueue {
                    queue: "orders".into(),
                    exchange: "commerce".into(),
                    routing_key: "order.*".into()
                },
                BrokerCall::BindQueue {
                    queue: "orders".into(),
                    exchange: "commerce".into(),
                    routing_key: "refund.*".into()
                },
            ]
        );
    }
}
