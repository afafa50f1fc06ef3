use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Broker assigned identifier of a delivery, strictly increasing per channel
pub type DeliveryTag = u64;

const UNKNOWN_MESSAGE_TYPE: &str = "unknown";

/// Result of processing a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    /// Processed successfully
    Ack,
    /// Permanent failure, the broker may dead-letter the message
    Reject,
    /// Transient failure, the broker should requeue the message
    Retry,
}

impl DeliveryOutcome {
    /// Whether a rejection with this outcome asks the broker to requeue the message
    pub fn requeue(&self) -> bool {
        matches!(self, DeliveryOutcome::Retry)
    }

    /// Lowercase name used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Ack => "ack",
            DeliveryOutcome::Reject => "reject",
            DeliveryOutcome::Retry => "retry",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata attached to a message by its publisher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Publisher assigned identifier
    pub message_id: Option<String>,
    /// Name of the contract the body adheres to
    pub message_type: Option<String>,
    /// Identifier linking requests and their replies
    pub correlation_id: Option<String>,
    /// Queue a reply should be published to
    pub reply_to: Option<String>,
    /// Application headers, including trace propagation headers
    pub headers: HashMap<String, String>,
}

/// Message as it has been delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel specific delivery identifier
    pub tag: DeliveryTag,
    /// Exchange the message was originally published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    /// Publisher provided metadata
    pub properties: MessageProperties,
    /// Raw, still serialized body
    pub body: Vec<u8>,
}

impl Delivery {
    /// Creates a delivery with empty metadata
    pub fn new(tag: DeliveryTag, body: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: MessageProperties::default(),
            body: body.into(),
        }
    }

    /// Sets the message type property
    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.properties.message_type = Some(message_type.into());
        self
    }

    /// Sets the message id property
    pub fn with_id(mut self, message_id: impl Into<String>) -> Self {
        self.properties.message_id = Some(message_id.into());
        self
    }

    /// Adds an application header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.headers.insert(key.into(), value.into());
        self
    }

    /// Message type or `unknown` if the publisher did not provide one
    pub fn message_type(&self) -> &str {
        self.properties
            .message_type
            .as_deref()
            .unwrap_or(UNKNOWN_MESSAGE_TYPE)
    }

    /// Message id or an empty string if the publisher did not provide one
    pub fn message_id(&self) -> &str {
        self.properties.message_id.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn requeue_only_retries() {
        assert!(DeliveryOutcome::Retry.requeue());
        assert!(!DeliveryOutcome::Reject.requeue());
        assert!(!DeliveryOutcome::Ack.requeue());
    }

    #[test]
    fn fall_back_to_unknown_type() {
        let delivery = Delivery::new(1, "{}");
        assert_eq!(delivery.message_type(), "unknown");
        assert_eq!(delivery.message_id(), "");

        let typed = delivery.with_type("OrderPlaced").with_id("42");
        assert_eq!(typed.message_type(), "OrderPlaced");
        assert_eq!(typed.message_id(), "42");
    }
}
