//! Strategies that settle deliveries with the broker
//!
//! Which strategy is used depends on the configured ack count, see [`AckMode::from_count`].

mod auto;
mod multi;
mod single;

pub use auto::AutoAck;
pub use multi::{AckWindowSnapshot, MultiAck};
pub use single::SingleAck;

use super::{AckChannel, AckOptions, ChannelError, ConfigurationError, DeliveryOutcome, DeliveryTag};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Failure to settle a delivery
#[derive(Debug, Error)]
pub enum AckError {
    /// Strategy has been shut down, the delivery will be redelivered on a new channel
    #[error("acknowledgement strategy has been shut down")]
    Closed,
    /// Broker call failed, the channel should be considered lost
    #[error("broker rejected settlement")]
    Channel(#[from] ChannelError),
}

/// Acknowledgement behaviour derived from the ack count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Broker acknowledges deliveries as soon as they are sent
    Auto,
    /// Every delivery is settled individually
    Single,
    /// Contiguous acknowledgements are batched, carrying the batch size
    Multi(u16),
}

impl AckMode {
    /// `0` selects [`AckMode::Auto`], `1` [`AckMode::Single`] and anything larger [`AckMode::Multi`]
    pub fn from_count(count: u16) -> Self {
        match count {
            0 => AckMode::Auto,
            1 => AckMode::Single,
            n => AckMode::Multi(n),
        }
    }

    /// Whether the consumer has to settle deliveries itself
    pub fn requires_manual_ack(&self) -> bool {
        !matches!(self, AckMode::Auto)
    }
}

/// Settles deliveries with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Hands the outcome of a delivery to the strategy
    ///
    /// Must be called exactly once for every delivery of the channel the strategy belongs to.
    async fn resolve(&self, tag: DeliveryTag, outcome: DeliveryOutcome) -> Result<(), AckError>;

    /// Settles everything that is still held back
    async fn flush(&self) -> Result<(), AckError> {
        Ok(())
    }

    /// Stops all background activity, later calls to [`resolve`](Acknowledger::resolve) fail
    async fn shutdown(&self) {}
}

/// Closed set of acknowledgement strategies
pub enum AckStrategy {
    #[allow(missing_docs)]
    Auto(AutoAck),
    #[allow(missing_docs)]
    Single(SingleAck),
    #[allow(missing_docs)]
    Multi(MultiAck),
}

impl AckStrategy {
    /// Builds the strategy for the given mode on top of a channel
    ///
    /// Multi-ack spawns its flush timer and thus has to be called from within a tokio runtime.
    pub fn new(
        mode: AckMode,
        channel: Arc<dyn AckChannel>,
        options: &AckOptions,
    ) -> Result<Self, ConfigurationError> {
        Ok(match mode {
            AckMode::Auto => AckStrategy::Auto(AutoAck::new()),
            AckMode::Single => AckStrategy::Single(SingleAck::new(channel)),
            AckMode::Multi(count) => AckStrategy::Multi(MultiAck::new(count, channel, options)?),
        })
    }

    /// Mode this strategy has been built for
    pub fn mode(&self) -> AckMode {
        match self {
            AckStrategy::Auto(_) => AckMode::Auto,
            AckStrategy::Single(_) => AckMode::Single,
            AckStrategy::Multi(multi) => AckMode::Multi(multi.multiple_count()),
        }
    }
}

#[async_trait]
impl Acknowledger for AckStrategy {
    async fn resolve(&self, tag: DeliveryTag, outcome: DeliveryOutcome) -> Result<(), AckError> {
        match self {
            AckStrategy::Auto(strategy) => strategy.resolve(tag, outcome).await,
            AckStrategy::Single(strategy) => strategy.resolve(tag, outcome).await,
            AckStrategy::Multi(strategy) => strategy.resolve(tag, outcome).await,
        }
    }

    async fn flush(&self) -> Result<(), AckError> {
        match self {
            AckStrategy::Auto(strategy) => strategy.flush().await,
            AckStrategy::Single(strategy) => strategy.flush().await,
            AckStrategy::Multi(strategy) => strategy.flush().await,
        }
    }

    async fn shutdown(&self) {
        match self {
            AckStrategy::Auto(strategy) => strategy.shutdown().await,
            AckStrategy::Single(strategy) => strategy.shutdown().await,
            AckStrategy::Multi(strategy) => strategy.shutdown().await,
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::implementation::mock::MockChannel;

    #[test]
    fn select_mode_by_count() {
        assert_eq!(AckMode::from_count(0), AckMode::Auto);
        assert_eq!(AckMode::from_count(1), AckMode::Single);
        assert_eq!(AckMode::from_count(2), AckMode::Multi(2));
        assert_eq!(AckMode::from_count(500), AckMode::Multi(500));
        assert!(!AckMode::Auto.requires_manual_ack());
        assert!(AckMode::Multi(3).requires_manual_ack());
    }

    #[tokio::test]
    async fn build_strategy_for_mode() {
        let channel = Arc::new(MockChannel::new(1));
        let options = AckOptions::default();

        for mode in [AckMode::Auto, AckMode::Single, AckMode::Multi(10)] {
            let strategy = AckStrategy::new(mode, channel.clone(), &options).unwrap();
            assert_eq!(strategy.mode(), mode);
            strategy.shutdown().await;
        }
    }

    #[tokio::test]
    async fn refuse_tiny_batches() {
        let channel = Arc::new(MockChannel::new(1));
        let result = AckStrategy::new(AckMode::Multi(1), channel, &AckOptions::default());

        assert!(matches!(
            result,
            Err(ConfigurationError::MultipleCountTooSmall(1))
        ));
    }
}
