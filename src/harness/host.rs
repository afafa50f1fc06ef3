use super::{DeathReason, Heart};
use crate::library::communication::consumer::{Consumer, ConsumerError};
use crate::library::communication::Transport;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

/// Consumer that can be run by a [`ConsumerHost`]
#[async_trait]
pub trait HostedConsumer: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Starts consuming
    async fn initialize(&self) -> Result<(), ConsumerError>;

    /// Stops consuming for good
    async fn dispose(&self);
}

#[async_trait]
impl<T: Transport + 'static> HostedConsumer for Consumer<T> {
    fn name(&self) -> &str {
        self.queue()
    }

    async fn initialize(&self) -> Result<(), ConsumerError> {
        Consumer::initialize(self).await
    }

    async fn dispose(&self) {
        Consumer::dispose(self).await
    }
}

/// Reason why the host could not bring its consumers up
#[derive(Debug, Error)]
pub enum HostError {
    /// A consumer failed to start
    #[error("consumer {name} failed to start")]
    StartupFailed {
        /// Name of the consumer
        name: String,
        #[source]
        /// Underlying failure
        source: ConsumerError,
    },
    /// A consumer did not start in time
    #[error("consumer {0} did not start in time")]
    Timeout(String),
}

/// Runs a set of consumers for as long as a [`Heart`] beats
pub struct ConsumerHost {
    consumers: Vec<Arc<dyn HostedConsumer>>,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Default for ConsumerHost {
    fn default() -> Self {
        Self {
            consumers: Vec::new(),
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl ConsumerHost {
    /// Adds a consumer that is started with the host
    pub fn with_consumer(mut self, consumer: Arc<dyn HostedConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    /// Overrides how long a single consumer may take to start
    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    /// Overrides how long a single consumer may take to stop
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Starts all consumers, waits for the heart to die and disposes them again
    ///
    /// If any consumer fails to start, the ones already running are disposed and the error is
    /// returned.
    #[instrument(skip(self, heart), fields(consumers = self.consumers.len()))]
    pub async fn run(&self, mut heart: Heart) -> Result<DeathReason, HostError> {
        info!("Starting consumers");

        if let Err(error) = self.startup().await {
            error!(%error, "Startup failed");
            self.shutdown().await;
            return Err(error);
        }

        let reason = heart.death().await;
        info!(%reason, "Heart died, stopping consumers");

        self.shutdown().await;
        Ok(reason)
    }

    async fn startup(&self) -> Result<(), HostError> {
        for consumer in &self.consumers {
            let name = consumer.name().to_owned();
            debug!(consumer = %name, "Initializing consumer");

            match timeout(self.startup_timeout, consumer.initialize()).await {
                Ok(Ok(())) => {}
                Ok(Err(source)) => return Err(HostError::StartupFailed { name, source }),
                Err(_) => return Err(HostError::Timeout(name)),
            }
        }

        Ok(())
    }

    async fn shutdown(&self) {
        let shutdown_timeout = self.shutdown_timeout;

        join_all(self.consumers.iter().map(|consumer| async move {
            if timeout(shutdown_timeout, consumer.dispose()).await.is_err() {
                error!(consumer = consumer.name(), "Consumer did not stop in time");
            }
        }))
        .await;

        info!("All consumers stopped");
    }
}
