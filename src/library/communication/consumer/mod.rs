//! Self-healing queue consumer
//!
//! A [`Consumer`] moves through the following states:
//!
//! ```text
//! Idle -> Starting -> Consuming -> Stopping -> Recovering -> Starting -> ... -> Disposed
//! ```
//!
//! Every transition happens while holding the consumer's lifecycle mutex. Background tasks that
//! observe a lost channel therefore never race a concurrent [`dispose`](Consumer::dispose) or a
//! second recovery.

mod processing;

use super::ack::{AckError, AckMode, AckStrategy, Acknowledger};
use super::{
    AckChannel, ChannelError, CloseReason, ConfigurationError, ConsumerChannel, ConsumerOptions,
    Delivery, DeliveryStream, MessageDistributor, TopologyDeclarer, Transport,
};
use crate::library::scheduling::{RunningTask, RunningTaskRegistry};
use crate::library::sync::AsyncMutex;
use crate::library::telemetry::{MetricsRecorder, NoopMetrics, NoopTraceFactory, TraceFactory};
use crate::library::BoxedError;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// Phase of a [`Consumer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not consuming, either never initialized or initialization failed
    Idle,
    /// Opening a channel and registering with the broker
    Starting,
    /// Receiving and processing deliveries
    Consuming,
    /// Draining in-flight deliveries and releasing the channel
    Stopping,
    /// Waiting for the network to recover after losing the channel
    Recovering,
    /// Stopped for good
    Disposed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

/// Failure to bring a consumer up
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The consumer has been disposed and can not be started again
    #[error("consumer has been disposed")]
    Disposed,
    /// Broker channel could not be opened or configured
    #[error("broker channel failed")]
    Channel(#[from] ChannelError),
    /// Queues or bindings could not be declared
    #[error("failed to declare topology")]
    Topology(#[source] BoxedError),
    /// Options are not usable
    #[error("invalid configuration")]
    Configuration(#[from] ConfigurationError),
}

/// External components a consumer hands deliveries to
#[derive(Clone)]
pub struct ConsumerCollaborators {
    /// Produces the outcome of each delivery
    pub distributor: Arc<dyn MessageDistributor>,
    /// Declares the queue and bindings on every new channel
    pub topology: Arc<dyn TopologyDeclarer>,
    /// Records processing metrics
    pub metrics: Arc<dyn MetricsRecorder>,
    /// Traces the processing of each delivery
    pub tracing: Arc<dyn TraceFactory>,
}

impl ConsumerCollaborators {
    /// Creates collaborators that neither record metrics nor traces
    pub fn new(
        distributor: Arc<dyn MessageDistributor>,
        topology: Arc<dyn TopologyDeclarer>,
    ) -> Self {
        Self {
            distributor,
            topology,
            metrics: Arc::new(NoopMetrics),
            tracing: Arc::new(NoopTraceFactory),
        }
    }

    /// Replaces the metrics recorder
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replaces the trace factory
    pub fn with_tracing(mut self, tracing: Arc<dyn TraceFactory>) -> Self {
        self.tracing = tracing;
        self
    }
}

struct Session<C> {
    generation: u64,
    channel: Arc<C>,
    consumer_tag: String,
    strategy: Arc<AckStrategy>,
    dispatcher: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

struct Lifecycle<C> {
    disposed: bool,
    session: Option<Session<C>>,
}

struct Shared<T: Transport> {
    transport: Arc<T>,
    options: ConsumerOptions,
    ack_mode: AckMode,
    collaborators: ConsumerCollaborators,
    tasks: RunningTaskRegistry,
    permits: Arc<Semaphore>,
    lifecycle: AsyncMutex<Lifecycle<T::Channel>>,
    phase: watch::Sender<ConsumerState>,
    generation: AtomicU64,
}

/// Consumes one queue and keeps doing so across connection losses
///
/// Each delivery is processed by its own task. The outcome reported by the
/// [`MessageDistributor`] is settled through the [`AckStrategy`] selected by the configured ack
/// count. When the channel closes unexpectedly, or the broker refuses a settlement, the consumer
/// stops, waits for the network recovery interval and starts over on a fresh channel.
pub struct Consumer<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport + 'static> Consumer<T> {
    /// Creates an idle consumer, rejecting unusable options right away
    pub fn new(
        transport: Arc<T>,
        options: ConsumerOptions,
        collaborators: ConsumerCollaborators,
    ) -> Result<Self, ConsumerError> {
        options.validate()?;

        let ack_mode = AckMode::from_count(options.ack_count);
        let (phase, _) = watch::channel(ConsumerState::Idle);

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                ack_mode,
                collaborators,
                tasks: RunningTaskRegistry::new(),
                permits: Arc::new(Semaphore::new(options.dispatch_concurrency)),
                lifecycle: AsyncMutex::named(
                    "consumer lifecycle",
                    Lifecycle {
                        disposed: false,
                        session: None,
                    },
                ),
                phase,
                generation: AtomicU64::new(0),
                options,
            }),
        })
    }

    /// Opens a channel and starts consuming
    ///
    /// Does nothing if the consumer is already running. On failure the partially opened channel is
    /// closed and the consumer stays idle.
    pub async fn initialize(&self) -> Result<(), ConsumerError> {
        let shared = &self.shared;
        let mut lifecycle = shared.lifecycle.acquire().await;

        if lifecycle.disposed {
            return Err(ConsumerError::Disposed);
        }

        if lifecycle.session.is_some() {
            return Ok(());
        }

        match shared.start_session().await {
            Ok(session) => {
                lifecycle.session = Some(session);
                Ok(())
            }
            Err(error) => {
                warn!(queue = %shared.options.queue, %error, "Failed to start consuming");
                shared.set_phase(ConsumerState::Idle);
                Err(error)
            }
        }
    }

    /// Stops consuming for good
    ///
    /// Cancels the broker registration, waits for in-flight deliveries (at most the shutdown
    /// timeout), settles acknowledgements that are still held back and closes the channel.
    /// Notifications arriving afterwards are ignored.
    pub async fn dispose(&self) {
        let shared = &self.shared;
        let mut lifecycle = shared.lifecycle.acquire().await;

        if lifecycle.disposed {
            return;
        }

        if let Some(session) = lifecycle.session.take() {
            shared.stop_session(session).await;
        }

        lifecycle.disposed = true;
        shared.set_phase(ConsumerState::Disposed);
        info!(queue = %shared.options.queue, "Consumer disposed");
    }

    /// Current phase
    pub fn state(&self) -> ConsumerState {
        *self.shared.phase.borrow()
    }

    /// Receiver that observes every phase change
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.shared.phase.subscribe()
    }

    /// Number of channels that have been opened over the lifetime of the consumer
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Number of deliveries currently being processed
    pub fn in_flight(&self) -> usize {
        self.shared.tasks.in_flight()
    }

    /// Name of the consumed queue
    pub fn queue(&self) -> &str {
        &self.shared.options.queue
    }

    /// Acknowledgement behaviour derived from the options
    pub fn ack_mode(&self) -> AckMode {
        self.shared.ack_mode
    }
}

impl<T: Transport + 'static> Shared<T> {
    fn set_phase(&self, state: ConsumerState) {
        self.phase.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(queue = %self.options.queue, from = %current, to = %state, "Consumer state changed");
                *current = state;
                true
            }
        });
    }

    async fn start_session(self: &Arc<Self>) -> Result<Session<T::Channel>, ConsumerError> {
        self.set_phase(ConsumerState::Starting);

        let channel = self.transport.open_channel().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        match self.open_session(generation, channel.clone()).await {
            Ok(session) => {
                self.set_phase(ConsumerState::Consuming);
                info!(
                    queue = %self.options.queue,
                    generation,
                    ack_mode = ?self.ack_mode,
                    "Consuming"
                );
                Ok(session)
            }
            Err(error) => {
                if channel.is_open() {
                    if let Err(close_error) = channel.close().await {
                        debug!(generation, %close_error, "Failed to close channel of failed start");
                    }
                }

                Err(error)
            }
        }
    }

    async fn open_session(
        self: &Arc<Self>,
        generation: u64,
        channel: Arc<T::Channel>,
    ) -> Result<Session<T::Channel>, ConsumerError> {
        let manual_ack = self.ack_mode.requires_manual_ack();

        if manual_ack {
            channel.qos(self.options.prefetch).await?;
        }

        self.collaborators
            .topology
            .declare(&*channel)
            .await
            .map_err(ConsumerError::Topology)?;

        let ack_channel: Arc<dyn AckChannel> = channel.clone();
        let strategy = Arc::new(AckStrategy::new(
            self.ack_mode,
            ack_channel,
            &self.options.ack,
        )?);

        let consumer_tag = format!("{}-{}", self.options.queue, Uuid::new_v4());
        let deliveries = match channel
            .consume(&self.options.queue, &consumer_tag, !manual_ack)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(error) => {
                strategy.shutdown().await;
                return Err(error.into());
            }
        };

        self.tasks.resume();

        let dispatcher = tokio::spawn(self.clone().dispatch(
            generation,
            deliveries,
            strategy.clone(),
        ));
        let watcher = tokio::spawn(self.clone().watch(generation, channel.clone()));

        Ok(Session {
            generation,
            channel,
            consumer_tag,
            strategy,
            dispatcher,
            watcher,
        })
    }

    async fn stop_session(&self, session: Session<T::Channel>) {
        let Session {
            generation,
            channel,
            consumer_tag,
            strategy,
            dispatcher,
            watcher,
        } = session;

        self.set_phase(ConsumerState::Stopping);
        debug!(generation, in_flight = self.tasks.in_flight(), "Stopping consumption");

        watcher.abort();

        if channel.is_open() {
            if let Err(error) = channel.cancel(&consumer_tag).await {
                warn!(generation, %error, "Failed to cancel consumer");
            }
        }

        dispatcher.abort();

        if timeout(self.options.shutdown_timeout, self.tasks.drain())
            .await
            .is_err()
        {
            warn!(
                generation,
                in_flight = self.tasks.in_flight(),
                "Gave up waiting for in-flight deliveries, they will be redelivered"
            );
        }

        if channel.is_open() {
            if let Err(error) = strategy.flush().await {
                warn!(generation, %error, "Failed to flush pending acknowledgements");
            }
        }

        strategy.shutdown().await;

        if channel.is_open() {
            if let Err(error) = channel.close().await {
                warn!(generation, %error, "Failed to close channel");
            }
        }

        info!(queue = %self.options.queue, generation, "Stopped consuming");
    }

    /// Replaces the channel of the given generation with a fresh one
    ///
    /// Notifications for generations that are no longer current are ignored.
    fn recover(self: Arc<Self>, generation: u64, reason: CloseReason) -> BoxFuture<'static, ()> {
        async move {
            let mut lifecycle = self.lifecycle.acquire().await;
            let current = lifecycle.session.as_ref().map(|session| session.generation);

            if lifecycle.disposed || current != Some(generation) {
                debug!(generation, ?current, %reason, "Ignoring outdated channel notification");
                return;
            }

            warn!(queue = %self.options.queue, generation, %reason, "Channel lost, recovering");

            if let Some(session) = lifecycle.session.take() {
                self.stop_session(session).await;
            }

            loop {
                self.set_phase(ConsumerState::Recovering);
                sleep(self.options.network_recovery_interval).await;

                match self.start_session().await {
                    Ok(session) => {
                        lifecycle.session = Some(session);
                        info!(queue = %self.options.queue, "Recovered from channel loss");
                        return;
                    }
                    Err(error) => {
                        warn!(
                            queue = %self.options.queue,
                            %error,
                            retry_in = ?self.options.network_recovery_interval,
                            "Failed to recover"
                        );

                        // Give dispose a chance to run between attempts
                        drop(lifecycle);
                        lifecycle = self.lifecycle.acquire().await;

                        if lifecycle.disposed || lifecycle.session.is_some() {
                            return;
                        }
                    }
                }
            }
        }
        .boxed()
    }

    async fn watch(self: Arc<Self>, generation: u64, channel: Arc<T::Channel>) {
        let reason = channel.closed().await;
        debug!(generation, %reason, "Channel closed");

        // Recovery aborts this task, so it has to run on its own
        tokio::spawn(self.recover(generation, reason));
    }

    async fn dispatch(
        self: Arc<Self>,
        generation: u64,
        mut deliveries: DeliveryStream,
        strategy: Arc<AckStrategy>,
    ) {
        while let Some(item) = deliveries.next().await {
            let delivery = match item {
                Ok(delivery) => delivery,
                Err(error) => {
                    warn!(generation, %error, "Delivery stream failed");
                    break;
                }
            };

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let ticket = match self.tasks.try_admit() {
                Some(ticket) => ticket,
                None => {
                    debug!(generation, tag = delivery.tag, "Not admitting delivery while stopping");
                    continue;
                }
            };

            let span = info_span!(
                "delivery",
                queue = %self.options.queue,
                generation,
                tag = delivery.tag,
                message_type = %delivery.message_type()
            );

            tokio::spawn(
                self.clone()
                    .process(generation, delivery, strategy.clone(), ticket, permit)
                    .instrument(span),
            );
        }

        debug!(generation, "Delivery stream ended");
    }

    async fn process(
        self: Arc<Self>,
        generation: u64,
        delivery: Delivery,
        strategy: Arc<AckStrategy>,
        _ticket: RunningTask,
        _permit: OwnedSemaphorePermit,
    ) {
        let outcome = processing::settle_outcome(
            &self.collaborators,
            &delivery,
            self.options.processing_timeout,
        )
        .await;

        match strategy.resolve(delivery.tag, outcome).await {
            Ok(()) => trace!(%outcome, "Delivery settled"),
            Err(AckError::Closed) => {
                debug!(%outcome, "Strategy already shut down, delivery will be redelivered")
            }
            Err(AckError::Channel(error)) => {
                warn!(%outcome, %error, "Failed to settle delivery, treating channel as lost");
                let reason = CloseReason::ConnectionLost(error.to_string());
                tokio::spawn(self.clone().recover(generation, reason));
            }
        }
    }
}
