use async_trait::async_trait;
use herald::library::communication::consumer::{
    Consumer, ConsumerCollaborators, ConsumerError, ConsumerState,
};
use herald::library::communication::implementation::mock::{
    BrokerCall, MockBehaviour, MockChannel, MockDistributor, MockTransport,
};
use herald::library::communication::{
    CloseReason, ConsumerChannel, ConsumerOptions, Delivery, DeliveryOutcome, QueueBinding,
    QueueDeclaration, QueueTopology, TopologyChannel, TopologyDeclarer,
};
use herald::library::EmptyResult;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const QUEUE: &str = "orders";

fn options(ack_count: u16) -> ConsumerOptions {
    let mut options = ConsumerOptions::new(QUEUE);
    options.ack_count = ack_count;
    options
}

fn topology() -> Arc<QueueTopology> {
    Arc::new(
        QueueTopology::new(QueueDeclaration::quorum(QUEUE))
            .bind(QueueBinding::new("commerce", "order.*")),
    )
}

fn consumer(
    transport: &Arc<MockTransport>,
    distributor: &Arc<MockDistributor>,
    options: ConsumerOptions,
) -> Consumer<MockTransport> {
    let collaborators = ConsumerCollaborators::new(distributor.clone(), topology());
    Consumer::new(transport.clone(), options, collaborators).unwrap()
}

async fn eventually(description: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }

        sleep(Duration::from_millis(10)).await;
    }

    panic!("timed out waiting for {}", description);
}

async fn reach(consumer: &Consumer<MockTransport>, state: ConsumerState) {
    consumer
        .subscribe_state()
        .wait_for(|current| *current == state)
        .await
        .unwrap();
}

fn setup_calls(prefetch: u16, no_ack: bool) -> Vec<BrokerCall> {
    let mut calls = Vec::new();

    if !no_ack {
        calls.push(BrokerCall::Qos(prefetch));
    }

    calls.push(BrokerCall::DeclareQueue(QUEUE.into()));
    calls.push(BrokerCall::BindQueue {
        queue: QUEUE.into(),
        exchange: "commerce".into(),
        routing_key: "order.*".into(),
    });
    calls.push(BrokerCall::Consume {
        queue: QUEUE.into(),
        no_ack,
    });

    calls
}

fn with_setup(calls: Vec<BrokerCall>) -> Vec<BrokerCall> {
    let mut expected = setup_calls(50, false);
    expected.extend(calls);
    expected
}

fn ack(tag: u64, multiple: bool) -> BrokerCall {
    BrokerCall::Ack { tag, multiple }
}

fn reject(tag: u64, requeue: bool) -> BrokerCall {
    BrokerCall::Reject { tag, requeue }
}

fn latest(transport: &MockTransport) -> Arc<MockChannel> {
    transport.latest_channel().unwrap()
}

#[tokio::test(start_paused = true)]
async fn start_consuming_with_topology_and_prefetch() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::acking());
    let consumer = consumer(&transport, &distributor, options(1));

    assert_eq!(consumer.state(), ConsumerState::Idle);
    consumer.initialize().await.unwrap();

    assert_eq!(consumer.state(), ConsumerState::Consuming);
    assert_eq!(consumer.generation(), 1);
    assert_eq!(latest(&transport).calls(), setup_calls(50, false));

    // Initializing twice keeps the running channel
    consumer.initialize().await.unwrap();
    assert_eq!(transport.channels().len(), 1);

    consumer.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_after_channel_loss() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::acking());
    let consumer = consumer(&transport, &distributor, options(1));
    consumer.initialize().await.unwrap();

    let first = latest(&transport);
    let lost_at = Instant::now();
    first.disconnect(CloseReason::ConnectionLost("reset by peer".into()));

    reach(&consumer, ConsumerState::Recovering).await;
    let second = transport.wait_for_channels(2).await.unwrap();
    reach(&consumer, ConsumerState::Consuming).await;

    assert!(lost_at.elapsed() >= Duration::from_secs(5));
    assert_eq!(consumer.generation(), 2);
    assert_eq!(transport.attempts(), 2);
    assert_eq!(transport.open_channels(), 1);
    assert!(second.is_open());

    // The lost channel saw no further calls, the new one was set up from scratch
    assert_eq!(first.calls(), setup_calls(50, false));
    assert_eq!(second.calls(), setup_calls(50, false));

    second.deliver(Delivery::new(1, "{}"));
    eventually("acknowledgement on new channel", || {
        second.acknowledgements() == vec![ack(1, false)]
    })
    .await;

    consumer.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn retry_recovery_until_channel_opens() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::acking());
    let consumer = consumer(&transport, &distributor, options(1));
    consumer.initialize().await.unwrap();

    transport.fail_next_opens(2);
    let lost_at = Instant::now();
    latest(&transport).disconnect(CloseReason::ClosedByBroker {
        code: 320,
        text: "CONNECTION_FORCED".into(),
    });

    transport.wait_for_channels(2).await.unwrap();
    reach(&consumer, ConsumerState::Consuming).await;

    assert!(lost_at.elapsed() >= Duration::from_secs(15));
    assert_eq!(transport.attempts(), 4);
    assert_eq!(consumer.generation(), 2);

    consumer.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn batch_acknowledgements() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::acking());
    let consumer = consumer(&transport, &distributor, options(3));
    consumer.initialize().await.unwrap();
    let channel = latest(&transport);

    for tag in 1..=3 {
        channel.deliver(Delivery::new(tag, "{}"));
    }
    eventually("first batch", || channel.acknowledgements() == vec![ack(3, true)]).await;

    for tag in 4..=6 {
        channel.deliver(Delivery::new(tag, "{}"));
    }
    eventually("second batch", || {
        channel.acknowledgements() == vec![ack(3, true), ack(6, true)]
    })
    .await;

    // A trickle below the batch size is flushed once it becomes stale
    channel.deliver(Delivery::new(7, "{}"));
    eventually("stale flush", || channel.acknowledgements().len() == 3).await;
    assert_eq!(channel.acknowledgements()[2], ack(7, false));

    consumer.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn flush_pending_acknowledgements_on_dispose() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::acking());
    let consumer = consumer(&transport, &distributor, options(10));
    consumer.initialize().await.unwrap();
    let channel = latest(&transport);

    channel.deliver(Delivery::new(1, "{}"));
    channel.deliver(Delivery::new(2, "{}"));
    eventually("processing", || {
        distributor.seen().len() == 2 && consumer.in_flight() == 0
    })
    .await;
    assert!(channel.acknowledgements().is_empty());

    consumer.dispose().await;

    assert_eq!(
        channel.calls(),
        with_setup(vec![
            BrokerCall::Cancel,
            ack(1, false),
            ack(2, false),
            BrokerCall::Close
        ])
    );
    assert_eq!(consumer.state(), ConsumerState::Disposed);
}

#[tokio::test(start_paused = true)]
async fn settle_failures_individually() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::acking());
    distributor
        .on(1, MockBehaviour::Fail("database unavailable".into()))
        .on(2, MockBehaviour::Panic)
        .on(3, MockBehaviour::Outcome(DeliveryOutcome::Retry));
    let consumer = consumer(&transport, &distributor, options(1));
    consumer.initialize().await.unwrap();
    let channel = latest(&transport);

    for tag in 1..=4 {
        channel.deliver(Delivery::new(tag, "{}").with_type("OrderPlaced"));
    }
    eventually("settlements", || channel.acknowledgements().len() == 4).await;

    let settlements = channel.acknowledgements();
    for expected in [reject(1, false), reject(2, false), reject(3, true), ack(4, false)] {
        assert!(settlements.contains(&expected), "missing {:?}", expected);
    }

    // Failing deliveries do not affect the channel
    assert_eq!(consumer.generation(), 1);
    consumer.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_processing_after_timeout() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::new(MockBehaviour::WaitForCancellation(
        DeliveryOutcome::Retry,
    )));
    let mut options = options(1);
    options.processing_timeout = Duration::from_millis(250);
    let consumer = consumer(&transport, &distributor, options);
    consumer.initialize().await.unwrap();
    let channel = latest(&transport);

    let delivered_at = Instant::now();
    channel.deliver(Delivery::new(1, "{}"));
    eventually("retry", || channel.acknowledgements() == vec![reject(1, true)]).await;

    assert!(delivered_at.elapsed() >= Duration::from_millis(250));
    assert_eq!(distributor.cancelled(), vec![1]);

    consumer.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn drain_in_flight_deliveries_on_dispose() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::new(MockBehaviour::Delay(
        Duration::from_millis(500),
        DeliveryOutcome::Ack,
    )));
    let consumer = consumer(&transport, &distributor, options(1));
    consumer.initialize().await.unwrap();
    let channel = latest(&transport);

    channel.deliver(Delivery::new(1, "{}"));
    eventually("processing start", || distributor.seen() == vec![1]).await;
    assert_eq!(consumer.in_flight(), 1);

    consumer.dispose().await;

    assert_eq!(consumer.in_flight(), 0);
    assert_eq!(
        channel.calls(),
        with_setup(vec![BrokerCall::Cancel, ack(1, false), BrokerCall::Close])
    );
}

#[tokio::test(start_paused = true)]
async fn bound_concurrent_processing() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::new(MockBehaviour::Delay(
        Duration::from_secs(1),
        DeliveryOutcome::Ack,
    )));
    let mut options = options(1);
    options.dispatch_concurrency = 2;
    let consumer = consumer(&transport, &distributor, options);
    consumer.initialize().await.unwrap();
    let channel = latest(&transport);

    for tag in 1..=5 {
        channel.deliver(Delivery::new(tag, "{}"));
    }

    eventually("first deliveries", || distributor.seen().len() == 2).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(consumer.in_flight(), 2);
    assert_eq!(distributor.seen(), vec![1, 2]);

    eventually("all settlements", || channel.acknowledgements().len() == 5).await;
    consumer.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn recover_when_settlement_fails() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::acking());
    let consumer = consumer(&transport, &distributor, options(1));
    consumer.initialize().await.unwrap();

    let first = latest(&transport);
    first.fail_acknowledgements(true);
    first.deliver(Delivery::new(1, "{}"));

    let second = transport.wait_for_channels(2).await.unwrap();
    reach(&consumer, ConsumerState::Consuming).await;

    assert_eq!(
        first.calls(),
        with_setup(vec![BrokerCall::Cancel, BrokerCall::Close])
    );
    assert!(!first.is_open());
    assert!(second.is_open());
    assert_eq!(consumer.generation(), 2);

    consumer.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn let_the_broker_acknowledge_in_auto_mode() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::new(MockBehaviour::Outcome(
        DeliveryOutcome::Reject,
    )));
    let consumer = consumer(&transport, &distributor, options(0));
    consumer.initialize().await.unwrap();
    let channel = latest(&transport);

    channel.deliver(Delivery::new(1, "{}"));
    eventually("processing", || {
        distributor.seen() == vec![1] && consumer.in_flight() == 0
    })
    .await;

    consumer.dispose().await;

    let mut expected = setup_calls(50, true);
    expected.extend(vec![BrokerCall::Cancel, BrokerCall::Close]);
    assert_eq!(channel.calls(), expected);
}

struct FailingTopology;

#[async_trait]
impl TopologyDeclarer for FailingTopology {
    async fn declare(&self, _channel: &dyn TopologyChannel) -> EmptyResult {
        Err("access refused".into())
    }
}

#[tokio::test(start_paused = true)]
async fn report_initialization_failures() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::acking());
    let consumer = consumer(&transport, &distributor, options(1));

    transport.fail_next_opens(1);
    assert!(matches!(
        consumer.initialize().await,
        Err(ConsumerError::Channel(_))
    ));
    assert_eq!(consumer.state(), ConsumerState::Idle);
    assert_eq!(consumer.generation(), 0);

    consumer.initialize().await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Consuming);
    consumer.dispose().await;

    let collaborators = ConsumerCollaborators::new(distributor.clone(), Arc::new(FailingTopology));
    let failing = Consumer::new(transport.clone(), options(1), collaborators).unwrap();

    assert!(matches!(
        failing.initialize().await,
        Err(ConsumerError::Topology(_))
    ));
    assert_eq!(failing.state(), ConsumerState::Idle);
    assert!(!latest(&transport).is_open());
    assert_eq!(latest(&transport).calls(), vec![BrokerCall::Qos(50), BrokerCall::Close]);
}

#[tokio::test(start_paused = true)]
async fn reject_invalid_options() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::acking());
    let collaborators = ConsumerCollaborators::new(distributor, topology());

    let mut options = options(1);
    options.prefetch = 0;

    assert!(matches!(
        Consumer::new(transport, options, collaborators),
        Err(ConsumerError::Configuration(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn ignore_notifications_after_dispose() {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(MockDistributor::acking());
    let consumer = consumer(&transport, &distributor, options(1));
    consumer.initialize().await.unwrap();

    consumer.dispose().await;
    consumer.dispose().await;
    latest(&transport).disconnect(CloseReason::ConnectionLost("late".into()));
    sleep(Duration::from_secs(30)).await;

    assert_eq!(transport.channels().len(), 1);
    assert_eq!(consumer.state(), ConsumerState::Disposed);
    assert!(matches!(
        consumer.initialize().await,
        Err(ConsumerError::Disposed)
    ));
}
