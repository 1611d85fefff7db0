//! End-to-End tests for the integration event bus.
//!
//! These tests run publishing and consuming buses against one shared
//! in-process broker and verify routing, dispatch and acknowledgment as seen
//! from the broker side.
//!
//! Test flows:
//! 1. OrderCreated: publish → subscription rule → handler → complete
//! 2. Unsubscribe: rule removed, already routed messages acknowledged
//! 3. Failure: failed handler → no completion → redelivery → complete
//! 4. Provisioning: concurrent first subscribes, creation failures
//! 5. Shutdown: dispose drains in-flight work and closes the broker once

use async_trait::async_trait;
use platform_eventbus::{
    DynamicIntegrationEventHandler, EventBus, EventBusConfig, EventBusError, EventMeta,
    IntegrationEvent, IntegrationEventHandler, MemoryTransport, OutgoingMessage, RuleDescription,
    Transport, TransportError, TransportOperation, DEFAULT_RULE_NAME,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const TOPIC: &str = "integration-events";
const BILLING_SUBSCRIPTION: &str = "billing.OrderCreated";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderCreatedIntegrationEvent {
    #[serde(flatten)]
    meta: EventMeta,
    order_id: u64,
}

impl IntegrationEvent for OrderCreatedIntegrationEvent {}

impl OrderCreatedIntegrationEvent {
    fn new(order_id: u64) -> Self {
        Self {
            meta: EventMeta::new(),
            order_id,
        }
    }
}

/// Records every order it sees.
#[derive(Clone, Default)]
struct RecordingHandler {
    orders: Arc<std::sync::Mutex<Vec<u64>>>,
}

impl RecordingHandler {
    fn orders(&self) -> Vec<u64> {
        self.orders.lock().unwrap().clone()
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderCreatedIntegrationEvent> for RecordingHandler {
    async fn handle(&self, event: OrderCreatedIntegrationEvent) -> anyhow::Result<()> {
        self.orders.lock().unwrap().push(event.order_id);
        Ok(())
    }
}

/// Fails the first delivery, succeeds afterwards.
#[derive(Clone, Default)]
struct FailOnceHandler {
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl IntegrationEventHandler<OrderCreatedIntegrationEvent> for FailOnceHandler {
    async fn handle(&self, _event: OrderCreatedIntegrationEvent) -> anyhow::Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("payment provider timed out");
        }
        Ok(())
    }
}

/// Signals when it starts, finishes after a delay.
#[derive(Clone, Default)]
struct SlowHandler {
    started: Arc<Notify>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl IntegrationEventHandler<OrderCreatedIntegrationEvent> for SlowHandler {
    async fn handle(&self, _event: OrderCreatedIntegrationEvent) -> anyhow::Result<()> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Tracks how many invocations overlap.
#[derive(Clone, Default)]
struct OverlapTracker {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl DynamicIntegrationEventHandler for OverlapTracker {
    async fn handle(&self, _event_name: &str, _payload: serde_json::Value) -> anyhow::Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Test fixture with a shared broker, a publishing bus and a consuming bus.
struct TestFixture {
    /// Shared in-process broker.
    transport: MemoryTransport,
    /// Bus of the publishing service.
    ordering: EventBus,
    /// Bus of the consuming service.
    billing: EventBus,
}

impl TestFixture {
    /// Create a fixture with default configuration.
    fn new() -> Self {
        Self::with_config(EventBusConfig::new("billing"))
    }

    /// Create a fixture with a custom consumer configuration.
    fn with_config(billing_config: EventBusConfig) -> Self {
        let transport = MemoryTransport::new();
        let ordering =
            EventBus::new(EventBusConfig::new("ordering"), Arc::new(transport.clone())).unwrap();
        let billing = EventBus::new(billing_config, Arc::new(transport.clone())).unwrap();

        Self {
            transport,
            ordering,
            billing,
        }
    }

    /// Wait until the consumer has completed `count` messages.
    async fn wait_for_completed(&self, count: u64) {
        for _ in 0..400 {
            if self.billing.stats().await.messages_completed >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {} completed messages, got {:?}",
            count,
            self.billing.stats().await
        );
    }

    /// Wait until the consumer has abandoned `count` messages.
    async fn wait_for_abandoned(&self, count: u64) {
        for _ in 0..400 {
            if self.billing.stats().await.messages_abandoned >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {} abandoned messages, got {:?}",
            count,
            self.billing.stats().await
        );
    }
}

// ============================================================================
// OrderCreated Flow
// ============================================================================

#[tokio::test]
async fn test_order_created_is_handled_and_completed() {
    let fixture = TestFixture::new();
    let handler = RecordingHandler::default();

    fixture
        .billing
        .subscribe::<OrderCreatedIntegrationEvent, _>(handler.clone())
        .await
        .unwrap();
    assert!(fixture
        .billing
        .subscriptions()
        .has_subscription("OrderCreated")
        .await);
    assert_eq!(
        fixture.transport.rule_names(TOPIC, BILLING_SUBSCRIPTION).await,
        vec!["OrderCreated".to_string()]
    );

    fixture
        .ordering
        .publish(&OrderCreatedIntegrationEvent::new(42))
        .await
        .unwrap();
    fixture.wait_for_completed(1).await;

    assert_eq!(handler.orders(), vec![42]);
    assert_eq!(
        fixture.transport.in_flight(TOPIC, BILLING_SUBSCRIPTION).await,
        0
    );
    assert_eq!(fixture.transport.stats().await.messages_completed, 1);
    assert_eq!(fixture.ordering.stats().await.events_published, 1);
}

#[tokio::test]
async fn test_unrelated_events_are_not_routed() {
    let fixture = TestFixture::new();
    let handler = RecordingHandler::default();
    fixture
        .billing
        .subscribe::<OrderCreatedIntegrationEvent, _>(handler.clone())
        .await
        .unwrap();

    fixture
        .ordering
        .publish_raw("OrderShippedIntegrationEvent", br#"{"order_id":1}"#.to_vec())
        .await
        .unwrap();
    fixture
        .ordering
        .publish(&OrderCreatedIntegrationEvent::new(2))
        .await
        .unwrap();
    fixture.wait_for_completed(1).await;

    assert_eq!(handler.orders(), vec![2]);
    assert_eq!(fixture.billing.stats().await.messages_received, 1);
}

#[tokio::test]
async fn test_unsubscribe_stops_routing_and_acks_routed_messages() {
    let fixture = TestFixture::new();
    let handler = RecordingHandler::default();
    fixture
        .billing
        .subscribe::<OrderCreatedIntegrationEvent, _>(handler.clone())
        .await
        .unwrap();

    fixture
        .ordering
        .publish(&OrderCreatedIntegrationEvent::new(1))
        .await
        .unwrap();
    fixture.wait_for_completed(1).await;

    fixture
        .billing
        .unsubscribe::<OrderCreatedIntegrationEvent, RecordingHandler>()
        .await
        .unwrap();
    assert!(!fixture
        .billing
        .subscriptions()
        .has_subscription("OrderCreated")
        .await);
    assert!(fixture
        .transport
        .rule_names(TOPIC, BILLING_SUBSCRIPTION)
        .await
        .is_empty());

    // New publishes no longer reach the subscription
    fixture
        .ordering
        .publish(&OrderCreatedIntegrationEvent::new(2))
        .await
        .unwrap();

    // A message routed before the rule went away finds no handler and is completed
    fixture
        .transport
        .inject(
            TOPIC,
            BILLING_SUBSCRIPTION,
            OutgoingMessage::new("OrderCreated", br#"{"order_id":3}"#.to_vec()),
        )
        .await
        .unwrap();
    fixture.wait_for_completed(2).await;

    assert_eq!(handler.orders(), vec![1]);
    assert_eq!(fixture.billing.stats().await.messages_received, 2);
    assert_eq!(
        fixture.transport.in_flight(TOPIC, BILLING_SUBSCRIPTION).await,
        0
    );
}

#[tokio::test]
async fn test_resubscribe_restores_routing() {
    let fixture = TestFixture::new();
    let handler = RecordingHandler::default();

    fixture
        .billing
        .subscribe::<OrderCreatedIntegrationEvent, _>(handler.clone())
        .await
        .unwrap();
    fixture
        .billing
        .unsubscribe::<OrderCreatedIntegrationEvent, RecordingHandler>()
        .await
        .unwrap();
    fixture
        .billing
        .subscribe::<OrderCreatedIntegrationEvent, _>(handler.clone())
        .await
        .unwrap();

    fixture
        .ordering
        .publish(&OrderCreatedIntegrationEvent::new(7))
        .await
        .unwrap();
    fixture.wait_for_completed(1).await;

    assert_eq!(handler.orders(), vec![7]);
    let stats = fixture.transport.stats().await;
    assert_eq!(stats.subscriptions_created, 1);
    assert_eq!(stats.rules_added, 2);
}

// ============================================================================
// Failure And Redelivery
// ============================================================================

#[tokio::test]
async fn test_failed_handler_leaves_message_for_redelivery() {
    let fixture = TestFixture::new();
    let flaky = FailOnceHandler::default();
    let recorder = RecordingHandler::default();
    fixture
        .billing
        .subscribe::<OrderCreatedIntegrationEvent, _>(flaky.clone())
        .await
        .unwrap();
    fixture
        .billing
        .subscribe::<OrderCreatedIntegrationEvent, _>(recorder.clone())
        .await
        .unwrap();

    fixture
        .ordering
        .publish(&OrderCreatedIntegrationEvent::new(9))
        .await
        .unwrap();
    fixture.wait_for_abandoned(1).await;

    // The healthy handler ran; the message was not completed
    assert_eq!(recorder.orders(), vec![9]);
    assert_eq!(fixture.billing.stats().await.messages_completed, 0);
    assert_eq!(
        fixture.transport.in_flight(TOPIC, BILLING_SUBSCRIPTION).await,
        1
    );

    let redelivered = fixture
        .transport
        .redeliver_unacknowledged(TOPIC, BILLING_SUBSCRIPTION)
        .await
        .unwrap();
    assert_eq!(redelivered, 1);
    fixture.wait_for_completed(1).await;

    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 2);
    // At-least-once: the healthy handler saw the event twice
    assert_eq!(recorder.orders(), vec![9, 9]);
    assert_eq!(
        fixture.transport.in_flight(TOPIC, BILLING_SUBSCRIPTION).await,
        0
    );
}

#[tokio::test]
async fn test_publish_failure_is_reported() {
    let fixture = TestFixture::new();
    fixture.transport.fail_with(
        TransportOperation::Send,
        TransportError::Connection("broker unreachable".into()),
    );

    let err = fixture
        .ordering
        .publish(&OrderCreatedIntegrationEvent::new(1))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EventBusError::PublishFailed { ref event_name, .. } if event_name == "OrderCreated"
    ));
    assert_eq!(err.error_code(), "PUBLISH_FAILED");
    assert_eq!(fixture.ordering.stats().await.events_published, 0);

    // No retry happened behind the caller's back
    assert_eq!(fixture.transport.stats().await.messages_sent, 0);
}

// ============================================================================
// Provisioning
// ============================================================================

#[tokio::test]
async fn test_concurrent_first_subscribes_provision_once() {
    let fixture = TestFixture::new();
    let billing = Arc::new(fixture.billing);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let billing = billing.clone();
            tokio::spawn(async move {
                billing
                    .subscribe_dynamic(
                        "OrderCreatedIntegrationEvent",
                        format!("audit-{}", i),
                        OverlapTracker::default(),
                    )
                    .await
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        task.unwrap().unwrap();
    }

    let stats = fixture.transport.stats().await;
    assert_eq!(stats.topics_created, 1);
    assert_eq!(stats.subscriptions_created, 1);
    assert_eq!(stats.rules_added, 1);
    assert_eq!(billing.subscriptions().handler_count().await, 8);
    assert_eq!(
        billing.subscriptions().event_names().await,
        vec!["OrderCreated".to_string()]
    );
}

#[tokio::test]
async fn test_provisioning_failure_records_nothing() {
    let fixture = TestFixture::new();
    fixture.transport.fail_with(
        TransportOperation::CreateSubscription,
        TransportError::Connection("broker unreachable".into()),
    );

    let err = fixture
        .billing
        .subscribe::<OrderCreatedIntegrationEvent, _>(RecordingHandler::default())
        .await
        .unwrap_err();

    assert!(matches!(err, EventBusError::RoutingProvisionFailed { .. }));
    assert!(!fixture
        .billing
        .subscriptions()
        .has_subscription("OrderCreated")
        .await);

    // A retry picks up where provisioning stopped
    fixture
        .billing
        .subscribe::<OrderCreatedIntegrationEvent, _>(RecordingHandler::default())
        .await
        .unwrap();
    let stats = fixture.transport.stats().await;
    assert_eq!(stats.topics_created, 1);
    assert_eq!(stats.subscriptions_created, 1);
    assert_eq!(stats.rules_added, 1);
}

#[tokio::test]
async fn test_consumer_reuses_existing_routing() {
    let fixture = TestFixture::new();

    // Routing left behind by a previous run of the consumer
    fixture.transport.create_topic(TOPIC).await.unwrap();
    fixture
        .transport
        .create_subscription(TOPIC, BILLING_SUBSCRIPTION)
        .await
        .unwrap();
    fixture
        .transport
        .remove_rule(TOPIC, BILLING_SUBSCRIPTION, DEFAULT_RULE_NAME)
        .await
        .unwrap();
    fixture
        .transport
        .add_rule(
            TOPIC,
            BILLING_SUBSCRIPTION,
            RuleDescription::for_event("OrderCreated"),
        )
        .await
        .unwrap();
    let before = fixture.transport.stats().await;

    let handler = RecordingHandler::default();
    fixture
        .billing
        .subscribe::<OrderCreatedIntegrationEvent, _>(handler.clone())
        .await
        .unwrap();

    let after = fixture.transport.stats().await;
    assert_eq!(after.topics_created, before.topics_created);
    assert_eq!(after.subscriptions_created, before.subscriptions_created);
    assert_eq!(after.rules_added, before.rules_added);
    assert_eq!(after.rules_removed, before.rules_removed);

    fixture
        .ordering
        .publish(&OrderCreatedIntegrationEvent::new(11))
        .await
        .unwrap();
    fixture.wait_for_completed(1).await;
    assert_eq!(handler.orders(), vec![11]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backlog_is_handled_after_subscribe() {
    for _ in 0..10 {
        let fixture = TestFixture::new();

        // Messages routed while the consumer was down
        fixture.transport.create_topic(TOPIC).await.unwrap();
        fixture
            .transport
            .create_subscription(TOPIC, BILLING_SUBSCRIPTION)
            .await
            .unwrap();
        fixture
            .transport
            .remove_rule(TOPIC, BILLING_SUBSCRIPTION, DEFAULT_RULE_NAME)
            .await
            .unwrap();
        fixture
            .transport
            .add_rule(
                TOPIC,
                BILLING_SUBSCRIPTION,
                RuleDescription::for_event("OrderCreated"),
            )
            .await
            .unwrap();
        for order_id in 0..5 {
            fixture
                .ordering
                .publish(&OrderCreatedIntegrationEvent::new(order_id))
                .await
                .unwrap();
        }

        let handler = RecordingHandler::default();
        fixture
            .billing
            .subscribe::<OrderCreatedIntegrationEvent, _>(handler.clone())
            .await
            .unwrap();
        fixture.wait_for_completed(5).await;

        let mut orders = handler.orders();
        orders.sort_unstable();
        assert_eq!(orders, vec![0, 1, 2, 3, 4]);
    }
}

// ============================================================================
// Concurrency And Shutdown
// ============================================================================

#[tokio::test]
async fn test_in_flight_messages_are_bounded() {
    let fixture = TestFixture::with_config(EventBusConfig::new("billing").with_max_concurrent_calls(2));
    let tracker = OverlapTracker::default();
    fixture
        .billing
        .subscribe_dynamic("OrderCreated", "overlap", tracker.clone())
        .await
        .unwrap();

    for order_id in 0..6 {
        fixture
            .ordering
            .publish(&OrderCreatedIntegrationEvent::new(order_id))
            .await
            .unwrap();
    }
    fixture.wait_for_completed(6).await;

    assert_eq!(tracker.peak.load(Ordering::SeqCst), 2);
    assert_eq!(tracker.current.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_dispose_drains_in_flight_work() {
    let fixture = TestFixture::new();
    let handler = SlowHandler::default();
    fixture
        .billing
        .subscribe::<OrderCreatedIntegrationEvent, _>(handler.clone())
        .await
        .unwrap();

    fixture
        .ordering
        .publish(&OrderCreatedIntegrationEvent::new(5))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), handler.started.notified())
        .await
        .expect("handler did not start");

    fixture.billing.dispose().await.unwrap();

    assert!(handler.finished.load(Ordering::SeqCst));
    let stats = fixture.transport.stats().await;
    assert_eq!(stats.messages_completed, 1);
    assert_eq!(stats.close_calls, 1);
    assert!(fixture.billing.subscriptions().is_empty().await);

    assert!(matches!(
        fixture.billing.dispose().await,
        Err(EventBusError::AlreadyDisposed)
    ));
    assert_eq!(fixture.transport.stats().await.close_calls, 1);
}
