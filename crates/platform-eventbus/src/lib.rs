//! # Platform Event Bus
//!
//! This crate provides the integration event bus for the Relay platform,
//! letting services publish and consume integration events without depending
//! on a specific broker's client API.
//!
//! ## Overview
//!
//! The platform-eventbus crate handles:
//! - **Event Names**: Type names like `OrderCreatedIntegrationEvent` map to
//!   logical names like `OrderCreated`
//! - **Subscriptions**: A registry of event name to handler bindings
//! - **Routing**: Topic, per-event subscription and correlation rule are
//!   created on demand and never duplicated across restarts
//! - **Dispatch**: Every handler of an event runs concurrently; the message is
//!   completed only when all of them succeed
//!
//! ## Features
//!
//! - `memory` (default): In-process broker transport for single-process apps
//!   and tests
//!
//! ## Broker Layout
//!
//! Every event is published to one shared topic with the event name as the
//! message label. Each consuming application gets one subscription per
//! event, named `{app}.{event}`, filtered by a correlation rule on the label:
//!
//! ```text
//! topic: integration-events
//!   ├── billing.OrderCreated   rule OrderCreated (label = "OrderCreated")
//!   └── shipping.OrderCreated  rule OrderCreated (label = "OrderCreated")
//! ```
//!
//! ## Usage
//!
//! ### Publishing Events
//!
//! ```rust,no_run
//! use platform_eventbus::{EventBus, EventBusConfig, EventMeta, IntegrationEvent};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderCreatedIntegrationEvent {
//!     #[serde(flatten)]
//!     meta: EventMeta,
//!     order_id: u64,
//! }
//!
//! impl IntegrationEvent for OrderCreatedIntegrationEvent {}
//!
//! async fn publish_example() {
//!     let bus = EventBus::in_memory(EventBusConfig::new("ordering")).unwrap();
//!
//!     // Published with label "OrderCreated"
//!     bus.publish(&OrderCreatedIntegrationEvent {
//!         meta: EventMeta::new(),
//!         order_id: 42,
//!     })
//!     .await
//!     .unwrap();
//! }
//! ```
//!
//! ### Subscribing to Events
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use platform_eventbus::{EventBus, EventBusConfig, IntegrationEvent, IntegrationEventHandler};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderCreatedIntegrationEvent {
//!     order_id: u64,
//! }
//!
//! impl IntegrationEvent for OrderCreatedIntegrationEvent {}
//!
//! struct ChargeCustomer;
//!
//! #[async_trait]
//! impl IntegrationEventHandler<OrderCreatedIntegrationEvent> for ChargeCustomer {
//!     async fn handle(&self, event: OrderCreatedIntegrationEvent) -> anyhow::Result<()> {
//!         println!("Charging order {}", event.order_id);
//!         Ok(())
//!     }
//! }
//!
//! async fn subscribe_example() {
//!     let bus = EventBus::in_memory(EventBusConfig::from_env()).unwrap();
//!
//!     // Creates billing.OrderCreated and its rule on first use
//!     bus.subscribe::<OrderCreatedIntegrationEvent, _>(ChargeCustomer)
//!         .await
//!         .unwrap();
//!
//!     // ...
//!
//!     bus.dispose().await.unwrap();
//! }
//! ```
//!
//! ## Delivery Semantics
//!
//! Delivery is at-least-once. A message is completed when every handler
//! succeeded or when no handler is bound to its event. If any handler fails
//! the message is left for the broker to redeliver, so handlers must be
//! idempotent.

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod naming;
pub mod receiver;
pub mod routing;
pub mod subscriptions;
pub mod transport;

#[cfg(feature = "memory")]
pub mod memory;

// Re-export main types
pub use bus::{EventBus, EventBusStats};
pub use config::{ConfigError, EventBusConfig};
pub use dispatcher::{DispatchOutcome, EventDispatcher, HandlerFailure};
pub use error::{EventBusError, EventBusResult, TransportError, TransportResult};
pub use event::{DynamicIntegrationEventHandler, EventMeta, IntegrationEvent, IntegrationEventHandler};
pub use naming::EventNameResolver;
pub use receiver::{ReceiveCounters, ReceiveLoop};
pub use routing::{RoutingProvisioner, RoutingState};
pub use subscriptions::{HandlerBinding, HandlerId, SubscriptionManager};
pub use transport::{
    LockToken, MessageReceiver, OutgoingMessage, ReceivedMessage, RuleDescription, RuleFilter,
    Transport, DEFAULT_RULE_NAME,
};

#[cfg(feature = "memory")]
pub use memory::{MemoryTransport, MemoryTransportStats, TransportOperation};
