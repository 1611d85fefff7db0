//! Integration events and their handlers
//!
//! An integration event is any serde-serializable type that names itself.
//! Handlers are async and return `anyhow::Result` so application errors of
//! any kind can flow back to the dispatcher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event published across service boundaries.
///
/// The default [`event_type_name`](IntegrationEvent::event_type_name) is the
/// last path segment of the Rust type name, e.g. `OrderCreatedIntegrationEvent`.
///
/// ```rust
/// use platform_eventbus::{EventMeta, IntegrationEvent};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderCreatedIntegrationEvent {
///     #[serde(flatten)]
///     meta: EventMeta,
///     order_id: u64,
/// }
///
/// impl IntegrationEvent for OrderCreatedIntegrationEvent {}
///
/// assert_eq!(
///     OrderCreatedIntegrationEvent::event_type_name(),
///     "OrderCreatedIntegrationEvent"
/// );
/// ```
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Raw type name, before prefix/suffix normalization.
    fn event_type_name() -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }
}

/// Handler for one integration event type.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    /// Handle a decoded event.
    async fn handle(&self, event: E) -> anyhow::Result<()>;
}

/// Handler that receives the raw JSON payload of an event.
///
/// Useful when the consumer has no Rust type for the event.
#[async_trait]
pub trait DynamicIntegrationEventHandler: Send + Sync + 'static {
    /// Handle an event payload.
    async fn handle(&self, event_name: &str, payload: serde_json::Value) -> anyhow::Result<()>;
}

/// Envelope fields carried by every integration event.
///
/// Embed it with `#[serde(flatten)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    /// Unique event ID
    pub id: Uuid,
    /// When the event was created
    pub created_date: DateTime<Utc>,
}

impl EventMeta {
    /// Create metadata for a new event.
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            created_date: Utc::now(),
        }
    }

    /// Rebuild metadata for an existing event.
    pub fn with_id(id: Uuid, created_date: DateTime<Utc>) -> Self {
        Self { id, created_date }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip the module path (and any generic arguments) from a type name.
pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
