//! In-memory subscription registry
//!
//! Maps logical event names to the ordered set of handler bindings that
//! consume them. A binding pairs a handler identity with a type-erased
//! invoker built at subscribe time, so dispatch never inspects types.

use crate::error::{EventBusError, EventBusResult};
use crate::event::{DynamicIntegrationEventHandler, IntegrationEvent, IntegrationEventHandler};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Stable identity of an event handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(String);

impl HandlerId {
    /// Create an explicitly named handler identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity of a handler type.
    pub fn of<H: ?Sized + 'static>() -> Self {
        Self(std::any::type_name::<H>().to_string())
    }

    /// Get the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for HandlerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for HandlerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Decodes a raw payload and invokes a handler with it.
#[async_trait]
pub(crate) trait HandlerInvoker: Send + Sync {
    async fn invoke(&self, event_name: &str, payload: &[u8]) -> anyhow::Result<()>;
}

struct TypedInvoker<E, H> {
    handler: Arc<H>,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> HandlerInvoker for TypedInvoker<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    async fn invoke(&self, _event_name: &str, payload: &[u8]) -> anyhow::Result<()> {
        let event: E = serde_json::from_slice(payload)?;
        self.handler.handle(event).await
    }
}

struct DynamicInvoker<H> {
    handler: Arc<H>,
}

#[async_trait]
impl<H> HandlerInvoker for DynamicInvoker<H>
where
    H: DynamicIntegrationEventHandler,
{
    async fn invoke(&self, event_name: &str, payload: &[u8]) -> anyhow::Result<()> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        self.handler.handle(event_name, value).await
    }
}

/// A handler registered for an event.
///
/// Bindings compare equal when their handler identities match.
#[derive(Clone)]
pub struct HandlerBinding {
    handler_id: HandlerId,
    invoker: Arc<dyn HandlerInvoker>,
}

impl HandlerBinding {
    /// Bind a typed handler; its identity is the handler's type.
    pub fn typed<E, H>(handler: H) -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        Self::typed_arc(Arc::new(handler))
    }

    /// Bind a shared typed handler; its identity is the handler's type.
    pub fn typed_arc<E, H>(handler: Arc<H>) -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        Self {
            handler_id: HandlerId::of::<H>(),
            invoker: Arc::new(TypedInvoker::<E, H> {
                handler,
                _event: PhantomData,
            }),
        }
    }

    /// Bind a handler that receives raw JSON payloads.
    pub fn dynamic<H>(handler_id: impl Into<HandlerId>, handler: H) -> Self
    where
        H: DynamicIntegrationEventHandler,
    {
        Self {
            handler_id: handler_id.into(),
            invoker: Arc::new(DynamicInvoker {
                handler: Arc::new(handler),
            }),
        }
    }

    /// Handler identity.
    pub fn handler_id(&self) -> &HandlerId {
        &self.handler_id
    }

    pub(crate) async fn invoke(&self, event_name: &str, payload: &[u8]) -> anyhow::Result<()> {
        self.invoker.invoke(event_name, payload).await
    }
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("handler_id", &self.handler_id)
            .finish()
    }
}

impl PartialEq for HandlerBinding {
    fn eq(&self, other: &Self) -> bool {
        self.handler_id == other.handler_id
    }
}

impl Eq for HandlerBinding {}

/// Registry of event name → handler bindings.
///
/// Shared by the subscribe path and the dispatch path; every operation
/// goes through one reader/writer lock.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    handlers: RwLock<HashMap<String, Vec<HandlerBinding>>>,
}

impl SubscriptionManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether at least one handler is bound to the event.
    pub async fn has_subscription(&self, event_name: &str) -> bool {
        let handlers = self.handlers.read().await;
        handlers
            .get(event_name)
            .map(|bindings| !bindings.is_empty())
            .unwrap_or(false)
    }

    /// Whether this exact handler is bound to the event.
    pub async fn is_subscribed(&self, event_name: &str, handler_id: &HandlerId) -> bool {
        let handlers = self.handlers.read().await;
        handlers
            .get(event_name)
            .map(|bindings| bindings.iter().any(|b| &b.handler_id == handler_id))
            .unwrap_or(false)
    }

    /// Add a binding. Returns `false` if the pair was already registered.
    pub async fn add_subscription(&self, event_name: &str, binding: HandlerBinding) -> bool {
        let mut handlers = self.handlers.write().await;
        let bindings = handlers.entry(event_name.to_string()).or_default();

        if bindings.contains(&binding) {
            return false;
        }

        bindings.push(binding);
        true
    }

    /// Remove a binding, dropping the event key once no handler remains.
    pub async fn remove_subscription(
        &self,
        event_name: &str,
        handler_id: &HandlerId,
    ) -> EventBusResult<()> {
        let mut handlers = self.handlers.write().await;

        let not_subscribed = || EventBusError::NotSubscribed {
            event_name: event_name.to_string(),
            handler_id: handler_id.to_string(),
        };

        let bindings = handlers.get_mut(event_name).ok_or_else(not_subscribed)?;
        let index = bindings
            .iter()
            .position(|b| &b.handler_id == handler_id)
            .ok_or_else(not_subscribed)?;

        bindings.remove(index);
        if bindings.is_empty() {
            handlers.remove(event_name);
        }

        Ok(())
    }

    /// Handlers bound to the event, in registration order.
    pub async fn get_handlers(&self, event_name: &str) -> Vec<HandlerBinding> {
        let handlers = self.handlers.read().await;
        handlers.get(event_name).cloned().unwrap_or_default()
    }

    /// Event names with at least one handler.
    pub async fn event_names(&self) -> Vec<String> {
        let handlers = self.handlers.read().await;
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Total number of bindings across all events.
    pub async fn handler_count(&self) -> usize {
        let handlers = self.handlers.read().await;
        handlers.values().map(Vec::len).sum()
    }

    /// Whether no event has a handler.
    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }

    /// Remove every binding.
    pub async fn clear(&self) {
        self.handlers.write().await.clear();
    }
}
