//! Event bus facade
//!
//! [`EventBus`] ties the pieces together: publishing goes straight to the
//! transport, subscribing records a handler binding and, for the first
//! handler of an event, provisions broker routing and starts the event's
//! receive loop.

use crate::config::{ConfigError, EventBusConfig};
use crate::dispatcher::EventDispatcher;
use crate::error::{EventBusError, EventBusResult};
use crate::event::{DynamicIntegrationEventHandler, IntegrationEvent, IntegrationEventHandler};
use crate::naming::EventNameResolver;
use crate::receiver::{ReceiveCounters, ReceiveLoop};
use crate::routing::RoutingProvisioner;
use crate::subscriptions::{HandlerBinding, HandlerId, SubscriptionManager};
use crate::transport::{OutgoingMessage, Transport};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Event bus statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusStats {
    /// Total events published
    pub events_published: u64,
    /// Messages pulled from event subscriptions
    pub messages_received: u64,
    /// Messages completed after dispatch
    pub messages_completed: u64,
    /// Messages left unacknowledged because a handler failed
    pub messages_abandoned: u64,
    /// Events with at least one handler
    pub active_subscriptions: usize,
    /// Registered handler bindings
    pub registered_handlers: usize,
}

/// Integration event bus over a broker [`Transport`].
pub struct EventBus {
    config: EventBusConfig,
    resolver: EventNameResolver,
    transport: Arc<dyn Transport>,
    subscriptions: Arc<SubscriptionManager>,
    provisioner: RoutingProvisioner,
    dispatcher: Arc<EventDispatcher>,
    /// Events whose receive loop has been started. Also serializes
    /// subscribe, unsubscribe and dispose.
    receive_loops: Mutex<HashSet<String>>,
    counters: Arc<ReceiveCounters>,
    events_published: AtomicU64,
    disposed: AtomicBool,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topic", &self.config.default_topic_name)
            .field("subscriber", &self.config.subscriber_client_app_name)
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl EventBus {
    /// Create a bus over a transport.
    pub fn new(config: EventBusConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate()?;

        let resolver = EventNameResolver::from_config(&config);
        let subscriptions = Arc::new(SubscriptionManager::new());
        let provisioner = RoutingProvisioner::new(
            transport.clone(),
            config.default_topic_name.clone(),
            resolver.clone(),
        );
        let dispatcher = Arc::new(EventDispatcher::new(resolver.clone(), subscriptions.clone()));

        Ok(Self {
            config,
            resolver,
            transport,
            subscriptions,
            provisioner,
            dispatcher,
            receive_loops: Mutex::new(HashSet::new()),
            counters: Arc::new(ReceiveCounters::default()),
            events_published: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        })
    }

    /// Create a bus over a fresh in-process broker.
    #[cfg(feature = "memory")]
    pub fn in_memory(config: EventBusConfig) -> Result<Self, ConfigError> {
        Self::new(config, Arc::new(crate::memory::MemoryTransport::new()))
    }

    /// Bus configuration.
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Handler registry.
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Name resolver used for publishing and subscribing.
    pub fn resolver(&self) -> &EventNameResolver {
        &self.resolver
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> EventBusResult<()> {
        if self.is_disposed() {
            return Err(EventBusError::AlreadyDisposed);
        }
        Ok(())
    }

    /// Publish an integration event to the shared topic.
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> EventBusResult<()> {
        self.ensure_active()?;
        let event_name = self.resolver.resolve_type::<E>();
        let body = serde_json::to_vec(event)?;
        self.send(event_name, Bytes::from(body)).await
    }

    /// Publish an already serialized payload under an event name.
    pub async fn publish_raw(&self, event_name: &str, body: impl Into<Bytes>) -> EventBusResult<()> {
        self.ensure_active()?;
        let event_name = self.resolver.resolve(event_name);
        self.send(event_name, body.into()).await
    }

    async fn send(&self, event_name: String, body: Bytes) -> EventBusResult<()> {
        let failed = |source| EventBusError::PublishFailed {
            event_name: event_name.clone(),
            source,
        };

        self.provisioner.ensure_topic_exists().await.map_err(failed)?;

        let message = OutgoingMessage::new(event_name.clone(), body);
        let message_id = message.message_id;
        self.transport
            .send(&self.config.default_topic_name, message)
            .await
            .map_err(failed)?;

        self.events_published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            event_name = %event_name,
            message_id = %message_id,
            topic = %self.config.default_topic_name,
            "Published event"
        );

        Ok(())
    }

    /// Subscribe a typed handler to its event.
    pub async fn subscribe<E, H>(&self, handler: H) -> EventBusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_name = self.resolver.resolve_type::<E>();
        self.subscribe_binding(&event_name, HandlerBinding::typed::<E, H>(handler))
            .await
    }

    /// Subscribe a raw JSON handler to an event by name.
    pub async fn subscribe_dynamic<H>(
        &self,
        event_name: &str,
        handler_id: impl Into<HandlerId>,
        handler: H,
    ) -> EventBusResult<()>
    where
        H: DynamicIntegrationEventHandler,
    {
        self.subscribe_binding(event_name, HandlerBinding::dynamic(handler_id, handler))
            .await
    }

    /// Subscribe a prepared binding to an event.
    ///
    /// The binding is recorded first; for the first binding of an event
    /// routing is then provisioned and the event's receive loop started. If
    /// that fails the binding is removed again. Subscribing a bound pair
    /// again is a no-op.
    pub async fn subscribe_binding(
        &self,
        event_name: &str,
        binding: HandlerBinding,
    ) -> EventBusResult<()> {
        self.ensure_active()?;
        let event_name = self.resolver.resolve(event_name);

        let mut receive_loops = self.receive_loops.lock().await;
        self.ensure_active()?;

        if self
            .subscriptions
            .is_subscribed(&event_name, binding.handler_id())
            .await
        {
            tracing::debug!(
                event_name = %event_name,
                handler = %binding.handler_id(),
                "Handler already subscribed"
            );
            return Ok(());
        }

        let first_binding = !self.subscriptions.has_subscription(&event_name).await;
        let handler_id = binding.handler_id().clone();

        // Recorded before any message can be routed or pulled, so a backlog
        // never meets an empty handler set
        self.subscriptions.add_subscription(&event_name, binding).await;

        if first_binding {
            if let Err(e) = self.open_routing(&event_name, &mut receive_loops).await {
                if let Err(rollback) = self
                    .subscriptions
                    .remove_subscription(&event_name, &handler_id)
                    .await
                {
                    tracing::warn!(
                        event_name = %event_name,
                        handler = %handler_id,
                        error = %rollback,
                        "Failed to remove binding after routing failure"
                    );
                }
                return Err(e);
            }
        }

        tracing::info!(
            event_name = %event_name,
            handler = %handler_id,
            "Subscribing to event"
        );

        Ok(())
    }

    async fn open_routing(
        &self,
        event_name: &str,
        receive_loops: &mut HashSet<String>,
    ) -> EventBusResult<()> {
        self.provisioner.ensure_routing(event_name).await?;

        if !receive_loops.contains(event_name) {
            self.start_receive_loop(event_name).await?;
            receive_loops.insert(event_name.to_string());
        }

        Ok(())
    }

    async fn start_receive_loop(&self, event_name: &str) -> EventBusResult<()> {
        let subscription = self.resolver.subscription_name(event_name);
        let receiver = self
            .transport
            .open_receiver(&self.config.default_topic_name, &subscription)
            .await
            .map_err(|source| EventBusError::RoutingProvisionFailed {
                event_name: event_name.to_string(),
                source,
            })?;

        ReceiveLoop::new(
            self.transport.clone(),
            self.dispatcher.clone(),
            self.config.default_topic_name.clone(),
            subscription,
            self.config.max_concurrent_calls,
            self.counters.clone(),
            self.shutdown_token.child_token(),
            self.task_tracker.clone(),
        )
        .spawn(receiver);

        Ok(())
    }

    /// Unsubscribe a typed handler from its event.
    pub async fn unsubscribe<E, H>(&self) -> EventBusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_name = self.resolver.resolve_type::<E>();
        self.unsubscribe_handler(&event_name, &HandlerId::of::<H>())
            .await
    }

    /// Unsubscribe a handler from an event by identity.
    ///
    /// Removing the last handler of an event also removes its broker rule,
    /// so the subscription stops receiving the event. The receive loop keeps
    /// running and resumes once the event is subscribed again.
    pub async fn unsubscribe_handler(
        &self,
        event_name: &str,
        handler_id: &HandlerId,
    ) -> EventBusResult<()> {
        self.ensure_active()?;
        let event_name = self.resolver.resolve(event_name);

        let _receive_loops = self.receive_loops.lock().await;
        self.ensure_active()?;

        if !self.subscriptions.is_subscribed(&event_name, handler_id).await {
            return Err(EventBusError::NotSubscribed {
                event_name,
                handler_id: handler_id.to_string(),
            });
        }

        if self.subscriptions.get_handlers(&event_name).await.len() == 1 {
            self.provisioner.remove_routing(&event_name).await?;
        }

        self.subscriptions
            .remove_subscription(&event_name, handler_id)
            .await?;

        tracing::info!(
            event_name = %event_name,
            handler = %handler_id,
            "Unsubscribed from event"
        );

        Ok(())
    }

    /// Shut the bus down.
    ///
    /// Stops every receive loop, waits for in-flight messages to finish,
    /// closes the transport and clears the registry. Only the first call
    /// does anything; later calls return [`EventBusError::AlreadyDisposed`].
    pub async fn dispose(&self) -> EventBusResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Err(EventBusError::AlreadyDisposed);
        }

        let mut receive_loops = self.receive_loops.lock().await;

        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        let closed = self.transport.close().await;
        self.subscriptions.clear().await;
        receive_loops.clear();

        tracing::info!(
            topic = %self.config.default_topic_name,
            subscriber = %self.config.subscriber_client_app_name,
            "Event bus disposed"
        );

        closed.map_err(EventBusError::from)
    }

    /// Get event bus stats.
    pub async fn stats(&self) -> EventBusStats {
        EventBusStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            messages_received: self.counters.received(),
            messages_completed: self.counters.completed(),
            messages_abandoned: self.counters.abandoned(),
            active_subscriptions: self.subscriptions.event_names().await.len(),
            registered_handlers: self.subscriptions.handler_count().await,
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
