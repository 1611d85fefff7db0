//! Broker routing provisioning
//!
//! Every event consumed by this application gets a subscription on the shared
//! topic and a correlation rule that only lets messages labeled with the event
//! name through. Provisioning is "create if missing, then trust": each step is
//! checked against the broker once and remembered in [`RoutingState`].

use crate::error::{EventBusError, EventBusResult, TransportError, TransportResult};
use crate::naming::EventNameResolver;
use crate::transport::{RuleDescription, Transport, DEFAULT_RULE_NAME};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Routing objects known to exist on the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingState {
    /// Whether the shared topic exists
    pub topic_exists: bool,
    /// Subscriptions known to exist
    pub subscriptions: HashSet<String>,
    /// Event names whose rule is known to exist
    pub rules: HashSet<String>,
    /// Subscriptions created by us whose default rule is still attached
    pub default_rule_pending: HashSet<String>,
}

/// Creates topics, subscriptions and rules on demand.
pub struct RoutingProvisioner {
    transport: Arc<dyn Transport>,
    topic: String,
    resolver: EventNameResolver,
    state: Mutex<RoutingState>,
}

impl std::fmt::Debug for RoutingProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingProvisioner")
            .field("topic", &self.topic)
            .finish()
    }
}

impl RoutingProvisioner {
    /// Create a provisioner for the shared topic.
    pub fn new(
        transport: Arc<dyn Transport>,
        topic: impl Into<String>,
        resolver: EventNameResolver,
    ) -> Self {
        Self {
            transport,
            topic: topic.into(),
            resolver,
            state: Mutex::new(RoutingState::default()),
        }
    }

    /// Shared topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Snapshot of the routing state.
    pub async fn state(&self) -> RoutingState {
        self.state.lock().await.clone()
    }

    /// Make sure the shared topic exists. Publishers need nothing else.
    pub async fn ensure_topic_exists(&self) -> TransportResult<()> {
        let mut state = self.state.lock().await;
        if !state.topic_exists {
            self.ensure_topic().await?;
            state.topic_exists = true;
        }
        Ok(())
    }

    /// Make sure topic, subscription and rule exist for the event.
    ///
    /// Concurrent callers are serialized; whoever comes second finds the
    /// state already recorded and makes no broker calls.
    pub async fn ensure_routing(&self, event_name: &str) -> EventBusResult<()> {
        let mut state = self.state.lock().await;
        let subscription = self.resolver.subscription_name(event_name);
        let failed = |source: TransportError| EventBusError::RoutingProvisionFailed {
            event_name: event_name.to_string(),
            source,
        };

        if !state.topic_exists {
            self.ensure_topic().await.map_err(failed)?;
            state.topic_exists = true;
        }

        if !state.subscriptions.contains(&subscription) {
            if self.ensure_subscription(&subscription).await.map_err(failed)? {
                state.default_rule_pending.insert(subscription.clone());
            }
            state.subscriptions.insert(subscription.clone());
        }

        if state.default_rule_pending.contains(&subscription) {
            self.remove_default_rule(&subscription)
                .await
                .map_err(failed)?;
            state.default_rule_pending.remove(&subscription);
        }

        if !state.rules.contains(event_name) {
            self.ensure_rule(&subscription, event_name)
                .await
                .map_err(failed)?;
            state.rules.insert(event_name.to_string());
        }

        Ok(())
    }

    /// Remove the event's rule from its subscription.
    ///
    /// A rule that is already gone is logged and ignored.
    pub async fn remove_routing(&self, event_name: &str) -> EventBusResult<()> {
        let mut state = self.state.lock().await;
        let subscription = self.resolver.subscription_name(event_name);

        match self
            .transport
            .remove_rule(&self.topic, &subscription, event_name)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    topic = %self.topic,
                    subscription = %subscription,
                    rule = %event_name,
                    "Removed subscription rule"
                );
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    subscription = %subscription,
                    rule = %event_name,
                    "The messaging entity {} could not be found",
                    event_name
                );
            }
            Err(source) => {
                return Err(EventBusError::RoutingProvisionFailed {
                    event_name: event_name.to_string(),
                    source,
                });
            }
        }

        state.rules.remove(event_name);
        Ok(())
    }

    async fn ensure_topic(&self) -> TransportResult<()> {
        if self.transport.topic_exists(&self.topic).await? {
            return Ok(());
        }

        match self.transport.create_topic(&self.topic).await {
            Ok(()) => {
                tracing::info!(topic = %self.topic, "Created topic");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Returns whether the subscription was created by this call.
    async fn ensure_subscription(&self, subscription: &str) -> TransportResult<bool> {
        if self
            .transport
            .subscription_exists(&self.topic, subscription)
            .await?
        {
            return Ok(false);
        }

        match self
            .transport
            .create_subscription(&self.topic, subscription)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    topic = %self.topic,
                    subscription = %subscription,
                    "Created subscription"
                );
                Ok(true)
            }
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn remove_default_rule(&self, subscription: &str) -> TransportResult<()> {
        match self
            .transport
            .remove_rule(&self.topic, subscription, DEFAULT_RULE_NAME)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    subscription = %subscription,
                    "The messaging entity {} could not be found",
                    DEFAULT_RULE_NAME
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_rule(&self, subscription: &str, event_name: &str) -> TransportResult<()> {
        let expected = RuleDescription::for_event(event_name);

        let existing = match self
            .transport
            .get_rule(&self.topic, subscription, &expected.name)
            .await
        {
            Ok(rule) => rule,
            // Not every broker has an existence query; absence shows up as NotFound
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        match existing {
            Some(rule) if rule.filter == expected.filter => return Ok(()),
            Some(rule) => {
                tracing::warn!(
                    subscription = %subscription,
                    rule = %rule.name,
                    found = ?rule.filter,
                    expected = ?expected.filter,
                    "Replacing subscription rule with mismatched filter"
                );
                match self
                    .transport
                    .remove_rule(&self.topic, subscription, &rule.name)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            None => {}
        }

        match self
            .transport
            .add_rule(&self.topic, subscription, expected)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    subscription = %subscription,
                    rule = %event_name,
                    "Added subscription rule"
                );
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
