//! Broker transport abstraction
//!
//! The bus talks to a broker only through [`Transport`]. A transport exposes
//! the topic / subscription / rule primitives of a service-bus style broker,
//! a pull-based [`MessageReceiver`] per subscription, and lock-token
//! completion. "Already exists" and "not found" are reported as distinct
//! [`TransportError`](crate::TransportError) variants so the bus can treat
//! them as benign.

use crate::error::TransportResult;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Name of the catch-all rule brokers attach to new subscriptions.
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// A message handed to the transport for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Unique message ID
    pub message_id: Uuid,
    /// Routing label (the logical event name)
    pub label: String,
    /// Serialized event payload
    pub body: Bytes,
}

impl OutgoingMessage {
    /// Create a message with a fresh unique ID.
    pub fn new(label: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            label: label.into(),
            body: body.into(),
        }
    }
}

/// Opaque capability for completing a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Wrap a broker-issued lock token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message delivered from a subscription.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Unique message ID assigned by the publisher
    pub message_id: Uuid,
    /// Routing label (the logical event name)
    pub label: String,
    /// Raw payload
    pub body: Bytes,
    /// Ack handle for this delivery
    pub lock_token: LockToken,
    /// How many times this message has been delivered, starting at 1
    pub delivery_count: u32,
}

/// Subscription filter predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleFilter {
    /// Matches every message
    True,
    /// Matches messages whose label equals `label`
    Correlation {
        /// Expected message label
        label: String,
    },
}

impl RuleFilter {
    /// Whether a message with this label passes the filter.
    pub fn matches(&self, label: &str) -> bool {
        match self {
            RuleFilter::True => true,
            RuleFilter::Correlation { label: expected } => expected == label,
        }
    }
}

/// A named subscription rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDescription {
    /// Rule name
    pub name: String,
    /// Rule filter
    pub filter: RuleFilter,
}

impl RuleDescription {
    /// The broker's default catch-all rule.
    pub fn default_rule() -> Self {
        Self {
            name: DEFAULT_RULE_NAME.to_string(),
            filter: RuleFilter::True,
        }
    }

    /// A rule routing messages labeled `event_name`, named after the event.
    pub fn for_event(event_name: &str) -> Self {
        Self {
            name: event_name.to_string(),
            filter: RuleFilter::Correlation {
                label: event_name.to_string(),
            },
        }
    }
}

/// Pull side of a broker subscription.
#[async_trait]
pub trait MessageReceiver: Send {
    /// Wait for the next message. `None` once the subscription is closed.
    ///
    /// Must be cancel safe: dropping the future before it resolves must not
    /// lose a message.
    async fn receive(&mut self) -> TransportResult<Option<ReceivedMessage>>;
}

/// Broker client used by the event bus.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a message to a topic.
    async fn send(&self, topic: &str, message: OutgoingMessage) -> TransportResult<()>;

    /// Whether the topic exists.
    async fn topic_exists(&self, topic: &str) -> TransportResult<bool>;

    /// Create a topic.
    async fn create_topic(&self, topic: &str) -> TransportResult<()>;

    /// Whether the subscription exists under the topic.
    async fn subscription_exists(&self, topic: &str, subscription: &str) -> TransportResult<bool>;

    /// Create a subscription under the topic.
    ///
    /// Brokers attach the [`DEFAULT_RULE_NAME`] rule to new subscriptions.
    async fn create_subscription(&self, topic: &str, subscription: &str) -> TransportResult<()>;

    /// Look up a rule. May return `Ok(None)` or `Err(NotFound)` when absent.
    async fn get_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
    ) -> TransportResult<Option<RuleDescription>>;

    /// Add a rule to a subscription.
    async fn add_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: RuleDescription,
    ) -> TransportResult<()>;

    /// Remove a rule from a subscription.
    async fn remove_rule(&self, topic: &str, subscription: &str, rule: &str) -> TransportResult<()>;

    /// Open the receive side of a subscription with manual completion.
    async fn open_receiver(
        &self,
        topic: &str,
        subscription: &str,
    ) -> TransportResult<Box<dyn MessageReceiver>>;

    /// Complete a delivered message so it is not redelivered.
    async fn complete_message(
        &self,
        topic: &str,
        subscription: &str,
        lock_token: &LockToken,
    ) -> TransportResult<()>;

    /// Close every connection held by the transport.
    async fn close(&self) -> TransportResult<()>;
}
