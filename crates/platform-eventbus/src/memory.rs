//! In-process broker transport.
//!
//! `MemoryTransport` behaves like a service-bus broker inside one process:
//! topics fan messages out to subscriptions, subscriptions filter by rules
//! (new ones get the `$Default` catch-all rule), deliveries carry lock tokens
//! and stay outstanding until completed. Unacknowledged deliveries can be
//! redelivered on demand, standing in for lock expiry.
//!
//! It also records call statistics and supports one-shot fault injection,
//! which the bus tests rely on.

use crate::error::{TransportError, TransportResult};
use crate::transport::{
    LockToken, MessageReceiver, OutgoingMessage, ReceivedMessage, RuleDescription, Transport,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Transport operations that faults can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOperation {
    /// `send`
    Send,
    /// `topic_exists`
    TopicExists,
    /// `create_topic`
    CreateTopic,
    /// `subscription_exists`
    SubscriptionExists,
    /// `create_subscription`
    CreateSubscription,
    /// `get_rule`
    GetRule,
    /// `add_rule`
    AddRule,
    /// `remove_rule`
    RemoveRule,
    /// `open_receiver`
    OpenReceiver,
    /// `complete_message`
    CompleteMessage,
}

/// Counters describing what the transport has been asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTransportStats {
    /// Messages accepted by `send`
    pub messages_sent: u64,
    /// Deliveries handed out by receivers (including redeliveries)
    pub messages_delivered: u64,
    /// Deliveries completed
    pub messages_completed: u64,
    /// Topics created
    pub topics_created: u64,
    /// Subscriptions created
    pub subscriptions_created: u64,
    /// Rules added
    pub rules_added: u64,
    /// Rules removed
    pub rules_removed: u64,
    /// Calls to topic, subscription and rule management operations
    pub management_calls: u64,
    /// Calls to `close`
    pub close_calls: u64,
}

#[derive(Debug)]
struct Fault {
    error: TransportError,
    apply_first: bool,
}

#[derive(Debug)]
struct SubscriptionState {
    rules: BTreeMap<String, RuleDescription>,
    sender: Option<mpsc::UnboundedSender<ReceivedMessage>>,
    receiver: Option<mpsc::UnboundedReceiver<ReceivedMessage>>,
    in_flight: HashMap<LockToken, ReceivedMessage>,
}

impl SubscriptionState {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let default_rule = RuleDescription::default_rule();
        let mut rules = BTreeMap::new();
        rules.insert(default_rule.name.clone(), default_rule);
        Self {
            rules,
            sender: Some(sender),
            receiver: Some(receiver),
            in_flight: HashMap::new(),
        }
    }

    fn enqueue(&self, message: ReceivedMessage) -> bool {
        match &self.sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct TopicState {
    subscriptions: HashMap<String, SubscriptionState>,
}

#[derive(Debug, Default)]
struct Inner {
    closed: bool,
    topics: HashMap<String, TopicState>,
    stats: MemoryTransportStats,
    faults: HashMap<TransportOperation, VecDeque<Fault>>,
}

impl Inner {
    fn subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> TransportResult<&SubscriptionState> {
        self.topics
            .get(topic)
            .ok_or_else(|| TransportError::NotFound(topic.to_string()))?
            .subscriptions
            .get(subscription)
            .ok_or_else(|| TransportError::NotFound(format!("{}/{}", topic, subscription)))
    }

    fn subscription_mut(
        &mut self,
        topic: &str,
        subscription: &str,
    ) -> TransportResult<&mut SubscriptionState> {
        self.topics
            .get_mut(topic)
            .ok_or_else(|| TransportError::NotFound(topic.to_string()))?
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| TransportError::NotFound(format!("{}/{}", topic, subscription)))
    }

    fn take_fault(&mut self, op: TransportOperation) -> Option<Fault> {
        self.faults.get_mut(&op).and_then(VecDeque::pop_front)
    }
}

/// In-process broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTransport {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent across a panicking holder; every mutation is a single step
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next call of `op` fail with `error` without touching state.
    pub fn fail_with(&self, op: TransportOperation, error: TransportError) {
        self.lock().faults.entry(op).or_default().push_back(Fault {
            error,
            apply_first: false,
        });
    }

    /// Make the next call of `op` take effect and then report `error`.
    ///
    /// Models a racing creator: the entity ends up existing while this
    /// caller sees "already exists".
    pub fn fail_after_applying(&self, op: TransportOperation, error: TransportError) {
        self.lock().faults.entry(op).or_default().push_back(Fault {
            error,
            apply_first: true,
        });
    }

    /// Snapshot of the call counters.
    pub async fn stats(&self) -> MemoryTransportStats {
        self.lock().stats.clone()
    }

    /// Whether `close` has been called.
    pub async fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Names of the rules attached to a subscription, sorted.
    pub async fn rule_names(&self, topic: &str, subscription: &str) -> Vec<String> {
        let inner = self.lock();
        inner
            .subscription(topic, subscription)
            .map(|s| s.rules.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of deliveries handed out but not completed.
    pub async fn in_flight(&self, topic: &str, subscription: &str) -> usize {
        let inner = self.lock();
        inner
            .subscription(topic, subscription)
            .map(|s| s.in_flight.len())
            .unwrap_or(0)
    }

    /// Put a message straight into a subscription, bypassing its rules.
    pub async fn inject(
        &self,
        topic: &str,
        subscription: &str,
        message: OutgoingMessage,
    ) -> TransportResult<()> {
        let inner = self.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        let state = inner.subscription(topic, subscription)?;
        if state.enqueue(delivery(&message, 1)) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Redeliver every outstanding delivery of a subscription.
    ///
    /// Stands in for lock expiry: the old lock tokens become invalid and the
    /// messages are queued again with an incremented delivery count.
    pub async fn redeliver_unacknowledged(
        &self,
        topic: &str,
        subscription: &str,
    ) -> TransportResult<usize> {
        let mut inner = self.lock();
        let state = inner.subscription_mut(topic, subscription)?;

        let expired: Vec<ReceivedMessage> = state.in_flight.drain().map(|(_, m)| m).collect();
        let count = expired.len();
        for message in expired {
            let mut again = message;
            again.lock_token = LockToken::new(Uuid::now_v7().to_string());
            again.delivery_count += 1;
            state.enqueue(again);
        }

        Ok(count)
    }

    /// Shared entry for every operation: yields, then applies injected faults.
    async fn begin(&self, op: TransportOperation) -> TransportResult<Option<TransportError>> {
        tokio::task::yield_now().await;

        let mut inner = self.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        if !matches!(
            op,
            TransportOperation::Send
                | TransportOperation::OpenReceiver
                | TransportOperation::CompleteMessage
        ) {
            inner.stats.management_calls += 1;
        }

        match inner.take_fault(op) {
            Some(Fault {
                error,
                apply_first: false,
            }) => Err(error),
            Some(Fault {
                error,
                apply_first: true,
            }) => Ok(Some(error)),
            None => Ok(None),
        }
    }
}

fn delivery(message: &OutgoingMessage, delivery_count: u32) -> ReceivedMessage {
    ReceivedMessage {
        message_id: message.message_id,
        label: message.label.clone(),
        body: message.body.clone(),
        lock_token: LockToken::new(Uuid::now_v7().to_string()),
        delivery_count,
    }
}

fn finish<T>(result: TransportResult<T>, late_fault: Option<TransportError>) -> TransportResult<T> {
    match late_fault {
        Some(error) => Err(error),
        None => result,
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, topic: &str, message: OutgoingMessage) -> TransportResult<()> {
        let late = self.begin(TransportOperation::Send).await?;
        let mut inner = self.lock();

        let topic_state = inner
            .topics
            .get(topic)
            .ok_or_else(|| TransportError::NotFound(topic.to_string()))?;

        for state in topic_state.subscriptions.values() {
            if state.rules.values().any(|r| r.filter.matches(&message.label)) {
                state.enqueue(delivery(&message, 1));
            }
        }
        inner.stats.messages_sent += 1;

        finish(Ok(()), late)
    }

    async fn topic_exists(&self, topic: &str) -> TransportResult<bool> {
        let late = self.begin(TransportOperation::TopicExists).await?;
        let exists = self.lock().topics.contains_key(topic);
        finish(Ok(exists), late)
    }

    async fn create_topic(&self, topic: &str) -> TransportResult<()> {
        let late = self.begin(TransportOperation::CreateTopic).await?;
        let mut inner = self.lock();

        if inner.topics.contains_key(topic) {
            return Err(TransportError::AlreadyExists(topic.to_string()));
        }
        inner.topics.insert(topic.to_string(), TopicState::default());
        inner.stats.topics_created += 1;

        finish(Ok(()), late)
    }

    async fn subscription_exists(&self, topic: &str, subscription: &str) -> TransportResult<bool> {
        let late = self.begin(TransportOperation::SubscriptionExists).await?;
        let exists = self.lock().subscription(topic, subscription).is_ok();
        finish(Ok(exists), late)
    }

    async fn create_subscription(&self, topic: &str, subscription: &str) -> TransportResult<()> {
        let late = self.begin(TransportOperation::CreateSubscription).await?;
        let mut inner = self.lock();

        let topic_state = inner
            .topics
            .get_mut(topic)
            .ok_or_else(|| TransportError::NotFound(topic.to_string()))?;
        if topic_state.subscriptions.contains_key(subscription) {
            return Err(TransportError::AlreadyExists(format!(
                "{}/{}",
                topic, subscription
            )));
        }
        topic_state
            .subscriptions
            .insert(subscription.to_string(), SubscriptionState::new());
        inner.stats.subscriptions_created += 1;

        finish(Ok(()), late)
    }

    async fn get_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
    ) -> TransportResult<Option<RuleDescription>> {
        let late = self.begin(TransportOperation::GetRule).await?;
        let inner = self.lock();

        // Like the management APIs it models, a missing rule is NotFound rather than None
        let found = inner
            .subscription(topic, subscription)?
            .rules
            .get(rule)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(format!("{}/{}/{}", topic, subscription, rule)))?;

        finish(Ok(Some(found)), late)
    }

    async fn add_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: RuleDescription,
    ) -> TransportResult<()> {
        let late = self.begin(TransportOperation::AddRule).await?;
        let mut inner = self.lock();

        let state = inner.subscription_mut(topic, subscription)?;
        if state.rules.contains_key(&rule.name) {
            return Err(TransportError::AlreadyExists(rule.name));
        }
        state.rules.insert(rule.name.clone(), rule);
        inner.stats.rules_added += 1;

        finish(Ok(()), late)
    }

    async fn remove_rule(&self, topic: &str, subscription: &str, rule: &str) -> TransportResult<()> {
        let late = self.begin(TransportOperation::RemoveRule).await?;
        let mut inner = self.lock();

        let state = inner.subscription_mut(topic, subscription)?;
        if state.rules.remove(rule).is_none() {
            return Err(TransportError::NotFound(format!(
                "{}/{}/{}",
                topic, subscription, rule
            )));
        }
        inner.stats.rules_removed += 1;

        finish(Ok(()), late)
    }

    async fn open_receiver(
        &self,
        topic: &str,
        subscription: &str,
    ) -> TransportResult<Box<dyn MessageReceiver>> {
        self.begin(TransportOperation::OpenReceiver).await?;
        let mut inner = self.lock();

        let receiver = inner
            .subscription_mut(topic, subscription)?
            .receiver
            .take()
            .ok_or_else(|| {
                TransportError::Rejected(format!(
                    "receiver for {}/{} is already open",
                    topic, subscription
                ))
            })?;

        Ok(Box::new(MemoryReceiver {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            receiver,
            inner: self.inner.clone(),
        }))
    }

    async fn complete_message(
        &self,
        topic: &str,
        subscription: &str,
        lock_token: &LockToken,
    ) -> TransportResult<()> {
        let late = self.begin(TransportOperation::CompleteMessage).await?;
        let mut inner = self.lock();

        let state = inner.subscription_mut(topic, subscription)?;
        if state.in_flight.remove(lock_token).is_none() {
            return Err(TransportError::NotFound(format!("lock token {}", lock_token)));
        }
        inner.stats.messages_completed += 1;

        finish(Ok(()), late)
    }

    async fn close(&self) -> TransportResult<()> {
        let mut inner = self.lock();
        inner.stats.close_calls += 1;
        inner.closed = true;

        for topic in inner.topics.values_mut() {
            for state in topic.subscriptions.values_mut() {
                state.sender = None;
            }
        }

        Ok(())
    }
}

/// Receive side of a [`MemoryTransport`] subscription.
struct MemoryReceiver {
    topic: String,
    subscription: String,
    receiver: mpsc::UnboundedReceiver<ReceivedMessage>,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl MessageReceiver for MemoryReceiver {
    async fn receive(&mut self) -> TransportResult<Option<ReceivedMessage>> {
        let Some(message) = self.receiver.recv().await else {
            return Ok(None);
        };

        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.closed {
            return Ok(None);
        }
        inner.stats.messages_delivered += 1;
        if let Ok(state) = inner.subscription_mut(&self.topic, &self.subscription) {
            state
                .in_flight
                .insert(message.lock_token.clone(), message.clone());
        }

        Ok(Some(message))
    }
}
