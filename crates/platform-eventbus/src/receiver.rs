//! Subscription receive loop
//!
//! One loop runs per event subscription. It pulls a message only after it
//! holds a concurrency permit, processes every message in its own tracked
//! task, and completes the message's lock token when the dispatch outcome
//! allows it. Failed messages are left alone; the broker redelivers them
//! once their lock expires.

use crate::dispatcher::EventDispatcher;
use crate::error::TransportError;
use crate::transport::{MessageReceiver, ReceivedMessage, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Pause before pulling again after a receive error.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Message counters shared by every receive loop of a bus.
#[derive(Debug, Default)]
pub struct ReceiveCounters {
    received: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
}

impl ReceiveCounters {
    /// Messages pulled from the broker.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Messages completed after dispatch.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Messages left unacknowledged for redelivery.
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }
}

/// Receive loop for one broker subscription.
#[derive(Clone)]
pub struct ReceiveLoop {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    topic: String,
    subscription: String,
    semaphore: Arc<Semaphore>,
    counters: Arc<ReceiveCounters>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl std::fmt::Debug for ReceiveLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveLoop")
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .field("available_permits", &self.semaphore.available_permits())
            .finish()
    }
}

impl ReceiveLoop {
    /// Create a loop processing at most `max_concurrent_calls` messages at once.
    ///
    /// The limit is used as given and must be at least 1; a zero limit never
    /// pulls a message. The loop and its message tasks are spawned on
    /// `task_tracker` and stop pulling once `shutdown_token` is cancelled.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<EventDispatcher>,
        topic: impl Into<String>,
        subscription: impl Into<String>,
        max_concurrent_calls: usize,
        counters: Arc<ReceiveCounters>,
        shutdown_token: CancellationToken,
        task_tracker: TaskTracker,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            topic: topic.into(),
            subscription: subscription.into(),
            semaphore: Arc::new(Semaphore::new(max_concurrent_calls)),
            counters,
            shutdown_token,
            task_tracker,
        }
    }

    /// Subscription this loop reads from.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Spawn the loop over an opened receiver.
    pub fn spawn(self, receiver: Box<dyn MessageReceiver>) -> JoinHandle<()> {
        let task_tracker = self.task_tracker.clone();
        task_tracker.spawn(self.run(receiver))
    }

    async fn run(self, mut receiver: Box<dyn MessageReceiver>) {
        tracing::info!(
            topic = %self.topic,
            subscription = %self.subscription,
            "Receive loop started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => break,
                received = receiver.receive() => received,
            };

            match received {
                Ok(Some(message)) => {
                    self.counters.received.fetch_add(1, Ordering::Relaxed);
                    let this = self.clone();
                    self.task_tracker
                        .spawn(async move { this.process(message, permit).await });
                }
                Ok(None) | Err(TransportError::Closed) => {
                    tracing::debug!(subscription = %self.subscription, "Receiver closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        subscription = %self.subscription,
                        error = %e,
                        "Failed to receive message"
                    );
                    drop(permit);

                    tokio::select! {
                        _ = self.shutdown_token.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => {}
                    }
                }
            }
        }

        tracing::info!(subscription = %self.subscription, "Receive loop stopped");
    }

    async fn process(&self, message: ReceivedMessage, _permit: OwnedSemaphorePermit) {
        let outcome = self.dispatcher.dispatch(&message).await;

        if !outcome.should_acknowledge() {
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                subscription = %self.subscription,
                message_id = %message.message_id,
                label = %message.label,
                delivery_count = message.delivery_count,
                failed_handlers = outcome.failures().len(),
                "Message left unacknowledged for redelivery"
            );
            return;
        }

        match self
            .transport
            .complete_message(&self.topic, &self.subscription, &message.lock_token)
            .await
        {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(
                    subscription = %self.subscription,
                    message_id = %message.message_id,
                    error = %e,
                    "Failed to complete message"
                );
            }
        }
    }
}
