//! Inbound message dispatch
//!
//! Resolves the handlers bound to a message's event name, runs them
//! concurrently and folds their results into a [`DispatchOutcome`]. The
//! outcome decides acknowledgment; the dispatcher itself never retries.

use crate::naming::EventNameResolver;
use crate::subscriptions::{HandlerId, SubscriptionManager};
use crate::transport::ReceivedMessage;
use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;

/// A handler that failed while processing a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Failing handler
    pub handler_id: HandlerId,
    /// Error chain rendered as text
    pub cause: String,
}

/// Result of dispatching one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every bound handler completed
    Success {
        /// Number of handlers invoked
        handled: usize,
    },
    /// No handler is bound to the event
    NoHandler,
    /// At least one handler failed; the others may have completed
    Failed(Vec<HandlerFailure>),
}

impl DispatchOutcome {
    /// Whether the message should be completed at the broker.
    ///
    /// Unroutable events are not a processing failure of this node, so
    /// `NoHandler` is acknowledged too.
    pub fn should_acknowledge(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Success { .. } | DispatchOutcome::NoHandler
        )
    }

    /// Failures, if any.
    pub fn failures(&self) -> &[HandlerFailure] {
        match self {
            DispatchOutcome::Failed(failures) => failures,
            _ => &[],
        }
    }
}

/// Routes inbound messages to their handlers.
#[derive(Debug)]
pub struct EventDispatcher {
    resolver: EventNameResolver,
    subscriptions: Arc<SubscriptionManager>,
}

impl EventDispatcher {
    /// Create a dispatcher over a shared subscription registry.
    pub fn new(resolver: EventNameResolver, subscriptions: Arc<SubscriptionManager>) -> Self {
        Self {
            resolver,
            subscriptions,
        }
    }

    /// Dispatch a delivered message.
    pub async fn dispatch(&self, message: &ReceivedMessage) -> DispatchOutcome {
        let outcome = self.dispatch_payload(&message.label, message.body.clone()).await;

        tracing::debug!(
            message_id = %message.message_id,
            label = %message.label,
            delivery_count = message.delivery_count,
            outcome = ?outcome,
            "Dispatched message"
        );

        outcome
    }

    /// Dispatch a raw payload labeled with an event name.
    ///
    /// Each handler runs in its own task; a panicking handler counts as a
    /// failure instead of tearing down its siblings.
    pub async fn dispatch_payload(&self, label: &str, body: Bytes) -> DispatchOutcome {
        let event_name = self.resolver.resolve(label);
        let bindings = self.subscriptions.get_handlers(&event_name).await;

        if bindings.is_empty() {
            tracing::debug!(event_name = %event_name, "No handler bound to event");
            return DispatchOutcome::NoHandler;
        }

        let (ids, tasks): (Vec<HandlerId>, Vec<_>) = bindings
            .into_iter()
            .map(|binding| {
                let id = binding.handler_id().clone();
                let event_name = event_name.clone();
                let body = body.clone();
                let task =
                    tokio::spawn(async move { binding.invoke(&event_name, &body).await });
                (id, task)
            })
            .unzip();

        let handled = ids.len();
        let mut failures = Vec::new();

        for (handler_id, result) in ids.into_iter().zip(join_all(tasks).await) {
            let cause = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(e) if e.is_panic() => "handler panicked".to_string(),
                Err(e) => format!("handler task failed: {}", e),
            };

            tracing::warn!(
                event_name = %event_name,
                handler = %handler_id,
                error = %cause,
                "Event handler failed"
            );
            failures.push(HandlerFailure { handler_id, cause });
        }

        if failures.is_empty() {
            DispatchOutcome::Success { handled }
        } else {
            DispatchOutcome::Failed(failures)
        }
    }
}
