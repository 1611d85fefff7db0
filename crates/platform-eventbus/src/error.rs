//! Error types for the event bus and its transports
//!
//! `EventBusError` is what callers of [`EventBus`](crate::EventBus) see.
//! `TransportError` is what a broker client reports; the bus decides which
//! transport errors are benign ("already exists", "not found") and which
//! surface to the caller.

use thiserror::Error;

/// Event bus error types.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// Creating or querying broker routing (topic, subscription, rule) failed
    #[error("Failed to provision routing for event {event_name}: {source}")]
    RoutingProvisionFailed {
        /// Event whose routing was being provisioned
        event_name: String,
        /// Underlying transport failure
        #[source]
        source: TransportError,
    },

    /// Sending a message to the broker failed
    #[error("Failed to publish event {event_name}: {source}")]
    PublishFailed {
        /// Event being published
        event_name: String,
        /// Underlying transport failure
        #[source]
        source: TransportError,
    },

    /// The (event, handler) pair is not registered
    #[error("Handler {handler_id} is not subscribed to event {event_name}")]
    NotSubscribed {
        /// Event name
        event_name: String,
        /// Handler identity
        handler_id: String,
    },

    /// The bus has already been disposed
    #[error("Event bus has already been disposed")]
    AlreadyDisposed,

    /// Event payload could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport failure outside provisioning and publishing
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for event bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;

impl EventBusError {
    /// Get error code for logs and API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            EventBusError::RoutingProvisionFailed { .. } => "ROUTING_PROVISION_FAILED",
            EventBusError::PublishFailed { .. } => "PUBLISH_FAILED",
            EventBusError::NotSubscribed { .. } => "NOT_SUBSCRIBED",
            EventBusError::AlreadyDisposed => "ALREADY_DISPOSED",
            EventBusError::Serialization(_) => "SERIALIZATION_ERROR",
            EventBusError::Transport(_) => "TRANSPORT_ERROR",
        }
    }
}

/// Errors reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The addressed entity (topic, subscription, rule, lock) does not exist
    #[error("Messaging entity not found: {0}")]
    NotFound(String),

    /// The entity being created already exists
    #[error("Messaging entity already exists: {0}")]
    AlreadyExists(String),

    /// The transport has been closed
    #[error("Transport closed")]
    Closed,

    /// Connection to the broker failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker rejected the request
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

impl TransportError {
    /// Whether this is a "not found" response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound(_))
    }

    /// Whether this is an "already exists" response from a racing creator.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, TransportError::AlreadyExists(_))
    }
}
