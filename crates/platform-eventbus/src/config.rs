//! Event bus configuration.
//!
//! Configuration is loaded from environment variables with defaults suitable
//! for local development against the in-memory transport.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum number of in-flight messages per event subscription.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 10;

/// Default suffix stripped from event type names.
pub const DEFAULT_EVENT_NAME_SUFFIX: &str = "IntegrationEvent";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },
}

/// Event bus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Broker connection string, passed through to the transport.
    pub connection_string: String,

    /// Shared topic every event is published to.
    pub default_topic_name: String,

    /// Consumer qualifier used to derive per-event subscription names.
    pub subscriber_client_app_name: String,

    /// Prefix stripped from event type names, if any.
    pub event_name_prefix: Option<String>,

    /// Suffix stripped from event type names, if any.
    pub event_name_suffix: Option<String>,

    /// Maximum in-flight messages per event subscription.
    pub max_concurrent_calls: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            connection_string: "memory://local".to_string(),
            default_topic_name: "integration-events".to_string(),
            subscriber_client_app_name: "default".to_string(),
            event_name_prefix: None,
            event_name_suffix: Some(DEFAULT_EVENT_NAME_SUFFIX.to_string()),
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
        }
    }
}

impl EventBusConfig {
    /// Create a configuration for a consuming application.
    pub fn new(subscriber_client_app_name: impl Into<String>) -> Self {
        Self {
            subscriber_client_app_name: subscriber_client_app_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `EVENTBUS_CONNECTION_STRING`: Broker connection string (default: memory://local)
    /// - `EVENTBUS_TOPIC`: Shared topic name (default: integration-events)
    /// - `EVENTBUS_SUBSCRIBER_APP`: Consumer qualifier for subscription names (default: default)
    /// - `EVENTBUS_EVENT_NAME_PREFIX`: Prefix stripped from event names (default: none)
    /// - `EVENTBUS_EVENT_NAME_SUFFIX`: Suffix stripped from event names (default: IntegrationEvent)
    /// - `EVENTBUS_MAX_CONCURRENT_CALLS`: In-flight messages per subscription (default: 10)
    ///
    /// An empty prefix or suffix variable disables stripping.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            connection_string: std::env::var("EVENTBUS_CONNECTION_STRING")
                .unwrap_or(default.connection_string),
            default_topic_name: std::env::var("EVENTBUS_TOPIC")
                .unwrap_or(default.default_topic_name),
            subscriber_client_app_name: std::env::var("EVENTBUS_SUBSCRIBER_APP")
                .unwrap_or(default.subscriber_client_app_name),
            event_name_prefix: match std::env::var("EVENTBUS_EVENT_NAME_PREFIX") {
                Ok(s) => non_empty(s),
                Err(_) => default.event_name_prefix,
            },
            event_name_suffix: match std::env::var("EVENTBUS_EVENT_NAME_SUFFIX") {
                Ok(s) => non_empty(s),
                Err(_) => default.event_name_suffix,
            },
            max_concurrent_calls: std::env::var("EVENTBUS_MAX_CONCURRENT_CALLS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.max_concurrent_calls),
        }
    }

    /// Set the shared topic name.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic_name = topic.into();
        self
    }

    /// Set the connection string.
    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = connection_string.into();
        self
    }

    /// Set the prefix stripped from event names.
    pub fn with_event_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.event_name_prefix = non_empty(prefix.into());
        self
    }

    /// Set the suffix stripped from event names.
    pub fn with_event_name_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.event_name_suffix = non_empty(suffix.into());
        self
    }

    /// Disable suffix stripping.
    pub fn without_event_name_suffix(mut self) -> Self {
        self.event_name_suffix = None;
        self
    }

    /// Set the in-flight message limit per subscription.
    pub fn with_max_concurrent_calls(mut self, limit: usize) -> Self {
        self.max_concurrent_calls = limit;
        self
    }

    /// Validate the configuration before building a bus.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_string.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "connection_string".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.default_topic_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "default_topic_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.subscriber_client_app_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "subscriber_client_app_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_calls".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
