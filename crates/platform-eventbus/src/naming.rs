//! Event name normalization.
//!
//! Event types are named after their Rust type (`OrderCreatedIntegrationEvent`),
//! while the broker routes on a short logical name (`OrderCreated`). The
//! resolver maps one to the other and derives per-consumer subscription names.

use crate::config::EventBusConfig;
use crate::event::IntegrationEvent;

/// Normalizes raw type names into logical event names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventNameResolver {
    prefix: Option<String>,
    suffix: Option<String>,
    subscriber_client_app_name: String,
}

impl EventNameResolver {
    /// Create a resolver stripping the given prefix and suffix.
    pub fn new(prefix: Option<String>, suffix: Option<String>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()),
            suffix: suffix.filter(|s| !s.is_empty()),
            subscriber_client_app_name: String::new(),
        }
    }

    /// Create a resolver from bus configuration.
    pub fn from_config(config: &EventBusConfig) -> Self {
        Self {
            subscriber_client_app_name: config.subscriber_client_app_name.clone(),
            ..Self::new(
                config.event_name_prefix.clone(),
                config.event_name_suffix.clone(),
            )
        }
    }

    /// Resolve a raw type name to its logical event name.
    ///
    /// Removes one trailing suffix occurrence and one leading prefix
    /// occurrence. A strip that would leave an empty name is skipped.
    pub fn resolve(&self, raw: &str) -> String {
        let mut name = raw.trim();

        if let Some(suffix) = &self.suffix {
            if let Some(stem) = name.strip_suffix(suffix.as_str()) {
                if !stem.is_empty() {
                    name = stem;
                }
            }
        }

        if let Some(prefix) = &self.prefix {
            if let Some(rest) = name.strip_prefix(prefix.as_str()) {
                if !rest.is_empty() {
                    name = rest;
                }
            }
        }

        name.to_string()
    }

    /// Resolve the logical event name of an event type.
    pub fn resolve_type<E: IntegrationEvent>(&self) -> String {
        self.resolve(E::event_type_name())
    }

    /// Broker subscription name for an event consumed by this application.
    pub fn subscription_name(&self, event_name: &str) -> String {
        let event_name = self.resolve(event_name);
        if self.subscriber_client_app_name.is_empty() {
            event_name
        } else {
            format!("{}.{}", self.subscriber_client_app_name, event_name)
        }
    }
}
