//! Listener containers: one subscription, one worker thread, typed handlers
//! selected by business route.

mod acknowledger;
mod binding;
mod container;
mod dispatcher;
mod registry;

pub use acknowledger::Acknowledger;
pub use binding::{HandlerBinding, HandlerFn, RouteTable};
pub use container::{ContainerError, ContainerState, ListenerContainer};
pub use dispatcher::{ContainerStats, ContainerStatsSnapshot, Disposition, MessageDispatcher};
pub use registry::{ContainerGroup, ListenerRegistry, ListenerRuntime, RegistryError};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with a message whose route has no handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnroutablePolicy {
    /// Hand it to the topic's default handler; drop it when there is none.
    #[default]
    Fallback,
    /// Dead-letter it.
    DeadLetter,
    /// Acknowledge and log it.
    Drop,
}

/// Listener container configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub subscription: String,
    /// Message property carrying the business route.
    pub route_property: String,
    /// JSON payload field read when the route property is absent.
    pub route_field: Option<String>,
    pub unroutable: UnroutablePolicy,
    /// How long one receive call blocks; bounds how quickly `stop` is observed.
    #[serde(rename = "receive_timeout_ms", with = "crate::config::duration_ms")]
    pub receive_timeout: Duration,
    /// Pause after a failed receive.
    #[serde(rename = "error_backoff_ms", with = "crate::config::duration_ms")]
    pub error_backoff: Duration,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            subscription: "courier".to_string(),
            route_property: "route".to_string(),
            route_field: None,
            unroutable: UnroutablePolicy::default(),
            receive_timeout: Duration::from_millis(250),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl ContainerConfig {
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = subscription.into();
        self
    }

    pub fn with_route_property(mut self, property: impl Into<String>) -> Self {
        self.route_property = property.into();
        self
    }

    pub fn with_route_field(mut self, field: impl Into<String>) -> Self {
        self.route_field = Some(field.into());
        self
    }

    pub fn with_unroutable(mut self, policy: UnroutablePolicy) -> Self {
        self.unroutable = policy;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}
