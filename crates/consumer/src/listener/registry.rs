//! Startup registration of handler bindings and container assembly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use courier_broker::BrokerClient;

use super::binding::{HandlerBinding, RouteTable};
use super::container::{ContainerError, ListenerContainer};
use super::dispatcher::MessageDispatcher;
use super::ContainerConfig;
use crate::dead_letter::{DeadLetterProcessor, DeadLetterRetryStrategy};
use crate::exception::ExceptionHandlerRegistry;
use crate::interceptor::InterceptorChain;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a handler is already bound to topic `{topic}` route `{route}`")]
    DuplicateRoute { topic: String, route: String },

    #[error("handler binding has an empty topic")]
    EmptyTopic,
}

/// Collaborators shared by every container.
#[derive(Clone)]
pub struct ListenerRuntime {
    pub client: Arc<dyn BrokerClient>,
    pub interceptors: Arc<InterceptorChain>,
    pub exceptions: Arc<ExceptionHandlerRegistry>,
    pub retry: Option<Arc<DeadLetterRetryStrategy>>,
    pub dead_letters: Option<Arc<DeadLetterProcessor>>,
    /// Used for topics without their own configuration.
    pub config: ContainerConfig,
}

impl std::fmt::Debug for ListenerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRuntime")
            .field("interceptors", &self.interceptors.names())
            .field("exceptions", &self.exceptions)
            .field("retry", &self.retry.is_some())
            .field("dead_letters", &self.dead_letters.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ListenerRuntime {
    /// No interceptors, an empty exception registry, no dead-letter handling.
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self {
            client,
            interceptors: Arc::new(InterceptorChain::empty()),
            exceptions: Arc::new(ExceptionHandlerRegistry::new()),
            retry: None,
            dead_letters: None,
            config: ContainerConfig::default(),
        }
    }

    pub fn with_interceptors(mut self, chain: InterceptorChain) -> Self {
        self.interceptors = Arc::new(chain);
        self
    }

    pub fn with_exception_registry(mut self, registry: Arc<ExceptionHandlerRegistry>) -> Self {
        self.exceptions = registry;
        self
    }

    pub fn with_retry_strategy(mut self, retry: Arc<DeadLetterRetryStrategy>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_dead_letter_processor(mut self, processor: Arc<DeadLetterProcessor>) -> Self {
        self.dead_letters = Some(processor);
        self
    }

    pub fn with_config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }
}

/// Handler bindings collected at startup, grouped by topic.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    topics: BTreeMap<String, RouteTable>,
    overrides: HashMap<String, ContainerConfig>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding. `(topic, route)` must be unique.
    pub fn register(&mut self, binding: HandlerBinding) -> Result<(), RegistryError> {
        if binding.topic().trim().is_empty() {
            return Err(RegistryError::EmptyTopic);
        }

        let topic = binding.topic().to_string();
        let route = binding.route().to_string();
        let payload_type = binding.payload_type();
        self.topics
            .entry(topic.clone())
            .or_default()
            .insert(binding)
            .map_err(|_| RegistryError::DuplicateRoute {
                topic: topic.clone(),
                route: route.clone(),
            })?;

        info!(topic = %topic, route = %route, payload_type, "handler registered");
        Ok(())
    }

    /// Use `config` instead of the runtime default for `topic`.
    pub fn configure_topic(&mut self, topic: impl Into<String>, config: ContainerConfig) {
        self.overrides.insert(topic.into(), config);
    }

    pub fn topics(&self) -> Vec<&str> {
        self.topics.keys().map(String::as_str).collect()
    }

    pub fn routes(&self, topic: &str) -> Option<&RouteTable> {
        self.topics.get(topic)
    }

    /// One container per topic; nothing is started.
    pub fn build(&self, runtime: &ListenerRuntime) -> ContainerGroup {
        let containers = self
            .topics
            .iter()
            .map(|(topic, routes)| {
                let config = self
                    .overrides
                    .get(topic)
                    .cloned()
                    .unwrap_or_else(|| runtime.config.clone());
                let dispatcher = MessageDispatcher::new(
                    topic.clone(),
                    routes.clone(),
                    config,
                    runtime.interceptors.clone(),
                    runtime.exceptions.clone(),
                )
                .with_retry_strategy(runtime.retry.clone())
                .with_dead_letter_processor(runtime.dead_letters.clone());
                ListenerContainer::new(runtime.client.clone(), dispatcher)
            })
            .collect();

        ContainerGroup { containers }
    }
}

/// The containers built from one registry.
#[derive(Debug, Default)]
pub struct ContainerGroup {
    containers: Vec<ListenerContainer>,
}

impl ContainerGroup {
    /// Start every container. Containers that fail to start are reported and
    /// the rest keep running; the first error is returned.
    pub fn start_all(&self) -> Result<(), ContainerError> {
        let mut first_error = None;
        for container in &self.containers {
            if let Err(e) = container.start() {
                error!(container = %container.name(), error = %e, "listener container failed to start");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn stop_all(&self) {
        for container in &self.containers {
            container.stop();
        }
    }

    pub fn get(&self, topic: &str) -> Option<&ListenerContainer> {
        self.containers.iter().find(|c| c.topic() == topic)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListenerContainer> {
        self.containers.iter()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}
