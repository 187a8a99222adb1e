//! `courier-consumer` — the message-consumption runtime.
//!
//! Listener containers pull messages from a broker subscription, run them
//! through the interceptor chain, and dispatch them to typed handlers chosen
//! by business route. Handler failures are mapped to an acknowledgment
//! decision by the exception registry, and the dead-letter subsystem takes
//! over messages that should not be retried any more.

pub mod config;
pub mod dead_letter;
pub mod exception;
pub mod interceptor;
pub mod listener;
pub mod producer;

mod integration_tests;

pub use config::{ConfigError, CourierSettings};
pub use dead_letter::{
    BatchReprocessResult, DeadLetterConfig, DeadLetterManagerConfig, DeadLetterMessage,
    DeadLetterProcessor, DeadLetterQueueManager, DeadLetterRetryStrategy, DeadLetterStore,
    InMemoryDeadLetterStore, RetryStrategyConfig,
};
pub use exception::{ExceptionHandlerBinding, ExceptionHandlerRegistry, ResponseAction};
pub use interceptor::{
    InterceptorChain, InterceptorError, LoggingInterceptor, MessageInterceptor, StatsInterceptor,
};
pub use listener::{
    Acknowledger, ContainerConfig, ContainerError, ContainerGroup, ContainerState, Disposition,
    HandlerBinding, ListenerContainer, ListenerRegistry, ListenerRuntime, MessageDispatcher,
    RegistryError, UnroutablePolicy,
};
pub use producer::{MessageSender, SendError};
