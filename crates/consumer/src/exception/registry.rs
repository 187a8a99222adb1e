use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use courier_core::{ErrorClass, InboundMessage, MessageContext, ProcessingError, class};

/// Delay used by [`ResponseAction::ReconsumeLater`] when the binding sets none.
pub const DEFAULT_RECONSUME_DELAY: Duration = Duration::from_secs(60);

/// What the container does with a message whose handler failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    /// Drop the message (expected or unrecoverable failure).
    Ack,
    /// Broker-native redelivery.
    #[default]
    Nack,
    /// Timed redelivery.
    ReconsumeLater,
    /// Hand the message to the dead-letter subsystem right away.
    DeadLetter,
}

/// Side-effect hook run when a binding matches.
pub type ExceptionHandlerFn = Arc<
    dyn Fn(&ProcessingError, &InboundMessage, &MessageContext) -> Result<(), ProcessingError>
        + Send
        + Sync,
>;

/// An error class bound to an optional handler and a response action.
#[derive(Clone)]
pub struct ExceptionHandlerBinding {
    class: &'static ErrorClass,
    handler: Option<ExceptionHandlerFn>,
    action: ResponseAction,
    reconsume_delay: Option<Duration>,
    sequence: usize,
}

impl std::fmt::Debug for ExceptionHandlerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionHandlerBinding")
            .field("class", &self.class.name())
            .field("has_handler", &self.handler.is_some())
            .field("action", &self.action)
            .field("reconsume_delay", &self.reconsume_delay)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl ExceptionHandlerBinding {
    pub fn new(class: &'static ErrorClass, action: ResponseAction) -> Self {
        Self {
            class,
            handler: None,
            action,
            reconsume_delay: None,
            sequence: usize::MAX,
        }
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ProcessingError, &InboundMessage, &MessageContext) -> Result<(), ProcessingError>
            + Send
            + Sync
            + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_reconsume_delay(mut self, delay: Duration) -> Self {
        self.reconsume_delay = Some(delay);
        self
    }

    pub fn class(&self) -> &'static ErrorClass {
        self.class
    }

    pub fn action(&self) -> ResponseAction {
        self.action
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Delay configured on the binding, if any.
    pub fn reconsume_delay(&self) -> Option<Duration> {
        self.reconsume_delay
    }
}

/// Outcome of [`ExceptionHandlerRegistry::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAction {
    pub action: ResponseAction,
    /// Class of the binding that matched.
    pub matched: &'static ErrorClass,
    pub reconsume_delay: Option<Duration>,
}

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub bindings: usize,
    pub cached_classes: usize,
    /// Resolutions that missed the cache and scanned the bindings.
    pub scans: u64,
}

/// Maps error classes to response actions.
///
/// Resolution for a thrown class:
///
/// 1. exact-class cache hit;
/// 2. otherwise the registered binding whose class is the *closest* ancestor
///    (fewest parent hops), ties broken by registration order;
/// 3. otherwise the catch-all `exception` binding (action `Nack`).
///
/// The result is cached per concrete class. Registering a binding clears the
/// cache.
pub struct ExceptionHandlerRegistry {
    bindings: RwLock<Vec<Arc<ExceptionHandlerBinding>>>,
    cache: DashMap<&'static str, Arc<ExceptionHandlerBinding>>,
    fallback: Arc<ExceptionHandlerBinding>,
    next_sequence: AtomicUsize,
    scans: AtomicU64,
}

impl std::fmt::Debug for ExceptionHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionHandlerRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for ExceptionHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionHandlerRegistry {
    pub fn new() -> Self {
        Self::with_default_action(ResponseAction::default())
    }

    /// Registry whose catch-all binding uses `action`.
    pub fn with_default_action(action: ResponseAction) -> Self {
        Self {
            bindings: RwLock::new(Vec::new()),
            cache: DashMap::new(),
            fallback: Arc::new(ExceptionHandlerBinding::new(&class::EXCEPTION, action)),
            next_sequence: AtomicUsize::new(0),
            scans: AtomicU64::new(0),
        }
    }

    /// Bind `class` to a handler and an action.
    pub fn register<F>(&self, class: &'static ErrorClass, handler: F, action: ResponseAction)
    where
        F: Fn(&ProcessingError, &InboundMessage, &MessageContext) -> Result<(), ProcessingError>
            + Send
            + Sync
            + 'static,
    {
        self.register_binding(ExceptionHandlerBinding::new(class, action).with_handler(handler));
    }

    /// Bind `class` to an action with no handler.
    pub fn register_action(&self, class: &'static ErrorClass, action: ResponseAction) {
        self.register_binding(ExceptionHandlerBinding::new(class, action));
    }

    pub fn register_binding(&self, mut binding: ExceptionHandlerBinding) {
        binding.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);

        let mut bindings = self
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        debug!(
            class = binding.class.name(),
            action = ?binding.action,
            "exception binding registered"
        );
        bindings.push(Arc::new(binding));
        self.cache.clear();
    }

    /// Find the binding that applies to `error`.
    pub fn resolve(&self, error: &ProcessingError) -> Arc<ExceptionHandlerBinding> {
        self.resolve_class(error.class())
    }

    pub fn resolve_class(&self, thrown: &'static ErrorClass) -> Arc<ExceptionHandlerBinding> {
        if let Some(hit) = self.cache.get(thrown.name()) {
            return hit.value().clone();
        }

        self.scans.fetch_add(1, Ordering::Relaxed);
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);

        let resolved = bindings
            .iter()
            .filter_map(|b| thrown.distance_to(b.class).map(|d| (d, b.sequence, b)))
            .min_by_key(|(distance, sequence, _)| (*distance, *sequence))
            .map(|(_, _, b)| b.clone())
            .unwrap_or_else(|| self.fallback.clone());

        // Inserted under the read guard so a concurrent register cannot be overtaken.
        self.cache.insert(thrown.name(), resolved.clone());
        resolved
    }

    /// Resolve, run the binding's handler, and return the action to apply.
    ///
    /// A handler that fails or panics is logged; the action still applies.
    pub fn handle(
        &self,
        error: &ProcessingError,
        message: &InboundMessage,
        ctx: &MessageContext,
    ) -> ResolvedAction {
        let binding = self.resolve(error);

        if let Some(handler) = &binding.handler {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(error, message, ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(secondary)) => warn!(
                    topic = %message.topic(),
                    message_id = %message.id(),
                    error = %error,
                    handler_error = %secondary,
                    "exception handler failed"
                ),
                Err(_) => warn!(
                    topic = %message.topic(),
                    message_id = %message.id(),
                    error = %error,
                    "exception handler panicked"
                ),
            }
        }

        ResolvedAction {
            action: binding.action,
            matched: binding.class,
            reconsume_delay: binding.reconsume_delay,
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            bindings: self
                .bindings
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            cached_classes: self.cache.len(),
            scans: self.scans.load(Ordering::Relaxed),
        }
    }
}
