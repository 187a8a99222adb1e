use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use courier_broker::BrokerError;
use courier_core::{InboundMessage, MessageContext, MessageId, OutboundMessage, ProcessingError};

use super::{InterceptorError, MessageInterceptor};
use crate::listener::Disposition;

/// Ordered, read-only list of interceptors.
///
/// Sorting is stable, so interceptors with equal `order` keep their
/// registration order.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn MessageInterceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("interceptors", &self.names())
            .finish()
    }
}

/// Builder collecting interceptors at startup.
#[derive(Default)]
pub struct InterceptorChainBuilder {
    interceptors: Vec<Arc<dyn MessageInterceptor>>,
}

impl InterceptorChainBuilder {
    pub fn with(mut self, interceptor: impl MessageInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn with_shared(mut self, interceptor: Arc<dyn MessageInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> InterceptorChain {
        InterceptorChain::new(self.interceptors)
    }
}

/// Run one hook, turning errors and panics into a logged `None`.
fn guarded<T>(
    phase: &'static str,
    interceptor: &dyn MessageInterceptor,
    hook: impl FnOnce() -> Result<T, InterceptorError>,
) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            warn!(interceptor = interceptor.name(), phase, error = %err, "interceptor hook failed");
            None
        }
        Err(_) => {
            warn!(interceptor = interceptor.name(), phase, "interceptor hook panicked");
            None
        }
    }
}

impl InterceptorChain {
    pub fn new(mut interceptors: Vec<Arc<dyn MessageInterceptor>>) -> Self {
        interceptors.sort_by_key(|i| i.order());
        Self { interceptors }
    }

    pub fn builder() -> InterceptorChainBuilder {
        InterceptorChainBuilder::default()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Interceptor names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Returns the (possibly rewritten) message, or `None` if a hook vetoed the send.
    ///
    /// A failing hook leaves the message as it was and the next hook runs.
    pub fn before_send(&self, topic: &str, message: OutboundMessage) -> Option<OutboundMessage> {
        let mut current = message;
        for interceptor in &self.interceptors {
            let input = current.clone();
            match guarded("before_send", interceptor.as_ref(), || {
                interceptor.before_send(topic, input)
            }) {
                Some(Some(next)) => current = next,
                Some(None) => {
                    debug!(interceptor = interceptor.name(), topic = %topic, "send vetoed");
                    return None;
                }
                None => {}
            }
        }
        Some(current)
    }

    pub fn after_send(
        &self,
        topic: &str,
        message: &OutboundMessage,
        id: Option<MessageId>,
        error: Option<&BrokerError>,
    ) {
        for interceptor in &self.interceptors {
            guarded("after_send", interceptor.as_ref(), || {
                interceptor.after_send(topic, message, id, error)
            });
        }
    }

    /// `false` as soon as one hook asks to skip the message.
    pub fn before_receive(&self, message: &InboundMessage, ctx: &MessageContext) -> bool {
        for interceptor in &self.interceptors {
            let proceed = guarded("before_receive", interceptor.as_ref(), || {
                interceptor.before_receive(message, ctx)
            })
            .unwrap_or(true);

            if !proceed {
                debug!(
                    interceptor = interceptor.name(),
                    topic = %message.topic(),
                    message_id = %message.id(),
                    "message skipped by interceptor"
                );
                return false;
            }
        }
        true
    }

    pub fn after_receive(
        &self,
        message: &InboundMessage,
        ctx: &MessageContext,
        outcome: Disposition,
        error: Option<&ProcessingError>,
    ) {
        for interceptor in &self.interceptors {
            guarded("after_receive", interceptor.as_ref(), || {
                interceptor.after_receive(message, ctx, outcome, error)
            });
        }
    }
}
