//! Cross-cutting hooks around every send and every receive.
//!
//! Interceptors run synchronously on the calling thread, ascending by
//! [`MessageInterceptor::order`]. A failing hook (error or panic) is logged and
//! skipped; it never aborts the phase and never changes the acknowledgment
//! outcome of a message.

mod builtin;
mod chain;

pub use builtin::{InterceptorStats, LoggingInterceptor, StatsInterceptor};
pub use chain::{InterceptorChain, InterceptorChainBuilder};

use courier_broker::BrokerError;
use courier_core::{InboundMessage, MessageContext, MessageId, OutboundMessage, ProcessingError};
use thiserror::Error;

use crate::listener::Disposition;

/// Failure raised by an interceptor hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("interceptor failed: {0}")]
pub struct InterceptorError(String);

impl InterceptorError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A send/receive hook. Every method has a pass-through default.
pub trait MessageInterceptor: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Lower runs first.
    fn order(&self) -> i32 {
        0
    }

    /// Inspect or rewrite an outbound message. `Ok(None)` vetoes the send.
    fn before_send(
        &self,
        _topic: &str,
        message: OutboundMessage,
    ) -> Result<Option<OutboundMessage>, InterceptorError> {
        Ok(Some(message))
    }

    fn after_send(
        &self,
        _topic: &str,
        _message: &OutboundMessage,
        _id: Option<MessageId>,
        _error: Option<&BrokerError>,
    ) -> Result<(), InterceptorError> {
        Ok(())
    }

    /// `Ok(false)` skips the message: it is acknowledged and never reaches a handler.
    fn before_receive(
        &self,
        _message: &InboundMessage,
        _ctx: &MessageContext,
    ) -> Result<bool, InterceptorError> {
        Ok(true)
    }

    /// Runs once the message is settled, with how it was settled and the
    /// handler failure if there was one. Not called for skipped messages.
    fn after_receive(
        &self,
        _message: &InboundMessage,
        _ctx: &MessageContext,
        _outcome: Disposition,
        _error: Option<&ProcessingError>,
    ) -> Result<(), InterceptorError> {
        Ok(())
    }
}
