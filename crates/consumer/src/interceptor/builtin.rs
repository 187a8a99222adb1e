use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::debug;

use courier_broker::BrokerError;
use courier_core::{InboundMessage, MessageContext, MessageId, OutboundMessage, ProcessingError};

use super::{InterceptorError, MessageInterceptor};
use crate::listener::Disposition;

/// Logs every phase at `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

impl MessageInterceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "logging"
    }

    fn order(&self) -> i32 {
        i32::MIN
    }

    fn before_send(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<Option<OutboundMessage>, InterceptorError> {
        debug!(topic = %topic, key = ?message.key(), bytes = message.payload().len(), "sending");
        Ok(Some(message))
    }

    fn after_send(
        &self,
        topic: &str,
        _message: &OutboundMessage,
        id: Option<MessageId>,
        error: Option<&BrokerError>,
    ) -> Result<(), InterceptorError> {
        match (id, error) {
            (Some(id), _) => debug!(topic = %topic, message_id = %id, "sent"),
            (None, Some(err)) => debug!(topic = %topic, error = %err, "send failed"),
            (None, None) => {}
        }
        Ok(())
    }

    fn before_receive(
        &self,
        message: &InboundMessage,
        ctx: &MessageContext,
    ) -> Result<bool, InterceptorError> {
        debug!(
            topic = %message.topic(),
            message_id = %message.id(),
            trace_id = %ctx.trace_id(),
            redelivery_count = message.redelivery_count(),
            "received"
        );
        Ok(true)
    }

    fn after_receive(
        &self,
        message: &InboundMessage,
        ctx: &MessageContext,
        outcome: Disposition,
        error: Option<&ProcessingError>,
    ) -> Result<(), InterceptorError> {
        match error {
            None => debug!(
                topic = %message.topic(),
                message_id = %message.id(),
                route = %ctx.route(),
                ?outcome,
                "handled"
            ),
            Some(err) => debug!(
                topic = %message.topic(),
                message_id = %message.id(),
                route = %ctx.route(),
                ?outcome,
                error = %err,
                "handler failed"
            ),
        }
        Ok(())
    }
}

/// Counts traffic through the chain.
///
/// Cloning shares the counters, so a clone can be kept to read them after the
/// interceptor has been handed to a chain.
#[derive(Debug, Default, Clone)]
pub struct StatsInterceptor {
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    send_failures: AtomicU64,
    received: AtomicU64,
    handled: AtomicU64,
    handler_failures: AtomicU64,
    acknowledged: AtomicU64,
    negatively_acknowledged: AtomicU64,
    reconsumed: AtomicU64,
    dead_lettered: AtomicU64,
    deferred: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`StatsInterceptor`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterceptorStats {
    pub sent: u64,
    pub send_failures: u64,
    pub received: u64,
    pub handled: u64,
    pub handler_failures: u64,
    pub acknowledged: u64,
    pub negatively_acknowledged: u64,
    pub reconsumed: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
    pub dropped: u64,
}

impl StatsInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> InterceptorStats {
        InterceptorStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            handled: self.counters.handled.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            negatively_acknowledged: self.counters.negatively_acknowledged.load(Ordering::Relaxed),
            reconsumed: self.counters.reconsumed.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl MessageInterceptor for StatsInterceptor {
    fn name(&self) -> &str {
        "stats"
    }

    fn after_send(
        &self,
        _topic: &str,
        _message: &OutboundMessage,
        _id: Option<MessageId>,
        error: Option<&BrokerError>,
    ) -> Result<(), InterceptorError> {
        let counter = if error.is_some() {
            &self.counters.send_failures
        } else {
            &self.counters.sent
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn before_receive(
        &self,
        _message: &InboundMessage,
        _ctx: &MessageContext,
    ) -> Result<bool, InterceptorError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn after_receive(
        &self,
        _message: &InboundMessage,
        _ctx: &MessageContext,
        outcome: Disposition,
        error: Option<&ProcessingError>,
    ) -> Result<(), InterceptorError> {
        let counter = if error.is_some() {
            &self.counters.handler_failures
        } else {
            &self.counters.handled
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let by_outcome = match outcome {
            Disposition::Acknowledged => Some(&self.counters.acknowledged),
            Disposition::NegativelyAcknowledged => Some(&self.counters.negatively_acknowledged),
            Disposition::ReconsumeLater(_) => Some(&self.counters.reconsumed),
            Disposition::DeadLettered => Some(&self.counters.dead_lettered),
            Disposition::Deferred => Some(&self.counters.deferred),
            Disposition::Dropped => Some(&self.counters.dropped),
            Disposition::Skipped => None,
        };
        if let Some(counter) = by_outcome {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
