//! Per-message dispatch: interceptors, route selection, handler invocation,
//! and the acknowledgment decision.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, warn};

use courier_broker::{BrokerConsumer, BrokerError};
use courier_core::{InboundMessage, MessageContext, ProcessingError, extract_field};

use super::acknowledger::Acknowledger;
use super::binding::{HandlerBinding, RouteTable};
use super::{ContainerConfig, UnroutablePolicy};
use crate::dead_letter::{DeadLetterProcessor, DeadLetterRetryStrategy};
use crate::exception::{DEFAULT_RECONSUME_DELAY, ExceptionHandlerRegistry, ResponseAction};
use crate::interceptor::InterceptorChain;

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Handler succeeded (or the failure was mapped to `Ack`).
    Acknowledged,
    /// An interceptor skipped the message; it was acknowledged unhandled.
    Skipped,
    NegativelyAcknowledged,
    ReconsumeLater(Duration),
    DeadLettered,
    /// Handler succeeded with auto-ack off and did not settle the message itself.
    Deferred,
    /// No handler for the route; acknowledged and logged.
    Dropped,
}

/// Container counters, shared with the worker thread.
#[derive(Debug, Default)]
pub struct ContainerStats {
    received: AtomicU64,
    acknowledged: AtomicU64,
    skipped: AtomicU64,
    negatively_acknowledged: AtomicU64,
    reconsumed: AtomicU64,
    dead_lettered: AtomicU64,
    deferred: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
    receive_errors: AtomicU64,
    transport_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContainerStatsSnapshot {
    pub received: u64,
    pub acknowledged: u64,
    pub skipped: u64,
    pub negatively_acknowledged: u64,
    pub reconsumed: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
    pub dropped: u64,
    pub handler_failures: u64,
    pub receive_errors: u64,
    pub transport_errors: u64,
}

impl ContainerStats {
    pub(crate) fn record_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Acknowledged => &self.acknowledged,
            Disposition::Skipped => &self.skipped,
            Disposition::NegativelyAcknowledged => &self.negatively_acknowledged,
            Disposition::ReconsumeLater(_) => &self.reconsumed,
            Disposition::DeadLettered => &self.dead_lettered,
            Disposition::Deferred => &self.deferred,
            Disposition::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ContainerStatsSnapshot {
        ContainerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            negatively_acknowledged: self.negatively_acknowledged.load(Ordering::Relaxed),
            reconsumed: self.reconsumed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

enum Selection<'a> {
    Handler(&'a Arc<HandlerBinding>),
    Unroutable,
}

/// Runs one message through the pipeline and settles it with the broker.
///
/// Used by [`ListenerContainer`](super::ListenerContainer) on its worker
/// thread; also usable directly to drive a consumer from custom code.
pub struct MessageDispatcher {
    topic: String,
    routes: RouteTable,
    config: ContainerConfig,
    interceptors: Arc<InterceptorChain>,
    exceptions: Arc<ExceptionHandlerRegistry>,
    retry: Option<Arc<DeadLetterRetryStrategy>>,
    dead_letters: Option<Arc<DeadLetterProcessor>>,
    stats: Arc<ContainerStats>,
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("topic", &self.topic)
            .field("routes", &self.routes.routes())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MessageDispatcher {
    pub fn new(
        topic: impl Into<String>,
        routes: RouteTable,
        config: ContainerConfig,
        interceptors: Arc<InterceptorChain>,
        exceptions: Arc<ExceptionHandlerRegistry>,
    ) -> Self {
        Self {
            topic: topic.into(),
            routes,
            config,
            interceptors,
            exceptions,
            retry: None,
            dead_letters: None,
            stats: Arc::new(ContainerStats::default()),
        }
    }

    pub fn with_retry_strategy(mut self, retry: Option<Arc<DeadLetterRetryStrategy>>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dead_letter_processor(mut self, processor: Option<Arc<DeadLetterProcessor>>) -> Self {
        self.dead_letters = processor;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn stats(&self) -> &Arc<ContainerStats> {
        &self.stats
    }

    /// Business route of `message`: the route property, else the configured
    /// payload field, else empty.
    pub fn route_of(&self, message: &InboundMessage) -> String {
        if let Some(route) = message
            .property(&self.config.route_property)
            .filter(|r| !r.is_empty())
        {
            return route.to_string();
        }
        self.config
            .route_field
            .as_deref()
            .and_then(|field| extract_field(message.payload(), field))
            .unwrap_or_default()
    }

    fn select(&self, route: &str) -> Selection<'_> {
        if let Some(binding) = self.routes.get(route) {
            return Selection::Handler(binding);
        }
        match (self.config.unroutable, self.routes.default_binding()) {
            (UnroutablePolicy::Fallback, Some(binding)) => Selection::Handler(binding),
            _ => Selection::Unroutable,
        }
    }

    pub fn dispatch(&self, message: &InboundMessage, consumer: &dyn BrokerConsumer) -> Disposition {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let route = self.route_of(message);
        let ctx = MessageContext::from_message(message).with_route(route.clone());

        let disposition = if !self.interceptors.before_receive(message, &ctx) {
            self.settle(consumer.acknowledge(message), message);
            Disposition::Skipped
        } else {
            let (disposition, err) = match self.select(&route) {
                Selection::Handler(binding) => self.invoke(binding, message, &ctx, consumer),
                Selection::Unroutable => self.unroutable(message, &ctx, consumer),
            };
            self.interceptors
                .after_receive(message, &ctx, disposition, err.as_ref());
            disposition
        };

        self.stats.record(disposition);
        disposition
    }

    fn invoke(
        &self,
        binding: &HandlerBinding,
        message: &InboundMessage,
        ctx: &MessageContext,
        consumer: &dyn BrokerConsumer,
    ) -> (Disposition, Option<ProcessingError>) {
        let ack = Acknowledger::new(consumer, message);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| binding.invoke(message, ctx, &ack)))
            .unwrap_or_else(|_| {
                Err(ProcessingError::runtime(format!(
                    "handler for route `{}` panicked",
                    binding.route()
                )))
            });

        if let Err(err) = &outcome {
            self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                topic = %self.topic,
                route = %binding.route(),
                message_id = %message.id(),
                error = %err,
                "handler failed"
            );
        }

        if let Some(settled) = ack.settled() {
            if let Some(retry) = &self.retry {
                retry.clear(message.id());
            }
            return (settled, outcome.err());
        }

        match outcome {
            Ok(()) => {
                if let Some(retry) = &self.retry {
                    retry.clear(message.id());
                }
                if binding.auto_ack() {
                    self.settle(consumer.acknowledge(message), message);
                    (Disposition::Acknowledged, None)
                } else {
                    (Disposition::Deferred, None)
                }
            }
            Err(err) => (self.on_failure(message, ctx, &err, consumer), Some(err)),
        }
    }

    fn on_failure(
        &self,
        message: &InboundMessage,
        ctx: &MessageContext,
        err: &ProcessingError,
        consumer: &dyn BrokerConsumer,
    ) -> Disposition {
        let resolved = self.exceptions.handle(err, message, ctx);
        let retry_count = self
            .retry
            .as_ref()
            .map_or(message.redelivery_count(), |r| r.retry_count(message));

        let exhausted = resolved.action != ResponseAction::Ack
            && self
                .retry
                .as_ref()
                .is_some_and(|r| !r.should_retry(message, retry_count, err));

        if resolved.action == ResponseAction::DeadLetter || exhausted {
            if let Some(disposition) = self.dead_letter(message, err, retry_count, consumer) {
                return disposition;
            }
            warn!(
                topic = %self.topic,
                message_id = %message.id(),
                "no dead-letter processor configured, applying response action"
            );
        }

        let delay = match resolved.action {
            ResponseAction::Ack => {
                if let Some(retry) = &self.retry {
                    retry.clear(message.id());
                }
                self.settle(consumer.acknowledge(message), message);
                return Disposition::Acknowledged;
            }
            ResponseAction::ReconsumeLater => resolved.reconsume_delay.unwrap_or_else(|| {
                self.retry
                    .as_ref()
                    .map_or(DEFAULT_RECONSUME_DELAY, |r| {
                        r.calculate_delay(message, retry_count, err)
                    })
            }),
            ResponseAction::Nack | ResponseAction::DeadLetter => Duration::ZERO,
        };

        if let Some(retry) = &self.retry {
            retry.record_retry(message, retry_count, err, delay);
        }

        if resolved.action == ResponseAction::ReconsumeLater {
            self.settle(consumer.reconsume_later(message, delay), message);
            Disposition::ReconsumeLater(delay)
        } else {
            self.settle(consumer.negative_acknowledge(message), message);
            Disposition::NegativelyAcknowledged
        }
    }

    /// `None` when no processor is configured.
    fn dead_letter(
        &self,
        message: &InboundMessage,
        err: &ProcessingError,
        retry_count: u32,
        consumer: &dyn BrokerConsumer,
    ) -> Option<Disposition> {
        let processor = self.dead_letters.as_ref()?;
        processor.process(message, err, retry_count);
        if let Some(retry) = &self.retry {
            retry.clear(message.id());
        }
        self.settle(consumer.acknowledge(message), message);
        Some(Disposition::DeadLettered)
    }

    fn unroutable(
        &self,
        message: &InboundMessage,
        ctx: &MessageContext,
        consumer: &dyn BrokerConsumer,
    ) -> (Disposition, Option<ProcessingError>) {
        let err = ProcessingError::unroutable(format!(
            "no handler for route `{}` on topic `{}`",
            ctx.route(),
            self.topic
        ));

        let disposition = match self.config.unroutable {
            UnroutablePolicy::DeadLetter => self
                .dead_letter(message, &err, message.redelivery_count(), consumer)
                .unwrap_or_else(|| self.drop_message(message, &err, consumer)),
            UnroutablePolicy::Fallback | UnroutablePolicy::Drop => {
                self.drop_message(message, &err, consumer)
            }
        };
        (disposition, Some(err))
    }

    fn drop_message(
        &self,
        message: &InboundMessage,
        err: &ProcessingError,
        consumer: &dyn BrokerConsumer,
    ) -> Disposition {
        warn!(topic = %self.topic, message_id = %message.id(), error = %err, "dropping unroutable message");
        self.settle(consumer.acknowledge(message), message);
        Disposition::Dropped
    }

    /// Transport errors while settling are logged, never escalated.
    fn settle(&self, result: Result<(), BrokerError>, message: &InboundMessage) {
        match result {
            Ok(()) => debug!(topic = %self.topic, message_id = %message.id(), "message settled"),
            Err(e) => {
                self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                error!(topic = %self.topic, message_id = %message.id(), error = %e, "failed to settle message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use courier_broker::{BrokerClient, InMemoryBroker};
    use courier_core::{MessageId, OutboundMessage, class};

    use crate::dead_letter::DeadLetterConfig;
    use crate::exception::ExceptionHandlerBinding;
    use crate::interceptor::StatsInterceptor;

    struct Fixture {
        broker: InMemoryBroker,
        consumer: Arc<dyn BrokerConsumer>,
    }

    impl Fixture {
        fn new() -> Self {
            let broker = InMemoryBroker::with_nack_delay(Duration::from_secs(60));
            let consumer = broker.subscribe("orders", "test").unwrap();
            Self { broker, consumer }
        }

        fn next(&self, message: OutboundMessage) -> InboundMessage {
            self.broker.publish("orders", message).unwrap();
            self.consumer.receive(Duration::from_millis(100)).unwrap().unwrap()
        }
    }

    fn dispatcher(routes: RouteTable, config: ContainerConfig) -> MessageDispatcher {
        MessageDispatcher::new(
            "orders",
            routes,
            config,
            Arc::new(InterceptorChain::empty()),
            Arc::new(ExceptionHandlerRegistry::new()),
        )
    }

    fn table(bindings: Vec<HandlerBinding>) -> RouteTable {
        let mut table = RouteTable::new();
        for b in bindings {
            table.insert(b).unwrap();
        }
        table
    }

    fn counting(route: &str, hits: &Arc<AtomicUsize>) -> HandlerBinding {
        let hits = hits.clone();
        HandlerBinding::payload_only("orders", route, move |_: String| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn route_comes_from_property_then_payload_field() {
        let d = dispatcher(RouteTable::new(), ContainerConfig::default().with_route_field("kind"));
        let by_property = InboundMessage::new(MessageId::new(0, 1), "orders", r#"{"kind":"paid"}"#)
            .with_property("route", "created");
        let by_field = InboundMessage::new(MessageId::new(0, 2), "orders", r#"{"kind":"paid"}"#);
        let none = InboundMessage::new(MessageId::new(0, 3), "orders", "plain");

        assert_eq!(d.route_of(&by_property), "created");
        assert_eq!(d.route_of(&by_field), "paid");
        assert_eq!(d.route_of(&none), "");
    }

    #[test]
    fn matching_route_wins_over_default() {
        let fx = Fixture::new();
        let default_hits = Arc::new(AtomicUsize::new(0));
        let paid_hits = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(
            table(vec![counting("", &default_hits), counting("paid", &paid_hits)]),
            ContainerConfig::default(),
        );

        let msg = fx.next(OutboundMessage::new("x").with_property("route", "paid"));
        assert_eq!(d.dispatch(&msg, fx.consumer.as_ref()), Disposition::Acknowledged);
        assert_eq!(paid_hits.load(Ordering::SeqCst), 1);
        assert_eq!(default_hits.load(Ordering::SeqCst), 0);

        let other = fx.next(OutboundMessage::new("x").with_property("route", "refunded"));
        assert_eq!(d.dispatch(&other, fx.consumer.as_ref()), Disposition::Acknowledged);
        assert_eq!(default_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unroutable_policies() {
        let fx = Fixture::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let drop = dispatcher(
            table(vec![counting("", &hits)]),
            ContainerConfig::default().with_unroutable(UnroutablePolicy::Drop),
        );
        let msg = fx.next(OutboundMessage::new("x").with_property("route", "nope"));
        assert_eq!(drop.dispatch(&msg, fx.consumer.as_ref()), Disposition::Dropped);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let processor = Arc::new(DeadLetterProcessor::new(fx.broker.producer(), DeadLetterConfig::default()));
        let dead_letter = dispatcher(
            table(vec![counting("paid", &hits)]),
            ContainerConfig::default().with_unroutable(UnroutablePolicy::DeadLetter),
        )
        .with_dead_letter_processor(Some(processor.clone()));
        let msg = fx.next(OutboundMessage::new("x").with_property("route", "nope"));
        assert_eq!(dead_letter.dispatch(&msg, fx.consumer.as_ref()), Disposition::DeadLettered);
        assert_eq!(processor.stats().total, 1);

        let no_default = dispatcher(table(vec![counting("paid", &hits)]), ContainerConfig::default());
        let msg = fx.next(OutboundMessage::new("x"));
        assert_eq!(no_default.dispatch(&msg, fx.consumer.as_ref()), Disposition::Dropped);
    }

    #[test]
    fn auto_ack_off_defers_acknowledgment() {
        let fx = Fixture::new();
        let d = dispatcher(
            table(vec![HandlerBinding::payload_only("orders", "", |_: String| Ok(())).with_auto_ack(false)]),
            ContainerConfig::default(),
        );
        let msg = fx.next(OutboundMessage::new("x"));
        assert_eq!(d.dispatch(&msg, fx.consumer.as_ref()), Disposition::Deferred);
        assert!(fx.broker.acknowledged("orders").is_empty());
    }

    #[test]
    fn manual_ack_handler_acknowledges_itself() {
        let fx = Fixture::new();
        let d = dispatcher(
            table(vec![HandlerBinding::manual_ack(
                "orders",
                "",
                |_: String, _: &InboundMessage, _: &MessageContext, ack: &Acknowledger<'_>| {
                    ack.acknowledge().map_err(|e| ProcessingError::network(e.to_string()))
                },
            )]),
            ContainerConfig::default(),
        );
        let msg = fx.next(OutboundMessage::new("x"));
        assert_eq!(d.dispatch(&msg, fx.consumer.as_ref()), Disposition::Acknowledged);
        assert_eq!(fx.broker.acknowledged("orders"), vec![msg.id()]);
        assert_eq!(d.stats().snapshot().deferred, 0);
    }

    #[test]
    fn settled_then_failed_handler_is_not_settled_twice() {
        let fx = Fixture::new();
        let d = dispatcher(
            table(vec![HandlerBinding::manual_ack(
                "orders",
                "",
                |_: String, _: &InboundMessage, _: &MessageContext, ack: &Acknowledger<'_>| {
                    ack.reconsume_later(Duration::from_secs(2))
                        .map_err(|e| ProcessingError::network(e.to_string()))?;
                    Err(ProcessingError::illegal_state("after settling"))
                },
            )]),
            ContainerConfig::default(),
        );
        let msg = fx.next(OutboundMessage::new("x"));
        assert_eq!(
            d.dispatch(&msg, fx.consumer.as_ref()),
            Disposition::ReconsumeLater(Duration::from_secs(2))
        );
        assert!(fx.broker.negatively_acknowledged("orders").is_empty());
        assert_eq!(d.stats().snapshot().handler_failures, 1);
    }

    #[test]
    fn settle_failures_are_counted_not_escalated() {
        let fx = Fixture::new();
        let d = dispatcher(
            table(vec![HandlerBinding::payload_only("orders", "", |_: String| Ok(()))]),
            ContainerConfig::default(),
        );
        let msg = fx.next(OutboundMessage::new("x"));

        fx.broker.fail_next_settles(1);
        assert_eq!(d.dispatch(&msg, fx.consumer.as_ref()), Disposition::Acknowledged);

        let stats = d.stats().snapshot();
        assert_eq!(stats.transport_errors, 1);
        assert_eq!(stats.acknowledged, 1);
        assert!(fx.broker.acknowledged("orders").is_empty());
    }

    #[test]
    fn after_receive_sees_the_disposition() {
        let fx = Fixture::new();
        let stats = StatsInterceptor::new();
        let d = MessageDispatcher::new(
            "orders",
            table(vec![
                HandlerBinding::payload_only("orders", "", |_: String| Ok(())),
                HandlerBinding::payload_only("orders", "bad", |_: String| {
                    Err(ProcessingError::illegal_argument("bad"))
                }),
            ]),
            ContainerConfig::default(),
            Arc::new(InterceptorChain::builder().with(stats.clone()).build()),
            Arc::new(ExceptionHandlerRegistry::new()),
        );

        let ok = fx.next(OutboundMessage::new("x"));
        d.dispatch(&ok, fx.consumer.as_ref());
        let bad = fx.next(OutboundMessage::new("x").with_property("route", "bad"));
        d.dispatch(&bad, fx.consumer.as_ref());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.acknowledged, 1);
        assert_eq!(snapshot.negatively_acknowledged, 1);
        assert_eq!(snapshot.handled, 1);
        assert_eq!(snapshot.handler_failures, 1);
    }

    #[test]
    fn reconsume_later_uses_binding_delay() {
        let fx = Fixture::new();
        let exceptions = Arc::new(ExceptionHandlerRegistry::new());
        exceptions.register_binding(
            ExceptionHandlerBinding::new(&class::ILLEGAL_STATE, ResponseAction::ReconsumeLater)
                .with_reconsume_delay(Duration::from_secs(5)),
        );
        let d = MessageDispatcher::new(
            "orders",
            table(vec![HandlerBinding::payload_only("orders", "", |_: String| {
                Err(ProcessingError::illegal_state("not yet"))
            })]),
            ContainerConfig::default(),
            Arc::new(InterceptorChain::empty()),
            exceptions,
        );

        let msg = fx.next(OutboundMessage::new("x"));
        assert_eq!(
            d.dispatch(&msg, fx.consumer.as_ref()),
            Disposition::ReconsumeLater(Duration::from_secs(5))
        );
        assert_eq!(fx.broker.reconsumed("orders"), vec![(msg.id(), Duration::from_secs(5))]);
    }

    #[test]
    fn panicking_handler_is_a_runtime_failure() {
        let fx = Fixture::new();
        let d = dispatcher(
            table(vec![HandlerBinding::payload_only("orders", "", |_: String| -> Result<(), ProcessingError> {
                panic!("boom")
            })]),
            ContainerConfig::default(),
        );
        let msg = fx.next(OutboundMessage::new("x"));
        assert_eq!(d.dispatch(&msg, fx.consumer.as_ref()), Disposition::NegativelyAcknowledged);
        assert_eq!(d.stats().snapshot().handler_failures, 1);
    }

    #[test]
    fn ack_action_settles_without_dead_letter() {
        let fx = Fixture::new();
        let exceptions = Arc::new(ExceptionHandlerRegistry::with_default_action(ResponseAction::Ack));
        let processor = Arc::new(DeadLetterProcessor::new(fx.broker.producer(), DeadLetterConfig::default()));
        let d = MessageDispatcher::new(
            "orders",
            table(vec![HandlerBinding::payload_only("orders", "", |_: String| {
                Err(ProcessingError::new(&class::SECURITY, "denied"))
            })]),
            ContainerConfig::default(),
            Arc::new(InterceptorChain::empty()),
            exceptions,
        )
        .with_retry_strategy(Some(Arc::new(DeadLetterRetryStrategy::default())))
        .with_dead_letter_processor(Some(processor.clone()));

        let msg = fx.next(OutboundMessage::new("x"));
        assert_eq!(d.dispatch(&msg, fx.consumer.as_ref()), Disposition::Acknowledged);
        assert_eq!(processor.stats().total, 0);
    }
}
