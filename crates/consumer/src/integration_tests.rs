//! End-to-end tests: sender → in-memory broker → listener containers →
//! exception registry → dead-letter subsystem.
//!
//! Verifies:
//! - Successful handling acknowledges the message
//! - Registered response actions are applied without dead-lettering
//! - Retry ceilings hand messages to the dead-letter subsystem
//! - Skipped messages never reach their handler
//! - Dead letters can be reprocessed and swept

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use courier_broker::{BrokerClient, InMemoryBroker};
    use courier_core::{
        ErrorClass, InboundMessage, MessageContext, MessageId, OutboundMessage, ProcessingError,
        TraceId, class,
    };

    use crate::dead_letter::{
        DeadLetterConfig, DeadLetterManagerConfig, DeadLetterMessage, DeadLetterProcessor,
        DeadLetterQueueManager, DeadLetterRetryStrategy, RetryStrategyConfig, keys,
    };
    use crate::exception::{ExceptionHandlerRegistry, ResponseAction};
    use crate::interceptor::{
        InterceptorChain, InterceptorError, LoggingInterceptor, MessageInterceptor, StatsInterceptor,
    };
    use crate::listener::{
        ContainerConfig, ContainerGroup, HandlerBinding, ListenerRegistry, ListenerRuntime,
    };
    use crate::producer::MessageSender;

    static INVENTORY_MISMATCH: ErrorClass =
        ErrorClass::new("inventory_mismatch", Some(&class::RUNTIME));

    struct Harness {
        broker: InMemoryBroker,
        sender: MessageSender,
        processor: Arc<DeadLetterProcessor>,
        group: ContainerGroup,
    }

    fn harness(
        nack_delay: Duration,
        exceptions: ExceptionHandlerRegistry,
        chain: InterceptorChain,
        bindings: Vec<HandlerBinding>,
    ) -> Harness {
        courier_observability::init_for_tests();

        let broker = InMemoryBroker::with_nack_delay(nack_delay);
        let client: Arc<dyn BrokerClient> = Arc::new(broker.clone());
        let processor = Arc::new(DeadLetterProcessor::new(
            client.producer(),
            DeadLetterConfig::default(),
        ));
        let chain = Arc::new(chain);

        let mut runtime = ListenerRuntime::new(client.clone())
            .with_exception_registry(Arc::new(exceptions))
            .with_retry_strategy(Arc::new(DeadLetterRetryStrategy::new(
                RetryStrategyConfig::default().with_jitter(0.0),
            )))
            .with_dead_letter_processor(processor.clone())
            .with_config(ContainerConfig::default().with_receive_timeout(Duration::from_millis(20)));
        runtime.interceptors = chain.clone();

        let mut registry = ListenerRegistry::new();
        for binding in bindings {
            registry.register(binding).unwrap();
        }
        let group = registry.build(&runtime);
        group.start_all().unwrap();

        Harness {
            broker,
            sender: MessageSender::new(client.producer(), chain),
            processor,
            group,
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Give the worker a moment to (not) do anything further.
    fn settle() {
        thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn string_message_is_handled_and_acknowledged() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let h = harness(
            Duration::from_secs(60),
            ExceptionHandlerRegistry::new(),
            InterceptorChain::empty(),
            vec![HandlerBinding::payload_only("T", "", move |s: String| {
                sink.lock().unwrap().push(s);
                Ok(())
            })],
        );

        let id = h.sender.send("T", &"hello".to_string()).unwrap();

        assert!(wait_for(|| h.broker.acknowledged("T") == vec![id]));
        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
        assert_eq!(h.group.get("T").unwrap().stats().acknowledged, 1);
        h.group.stop_all();
    }

    #[test]
    fn registered_nack_is_applied_once_without_dead_letter() {
        let exceptions = ExceptionHandlerRegistry::new();
        exceptions.register_action(&class::ILLEGAL_ARGUMENT, ResponseAction::Nack);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let h = harness(
            Duration::from_secs(60),
            exceptions,
            InterceptorChain::empty(),
            vec![HandlerBinding::payload_only("orders", "", move |_: String| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProcessingError::illegal_argument("bad quantity"))
            })],
        );

        let id = h.sender.send("orders", &"order-1".to_string()).unwrap();

        assert!(wait_for(|| !h.broker.negatively_acknowledged("orders").is_empty()));
        settle();
        assert_eq!(h.broker.negatively_acknowledged("orders"), vec![id]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.processor.stats().total, 0);
        assert!(h.broker.published("orders-DLQ").is_empty());
        h.group.stop_all();
    }

    #[test]
    fn fourth_failure_of_unregistered_error_is_dead_lettered() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let h = harness(
            Duration::ZERO,
            ExceptionHandlerRegistry::new(),
            InterceptorChain::empty(),
            vec![HandlerBinding::payload_only("orders", "", move |_: String| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProcessingError::new(&INVENTORY_MISMATCH, "stock drifted"))
            })],
        );

        let id = h.sender.send("orders", &"order-9".to_string()).unwrap();

        assert!(wait_for(|| h.processor.stats().total == 1));
        settle();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.broker.negatively_acknowledged("orders").len(), 3);
        assert_eq!(h.broker.acknowledged("orders"), vec![id]);

        let stored = h.processor.store().list_by_topic("orders", 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].original_message_id(), id);
        assert_eq!(stored[0].original_topic(), Some("orders"));
        assert_eq!(stored[0].original_payload(), Some(&b"order-9"[..]));
        assert_eq!(stored[0].error_class(), "inventory_mismatch");
        assert_eq!(stored[0].retry_count(), 3);

        let published = h.broker.published("orders-DLQ");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload(), b"order-9");
        assert_eq!(published[0].property(keys::ORIGINAL_TOPIC), Some("orders"));
        h.group.stop_all();
    }

    #[test]
    fn dead_letter_action_bypasses_retries() {
        let exceptions = ExceptionHandlerRegistry::new();
        exceptions.register_action(&class::ILLEGAL_STATE, ResponseAction::DeadLetter);

        let h = harness(
            Duration::ZERO,
            exceptions,
            InterceptorChain::empty(),
            vec![HandlerBinding::payload_only("orders", "", |_: String| {
                Err(ProcessingError::illegal_state("order closed"))
            })],
        );

        h.sender.send("orders", &"x".to_string()).unwrap();
        assert!(wait_for(|| h.processor.stats().total == 1));
        assert!(h.broker.negatively_acknowledged("orders").is_empty());
        h.group.stop_all();
    }

    struct SkipAll;

    impl MessageInterceptor for SkipAll {
        fn before_receive(
            &self,
            _message: &InboundMessage,
            _ctx: &MessageContext,
        ) -> Result<bool, InterceptorError> {
            Ok(false)
        }
    }

    #[test]
    fn skipped_message_is_acknowledged_without_handler() {
        let stats = StatsInterceptor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let h = harness(
            Duration::from_secs(60),
            ExceptionHandlerRegistry::new(),
            InterceptorChain::builder()
                .with(LoggingInterceptor)
                .with(SkipAll)
                .with(stats.clone())
                .build(),
            vec![HandlerBinding::payload_only("orders", "", move |_: String| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })],
        );

        let id = h.sender.send("orders", &"x".to_string()).unwrap();

        assert!(wait_for(|| h.broker.acknowledged("orders") == vec![id]));
        settle();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 0);
        assert_eq!(snapshot.handled, 0);
        assert_eq!(h.group.get("orders").unwrap().stats().skipped, 1);
        h.group.stop_all();
    }

    #[test]
    fn context_travels_from_sender_to_handler() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let h = harness(
            Duration::from_secs(60),
            ExceptionHandlerRegistry::new(),
            InterceptorChain::empty(),
            vec![HandlerBinding::new(
                "orders",
                "paid",
                move |_: String, _: &InboundMessage, ctx: &MessageContext| {
                    *sink.lock().unwrap() = Some((
                        ctx.trace_id(),
                        ctx.corp_key().map(str::to_string),
                        ctx.route().to_string(),
                    ));
                    Ok(())
                },
            )],
        );

        let ctx = MessageContext::new().with_corp_key("acme");
        let trace: TraceId = ctx.trace_id();
        let mut message = OutboundMessage::new("x").with_property("route", "paid");
        ctx.inject(message.properties_mut());
        h.sender.send_message("orders", message).unwrap();

        assert!(wait_for(|| seen.lock().unwrap().is_some()));
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some((trace, Some("acme".to_string()), "paid".to_string()))
        );
        h.group.stop_all();
    }

    #[test]
    fn batch_reprocess_counts_missing_payloads_as_failures() {
        let broker = InMemoryBroker::new();
        let processor = DeadLetterProcessor::new(broker.producer(), DeadLetterConfig::default());

        let batch: Vec<_> = (1..=5u64)
            .map(|seq| {
                let payload = (seq != 2 && seq != 5).then(|| format!("order-{seq}").into_bytes());
                DeadLetterMessage::new(MessageId::new(0, seq), Some("orders".into()), payload, "boom")
            })
            .collect();

        let result = processor.batch_reprocess(&batch, None);
        assert_eq!(result.total_count, 5);
        assert_eq!(result.success_count, 3);
        assert_eq!(result.failure_count, 2);
        assert_eq!(result.failed_ids, vec![MessageId::new(0, 2), MessageId::new(0, 5)]);
        assert_eq!(broker.published("orders").len(), 3);
    }

    #[test]
    fn reprocess_without_topic_fails_quietly() {
        let broker = InMemoryBroker::new();
        let processor = DeadLetterProcessor::new(broker.producer(), DeadLetterConfig::default());
        let orphan = DeadLetterMessage::new(MessageId::new(0, 1), None, Some(b"x".to_vec()), "boom");

        assert!(!processor.reprocess(&orphan, None));
    }

    #[test]
    fn dead_letters_flow_into_the_queue_manager() {
        let exceptions = ExceptionHandlerRegistry::new();
        exceptions.register_action(&class::SECURITY, ResponseAction::Nack);

        let h = harness(
            Duration::ZERO,
            exceptions,
            InterceptorChain::empty(),
            vec![HandlerBinding::payload_only("orders", "", |_: String| {
                Err(ProcessingError::new(&class::SECURITY, "forbidden"))
            })],
        );
        h.sender.send("orders", &"x".to_string()).unwrap();
        assert!(wait_for(|| h.processor.stats().total == 1));
        h.group.stop_all();

        let manager = DeadLetterQueueManager::new(
            Arc::new(h.broker.clone()),
            DeadLetterManagerConfig::default().with_drain_timeout(Duration::from_millis(20)),
        )
        .with_store(h.processor.store().clone());
        manager.watch_topic("orders-DLQ").unwrap();

        let report = manager.sweep_expired(Utc::now());
        assert_eq!(report.scanned, 1);
        assert_eq!(report.republished, 1);
        assert_eq!(h.processor.store().len(), 1);

        let report = manager.sweep_expired(Utc::now() + chrono::Duration::days(8));
        assert_eq!(report.expired, 1);
        assert!(h.processor.store().is_empty());
    }
}
