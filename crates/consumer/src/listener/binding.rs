//! Typed handler bindings and the per-topic route table.

use std::collections::HashMap;
use std::sync::Arc;

use courier_core::{InboundMessage, MessageContext, MessagePayload, ProcessingError};

use super::acknowledger::Acknowledger;

/// Type-erased handler: decodes the payload and calls the typed closure.
pub type HandlerFn = Arc<
    dyn Fn(&InboundMessage, &MessageContext, &Acknowledger<'_>) -> Result<(), ProcessingError>
        + Send
        + Sync,
>;

/// One handler bound to `(topic, route)`.
///
/// An empty route marks the default handler of its topic.
#[derive(Clone)]
pub struct HandlerBinding {
    topic: String,
    route: String,
    payload_type: &'static str,
    auto_ack: bool,
    handler: HandlerFn,
}

impl std::fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("topic", &self.topic)
            .field("route", &self.route)
            .field("payload_type", &self.payload_type)
            .field("auto_ack", &self.auto_ack)
            .finish_non_exhaustive()
    }
}

impl HandlerBinding {
    /// Bind a handler receiving the decoded payload, the raw message and its context.
    pub fn new<T, F>(topic: impl Into<String>, route: impl Into<String>, handler: F) -> Self
    where
        T: MessagePayload + 'static,
        F: Fn(T, &InboundMessage, &MessageContext) -> Result<(), ProcessingError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            topic: topic.into(),
            route: route.into(),
            payload_type: T::type_name(),
            auto_ack: true,
            handler: Arc::new(move |message: &InboundMessage, ctx: &MessageContext, _: &Acknowledger<'_>| {
                let payload = T::decode(message.payload())?;
                handler(payload, message, ctx)
            }),
        }
    }

    /// Bind a handler that settles the message itself through the [`Acknowledger`].
    ///
    /// Auto-ack is off. A message the handler leaves unsettled is reported as
    /// [`Disposition::Deferred`](super::Disposition::Deferred).
    pub fn manual_ack<T, F>(topic: impl Into<String>, route: impl Into<String>, handler: F) -> Self
    where
        T: MessagePayload + 'static,
        F: Fn(T, &InboundMessage, &MessageContext, &Acknowledger<'_>) -> Result<(), ProcessingError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            topic: topic.into(),
            route: route.into(),
            payload_type: T::type_name(),
            auto_ack: false,
            handler: Arc::new(move |message: &InboundMessage, ctx: &MessageContext, ack: &Acknowledger<'_>| {
                let payload = T::decode(message.payload())?;
                handler(payload, message, ctx, ack)
            }),
        }
    }

    /// Bind a handler that only needs the decoded payload.
    pub fn payload_only<T, F>(topic: impl Into<String>, route: impl Into<String>, handler: F) -> Self
    where
        T: MessagePayload + 'static,
        F: Fn(T) -> Result<(), ProcessingError> + Send + Sync + 'static,
    {
        Self::new(topic, route, move |payload: T, _: &InboundMessage, _: &MessageContext| {
            handler(payload)
        })
    }

    /// With auto-ack off, a successful handler leaves acknowledgment to the caller.
    /// Handlers that settle through an [`Acknowledger`] are built with [`HandlerBinding::manual_ack`].
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn payload_type(&self) -> &'static str {
        self.payload_type
    }

    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    pub fn is_default(&self) -> bool {
        self.route.is_empty()
    }

    /// Decode and run. A decode failure is a `serialization` [`ProcessingError`].
    pub fn invoke(
        &self,
        message: &InboundMessage,
        ctx: &MessageContext,
        ack: &Acknowledger<'_>,
    ) -> Result<(), ProcessingError> {
        (self.handler)(message, ctx, ack)
    }
}

/// Handlers of one topic, keyed by route.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Arc<HandlerBinding>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the binding already holding that route, if any, without replacing it.
    pub fn insert(&mut self, binding: HandlerBinding) -> Result<(), Arc<HandlerBinding>> {
        if let Some(existing) = self.routes.get(binding.route()) {
            return Err(existing.clone());
        }
        self.routes
            .insert(binding.route().to_string(), Arc::new(binding));
        Ok(())
    }

    pub fn get(&self, route: &str) -> Option<&Arc<HandlerBinding>> {
        self.routes.get(route)
    }

    pub fn default_binding(&self) -> Option<&Arc<HandlerBinding>> {
        self.routes.get("")
    }

    pub fn routes(&self) -> Vec<&str> {
        let mut routes: Vec<_> = self.routes.keys().map(String::as_str).collect();
        routes.sort_unstable();
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use courier_broker::{BrokerClient, BrokerConsumer, InMemoryBroker};
    use courier_core::{Json, MessageId, OutboundMessage};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: u32,
    }

    fn message(payload: &str) -> InboundMessage {
        InboundMessage::new(MessageId::new(0, 1), "orders", payload)
    }

    fn consumer() -> Arc<dyn BrokerConsumer> {
        InMemoryBroker::new().subscribe("orders", "test").unwrap()
    }

    #[test]
    fn decodes_declared_payload_type() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let binding = HandlerBinding::new("orders", "created", move |order: Json<Order>, msg: &InboundMessage, _: &MessageContext| {
            *sink.lock().unwrap() = Some((order.into_inner(), msg.id()));
            Ok(())
        });

        let consumer = consumer();
        let msg = message(r#"{"id":7}"#);
        binding
            .invoke(&msg, &MessageContext::new(), &Acknowledger::new(consumer.as_ref(), &msg))
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((Order { id: 7 }, MessageId::new(0, 1))));
        assert!(binding.payload_type().contains("Order"));
    }

    #[test]
    fn decode_failure_is_a_serialization_error() {
        let binding = HandlerBinding::payload_only("orders", "", |_: u32| Ok(()));
        let consumer = consumer();
        let msg = message("not a number");
        let err = binding
            .invoke(&msg, &MessageContext::new(), &Acknowledger::new(consumer.as_ref(), &msg))
            .unwrap_err();
        assert_eq!(err.class().name(), "serialization");
    }

    #[test]
    fn manual_ack_handler_settles_through_acknowledger() {
        let broker = InMemoryBroker::new();
        let consumer = broker.subscribe("orders", "test").unwrap();
        broker.publish("orders", OutboundMessage::new("7")).unwrap();
        let msg = consumer.receive(Duration::from_millis(100)).unwrap().unwrap();

        let binding = HandlerBinding::manual_ack("orders", "", |n: u32, _: &InboundMessage, _: &MessageContext, ack: &Acknowledger<'_>| {
            if n == 7 {
                ack.acknowledge().map_err(|e| ProcessingError::network(e.to_string()))?;
            }
            Ok(())
        });
        assert!(!binding.auto_ack());

        let ack = Acknowledger::new(consumer.as_ref(), &msg);
        binding.invoke(&msg, &MessageContext::new(), &ack).unwrap();
        assert_eq!(broker.acknowledged("orders"), vec![msg.id()]);
    }

    #[test]
    fn route_table_rejects_duplicates() {
        let mut table = RouteTable::new();
        table.insert(HandlerBinding::payload_only("orders", "", |_: String| Ok(()))).unwrap();
        table.insert(HandlerBinding::payload_only("orders", "paid", |_: String| Ok(()))).unwrap();
        assert!(table.insert(HandlerBinding::payload_only("orders", "paid", |_: String| Ok(()))).is_err());

        assert_eq!(table.routes(), vec!["", "paid"]);
        assert!(table.default_binding().is_some());
    }
}
