//! Send path: encode, run the send-side interceptors, hand to the broker.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use courier_broker::{BrokerError, BrokerProducer};
use courier_core::{MessageContext, MessageId, MessagePayload, OutboundMessage, ProcessingError};

use crate::interceptor::InterceptorChain;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("failed to encode payload: {0}")]
    Encode(#[source] ProcessingError),

    #[error("send to `{topic}` vetoed by an interceptor")]
    Vetoed { topic: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Sends messages through the interceptor chain.
#[derive(Clone)]
pub struct MessageSender {
    producer: Arc<dyn BrokerProducer>,
    interceptors: Arc<InterceptorChain>,
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender")
            .field("interceptors", &self.interceptors.names())
            .finish_non_exhaustive()
    }
}

impl MessageSender {
    pub fn new(producer: Arc<dyn BrokerProducer>, interceptors: Arc<InterceptorChain>) -> Self {
        Self {
            producer,
            interceptors,
        }
    }

    /// Encode and send `payload` with no key and a fresh context.
    pub fn send<T: MessagePayload>(&self, topic: &str, payload: &T) -> Result<MessageId, SendError> {
        self.send_with(topic, payload, None, &MessageContext::new())
    }

    /// Encode and send `payload`, propagating `ctx` in the message properties.
    pub fn send_with<T: MessagePayload>(
        &self,
        topic: &str,
        payload: &T,
        key: Option<&str>,
        ctx: &MessageContext,
    ) -> Result<MessageId, SendError> {
        let bytes = payload.encode().map_err(SendError::Encode)?;
        let mut message = OutboundMessage::new(bytes).with_optional_key(key.map(str::to_string));
        ctx.inject(message.properties_mut());
        self.send_message(topic, message)
    }

    /// Send an already-built message.
    pub fn send_message(&self, topic: &str, message: OutboundMessage) -> Result<MessageId, SendError> {
        let Some(message) = self.interceptors.before_send(topic, message) else {
            return Err(SendError::Vetoed {
                topic: topic.to_string(),
            });
        };

        let result = self.producer.send(topic, message.clone());
        match &result {
            Ok(id) => {
                debug!(topic = %topic, message_id = %id, "message sent");
                self.interceptors.after_send(topic, &message, Some(*id), None);
            }
            Err(e) => self.interceptors.after_send(topic, &message, None, Some(e)),
        }
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_broker::{BrokerClient, InMemoryBroker};
    use courier_core::{Json, context};
    use serde::{Deserialize, Serialize};

    use crate::interceptor::{InterceptorError, MessageInterceptor, StatsInterceptor};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: u32,
    }

    struct Veto;

    impl MessageInterceptor for Veto {
        fn before_send(
            &self,
            _topic: &str,
            _message: OutboundMessage,
        ) -> Result<Option<OutboundMessage>, InterceptorError> {
            Ok(None)
        }
    }

    #[test]
    fn sends_encoded_payload_with_context() {
        let broker = InMemoryBroker::new();
        let stats = StatsInterceptor::new();
        let sender = MessageSender::new(
            broker.producer(),
            Arc::new(InterceptorChain::builder().with(stats.clone()).build()),
        );

        let ctx = MessageContext::new().with_corp_key("acme");
        sender
            .send_with("orders", &Json(Order { id: 3 }), Some("k"), &ctx)
            .unwrap();

        let published = &broker.published("orders")[0];
        assert_eq!(published.payload(), br#"{"id":3}"#);
        assert_eq!(published.key(), Some("k"));
        assert_eq!(published.property(context::keys::CORP_KEY), Some("acme"));
        assert_eq!(stats.snapshot().sent, 1);
    }

    #[test]
    fn veto_and_broker_failure_are_errors() {
        let broker = InMemoryBroker::new();
        let vetoing = MessageSender::new(
            broker.producer(),
            Arc::new(InterceptorChain::builder().with(Veto).build()),
        );
        assert!(matches!(vetoing.send("orders", &"x".to_string()), Err(SendError::Vetoed { .. })));
        assert!(broker.published("orders").is_empty());

        let stats = StatsInterceptor::new();
        let sender = MessageSender::new(
            broker.producer(),
            Arc::new(InterceptorChain::builder().with(stats.clone()).build()),
        );
        broker.set_send_failure(true);
        assert!(matches!(sender.send("orders", &1u32), Err(SendError::Broker(_))));
        assert_eq!(stats.snapshot().send_failures, 1);
    }
}
