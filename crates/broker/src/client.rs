//! Broker SDK boundary.
//!
//! The consumer runtime never talks to a broker directly; it goes through these
//! traits. A real deployment wraps its broker SDK behind them, tests and local
//! development use [`InMemoryBroker`](crate::InMemoryBroker).
//!
//! ## Delivery model
//!
//! - **At-least-once**: a message that is not acknowledged is eventually redelivered.
//! - **Negative acknowledgment** asks for redelivery after the broker's nack delay.
//! - **Reconsume later** asks for redelivery after an explicit delay and bumps
//!   the redelivery count.
//!
//! ## Thread safety
//!
//! Consumers take `&self` everywhere so the container can call
//! [`BrokerConsumer::close`] from its control thread while the worker thread is
//! blocked in [`BrokerConsumer::receive`].

use std::sync::Arc;
use std::time::Duration;

use courier_core::{InboundMessage, MessageId, OutboundMessage};
use thiserror::Error;

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("consumer closed")]
    Closed,

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("acknowledgment failed: {0}")]
    Acknowledge(String),

    #[error("send failed: {0}")]
    Send(String),
}

/// One subscription's consumer.
pub trait BrokerConsumer: Send + Sync {
    fn topic(&self) -> &str;

    fn subscription(&self) -> &str;

    /// Block for up to `timeout` waiting for the next message.
    ///
    /// `Ok(None)` means the timeout elapsed with nothing to deliver.
    fn receive(&self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError>;

    fn acknowledge(&self, message: &InboundMessage) -> Result<(), BrokerError>;

    fn negative_acknowledge(&self, message: &InboundMessage) -> Result<(), BrokerError>;

    fn reconsume_later(&self, message: &InboundMessage, delay: Duration) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    /// Release the consumer; a pending or later `receive` returns [`BrokerError::Closed`].
    fn close(&self) -> Result<(), BrokerError>;
}

/// Producer for any topic.
pub trait BrokerProducer: Send + Sync {
    fn send(&self, topic: &str, message: OutboundMessage) -> Result<MessageId, BrokerError>;
}

/// Entry point of a broker SDK.
pub trait BrokerClient: Send + Sync {
    fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError>;

    fn producer(&self) -> Arc<dyn BrokerProducer>;
}

impl<C> BrokerClient for Arc<C>
where
    C: BrokerClient + ?Sized,
{
    fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        (**self).subscribe(topic, subscription)
    }

    fn producer(&self) -> Arc<dyn BrokerProducer> {
        (**self).producer()
    }
}

impl<P> BrokerProducer for Arc<P>
where
    P: BrokerProducer + ?Sized,
{
    fn send(&self, topic: &str, message: OutboundMessage) -> Result<MessageId, BrokerError> {
        (**self).send(topic, message)
    }
}
