//! Handler-side settlement for bindings with auto-ack off.

use std::cell::Cell;
use std::time::Duration;

use courier_broker::{BrokerConsumer, BrokerError};
use courier_core::{InboundMessage, MessageId};

use super::dispatcher::Disposition;

/// Settles the message currently being handled.
///
/// The first successful call wins; later calls are no-ops returning `Ok`.
pub struct Acknowledger<'a> {
    consumer: &'a dyn BrokerConsumer,
    message: &'a InboundMessage,
    settled: Cell<Option<Disposition>>,
}

impl std::fmt::Debug for Acknowledger<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acknowledger")
            .field("message_id", &self.message.id())
            .field("settled", &self.settled.get())
            .finish()
    }
}

impl<'a> Acknowledger<'a> {
    pub fn new(consumer: &'a dyn BrokerConsumer, message: &'a InboundMessage) -> Self {
        Self {
            consumer,
            message,
            settled: Cell::new(None),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message.id()
    }

    pub fn acknowledge(&self) -> Result<(), BrokerError> {
        self.settle(Disposition::Acknowledged, || self.consumer.acknowledge(self.message))
    }

    pub fn negative_acknowledge(&self) -> Result<(), BrokerError> {
        self.settle(Disposition::NegativelyAcknowledged, || {
            self.consumer.negative_acknowledge(self.message)
        })
    }

    pub fn reconsume_later(&self, delay: Duration) -> Result<(), BrokerError> {
        self.settle(Disposition::ReconsumeLater(delay), || {
            self.consumer.reconsume_later(self.message, delay)
        })
    }

    /// How the handler settled the message, if it did.
    pub fn settled(&self) -> Option<Disposition> {
        self.settled.get()
    }

    fn settle(
        &self,
        disposition: Disposition,
        op: impl FnOnce() -> Result<(), BrokerError>,
    ) -> Result<(), BrokerError> {
        if self.settled.get().is_some() {
            return Ok(());
        }
        op()?;
        self.settled.set(Some(disposition));
        Ok(())
    }
}
