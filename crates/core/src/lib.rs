//! `courier-core` — message model shared by the broker boundary and the consumer runtime.
//!
//! This crate has no threads and no IO: identifiers, messages, per-message
//! context, the processing error hierarchy and payload codecs.

pub mod codec;
pub mod context;
pub mod error;
pub mod id;
pub mod message;

pub use codec::{Json, MessagePayload, extract_field};
pub use context::MessageContext;
pub use error::{ErrorClass, Lineage, ProcessingError, class};
pub use id::{MessageId, ParseMessageIdError, SpanId, TraceId};
pub use message::{InboundMessage, OutboundMessage, Properties};
