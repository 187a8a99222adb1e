//! `courier-broker` — the boundary to the message broker SDK.
//!
//! Transport concerns (connect, subscribe, receive, ack) live behind the traits
//! in [`client`]; [`in_memory`] provides a dependency-free implementation.

pub mod client;
pub mod in_memory;

pub use client::{BrokerClient, BrokerConsumer, BrokerError, BrokerProducer};
pub use in_memory::{DEFAULT_NACK_DELAY, InMemoryBroker};
