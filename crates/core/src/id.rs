//! Strongly-typed identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Broker-assigned message identifier.
///
/// Opaque to application code; totally ordered within a partition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    partition: i32,
    sequence: u64,
}

impl MessageId {
    pub fn new(partition: i32, sequence: u64) -> Self {
        Self {
            partition,
            sequence,
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.partition, self.sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid message id `{0}`")]
pub struct ParseMessageIdError(String);

impl FromStr for MessageId {
    type Err = ParseMessageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (partition, sequence) = s
            .split_once(':')
            .ok_or_else(|| ParseMessageIdError(s.to_string()))?;
        let partition = partition
            .parse()
            .map_err(|_| ParseMessageIdError(s.to_string()))?;
        let sequence = sequence
            .parse()
            .map_err(|_| ParseMessageIdError(s.to_string()))?;
        Ok(Self::new(partition, sequence))
    }
}

/// Distributed trace identifier carried in message properties.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(Uuid);

/// Span identifier carried in message properties.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty) => {
        impl $t {
            /// Create a new identifier (UUIDv7, time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $t {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s).map(Self)
            }
        }
    };
}

impl_uuid_newtype!(TraceId);
impl_uuid_newtype!(SpanId);
