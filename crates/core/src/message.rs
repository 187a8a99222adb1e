use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MessageId;

/// String properties attached to a message.
pub type Properties = BTreeMap<String, String>;

/// A message as delivered by the broker.
///
/// Owned by the broker client; the listener container only borrows it for the
/// duration of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    id: MessageId,
    topic: String,
    key: Option<String>,
    payload: Vec<u8>,
    properties: Properties,
    publish_time: DateTime<Utc>,
    /// How many times the broker has redelivered this message.
    redelivery_count: u32,
}

impl InboundMessage {
    pub fn new(id: MessageId, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            topic: topic.into(),
            key: None,
            payload: payload.into(),
            properties: Properties::new(),
            publish_time: Utc::now(),
            redelivery_count: 0,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_publish_time(mut self, at: DateTime<Utc>) -> Self {
        self.publish_time = at;
        self
    }

    pub fn with_redelivery_count(mut self, count: u32) -> Self {
        self.redelivery_count = count;
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn publish_time(&self) -> DateTime<Utc> {
        self.publish_time
    }

    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }
}

/// A message about to be handed to the broker producer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    key: Option<String>,
    payload: Vec<u8>,
    properties: Properties,
    /// Ask the broker to withhold delivery for this long.
    deliver_after: Option<Duration>,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_optional_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn deliver_after(mut self, delay: Duration) -> Self {
        self.deliver_after = Some(delay);
        self
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn delivery_delay(&self) -> Option<Duration> {
        self.deliver_after
    }
}
