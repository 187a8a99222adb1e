//! Dead-letter data types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_core::{InboundMessage, MessageId, OutboundMessage, ProcessingError, Properties};

/// Property keys written on messages published to a dead-letter topic.
pub mod keys {
    pub const ORIGINAL_MESSAGE_ID: &str = "dlq_original_message_id";
    pub const ORIGINAL_TOPIC: &str = "dlq_original_topic";
    pub const FAILURE_REASON: &str = "dlq_failure_reason";
    pub const ERROR_CLASS: &str = "dlq_error_class";
    pub const FAILURE_TIME: &str = "dlq_failure_time";
    pub const RETRY_COUNT: &str = "dlq_retry_count";

    pub const REPROCESS_ORIGINAL_MESSAGE_ID: &str = "reprocess_original_message_id";
    pub const REPROCESS_ORIGINAL_TOPIC: &str = "reprocess_original_topic";
    pub const REPROCESS_DEAD_LETTER_ID: &str = "reprocess_dead_letter_id";
    pub const REPROCESS_TIME: &str = "reprocess_time";

    pub(crate) fn is_dead_letter_metadata(key: &str) -> bool {
        key.starts_with("dlq_") || key.starts_with("reprocess_")
    }
}

/// Unique dead-letter record identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(pub Uuid);

impl DeadLetterId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message that could not be processed.
///
/// Never mutated after creation; reprocessing re-wraps the original payload
/// into a new outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    id: DeadLetterId,
    original_message_id: MessageId,
    original_topic: Option<String>,
    original_key: Option<String>,
    original_payload: Option<Vec<u8>>,
    original_properties: Properties,
    failure_reason: String,
    error_class: String,
    retry_count: u32,
    failure_time: DateTime<Utc>,
}

impl DeadLetterMessage {
    /// Wrap a message that failed with `error` after `retry_count` retries.
    pub fn from_failure(message: &InboundMessage, error: &ProcessingError, retry_count: u32) -> Self {
        Self {
            id: DeadLetterId::new(),
            original_message_id: message.id(),
            original_topic: Some(message.topic().to_string()),
            original_key: message.key().map(str::to_string),
            original_payload: Some(message.payload().to_vec()),
            original_properties: message.properties().clone(),
            failure_reason: error.to_string(),
            error_class: error.class().name().to_string(),
            retry_count,
            failure_time: Utc::now(),
        }
    }

    /// Build a record from parts, e.g. when importing from an external dead-letter source.
    pub fn new(
        original_message_id: MessageId,
        original_topic: Option<String>,
        original_payload: Option<Vec<u8>>,
        failure_reason: impl Into<String>,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            original_message_id,
            original_topic,
            original_key: None,
            original_payload,
            original_properties: Properties::new(),
            failure_reason: failure_reason.into(),
            error_class: String::new(),
            retry_count: 0,
            failure_time: Utc::now(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.original_key = Some(key.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.original_properties = properties;
        self
    }

    pub fn with_failure_time(mut self, at: DateTime<Utc>) -> Self {
        self.failure_time = at;
        self
    }

    pub fn id(&self) -> DeadLetterId {
        self.id
    }

    pub fn original_message_id(&self) -> MessageId {
        self.original_message_id
    }

    pub fn original_topic(&self) -> Option<&str> {
        self.original_topic.as_deref()
    }

    pub fn original_key(&self) -> Option<&str> {
        self.original_key.as_deref()
    }

    pub fn original_payload(&self) -> Option<&[u8]> {
        self.original_payload.as_deref()
    }

    pub fn original_properties(&self) -> &Properties {
        &self.original_properties
    }

    pub fn failure_reason(&self) -> &str {
        &self.failure_reason
    }

    pub fn error_class(&self) -> &str {
        &self.error_class
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn failure_time(&self) -> DateTime<Utc> {
        self.failure_time
    }

    /// Outbound form for the dead-letter topic: original payload plus failure metadata.
    pub fn to_dead_letter_outbound(&self) -> OutboundMessage {
        let mut props = self.original_properties.clone();
        props.insert(
            keys::ORIGINAL_MESSAGE_ID.to_string(),
            self.original_message_id.to_string(),
        );
        if let Some(topic) = &self.original_topic {
            props.insert(keys::ORIGINAL_TOPIC.to_string(), topic.clone());
        }
        props.insert(keys::FAILURE_REASON.to_string(), self.failure_reason.clone());
        props.insert(keys::ERROR_CLASS.to_string(), self.error_class.clone());
        props.insert(keys::FAILURE_TIME.to_string(), self.failure_time.to_rfc3339());
        props.insert(keys::RETRY_COUNT.to_string(), self.retry_count.to_string());

        OutboundMessage::new(self.original_payload.clone().unwrap_or_default())
            .with_optional_key(self.original_key.clone())
            .with_properties(props)
    }

    /// Outbound form for reprocessing: original payload, original properties,
    /// and reprocessing metadata.
    pub fn to_reprocess_outbound(&self, reprocessed_at: DateTime<Utc>) -> Option<OutboundMessage> {
        let payload = self.original_payload.clone()?;

        let mut props: Properties = self
            .original_properties
            .iter()
            .filter(|(k, _)| !keys::is_dead_letter_metadata(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        props.insert(
            keys::REPROCESS_ORIGINAL_MESSAGE_ID.to_string(),
            self.original_message_id.to_string(),
        );
        if let Some(topic) = &self.original_topic {
            props.insert(keys::REPROCESS_ORIGINAL_TOPIC.to_string(), topic.clone());
        }
        props.insert(keys::REPROCESS_DEAD_LETTER_ID.to_string(), self.id.to_string());
        props.insert(keys::REPROCESS_TIME.to_string(), reprocessed_at.to_rfc3339());

        Some(
            OutboundMessage::new(payload)
                .with_optional_key(self.original_key.clone())
                .with_properties(props),
        )
    }
}

/// When a message sitting on a dead-letter topic failed.
///
/// Falls back to the publish time when the metadata is missing or malformed.
pub fn dead_letter_failure_time(message: &InboundMessage) -> DateTime<Utc> {
    message
        .property(keys::FAILURE_TIME)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| message.publish_time())
}

/// Backoff family used to space retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffFamily {
    /// base * 2^retry, capped
    Exponential,
    /// step * (retry + 1), capped
    Linear,
    /// Flat delay
    Fixed,
    /// No delay
    Immediate,
}

/// Per-message retry bookkeeping, keyed by broker message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryInfo {
    pub message_id: MessageId,
    pub retry_count: u32,
    pub last_retry_at: DateTime<Utc>,
    pub last_error_class: String,
    pub next_delay: Duration,
}

/// Aggregate outcome of a batch reprocess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReprocessResult {
    pub total_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Original message ids that failed, in input order.
    pub failed_ids: Vec<MessageId>,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> InboundMessage {
        InboundMessage::new(MessageId::new(1, 7), "orders", "payload")
            .with_key("k")
            .with_property("tenant", "acme")
    }

    #[test]
    fn captures_original_message() {
        let err = ProcessingError::illegal_state("bad order");
        let dlm = DeadLetterMessage::from_failure(&failed(), &err, 3);

        assert_eq!(dlm.original_message_id(), MessageId::new(1, 7));
        assert_eq!(dlm.original_topic(), Some("orders"));
        assert_eq!(dlm.original_key(), Some("k"));
        assert_eq!(dlm.original_payload(), Some(&b"payload"[..]));
        assert_eq!(dlm.error_class(), "illegal_state");
        assert_eq!(dlm.retry_count(), 3);
        assert!(dlm.failure_reason().contains("bad order"));
    }

    #[test]
    fn dead_letter_outbound_carries_metadata() {
        let dlm = DeadLetterMessage::from_failure(&failed(), &ProcessingError::runtime("x"), 1);
        let out = dlm.to_dead_letter_outbound();

        assert_eq!(out.payload(), b"payload");
        assert_eq!(out.key(), Some("k"));
        assert_eq!(out.properties()["tenant"], "acme");
        assert_eq!(out.properties()[keys::ORIGINAL_TOPIC], "orders");
        assert_eq!(out.properties()[keys::ORIGINAL_MESSAGE_ID], "1:7");
        assert_eq!(out.properties()[keys::RETRY_COUNT], "1");
    }

    #[test]
    fn reprocess_outbound_strips_dead_letter_metadata() {
        let mut props = Properties::new();
        props.insert("tenant".into(), "acme".into());
        props.insert(keys::FAILURE_REASON.into(), "old".into());
        let dlm = DeadLetterMessage::new(MessageId::new(0, 1), Some("orders".into()), Some(b"p".to_vec()), "x")
            .with_properties(props);

        let out = dlm.to_reprocess_outbound(Utc::now()).unwrap();
        assert_eq!(out.properties()["tenant"], "acme");
        assert!(!out.properties().contains_key(keys::FAILURE_REASON));
        assert_eq!(out.properties()[keys::REPROCESS_DEAD_LETTER_ID], dlm.id().to_string());

        let empty = DeadLetterMessage::new(MessageId::new(0, 2), Some("orders".into()), None, "x");
        assert!(empty.to_reprocess_outbound(Utc::now()).is_none());
    }

    #[test]
    fn failure_time_prefers_metadata() {
        let at = Utc::now() - chrono::Duration::days(3);
        let msg = InboundMessage::new(MessageId::new(0, 1), "orders-DLQ", "p")
            .with_property(keys::FAILURE_TIME, at.to_rfc3339());
        assert_eq!(dead_letter_failure_time(&msg).timestamp(), at.timestamp());

        let plain = InboundMessage::new(MessageId::new(0, 2), "orders-DLQ", "p");
        assert_eq!(dead_letter_failure_time(&plain), plain.publish_time());
    }
}
