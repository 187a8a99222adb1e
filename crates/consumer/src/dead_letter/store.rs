//! Dead-letter record storage.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use super::types::{DeadLetterId, DeadLetterMessage};

/// Where dead-lettered messages are kept for inspection and manual replay.
pub trait DeadLetterStore: Send + Sync {
    /// Keep a new record.
    fn record(&self, message: DeadLetterMessage) -> Result<DeadLetterId, DeadLetterStoreError>;

    fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterMessage>, DeadLetterStoreError>;

    /// Oldest first.
    fn list(&self, limit: usize) -> Result<Vec<DeadLetterMessage>, DeadLetterStoreError>;

    fn list_by_topic(
        &self,
        topic: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterMessage>, DeadLetterStoreError>;

    /// Remove a record, e.g. after a successful reprocess.
    fn remove(&self, id: DeadLetterId) -> Result<DeadLetterMessage, DeadLetterStoreError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop records that failed before `cutoff`. Returns how many were removed.
    fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, DeadLetterStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeadLetterStoreError {
    #[error("dead letter not found: {0}")]
    NotFound(DeadLetterId),
    #[error("dead letter already recorded: {0}")]
    AlreadyExists(DeadLetterId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<S> DeadLetterStore for Arc<S>
where
    S: DeadLetterStore + ?Sized,
{
    fn record(&self, message: DeadLetterMessage) -> Result<DeadLetterId, DeadLetterStoreError> {
        (**self).record(message)
    }

    fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterMessage>, DeadLetterStoreError> {
        (**self).get(id)
    }

    fn list(&self, limit: usize) -> Result<Vec<DeadLetterMessage>, DeadLetterStoreError> {
        (**self).list(limit)
    }

    fn list_by_topic(
        &self,
        topic: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterMessage>, DeadLetterStoreError> {
        (**self).list_by_topic(topic, limit)
    }

    fn remove(&self, id: DeadLetterId) -> Result<DeadLetterMessage, DeadLetterStoreError> {
        (**self).remove(id)
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, DeadLetterStoreError> {
        (**self).expire_older_than(cutoff)
    }
}

/// In-memory dead-letter store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    records: RwLock<HashMap<DeadLetterId, DeadLetterMessage>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn sorted(mut records: Vec<DeadLetterMessage>, limit: usize) -> Vec<DeadLetterMessage> {
        records.sort_by_key(|m| (m.failure_time(), m.id().0));
        records.truncate(limit);
        records
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn record(&self, message: DeadLetterMessage) -> Result<DeadLetterId, DeadLetterStoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let id = message.id();
        if records.contains_key(&id) {
            return Err(DeadLetterStoreError::AlreadyExists(id));
        }
        records.insert(id, message);
        Ok(id)
    }

    fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterMessage>, DeadLetterStoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(&id).cloned())
    }

    fn list(&self, limit: usize) -> Result<Vec<DeadLetterMessage>, DeadLetterStoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(Self::sorted(records.values().cloned().collect(), limit))
    }

    fn list_by_topic(
        &self,
        topic: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterMessage>, DeadLetterStoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let matching = records
            .values()
            .filter(|m| m.original_topic() == Some(topic))
            .cloned()
            .collect();
        Ok(Self::sorted(matching, limit))
    }

    fn remove(&self, id: DeadLetterId) -> Result<DeadLetterMessage, DeadLetterStoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.remove(&id).ok_or(DeadLetterStoreError::NotFound(id))
    }

    fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, DeadLetterStoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, m| m.failure_time() >= cutoff);
        Ok(before - records.len())
    }
}
