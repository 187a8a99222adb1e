//! Dead-letter hand-off and reprocessing.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use courier_broker::BrokerProducer;
use courier_core::{InboundMessage, ProcessingError};

use super::store::{DeadLetterStore, InMemoryDeadLetterStore};
use super::types::{BatchReprocessResult, DeadLetterMessage};

/// Dead-letter processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Publish dead letters to `<topic><topic_suffix>`.
    pub publish_to_topic: bool,
    pub topic_suffix: String,
    /// Dead letters older than this can no longer be reprocessed.
    #[serde(rename = "max_reprocess_age_ms", with = "crate::config::duration_ms")]
    pub max_reprocess_age: Duration,
    /// Upper bound on concurrent sends during a batch reprocess.
    pub batch_parallelism: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            publish_to_topic: true,
            topic_suffix: "-DLQ".to_string(),
            max_reprocess_age: Duration::from_secs(7 * 24 * 60 * 60),
            batch_parallelism: 16,
        }
    }
}

impl DeadLetterConfig {
    pub fn with_publish_to_topic(mut self, publish: bool) -> Self {
        self.publish_to_topic = publish;
        self
    }

    pub fn with_topic_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.topic_suffix = suffix.into();
        self
    }

    pub fn with_batch_parallelism(mut self, parallelism: usize) -> Self {
        self.batch_parallelism = parallelism;
        self
    }
}

/// Point-in-time dead-letter statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStatsSnapshot {
    pub total: u64,
    pub per_topic: BTreeMap<String, u64>,
    pub last_dead_lettered_at: Option<DateTime<Utc>>,
    pub reprocessed: u64,
    pub reprocess_failed: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Default)]
struct DeadLetterStats {
    total: AtomicU64,
    per_topic: DashMap<String, u64>,
    /// Millis since epoch; 0 = never.
    last_dead_lettered_ms: AtomicI64,
    reprocessed: AtomicU64,
    reprocess_failed: AtomicU64,
    publish_failures: AtomicU64,
}

/// Takes over messages the listener gave up on.
///
/// Every dead letter is recorded in the store and counted; publishing to the
/// dead-letter topic is optional. Nothing here returns an error to the
/// listener: failures are logged and counted.
pub struct DeadLetterProcessor {
    producer: Arc<dyn BrokerProducer>,
    store: Arc<dyn DeadLetterStore>,
    config: DeadLetterConfig,
    stats: DeadLetterStats,
}

impl std::fmt::Debug for DeadLetterProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterProcessor")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl DeadLetterProcessor {
    /// Processor backed by an [`InMemoryDeadLetterStore`].
    pub fn new(producer: Arc<dyn BrokerProducer>, config: DeadLetterConfig) -> Self {
        Self::with_store(producer, InMemoryDeadLetterStore::arc(), config)
    }

    pub fn with_store(
        producer: Arc<dyn BrokerProducer>,
        store: Arc<dyn DeadLetterStore>,
        config: DeadLetterConfig,
    ) -> Self {
        Self {
            producer,
            store,
            config,
            stats: DeadLetterStats::default(),
        }
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DeadLetterStore> {
        &self.store
    }

    pub fn dead_letter_topic_for(&self, topic: &str) -> String {
        format!("{topic}{}", self.config.topic_suffix)
    }

    /// Dead-letter `message`, which failed with `error` after `retry_count` retries.
    pub fn process(
        &self,
        message: &InboundMessage,
        error: &ProcessingError,
        retry_count: u32,
    ) -> DeadLetterMessage {
        let dead_letter = DeadLetterMessage::from_failure(message, error, retry_count);

        warn!(
            topic = %message.topic(),
            message_id = %message.id(),
            dead_letter_id = %dead_letter.id(),
            retry_count,
            error = %error,
            "message dead-lettered"
        );

        if let Err(e) = self.store.record(dead_letter.clone()) {
            error!(dead_letter_id = %dead_letter.id(), error = %e, "failed to record dead letter");
        }

        self.stats.total.fetch_add(1, Ordering::Relaxed);
        *self
            .stats
            .per_topic
            .entry(message.topic().to_string())
            .or_insert(0) += 1;
        self.stats
            .last_dead_lettered_ms
            .store(dead_letter.failure_time().timestamp_millis(), Ordering::Relaxed);

        if self.config.publish_to_topic {
            self.publish(message.topic(), &dead_letter);
        }

        dead_letter
    }

    #[instrument(skip(self, dead_letter), fields(dead_letter_id = %dead_letter.id()))]
    fn publish(&self, topic: &str, dead_letter: &DeadLetterMessage) {
        let dlq_topic = self.dead_letter_topic_for(topic);
        match self.producer.send(&dlq_topic, dead_letter.to_dead_letter_outbound()) {
            Ok(id) => debug!(topic = %dlq_topic, message_id = %id, "published dead letter"),
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                error!(topic = %dlq_topic, error = %e, "failed to publish dead letter");
            }
        }
    }

    pub fn can_reprocess(&self, dead_letter: &DeadLetterMessage) -> bool {
        self.can_reprocess_at(dead_letter, Utc::now())
    }

    pub fn can_reprocess_at(&self, dead_letter: &DeadLetterMessage, now: DateTime<Utc>) -> bool {
        if dead_letter.original_payload().is_none() || dead_letter.original_topic().is_none() {
            return false;
        }
        let age = (now - dead_letter.failure_time()).to_std().unwrap_or_default();
        age <= self.config.max_reprocess_age
    }

    /// Re-send a dead letter to `target`, or to its original topic.
    ///
    /// Returns `false` when the record is not reprocessable or the send fails.
    /// Never panics.
    #[instrument(skip(self, dead_letter), fields(dead_letter_id = %dead_letter.id()))]
    pub fn reprocess(&self, dead_letter: &DeadLetterMessage, target: Option<&str>) -> bool {
        let ok = self.try_reprocess(dead_letter, target);
        if ok {
            self.stats.reprocessed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.reprocess_failed.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    fn try_reprocess(&self, dead_letter: &DeadLetterMessage, target: Option<&str>) -> bool {
        let Some(topic) = target.or(dead_letter.original_topic()) else {
            warn!("dead letter has no topic to reprocess to");
            return false;
        };

        let now = Utc::now();
        if !self.can_reprocess_at(dead_letter, now) {
            warn!(topic = %topic, "dead letter is not reprocessable");
            return false;
        }
        let Some(outbound) = dead_letter.to_reprocess_outbound(now) else {
            return false;
        };

        let sent = panic::catch_unwind(AssertUnwindSafe(|| self.producer.send(topic, outbound)));
        match sent {
            Ok(Ok(id)) => {
                info!(topic = %topic, message_id = %id, "dead letter reprocessed");
                if let Err(e) = self.store.remove(dead_letter.id()) {
                    debug!(error = %e, "reprocessed dead letter was not in the store");
                }
                true
            }
            Ok(Err(e)) => {
                error!(topic = %topic, error = %e, "dead letter reprocess failed");
                false
            }
            Err(_) => {
                error!(topic = %topic, "producer panicked during dead letter reprocess");
                false
            }
        }
    }

    /// Reprocess many dead letters with at most `batch_parallelism` concurrent sends.
    pub fn batch_reprocess(
        &self,
        dead_letters: &[DeadLetterMessage],
        target: Option<&str>,
    ) -> BatchReprocessResult {
        let started = Instant::now();
        let workers = self.config.batch_parallelism.max(1).min(dead_letters.len());
        let next = AtomicUsize::new(0);
        let succeeded: Vec<AtomicBool> = dead_letters.iter().map(|_| AtomicBool::new(false)).collect();

        // Every entry counts as failed until a worker reports it succeeded, so
        // entries lost to a panicking worker still show up in `failed_ids`.
        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(|| loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(dead_letter) = dead_letters.get(i) else {
                            break;
                        };
                        if self.reprocess(dead_letter, target) {
                            succeeded[i].store(true, Ordering::Relaxed);
                        }
                    })
                })
                .collect();

            for handle in handles {
                if handle.join().is_err() {
                    error!("batch reprocess worker panicked");
                }
            }
        });

        let failed_ids: Vec<_> = dead_letters
            .iter()
            .zip(&succeeded)
            .filter(|(_, ok)| !ok.load(Ordering::Relaxed))
            .map(|(dead_letter, _)| dead_letter.original_message_id())
            .collect();
        let success_count = succeeded.iter().filter(|ok| ok.load(Ordering::Relaxed)).count();
        let total_count = dead_letters.len();

        let result = BatchReprocessResult {
            total_count,
            success_count,
            failure_count: total_count - success_count,
            failed_ids,
            elapsed: started.elapsed(),
        };
        info!(
            total = result.total_count,
            succeeded = result.success_count,
            failed = result.failure_count,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "batch reprocess finished"
        );
        result
    }

    pub fn stats(&self) -> DeadLetterStatsSnapshot {
        let last_ms = self.stats.last_dead_lettered_ms.load(Ordering::Relaxed);
        DeadLetterStatsSnapshot {
            total: self.stats.total.load(Ordering::Relaxed),
            per_topic: self
                .stats
                .per_topic
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            last_dead_lettered_at: (last_ms != 0)
                .then(|| Utc.timestamp_millis_opt(last_ms).single())
                .flatten(),
            reprocessed: self.stats.reprocessed.load(Ordering::Relaxed),
            reprocess_failed: self.stats.reprocess_failed.load(Ordering::Relaxed),
            publish_failures: self.stats.publish_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use courier_broker::{BrokerClient, InMemoryBroker};
    use courier_core::MessageId;

    use crate::dead_letter::{DeadLetterId, DeadLetterStoreError, keys};

    fn processor(broker: &InMemoryBroker) -> DeadLetterProcessor {
        DeadLetterProcessor::new(broker.producer(), DeadLetterConfig::default())
    }

    fn failed(seq: u64) -> InboundMessage {
        InboundMessage::new(MessageId::new(0, seq), "orders", format!("order-{seq}"))
    }

    #[test]
    fn process_records_counts_and_publishes() {
        let broker = InMemoryBroker::new();
        let processor = processor(&broker);

        let dlm = processor.process(&failed(1), &ProcessingError::runtime("boom"), 3);

        let published = broker.published("orders-DLQ");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload(), b"order-1");
        assert_eq!(published[0].property(keys::ORIGINAL_TOPIC), Some("orders"));

        assert_eq!(processor.store().get(dlm.id()).unwrap(), Some(dlm));
        let stats = processor.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.per_topic["orders"], 1);
        assert!(stats.last_dead_lettered_at.is_some());
    }

    #[test]
    fn publish_failure_is_counted_not_raised() {
        let broker = InMemoryBroker::new();
        broker.set_send_failure(true);
        let processor = processor(&broker);

        processor.process(&failed(1), &ProcessingError::runtime("boom"), 0);

        assert_eq!(processor.stats().publish_failures, 1);
        assert_eq!(processor.store().len(), 1);
    }

    #[test]
    fn publishing_can_be_disabled() {
        let broker = InMemoryBroker::new();
        let processor = DeadLetterProcessor::new(
            broker.producer(),
            DeadLetterConfig::default().with_publish_to_topic(false),
        );
        processor.process(&failed(1), &ProcessingError::runtime("boom"), 0);
        assert!(broker.published("orders-DLQ").is_empty());
    }

    #[test]
    fn reprocess_sends_to_original_or_target_topic() {
        let broker = InMemoryBroker::new();
        let processor = processor(&broker);
        let dlm = processor.process(&failed(1), &ProcessingError::runtime("boom"), 0);

        assert!(processor.reprocess(&dlm, None));
        let resent = broker.published("orders");
        assert_eq!(resent.len(), 1);
        assert_eq!(
            resent[0].property(keys::REPROCESS_DEAD_LETTER_ID),
            Some(dlm.id().to_string().as_str())
        );
        assert!(processor.store().is_empty());

        assert!(processor.reprocess(&dlm, Some("orders-replay")));
        assert_eq!(broker.published("orders-replay").len(), 1);
    }

    #[test]
    fn unreprocessable_records_return_false() {
        let broker = InMemoryBroker::new();
        let processor = processor(&broker);

        let no_topic = DeadLetterMessage::new(MessageId::new(0, 1), None, Some(b"p".to_vec()), "x");
        assert!(!processor.reprocess(&no_topic, None));

        let no_payload = DeadLetterMessage::new(MessageId::new(0, 2), Some("orders".into()), None, "x");
        assert!(!processor.reprocess(&no_payload, None));

        let stale = DeadLetterMessage::new(MessageId::new(0, 3), Some("orders".into()), Some(b"p".to_vec()), "x")
            .with_failure_time(Utc::now() - chrono::Duration::days(8));
        assert!(!processor.can_reprocess(&stale));
        assert!(!processor.reprocess(&stale, None));

        assert_eq!(processor.stats().reprocess_failed, 3);
        assert!(broker.published("orders").is_empty());
    }

    #[test]
    fn batch_reprocess_reports_failures_in_input_order() {
        let broker = InMemoryBroker::new();
        let processor = DeadLetterProcessor::new(
            broker.producer(),
            DeadLetterConfig::default().with_batch_parallelism(2),
        );

        let batch: Vec<_> = (1..=5)
            .map(|seq| {
                let payload = (seq % 2 == 1).then(|| b"p".to_vec());
                DeadLetterMessage::new(MessageId::new(0, seq), Some("orders".into()), payload, "x")
            })
            .collect();

        let result = processor.batch_reprocess(&batch, None);
        assert_eq!(result.total_count, 5);
        assert_eq!(result.success_count, 3);
        assert_eq!(result.failure_count, 2);
        assert_eq!(result.failed_ids, vec![MessageId::new(0, 2), MessageId::new(0, 4)]);
        assert_eq!(broker.published("orders").len(), 3);
    }

    /// Store whose `remove` panics for one record.
    struct PanickyStore {
        inner: InMemoryDeadLetterStore,
        panic_on: Mutex<Option<DeadLetterId>>,
    }

    impl DeadLetterStore for PanickyStore {
        fn record(&self, message: DeadLetterMessage) -> Result<DeadLetterId, DeadLetterStoreError> {
            self.inner.record(message)
        }

        fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterMessage>, DeadLetterStoreError> {
            self.inner.get(id)
        }

        fn list(&self, limit: usize) -> Result<Vec<DeadLetterMessage>, DeadLetterStoreError> {
            self.inner.list(limit)
        }

        fn list_by_topic(
            &self,
            topic: &str,
            limit: usize,
        ) -> Result<Vec<DeadLetterMessage>, DeadLetterStoreError> {
            self.inner.list_by_topic(topic, limit)
        }

        fn remove(&self, id: DeadLetterId) -> Result<DeadLetterMessage, DeadLetterStoreError> {
            if *self.panic_on.lock().unwrap() == Some(id) {
                panic!("store unavailable");
            }
            self.inner.remove(id)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }

        fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, DeadLetterStoreError> {
            self.inner.expire_older_than(cutoff)
        }
    }

    #[test]
    fn panicking_worker_does_not_lose_failed_ids() {
        let broker = InMemoryBroker::new();
        let store = Arc::new(PanickyStore {
            inner: InMemoryDeadLetterStore::new(),
            panic_on: Mutex::new(None),
        });
        let processor = DeadLetterProcessor::with_store(
            broker.producer(),
            store.clone(),
            DeadLetterConfig::default().with_batch_parallelism(1),
        );

        let batch: Vec<_> = (1..=3)
            .map(|seq| {
                DeadLetterMessage::new(MessageId::new(0, seq), Some("orders".into()), Some(b"p".to_vec()), "x")
            })
            .collect();
        *store.panic_on.lock().unwrap() = Some(batch[1].id());

        let result = processor.batch_reprocess(&batch, None);
        assert_eq!(result.total_count, 3);
        assert_eq!(result.success_count, 1);
        assert_eq!(result.failure_count, 2);
        assert_eq!(result.failed_ids, vec![MessageId::new(0, 2), MessageId::new(0, 3)]);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let broker = InMemoryBroker::new();
        let result = processor(&broker).batch_reprocess(&[], None);
        assert_eq!(result.total_count, 0);
        assert!(result.failed_ids.is_empty());
    }
}
