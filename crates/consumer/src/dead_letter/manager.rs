//! Background upkeep of dead-letter topics.

use std::collections::{HashMap, HashSet};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use courier_broker::{BrokerClient, BrokerConsumer, BrokerError, BrokerProducer};
use courier_core::{InboundMessage, OutboundMessage};

use super::retry::DeadLetterRetryStrategy;
use super::store::DeadLetterStore;
use super::types::dead_letter_failure_time;

/// Dead-letter queue manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterManagerConfig {
    /// Subscription used on every watched dead-letter topic.
    pub subscription: String,
    #[serde(rename = "health_check_interval_ms", with = "crate::config::duration_ms")]
    pub health_check_interval: Duration,
    #[serde(rename = "sweep_interval_ms", with = "crate::config::duration_ms")]
    pub sweep_interval: Duration,
    /// Dead letters that failed longer ago than this are expired by a sweep.
    #[serde(rename = "expiry_window_ms", with = "crate::config::duration_ms")]
    pub expiry_window: Duration,
    /// A topic is drained once a receive waits this long without a message.
    #[serde(rename = "drain_timeout_ms", with = "crate::config::duration_ms")]
    pub drain_timeout: Duration,
    /// Upper bound on messages handled per topic in one sweep.
    pub max_sweep_messages: usize,
    /// Background loop granularity.
    #[serde(rename = "tick_ms", with = "crate::config::duration_ms")]
    pub tick: Duration,
}

impl Default for DeadLetterManagerConfig {
    fn default() -> Self {
        Self {
            subscription: "courier-dlq-manager".to_string(),
            health_check_interval: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(24 * 60 * 60),
            expiry_window: Duration::from_secs(7 * 24 * 60 * 60),
            drain_timeout: Duration::from_millis(100),
            max_sweep_messages: 10_000,
            tick: Duration::from_millis(250),
        }
    }
}

impl DeadLetterManagerConfig {
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = subscription.into();
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_expiry_window(mut self, window: Duration) -> Self {
        self.expiry_window = window;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Health of one watched dead-letter topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicHealth {
    pub topic: String,
    pub connected: bool,
    pub resubscribed: bool,
    pub error: Option<String>,
}

/// Outcome of one expiry sweep, over all watched topics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub republished: usize,
    pub failed: usize,
}

/// Watches dead-letter topics: reconnects their consumers and expires old
/// dead letters.
///
/// Expiry means "stop tracking": expired messages are acknowledged off the
/// manager's subscription, live ones are put back on the dead-letter topic.
/// Physical retention stays with the broker.
pub struct DeadLetterQueueManager {
    client: Arc<dyn BrokerClient>,
    producer: Arc<dyn BrokerProducer>,
    config: DeadLetterManagerConfig,
    consumers: Mutex<HashMap<String, Arc<dyn BrokerConsumer>>>,
    store: Option<Arc<dyn DeadLetterStore>>,
    retry: Option<Arc<DeadLetterRetryStrategy>>,
}

impl std::fmt::Debug for DeadLetterQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueueManager")
            .field("config", &self.config)
            .field("topics", &self.watched_topics())
            .finish_non_exhaustive()
    }
}

impl DeadLetterQueueManager {
    pub fn new(client: Arc<dyn BrokerClient>, config: DeadLetterManagerConfig) -> Self {
        let producer = client.producer();
        Self {
            client,
            producer,
            config,
            consumers: Mutex::new(HashMap::new()),
            store: None,
            retry: None,
        }
    }

    /// Also expire records from `store` on every sweep.
    pub fn with_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Also prune idle retry info on every sweep.
    pub fn with_retry_strategy(mut self, retry: Arc<DeadLetterRetryStrategy>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn config(&self) -> &DeadLetterManagerConfig {
        &self.config
    }

    fn consumers(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn BrokerConsumer>>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start watching a dead-letter topic. Watching a topic twice is a no-op.
    pub fn watch_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let mut consumers = self.consumers();
        if consumers.contains_key(topic) {
            return Ok(());
        }
        let consumer = self.client.subscribe(topic, &self.config.subscription)?;
        consumers.insert(topic.to_string(), consumer);
        info!(topic = %topic, "watching dead-letter topic");
        Ok(())
    }

    pub fn watched_topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.consumers().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Check every watched consumer and re-subscribe the disconnected ones.
    pub fn health_check(&self) -> Vec<TopicHealth> {
        let mut consumers = self.consumers();
        let mut report = Vec::with_capacity(consumers.len());

        for (topic, consumer) in consumers.iter_mut() {
            if consumer.is_connected() {
                report.push(TopicHealth {
                    topic: topic.clone(),
                    connected: true,
                    resubscribed: false,
                    error: None,
                });
                continue;
            }

            warn!(topic = %topic, "dead-letter consumer disconnected, re-subscribing");
            let _ = consumer.close();
            match self.client.subscribe(topic, &self.config.subscription) {
                Ok(fresh) => {
                    *consumer = fresh;
                    report.push(TopicHealth {
                        topic: topic.clone(),
                        connected: true,
                        resubscribed: true,
                        error: None,
                    });
                }
                Err(e) => {
                    error!(topic = %topic, error = %e, "dead-letter re-subscribe failed");
                    report.push(TopicHealth {
                        topic: topic.clone(),
                        connected: false,
                        resubscribed: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        report.sort_by(|a, b| a.topic.cmp(&b.topic));
        report
    }

    /// Drain every watched topic once, expiring dead letters older than the
    /// expiry window and re-publishing the rest.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> SweepReport {
        let watched: Vec<_> = self
            .consumers()
            .iter()
            .map(|(topic, consumer)| (topic.clone(), consumer.clone()))
            .collect();

        let mut report = SweepReport::default();
        for (topic, consumer) in watched {
            self.sweep_topic(&topic, consumer.as_ref(), now, &mut report);
        }

        let cutoff = chrono::Duration::from_std(self.config.expiry_window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window));
        if let (Some(store), Some(cutoff)) = (&self.store, cutoff) {
            match store.expire_older_than(cutoff) {
                Ok(n) if n > 0 => debug!(expired = n, "expired stored dead letters"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "failed to expire stored dead letters"),
            }
        }
        if let Some(retry) = &self.retry {
            retry.prune_idle(now);
        }

        info!(
            scanned = report.scanned,
            expired = report.expired,
            republished = report.republished,
            failed = report.failed,
            "dead-letter sweep finished"
        );
        report
    }

    fn sweep_topic(
        &self,
        topic: &str,
        consumer: &dyn BrokerConsumer,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        // Ids we put back during this sweep; seeing one means the topic has wrapped around.
        let mut republished = HashSet::new();

        for _ in 0..self.config.max_sweep_messages {
            let message = match consumer.receive(self.config.drain_timeout) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "dead-letter sweep receive failed");
                    break;
                }
            };

            if republished.contains(&message.id()) {
                let _ = consumer.negative_acknowledge(&message);
                break;
            }
            report.scanned += 1;

            if self.is_expired(&message, now) {
                match consumer.acknowledge(&message) {
                    Ok(()) => report.expired += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(topic = %topic, message_id = %message.id(), error = %e, "failed to ack expired dead letter");
                    }
                }
                continue;
            }

            match self.republish(topic, &message) {
                Ok(id) => {
                    republished.insert(id);
                    if let Err(e) = consumer.acknowledge(&message) {
                        warn!(topic = %topic, message_id = %message.id(), error = %e, "failed to ack republished dead letter");
                    }
                    report.republished += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    error!(topic = %topic, message_id = %message.id(), error = %e, "failed to republish dead letter");
                    let _ = consumer.negative_acknowledge(&message);
                }
            }
        }
    }

    fn is_expired(&self, message: &InboundMessage, now: DateTime<Utc>) -> bool {
        let age = (now - dead_letter_failure_time(message))
            .to_std()
            .unwrap_or_default();
        age > self.config.expiry_window
    }

    fn republish(&self, topic: &str, message: &InboundMessage) -> Result<courier_core::MessageId, BrokerError> {
        let outbound = OutboundMessage::new(message.payload().to_vec())
            .with_optional_key(message.key().map(str::to_string))
            .with_properties(message.properties().clone());
        self.producer.send(topic, outbound)
    }

    /// Run health checks and sweeps on a background thread.
    pub fn spawn(self: Arc<Self>) -> DeadLetterManagerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("courier-dlq-manager".to_string())
            .spawn(move || manager_loop(&self, shutdown_rx))
            .expect("failed to spawn dead-letter manager thread");

        DeadLetterManagerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }

    /// Release every watched consumer.
    pub fn close(&self) {
        for (topic, consumer) in self.consumers().drain() {
            if let Err(e) = consumer.close() {
                warn!(topic = %topic, error = %e, "failed to close dead-letter consumer");
            }
        }
    }
}

fn manager_loop(manager: &DeadLetterQueueManager, shutdown_rx: mpsc::Receiver<()>) {
    info!("dead-letter manager started");
    let mut last_health = Instant::now();
    let mut last_sweep = Instant::now();

    loop {
        match shutdown_rx.recv_timeout(manager.config.tick) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        if last_health.elapsed() >= manager.config.health_check_interval {
            manager.health_check();
            last_health = Instant::now();
        }
        if last_sweep.elapsed() >= manager.config.sweep_interval {
            manager.sweep_expired(Utc::now());
            last_sweep = Instant::now();
        }
    }

    manager.close();
    info!("dead-letter manager stopped");
}

/// Handle to control and join the manager thread.
#[derive(Debug)]
pub struct DeadLetterManagerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl DeadLetterManagerHandle {
    /// Request shutdown and wait for the manager to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
