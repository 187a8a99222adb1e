//! In-memory broker for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

use courier_core::{InboundMessage, MessageId, OutboundMessage};

use crate::client::{BrokerClient, BrokerConsumer, BrokerError, BrokerProducer};

/// Default delay before a negatively acknowledged message is redelivered.
pub const DEFAULT_NACK_DELAY: Duration = Duration::from_secs(1);

/// In-memory pub/sub broker.
///
/// - No IO
/// - Every subscription sees every message published to its topic, including
///   messages published before it was created (earliest position)
/// - Consumers sharing a subscription name compete for messages
/// - Acks, nacks and reconsume requests are journaled for inspection
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Debug)]
struct BrokerState {
    topics: Mutex<HashMap<String, TopicState>>,
    journal: Mutex<Journal>,
    next_sequence: AtomicU64,
    nack_delay: Duration,
    failing_receives: AtomicU32,
    failing_settles: AtomicU32,
    failing_sends: AtomicBool,
}

#[derive(Debug, Default)]
struct TopicState {
    published: Vec<InboundMessage>,
    subscriptions: HashMap<String, Arc<SubscriptionQueue>>,
}

#[derive(Debug, Default)]
struct Journal {
    acked: HashMap<String, Vec<MessageId>>,
    nacked: HashMap<String, Vec<MessageId>>,
    reconsumed: HashMap<String, Vec<(MessageId, Duration)>>,
}

#[derive(Debug, Default)]
struct SubscriptionQueue {
    pending: Mutex<Vec<Pending>>,
    ready: Condvar,
}

#[derive(Debug)]
struct Pending {
    deliver_at: Instant,
    message: InboundMessage,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SubscriptionQueue {
    fn push(&self, message: InboundMessage, deliver_at: Instant) {
        lock(&self.pending).push(Pending {
            deliver_at,
            message,
        });
        self.ready.notify_all();
    }

    fn len(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_nack_delay(DEFAULT_NACK_DELAY)
    }

    pub fn with_nack_delay(nack_delay: Duration) -> Self {
        Self {
            state: Arc::new(BrokerState {
                topics: Mutex::new(HashMap::new()),
                journal: Mutex::new(Journal::default()),
                next_sequence: AtomicU64::new(1),
                nack_delay,
                failing_receives: AtomicU32::new(0),
                failing_settles: AtomicU32::new(0),
                failing_sends: AtomicBool::new(false),
            }),
        }
    }

    /// Publish directly (no interceptors), returning the assigned id.
    pub fn publish(&self, topic: &str, message: OutboundMessage) -> Result<MessageId, BrokerError> {
        self.state.publish(topic, message)
    }

    /// Make the next `count` receive calls (on any consumer) fail.
    pub fn fail_next_receives(&self, count: u32) {
        self.state.failing_receives.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` acknowledge, nack or reconsume calls fail.
    pub fn fail_next_settles(&self, count: u32) {
        self.state.failing_settles.store(count, Ordering::SeqCst);
    }

    /// Make every send fail until switched back.
    pub fn set_send_failure(&self, failing: bool) {
        self.state.failing_sends.store(failing, Ordering::SeqCst);
    }

    /// Every message ever published to `topic`.
    pub fn published(&self, topic: &str) -> Vec<InboundMessage> {
        lock(&self.state.topics)
            .get(topic)
            .map(|t| t.published.clone())
            .unwrap_or_default()
    }

    pub fn acknowledged(&self, topic: &str) -> Vec<MessageId> {
        lock(&self.state.journal)
            .acked
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn negatively_acknowledged(&self, topic: &str) -> Vec<MessageId> {
        lock(&self.state.journal)
            .nacked
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn reconsumed(&self, topic: &str) -> Vec<(MessageId, Duration)> {
        lock(&self.state.journal)
            .reconsumed
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages waiting (ready or delayed) on one subscription.
    pub fn backlog(&self, topic: &str, subscription: &str) -> usize {
        lock(&self.state.topics)
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription))
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerState {
    fn publish(&self, topic: &str, message: OutboundMessage) -> Result<MessageId, BrokerError> {
        if self.failing_sends.load(Ordering::SeqCst) {
            return Err(BrokerError::Send(format!("injected send failure on {topic}")));
        }

        let id = MessageId::new(0, self.next_sequence.fetch_add(1, Ordering::SeqCst));
        let deliver_at = Instant::now() + message.delivery_delay().unwrap_or_default();

        let mut inbound = InboundMessage::new(id, topic, message.payload().to_vec())
            .with_properties(message.properties().clone())
            .with_publish_time(Utc::now());
        if let Some(key) = message.key() {
            inbound = inbound.with_key(key);
        }

        let mut topics = lock(&self.topics);
        let state = topics.entry(topic.to_string()).or_default();
        state.published.push(inbound.clone());
        for queue in state.subscriptions.values() {
            queue.push(inbound.clone(), deliver_at);
        }

        debug!(topic = %topic, message_id = %id, "published");
        Ok(id)
    }

    fn redeliver(&self, queue: &SubscriptionQueue, message: &InboundMessage, delay: Duration) {
        let redelivered = message
            .clone()
            .with_redelivery_count(message.redelivery_count().saturating_add(1));
        queue.push(redelivered, Instant::now() + delay);
    }
}

impl BrokerClient for InMemoryBroker {
    fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        if subscription.is_empty() {
            return Err(BrokerError::Subscription(
                "subscription name must not be empty".to_string(),
            ));
        }

        let queue = {
            let mut topics = lock(&self.state.topics);
            let state = topics.entry(topic.to_string()).or_default();
            let backlog = state.published.clone();
            state
                .subscriptions
                .entry(subscription.to_string())
                .or_insert_with(|| {
                    let queue = SubscriptionQueue::default();
                    let now = Instant::now();
                    for message in backlog {
                        queue.push(message, now);
                    }
                    Arc::new(queue)
                })
                .clone()
        };

        Ok(Arc::new(InMemoryConsumer {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            queue,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn producer(&self) -> Arc<dyn BrokerProducer> {
        Arc::new(InMemoryProducer {
            state: self.state.clone(),
        })
    }
}

#[derive(Debug)]
struct InMemoryProducer {
    state: Arc<BrokerState>,
}

impl BrokerProducer for InMemoryProducer {
    fn send(&self, topic: &str, message: OutboundMessage) -> Result<MessageId, BrokerError> {
        self.state.publish(topic, message)
    }
}

#[derive(Debug)]
struct InMemoryConsumer {
    topic: String,
    subscription: String,
    queue: Arc<SubscriptionQueue>,
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

impl InMemoryConsumer {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_settleable(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let injected = self
            .state
            .failing_settles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(BrokerError::Acknowledge("injected settle failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

impl BrokerConsumer for InMemoryConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn subscription(&self) -> &str {
        &self.subscription
    }

    fn receive(&self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        self.ensure_open()?;

        let injected = self
            .state
            .failing_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(BrokerError::Connection("injected receive failure".to_string()));
        }

        let deadline = Instant::now() + timeout;
        let mut pending = lock(&self.queue.pending);

        loop {
            self.ensure_open()?;

            let now = Instant::now();
            if let Some(pos) = pending.iter().position(|p| p.deliver_at <= now) {
                return Ok(Some(pending.remove(pos).message));
            }
            if now >= deadline {
                return Ok(None);
            }

            let next_ready = pending.iter().map(|p| p.deliver_at).min();
            let wake_at = next_ready.map_or(deadline, |at| at.min(deadline));
            let (guard, _) = self
                .queue
                .ready
                .wait_timeout(pending, wake_at.saturating_duration_since(now))
                .unwrap_or_else(PoisonError::into_inner);
            pending = guard;
        }
    }

    fn acknowledge(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        self.ensure_settleable()?;
        lock(&self.state.journal)
            .acked
            .entry(self.topic.clone())
            .or_default()
            .push(message.id());
        Ok(())
    }

    fn negative_acknowledge(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        self.ensure_settleable()?;
        lock(&self.state.journal)
            .nacked
            .entry(self.topic.clone())
            .or_default()
            .push(message.id());
        self.state
            .redeliver(&self.queue, message, self.state.nack_delay);
        Ok(())
    }

    fn reconsume_later(&self, message: &InboundMessage, delay: Duration) -> Result<(), BrokerError> {
        self.ensure_settleable()?;
        lock(&self.state.journal)
            .reconsumed
            .entry(self.topic.clone())
            .or_default()
            .push((message.id(), delay));
        self.state.redeliver(&self.queue, message, delay);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        // Wake any receive blocked on this subscription so it observes the close.
        let _guard = lock(&self.queue.pending);
        self.queue.ready.notify_all();
        Ok(())
    }
}
