//! Listener container lifecycle and receive loop.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use courier_broker::{BrokerClient, BrokerConsumer, BrokerError};

use super::dispatcher::{ContainerStatsSnapshot, MessageDispatcher};

/// Lifecycle: `Created → Running → Stopping → Stopped`, and back to `Running`
/// on a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl ContainerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("failed to subscribe to `{topic}`: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("container is {0:?}")]
    InvalidState(ContainerState),
}

/// Owns one subscription and the worker thread draining it.
///
/// The consumer is created on `start` and released on `stop`, so a stopped
/// container can be started again.
pub struct ListenerContainer {
    name: String,
    client: Arc<dyn BrokerClient>,
    dispatcher: Arc<MessageDispatcher>,
    state: AtomicU8,
    running: Arc<AtomicBool>,
    consumer: Mutex<Option<Arc<dyn BrokerConsumer>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    lifecycle: Mutex<()>,
}

impl std::fmt::Debug for ListenerContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerContainer")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ListenerContainer {
    pub fn new(client: Arc<dyn BrokerClient>, dispatcher: MessageDispatcher) -> Self {
        let name = format!(
            "courier-listener-{}-{}",
            dispatcher.topic(),
            dispatcher.config().subscription
        );
        Self {
            name,
            client,
            dispatcher: Arc::new(dispatcher),
            state: AtomicU8::new(ContainerState::Created.as_u8()),
            running: Arc::new(AtomicBool::new(false)),
            consumer: Mutex::new(None),
            worker: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        self.dispatcher.topic()
    }

    pub fn state(&self) -> ContainerState {
        ContainerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ContainerState::Running
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> ContainerStatsSnapshot {
        self.dispatcher.stats().snapshot()
    }

    fn set_state(&self, state: ContainerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Subscribe and start the worker. A no-op while running.
    pub fn start(&self) -> Result<(), ContainerError> {
        let _lifecycle = lock(&self.lifecycle);
        match self.state() {
            ContainerState::Running => return Ok(()),
            ContainerState::Stopping => {
                return Err(ContainerError::InvalidState(ContainerState::Stopping));
            }
            ContainerState::Created | ContainerState::Stopped => {}
        }

        let topic = self.dispatcher.topic().to_string();
        let subscription = self.dispatcher.config().subscription.clone();
        let consumer = self
            .client
            .subscribe(&topic, &subscription)
            .map_err(|source| ContainerError::Subscribe {
                topic: topic.clone(),
                source,
            })?;

        self.running.store(true, Ordering::SeqCst);
        let worker = {
            let consumer = consumer.clone();
            let dispatcher = self.dispatcher.clone();
            let running = self.running.clone();
            let name = self.name.clone();
            thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || receive_loop(&name, consumer.as_ref(), &dispatcher, &running))
        };

        match worker {
            Ok(join) => {
                *lock(&self.consumer) = Some(consumer);
                *lock(&self.worker) = Some(join);
                self.set_state(ContainerState::Running);
                info!(container = %self.name, topic = %topic, subscription = %subscription, "listener container started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = consumer.close();
                Err(ContainerError::Spawn(e))
            }
        }
    }

    /// Stop the worker and release the consumer. Safe to call in any state.
    ///
    /// An in-flight handler runs to completion first.
    pub fn stop(&self) {
        let _lifecycle = lock(&self.lifecycle);
        match self.state() {
            ContainerState::Created => {
                self.set_state(ContainerState::Stopped);
                return;
            }
            ContainerState::Stopped | ContainerState::Stopping => return,
            ContainerState::Running => {}
        }

        self.set_state(ContainerState::Stopping);
        self.running.store(false, Ordering::SeqCst);

        if let Some(consumer) = lock(&self.consumer).take() {
            if let Err(e) = consumer.close() {
                warn!(container = %self.name, error = %e, "failed to close consumer");
            }
        }
        if let Some(join) = lock(&self.worker).take() {
            if join.join().is_err() {
                warn!(container = %self.name, "listener worker panicked");
            }
        }

        self.set_state(ContainerState::Stopped);
        info!(container = %self.name, "listener container stopped");
    }
}

impl Drop for ListenerContainer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    name: &str,
    consumer: &dyn BrokerConsumer,
    dispatcher: &MessageDispatcher,
    running: &AtomicBool,
) {
    let config = dispatcher.config();

    while running.load(Ordering::SeqCst) {
        match consumer.receive(config.receive_timeout) {
            Ok(Some(message)) => {
                let disposition = dispatcher.dispatch(&message, consumer);
                debug!(container = %name, message_id = %message.id(), ?disposition, "message dispatched");
            }
            Ok(None) => {}
            Err(BrokerError::Closed) if !running.load(Ordering::SeqCst) => break,
            Err(e) => {
                dispatcher.stats().record_receive_error();
                warn!(container = %name, error = %e, "receive failed");
                pause(running, config.error_backoff);
            }
        }
    }
}

/// Sleep for `backoff`, waking early once `running` drops.
fn pause(running: &AtomicBool, backoff: Duration) {
    let deadline = Instant::now() + backoff;
    let slice = Duration::from_millis(25);
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(slice.min(deadline - now));
    }
}
