//! Dead-letter subsystem: retry decisions, hand-off, storage, reprocessing
//! and background upkeep of dead-letter topics.

mod manager;
mod processor;
mod retry;
mod store;
mod types;

pub use manager::{
    DeadLetterManagerConfig, DeadLetterManagerHandle, DeadLetterQueueManager, SweepReport,
    TopicHealth,
};
pub use processor::{DeadLetterConfig, DeadLetterProcessor, DeadLetterStatsSnapshot};
pub use retry::{DeadLetterRetryStrategy, RetryStrategyConfig};
pub use store::{DeadLetterStore, DeadLetterStoreError, InMemoryDeadLetterStore};
pub use types::{
    BackoffFamily, BatchReprocessResult, DeadLetterId, DeadLetterMessage, RetryInfo,
    dead_letter_failure_time, keys,
};
