//! Live telemetry: keep client state in step with a server whose data keeps
//! changing.
//!
//! - [`connection`]: one multiplexed bidirectional channel per session
//! - [`events`]: filtered, resumable domain event feed
//! - [`log_tail`]: offset-addressed log following
//! - [`execution`]: per-execution status/log feed with cache invalidation
//! - [`visibility`] and [`poller`]: foreground-gated repeating work
//!
//! Every component owns its transport, reports a small status value through a
//! `watch` channel, and closes everything it opened when dropped.

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod execution;
pub mod log_tail;
pub mod metrics;
pub mod poller;
pub mod push;
pub mod visibility;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use cache::{CacheInvalidator, CacheKey};
pub use config::Settings;
pub use connection::{ConnectionManager, ConnectionState};
pub use error::StreamError;
pub use events::{EventFilter, EventStreamClient, EventStreamState};
pub use execution::{ExecutionStreamClient, ExecutionStreamState};
pub use log_tail::{LogTailState, LogTailer};
pub use metrics::StreamMetrics;
pub use poller::Poller;
pub use push::StreamStatus;
pub use visibility::{VisibilityGate, VisibilityWatch};

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
