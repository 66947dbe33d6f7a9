//! Durable, retrying delivery queue for outbound mail.
//!
//! [`QueueManager`] owns the queue: it accepts payloads, hands out ready items
//! in priority order, applies delivery outcomes with exponential backoff, and
//! persists a full snapshot through a [`QueueStorage`] adapter after every
//! change. [`Dispatcher`] drives it against a [`Sender`] with bounded
//! concurrency.
//!
//! The crate never installs a `tracing` subscriber; hosts do.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod backoff;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod item;
pub mod manager;
pub mod metrics;
pub mod ordering;
pub mod storage;

pub use backoff::{Backoff, ExponentialBackoff, FixedBackoff};
pub use clock::{Clock, ManualClock, SystemClock, UnixTimeMs};
pub use config::{BackoffConfig, DispatchConfig, QueueConfig};
pub use dispatch::{DispatchReport, Dispatcher, Sender};
pub use error::{QueueError, StorageError, TransportError};
pub use item::{ItemId, ItemState, Payload, Priority, QueueItem, DEFAULT_MAX_ATTEMPTS};
pub use manager::{DeliveryOutcome, OutcomeRecord, QuarantinedItem, QueueManager};
pub use metrics::{MetricsSnapshot, QueueEvent, QueueStats, StorageHealth};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use storage::SqliteStorage;
pub use storage::{FileStorage, MemoryStorage, QueueStorage};
