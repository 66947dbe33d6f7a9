use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::clock::UnixTimeMs;
use crate::item::{ItemId, Priority};

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub items_enqueued: AtomicU64,
    pub items_delivered: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub items_terminal_failed: AtomicU64,
    pub items_dequeued: AtomicU64,
    pub items_requeued: AtomicU64,
    pub failed_cleared: AtomicU64,
    pub items_expired: AtomicU64,
    pub items_quarantined: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_enqueued: self.items_enqueued.load(Ordering::Relaxed),
            items_delivered: self.items_delivered.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            items_terminal_failed: self.items_terminal_failed.load(Ordering::Relaxed),
            items_dequeued: self.items_dequeued.load(Ordering::Relaxed),
            items_requeued: self.items_requeued.load(Ordering::Relaxed),
            failed_cleared: self.failed_cleared.load(Ordering::Relaxed),
            items_expired: self.items_expired.load(Ordering::Relaxed),
            items_quarantined: self.items_quarantined.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub items_enqueued: u64,
    pub items_delivered: u64,
    pub retries_scheduled: u64,
    pub items_terminal_failed: u64,
    pub items_dequeued: u64,
    pub items_requeued: u64,
    pub failed_cleared: u64,
    pub items_expired: u64,
    pub items_quarantined: u64,
    pub storage_errors: u64,
}

/// Point-in-time view of queue contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total: usize,
    /// Eligible right now: due and not terminal.
    pub pending_count: usize,
    pub failed_count: usize,
    pub by_priority: HashMap<Priority, usize>,
}

/// Durability signal. Degraded while the latest save attempt failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageHealth {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub last_failure_at: Option<UnixTimeMs>,
}

impl StorageHealth {
    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures > 0
    }
}

#[derive(Debug, Default)]
pub(crate) struct HealthTracker {
    inner: Mutex<StorageHealth>,
}

impl HealthTracker {
    pub(crate) fn record_success(&self) {
        if let Ok(mut health) = self.inner.lock() {
            health.consecutive_failures = 0;
        }
    }

    /// Returns the consecutive failure count including this one.
    pub(crate) fn record_failure(&self, error: &str, now: UnixTimeMs) -> u32 {
        match self.inner.lock() {
            Ok(mut health) => {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                health.total_failures = health.total_failures.saturating_add(1);
                health.last_error = Some(error.to_string());
                health.last_failure_at = Some(now);
                health.consecutive_failures
            }
            Err(_) => 0,
        }
    }

    pub(crate) fn snapshot(&self) -> StorageHealth {
        self.inner
            .lock()
            .map(|health| health.clone())
            .unwrap_or_default()
    }
}

/// State changes published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Enqueued {
        id: ItemId,
        priority: Priority,
    },
    Delivered {
        id: ItemId,
    },
    RetryScheduled {
        id: ItemId,
        attempts: u32,
        next_retry_at: UnixTimeMs,
    },
    TerminalFailed {
        id: ItemId,
        attempts: u32,
    },
    Dequeued {
        id: ItemId,
    },
    Requeued {
        id: ItemId,
    },
    FailedCleared {
        count: usize,
    },
    Expired {
        count: usize,
    },
    StorageFailed {
        error: String,
        consecutive_failures: u32,
    },
}
