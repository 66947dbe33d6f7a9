use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::{broadcast, Notify, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::{Backoff, ExponentialBackoff};
use crate::clock::{Clock, SystemClock, UnixTimeMs};
use crate::config::QueueConfig;
use crate::error::{QueueError, StorageError, TransportError};
use crate::item::{ItemId, ItemState, Payload, Priority, QueueItem};
use crate::metrics::{
    HealthTracker, MetricsSnapshot, QueueEvent, QueueMetrics, QueueStats, StorageHealth,
};
use crate::ordering::sort_for_dispatch;
use crate::storage::QueueStorage;

/// What the transport reported for one attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed { error: Option<String> },
}

impl DeliveryOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        DeliveryOutcome::Failed {
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

impl From<Result<(), TransportError>> for DeliveryOutcome {
    fn from(result: Result<(), TransportError>) -> Self {
        match result {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(e) => DeliveryOutcome::Failed {
                error: Some(e.description),
            },
        }
    }
}

/// Effect of [`QueueManager::record_outcome`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutcomeRecord {
    /// Delivered; the item is gone.
    Removed,
    Rescheduled {
        attempts: u32,
        next_retry_at: UnixTimeMs,
    },
    TerminalFailed {
        attempts: u32,
    },
    /// No item with that id (already delivered, dequeued, cleared or expired).
    Unknown,
}

/// An item dropped at load because it failed structural validation.
#[derive(Clone, Debug, PartialEq)]
pub struct QuarantinedItem {
    pub item: QueueItem,
    pub reason: String,
    pub quarantined_at: UnixTimeMs,
}

struct QueueState {
    items: Vec<QueueItem>,
    quarantined: Vec<QuarantinedItem>,
}

impl QueueState {
    /// What goes to storage: live items, then quarantined ones so they survive
    /// until an operator clears them.
    fn snapshot(&self) -> Cow<'_, [QueueItem]> {
        if self.quarantined.is_empty() {
            return Cow::Borrowed(&self.items);
        }
        Cow::Owned(
            self.items
                .iter()
                .chain(self.quarantined.iter().map(|entry| &entry.item))
                .cloned()
                .collect(),
        )
    }
}

/// Owner of the delivery queue.
///
/// Every mutation holds the write lock across "mutate, persist", so durable
/// state follows memory one operation at a time. Reads take the read lock just
/// long enough to copy what they return.
pub struct QueueManager<S: QueueStorage> {
    storage: Arc<S>,
    config: QueueConfig,
    backoff: Arc<dyn Backoff>,
    clock: Arc<dyn Clock>,
    state: RwLock<QueueState>,
    metrics: QueueMetrics,
    health: HealthTracker,
    events: broadcast::Sender<QueueEvent>,
    wake: Notify,
}

impl<S: QueueStorage> QueueManager<S> {
    /// Open with the configured exponential backoff and the system clock.
    pub async fn open(storage: Arc<S>, config: QueueConfig) -> Result<Self, QueueError> {
        let backoff = Arc::new(ExponentialBackoff::new(&config.backoff));
        Self::open_with(storage, config, backoff, Arc::new(SystemClock)).await
    }

    /// Load the persisted snapshot and purge expired items.
    ///
    /// A snapshot that cannot be read fails the open; nothing is written.
    #[instrument(skip_all)]
    pub async fn open_with(
        storage: Arc<S>,
        config: QueueConfig,
        backoff: Arc<dyn Backoff>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let loaded = storage.load().await.map_err(|e| {
            error!(error = %e, "Failed to load queue snapshot");
            QueueError::Storage(e)
        })?;

        let now = clock.now();
        let loaded_count = loaded.len();
        let mut seen = HashSet::with_capacity(loaded_count);
        let mut items = Vec::with_capacity(loaded_count);
        let mut quarantined = Vec::new();
        let mut expired = 0usize;

        for item in loaded {
            if item.is_expired(now, config.expiry_window_ms) {
                debug!(item_id = %item.id, "Dropping expired item");
                expired += 1;
                continue;
            }

            let rejection = match item.validate() {
                Err(reason) => Some(reason),
                Ok(()) if !seen.insert(item.id.clone()) => Some("duplicate id"),
                Ok(()) => None,
            };

            match rejection {
                Some(reason) => {
                    warn!(item_id = %item.id, reason, "Quarantining invalid item");
                    quarantined.push(QuarantinedItem {
                        item,
                        reason: reason.to_string(),
                        quarantined_at: now,
                    });
                }
                None => items.push(item),
            }
        }

        let (events, _) = broadcast::channel(config.event_capacity);
        let metrics = QueueMetrics::new();
        QueueMetrics::incr(&metrics.items_expired, expired as u64);
        QueueMetrics::incr(&metrics.items_quarantined, quarantined.len() as u64);

        let quarantined_count = quarantined.len();

        let manager = Self {
            storage,
            config,
            backoff,
            clock,
            state: RwLock::new(QueueState { items, quarantined }),
            metrics,
            health: HealthTracker::default(),
            events,
            wake: Notify::new(),
        };

        // Quarantine alone leaves storage untouched.
        if expired > 0 {
            let state = manager.state.write().await;
            manager.persist_snapshot(&state).await;
            drop(state);
            manager.publish(QueueEvent::Expired { count: expired });
        }

        info!(
            loaded = loaded_count,
            expired,
            quarantined = quarantined_count,
            "Queue opened"
        );

        Ok(manager)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn now(&self) -> UnixTimeMs {
        self.clock.now()
    }

    /// Add a new item and persist. `max_attempts` falls back to the configured
    /// default; zero is raised to one.
    #[instrument(skip(self, payload))]
    pub async fn enqueue(
        &self,
        payload: Payload,
        priority: Priority,
        max_attempts: Option<u32>,
    ) -> ItemId {
        let requested = max_attempts.unwrap_or(self.config.default_max_attempts);
        if requested == 0 {
            warn!("max_attempts of 0 raised to 1");
        }

        let mut item = QueueItem::new(payload, priority, requested, self.clock.now());

        let mut state = self.state.write().await;
        while state.items.iter().any(|existing| existing.id == item.id) {
            item.id = ItemId::generate();
        }
        let id = item.id.clone();
        state.items.push(item);
        self.persist_snapshot(&state).await;
        drop(state);

        QueueMetrics::incr(&self.metrics.items_enqueued, 1);
        self.publish(QueueEvent::Enqueued {
            id: id.clone(),
            priority,
        });
        self.wake.notify_one();

        info!(item_id = %id, "Item enqueued");
        id
    }

    /// Remove an item regardless of its state. Unknown ids return false.
    #[instrument(skip(self, id), fields(item_id = %id))]
    pub async fn dequeue(&self, id: &ItemId) -> bool {
        let mut state = self.state.write().await;
        let Some(index) = state.items.iter().position(|item| &item.id == id) else {
            return false;
        };

        state.items.remove(index);
        self.persist_snapshot(&state).await;
        drop(state);

        QueueMetrics::incr(&self.metrics.items_dequeued, 1);
        self.publish(QueueEvent::Dequeued { id: id.clone() });
        info!("Item dequeued");
        true
    }

    /// Items due at `now` that still have attempts left, in dispatch order.
    pub async fn select_ready(&self, now: UnixTimeMs) -> Vec<QueueItem> {
        let mut ready: Vec<_> = {
            let state = self.state.read().await;
            state
                .items
                .iter()
                .filter(|item| item.is_ready(now))
                .cloned()
                .collect()
        };

        sort_for_dispatch(&mut ready);
        ready
    }

    /// Apply a transport result to the item. Unknown ids are a no-op.
    #[instrument(skip(self, id, outcome), fields(item_id = %id, success = outcome.is_success()))]
    pub async fn record_outcome(&self, id: &ItemId, outcome: DeliveryOutcome) -> OutcomeRecord {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let Some(index) = state.items.iter().position(|item| &item.id == id) else {
            debug!("Outcome for unknown item ignored");
            return OutcomeRecord::Unknown;
        };

        let record = match outcome {
            DeliveryOutcome::Delivered => {
                state.items.remove(index);
                OutcomeRecord::Removed
            }
            DeliveryOutcome::Failed { error } => {
                let item = &mut state.items[index];
                if item.is_terminal() {
                    debug!("Failure for terminal item ignored");
                    return OutcomeRecord::TerminalFailed {
                        attempts: item.attempts,
                    };
                }

                let backoff = &self.backoff;
                match item.record_failure(now, error, |attempts| backoff.delay(attempts)) {
                    ItemState::Pending => OutcomeRecord::Rescheduled {
                        attempts: item.attempts,
                        next_retry_at: item.next_retry_at,
                    },
                    ItemState::TerminalFailed => OutcomeRecord::TerminalFailed {
                        attempts: item.attempts,
                    },
                }
            }
        };

        self.persist_snapshot(&state).await;
        drop(state);

        match &record {
            OutcomeRecord::Removed => {
                QueueMetrics::incr(&self.metrics.items_delivered, 1);
                self.publish(QueueEvent::Delivered { id: id.clone() });
                info!("Item delivered");
            }
            OutcomeRecord::Rescheduled {
                attempts,
                next_retry_at,
            } => {
                QueueMetrics::incr(&self.metrics.retries_scheduled, 1);
                self.publish(QueueEvent::RetryScheduled {
                    id: id.clone(),
                    attempts: *attempts,
                    next_retry_at: *next_retry_at,
                });
                info!(attempts, next_retry_at = next_retry_at.as_millis(), "Retry scheduled");
            }
            OutcomeRecord::TerminalFailed { attempts } => {
                QueueMetrics::incr(&self.metrics.items_terminal_failed, 1);
                self.publish(QueueEvent::TerminalFailed {
                    id: id.clone(),
                    attempts: *attempts,
                });
                warn!(attempts, "Item exhausted its attempts");
            }
            OutcomeRecord::Unknown => {}
        }

        record
    }

    /// Items that exhausted their attempts, in stored order.
    pub async fn get_failed(&self) -> Vec<QueueItem> {
        let state = self.state.read().await;
        state
            .items
            .iter()
            .filter(|item| item.is_terminal())
            .cloned()
            .collect()
    }

    /// Remove every terminal-failed item. Returns how many were removed.
    #[instrument(skip(self))]
    pub async fn clear_failed(&self) -> usize {
        let mut state = self.state.write().await;
        let before = state.items.len();
        state.items.retain(|item| !item.is_terminal());
        let removed = before - state.items.len();

        if removed == 0 {
            return 0;
        }

        self.persist_snapshot(&state).await;
        drop(state);

        QueueMetrics::incr(&self.metrics.failed_cleared, removed as u64);
        self.publish(QueueEvent::FailedCleared { count: removed });
        info!(removed, "Cleared failed items");
        removed
    }

    /// Give a terminal-failed item a fresh attempt budget.
    #[instrument(skip(self, id), fields(item_id = %id))]
    pub async fn requeue(&self, id: &ItemId) -> bool {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let requeued = state
            .items
            .iter_mut()
            .find(|item| &item.id == id)
            .is_some_and(|item| item.requeue(now));

        if !requeued {
            return false;
        }

        self.persist_snapshot(&state).await;
        drop(state);

        QueueMetrics::incr(&self.metrics.items_requeued, 1);
        self.publish(QueueEvent::Requeued { id: id.clone() });
        self.wake.notify_one();
        info!("Item requeued");
        true
    }

    pub async fn stats(&self) -> QueueStats {
        let now = self.clock.now();
        let state = self.state.read().await;

        let mut stats = QueueStats {
            total: state.items.len(),
            ..Default::default()
        };

        for item in &state.items {
            if item.is_terminal() {
                stats.failed_count += 1;
            } else if item.is_ready(now) {
                stats.pending_count += 1;
            }
            *stats.by_priority.entry(item.priority).or_insert(0) += 1;
        }

        stats
    }

    pub async fn get(&self, id: &ItemId) -> Option<QueueItem> {
        let state = self.state.read().await;
        state.items.iter().find(|item| &item.id == id).cloned()
    }

    /// Full snapshot in stored order.
    pub async fn items(&self) -> Vec<QueueItem> {
        self.state.read().await.items.clone()
    }

    /// Earliest `next_retry_at` among items that can still be retried.
    pub async fn next_due_at(&self) -> Option<UnixTimeMs> {
        let state = self.state.read().await;
        state
            .items
            .iter()
            .filter(|item| !item.is_terminal())
            .map(|item| item.next_retry_at)
            .min()
    }

    pub async fn quarantined(&self) -> Vec<QuarantinedItem> {
        self.state.read().await.quarantined.clone()
    }

    /// Drop every quarantined item from memory and storage. Returns how many
    /// were dropped.
    #[instrument(skip(self))]
    pub async fn clear_quarantined(&self) -> usize {
        let mut state = self.state.write().await;
        let removed = state.quarantined.len();
        if removed == 0 {
            return 0;
        }

        state.quarantined.clear();
        self.persist_snapshot(&state).await;
        drop(state);

        warn!(removed, "Discarded quarantined items");
        removed
    }

    /// Write the current snapshot now and report the result directly.
    pub async fn persist(&self) -> Result<(), StorageError> {
        let state = self.state.write().await;
        match self.storage.save(&state.snapshot()).await {
            Ok(()) => {
                self.health.record_success();
                Ok(())
            }
            Err(e) => {
                self.note_storage_failure(&e);
                Err(e)
            }
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn health(&self) -> StorageHealth {
        self.health.snapshot()
    }

    /// Subscribe to state changes. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Resolves after the next enqueue or requeue (or immediately if one
    /// happened since the last wait).
    pub fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    /// Storage failures are absorbed: memory stays authoritative and the
    /// failure goes to logs, metrics, health and subscribers.
    async fn persist_snapshot(&self, state: &QueueState) {
        match self.storage.save(&state.snapshot()).await {
            Ok(()) => self.health.record_success(),
            Err(e) => self.note_storage_failure(&e),
        }
    }

    fn note_storage_failure(&self, e: &StorageError) {
        let message = e.to_string();
        let consecutive = self.health.record_failure(&message, self.clock.now());
        QueueMetrics::incr(&self.metrics.storage_errors, 1);
        error!(error = %message, consecutive, "Failed to persist queue snapshot");
        self.publish(QueueEvent::StorageFailed {
            error: message,
            consecutive_failures: consecutive,
        });
    }

    fn publish(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
