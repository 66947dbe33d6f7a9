//! Delivery loop driving a [`QueueManager`] through an external [`Sender`].
//!
//! Items are taken in `select_ready` order and each one gets its concurrency
//! permit before its task is spawned, so sends start in dispatch order. Each
//! item is claimed into an in-flight set before its send starts and released
//! when its outcome has been recorded, so one id is never sent twice at the
//! same time. Shutdown aborts outstanding sends without recording an outcome:
//! those items keep their attempts and go out again on the next start.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::config::DispatchConfig;
use crate::error::{QueueError, TransportError};
use crate::item::{ItemId, Payload, QueueItem};
use crate::manager::{DeliveryOutcome, OutcomeRecord, QueueManager};
use crate::storage::QueueStorage;

/// Outbound transport (SMTP client, HTTP relay, ...).
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, payload: &Payload) -> Result<(), TransportError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
}

impl DispatchReport {
    fn tally(&mut self, record: &OutcomeRecord) {
        match record {
            OutcomeRecord::Removed => self.delivered += 1,
            OutcomeRecord::Rescheduled { .. } => self.retried += 1,
            OutcomeRecord::TerminalFailed { .. } => self.failed += 1,
            OutcomeRecord::Unknown => {}
        }
    }
}

type InFlight = Arc<Mutex<HashSet<ItemId>>>;

/// How a dispatch pass gets concurrency permits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    /// Wait for each permit in turn (one-shot passes).
    Wait,
    /// Take only permits free right now; the rest is re-selected later.
    Available,
}

/// Holds one id in the in-flight set. Dropping it (normal completion, abort,
/// or a panicking sender) releases the id.
struct InFlightGuard {
    set: InFlight,
    id: ItemId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct Dispatcher<S: QueueStorage + 'static> {
    queue: Arc<QueueManager<S>>,
    sender: Arc<dyn Sender>,
    config: DispatchConfig,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
}

impl<S: QueueStorage + 'static> Dispatcher<S> {
    pub fn new(
        queue: Arc<QueueManager<S>>,
        sender: Arc<dyn Sender>,
        config: DispatchConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            queue,
            sender,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn queue(&self) -> &Arc<QueueManager<S>> {
        &self.queue
    }

    /// Ids currently being sent.
    pub fn in_flight(&self) -> Vec<ItemId> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Send everything ready right now (up to `batch_limit`) and wait for
    /// every outcome.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> DispatchReport {
        let mut tasks = JoinSet::new();
        let dispatched = self.dispatch_ready(&mut tasks, Admission::Wait).await;

        let mut report = DispatchReport {
            dispatched,
            ..Default::default()
        };
        while let Some(joined) = tasks.join_next().await {
            Self::reap(joined, &mut report);
        }

        debug!(?report, "Dispatch pass finished");
        report
    }

    /// Dispatch on every poll tick and enqueue notification until `shutdown`
    /// turns true (or its sender is dropped).
    #[instrument(skip_all)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> DispatchReport {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut tasks = JoinSet::new();
        let mut report = DispatchReport::default();

        info!(
            max_concurrency = self.config.max_concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            "Dispatcher started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    report.dispatched += self.dispatch_ready(&mut tasks, Admission::Available).await;
                }
                _ = self.queue.notified() => {
                    report.dispatched += self.dispatch_ready(&mut tasks, Admission::Available).await;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    Self::reap(joined, &mut report);
                    // A permit just freed up.
                    report.dispatched += self.dispatch_ready(&mut tasks, Admission::Available).await;
                }
            }
        }

        let abandoned = tasks.len();
        tasks.shutdown().await;

        info!(
            abandoned,
            delivered = report.delivered,
            retried = report.retried,
            failed = report.failed,
            "Dispatcher stopped"
        );
        report
    }

    /// Walk ready items in dispatch order: obtain a permit, claim the item if
    /// it is not already in flight, then spawn its send. Returns how many were
    /// spawned.
    async fn dispatch_ready(
        &self,
        tasks: &mut JoinSet<OutcomeRecord>,
        admission: Admission,
    ) -> usize {
        let now = self.queue.now();
        let ready = self.queue.select_ready(now).await;
        let mut count = 0;

        for item in ready {
            if count >= self.config.batch_limit {
                break;
            }
            if self.is_in_flight(&item.id) {
                continue;
            }
            let Some(permit) = self.permit(admission).await else {
                break;
            };
            // Already in flight: the permit goes back.
            let Some(guard) = self.claim(&item.id) else {
                continue;
            };

            self.spawn_delivery(tasks, item, guard, permit);
            count += 1;
        }

        if count > 0 {
            debug!(count, "Dispatched ready items");
        }
        count
    }

    fn is_in_flight(&self, id: &ItemId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn claim(&self, id: &ItemId) -> Option<InFlightGuard> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());

        inserted.then(|| InFlightGuard {
            set: Arc::clone(&self.in_flight),
            id: id.clone(),
        })
    }

    async fn permit(&self, admission: Admission) -> Option<OwnedSemaphorePermit> {
        let permits = Arc::clone(&self.permits);
        match admission {
            Admission::Wait => permits.acquire_owned().await.ok(),
            Admission::Available => permits.try_acquire_owned().ok(),
        }
    }

    fn spawn_delivery(
        &self,
        tasks: &mut JoinSet<OutcomeRecord>,
        item: QueueItem,
        guard: InFlightGuard,
        permit: OwnedSemaphorePermit,
    ) {
        let queue = Arc::clone(&self.queue);
        let sender = Arc::clone(&self.sender);

        tasks.spawn(async move {
            let _guard = guard;
            let _permit = permit;

            let result = sender.send(&item.payload).await;
            if let Err(e) = &result {
                debug!(item_id = %item.id, error = %e, "Send failed");
            }

            queue.record_outcome(&item.id, DeliveryOutcome::from(result)).await
        });
    }

    fn reap(joined: Result<OutcomeRecord, JoinError>, report: &mut DispatchReport) {
        match joined {
            Ok(record) => report.tally(&record),
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!(error = %e, "Delivery task panicked"),
        }
    }
}
