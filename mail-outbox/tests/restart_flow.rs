use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mail_outbox::{
    DeliveryOutcome, DispatchConfig, Dispatcher, ExponentialBackoff, FileStorage, ItemState,
    ManualClock, OutcomeRecord, Payload, Priority, QueueConfig, QueueError, QueueManager,
    QueueStorage, Sender, TransportError, UnixTimeMs,
};
use serde::{Deserialize, Serialize};
use tempfile::tempdir;

const T0: UnixTimeMs = UnixTimeMs(1_700_000_000_000);
const HOUR: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Message {
    to: String,
    subject: String,
}

fn message(to: &str) -> Payload {
    Payload::from_json(&Message {
        to: to.into(),
        subject: "Weekly digest".into(),
    })
    .unwrap()
}

async fn open<S: QueueStorage>(storage: S, clock: Arc<ManualClock>) -> QueueManager<S> {
    QueueManager::open_with(
        Arc::new(storage),
        QueueConfig::default(),
        Arc::new(ExponentialBackoff::default()),
        clock,
    )
    .await
    .unwrap()
}

/// Fails the first `failures` sends, then succeeds.
struct FlakySender {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Sender for FlakySender {
    async fn send(&self, _payload: &Payload) -> Result<(), TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(TransportError::new("421 service not available"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn file_queue_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.bin");
    let clock = Arc::new(ManualClock::new(T0));

    // 1. First process: enqueue three, fail one
    let (alice, bob, carol) = {
        let queue = open(FileStorage::new(&path), clock.clone()).await;
        let alice = queue.enqueue(message("alice@example.com"), Priority::Normal, None).await;
        let bob = queue.enqueue(message("bob@example.com"), Priority::High, Some(5)).await;
        let carol = queue.enqueue(message("carol@example.com"), Priority::Low, None).await;

        let record = queue
            .record_outcome(&alice, DeliveryOutcome::failed("421 busy"))
            .await;
        assert!(matches!(record, OutcomeRecord::Rescheduled { attempts: 1, .. }));
        assert!(!queue.health().is_degraded());
        (alice, bob, carol)
    };

    // 2. Second process sees exactly the same items
    let queue = open(FileStorage::new(&path), clock.clone()).await;
    let items = queue.items().await;
    assert_eq!(items.len(), 3);
    assert_eq!(
        items.iter().map(|item| item.id.clone()).collect::<Vec<_>>(),
        vec![alice.clone(), bob.clone(), carol.clone()]
    );

    let restored = queue.get(&alice).await.unwrap();
    assert_eq!(restored.attempts, 1);
    assert_eq!(restored.last_error.as_deref(), Some("421 busy"));
    assert_eq!(restored.last_attempt_at, Some(T0));
    assert_eq!(
        restored.payload.decode_json::<Message>().unwrap().to,
        "alice@example.com"
    );
    assert_eq!(queue.get(&bob).await.unwrap().max_attempts, 5);

    // 3. Ready order: High first, the retrying item is not due yet
    let ready: Vec<_> = queue
        .select_ready(T0)
        .await
        .into_iter()
        .map(|item| item.id)
        .collect();
    assert_eq!(ready, vec![bob, carol]);
}

#[tokio::test]
async fn stale_items_are_gone_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.bin");
    let clock = Arc::new(ManualClock::new(T0));

    let old = {
        let queue = open(FileStorage::new(&path), clock.clone()).await;
        queue.enqueue(message("old@example.com"), Priority::Normal, None).await
    };

    clock.advance(HOUR * 2);
    let recent = {
        let queue = open(FileStorage::new(&path), clock.clone()).await;
        queue.enqueue(message("new@example.com"), Priority::Normal, None).await
    };

    // 25h after the first enqueue, 23h after the second
    clock.set(T0.add_duration(HOUR * 25));
    let queue = open(FileStorage::new(&path), clock.clone()).await;

    assert!(queue.get(&old).await.is_none());
    assert!(queue.get(&recent).await.is_some());
    assert_eq!(queue.metrics().items_expired, 1);

    // The purge was written back.
    let on_disk = FileStorage::new(&path).load().await.unwrap();
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk[0].id, recent);
}

#[tokio::test]
async fn terminal_failures_persist_until_cleared() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.bin");
    let clock = Arc::new(ManualClock::new(T0));

    let id = {
        let queue = open(FileStorage::new(&path), clock.clone()).await;
        let id = queue.enqueue(message("nobody@example.com"), Priority::Normal, Some(1)).await;
        let record = queue
            .record_outcome(&id, DeliveryOutcome::failed("550 no such user"))
            .await;
        assert_eq!(record, OutcomeRecord::TerminalFailed { attempts: 1 });
        id
    };

    let queue = open(FileStorage::new(&path), clock.clone()).await;
    let failed = queue.get_failed().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].state, ItemState::TerminalFailed);
    assert!(queue.select_ready(T0.add_duration(HOUR)).await.is_empty());

    assert_eq!(queue.clear_failed().await, 1);
    drop(queue);

    let queue = open(FileStorage::new(&path), clock).await;
    assert!(queue.items().await.is_empty());
}

#[tokio::test]
async fn corrupt_snapshot_fails_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.bin");
    std::fs::write(&path, b"definitely not a queue snapshot").unwrap();

    let result = QueueManager::open(Arc::new(FileStorage::new(&path)), QueueConfig::default()).await;

    assert!(matches!(result, Err(QueueError::Storage(_))));
    // Nothing was overwritten.
    assert_eq!(std::fs::read(&path).unwrap(), b"definitely not a queue snapshot");
}

#[tokio::test]
async fn dispatcher_retries_then_delivers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.bin");
    let clock = Arc::new(ManualClock::new(T0));
    let queue = Arc::new(open(FileStorage::new(&path), clock.clone()).await);

    let id = queue.enqueue(message("dave@example.com"), Priority::Normal, None).await;

    let sender = Arc::new(FlakySender {
        failures: 1,
        calls: AtomicUsize::new(0),
    });
    let dispatcher = Dispatcher::new(queue.clone(), sender.clone(), DispatchConfig::default()).unwrap();

    // 1. First attempt fails and is rescheduled
    let report = dispatcher.run_once().await;
    assert_eq!(report.retried, 1);
    let due = queue.next_due_at().await.unwrap();
    assert!(due > T0);

    // 2. Not due yet: nothing goes out
    assert_eq!(dispatcher.run_once().await.dispatched, 0);

    // 3. Once due, the retry succeeds and the item is gone on disk too
    clock.set(due);
    let report = dispatcher.run_once().await;
    assert_eq!(report.delivered, 1);
    assert!(queue.get(&id).await.is_none());
    assert_eq!(sender.calls.load(Ordering::SeqCst), 2);
    assert!(FileStorage::new(&path).load().await.unwrap().is_empty());
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_queue_survives_restart() {
    use mail_outbox::SqliteStorage;

    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.db");
    let clock = Arc::new(ManualClock::new(T0));

    let ids = {
        let queue = open(SqliteStorage::open(&path).unwrap(), clock.clone()).await;
        let mut ids = Vec::new();
        for to in ["a@example.com", "b@example.com", "c@example.com"] {
            ids.push(queue.enqueue(message(to), Priority::Normal, None).await);
        }
        queue.dequeue(&ids[1]).await;
        ids
    };

    let queue = open(SqliteStorage::open(&path).unwrap(), clock).await;
    let restored: Vec<_> = queue.items().await.into_iter().map(|item| item.id).collect();
    assert_eq!(restored, vec![ids[0].clone(), ids[2].clone()]);
}
