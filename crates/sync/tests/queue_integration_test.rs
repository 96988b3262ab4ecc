//! End-to-end tests for the queue facade and the lock service
//!
//! Run with: cargo test -p filehost-sync --test queue_integration_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_test::{assert_pending, assert_ready};

use filehost_sync::locker::{user_file_lock_key, with_lock};
use filehost_sync::prelude::*;
use filehost_sync::worker::BoostPhase;

#[derive(Debug, Clone, PartialEq)]
struct Mail {
    to: String,
}

fn mail(to: &str) -> Mail {
    Mail { to: to.to_string() }
}

fn service_with(settings: QueueSettings) -> QueueService {
    let mut registry = QueueSettingsRegistry::default();
    registry.insert(settings);
    QueueService::new(Arc::new(Manager::new()), registry)
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_blocked_pushes_boost_up_to_max_workers() {
    let service = service_with(
        QueueSettings::new("mail")
            .with_length(1)
            .with_batch_length(1)
            .with_workers(1)
            .with_max_workers(3)
            .with_boost(2, Duration::from_millis(50), Duration::from_millis(200)),
    );

    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(AtomicUsize::new(0));
    let queue = {
        let live = Arc::clone(&live);
        let peak = Arc::clone(&peak);
        let delivered = Arc::clone(&delivered);
        service
            .create_typed_queue("mail", move |mails: Vec<Mail>| {
                let live = Arc::clone(&live);
                let peak = Arc::clone(&peak);
                let delivered = Arc::clone(&delivered);
                async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    delivered.fetch_add(mails.len(), Ordering::SeqCst);
                    live.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .unwrap()
    };
    queue.run();

    let record = service.manager().get_managed_queue(queue.queue_id()).unwrap();
    let pusher = {
        let queue = queue.clone();
        let record = Arc::clone(&record);
        tokio::spawn(async move {
            for i in 0..5 {
                queue.push(mail(&format!("user-{i}@example.com"))).await.unwrap();
                assert!(record.number_of_workers() <= 3);
            }
        })
    };

    // Boost lands one block timeout after the buffer fills
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(record.number_of_workers() > 1);
    assert!(record.worker_number() > 1);
    assert_eq!(record.summary().phase, BoostPhase::Boosted);
    pusher.await.unwrap();

    queue.flush(&CancellationToken::new()).await.unwrap();
    assert_eq!(delivered.load(Ordering::SeqCst), 5);
    assert_eq!(peak.load(Ordering::SeqCst), 3);

    // Boost expired and its workers finished their batch
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(record.number_of_workers(), 1);
    assert_eq!(record.worker_number(), 1);
    assert_eq!(record.block_timeout(), Duration::from_millis(50));
    assert_eq!(record.summary().phase, BoostPhase::Idle);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_shutdown_hands_over_every_item_once() {
    let service = service_with(QueueSettings::new("audit").with_length(64).with_batch_length(4).with_workers(3));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let queue = {
        let seen = Arc::clone(&seen);
        service
            .create_typed_queue("audit", move |items: Vec<u32>| {
                let seen = Arc::clone(&seen);
                async move {
                    assert!(items.len() <= 4);
                    seen.lock().extend(items);
                }
            })
            .unwrap()
    };

    for i in 0..50 {
        queue.push(i).await.unwrap();
    }
    queue.run();
    queue.shutdown();
    assert!(matches!(
        queue.push(99).await,
        Err(QueueError::Pool(PoolError::Closed))
    ));

    queue.flush(&CancellationToken::new()).await.unwrap();
    let mut seen = seen.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..50).collect::<Vec<_>>());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_terminate_hands_over_buffered_items() {
    let service = service_with(QueueSettings::new("audit").with_length(64).with_batch_length(100));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let queue = {
        let seen = Arc::clone(&seen);
        service
            .create_typed_queue("audit", move |items: Vec<u32>| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().extend(items);
                }
            })
            .unwrap()
    };

    for i in 0..20 {
        queue.push(i).await.unwrap();
    }
    queue.run();
    queue.terminate();

    queue.flush(&CancellationToken::new()).await.unwrap();
    assert_eq!(seen.lock().len(), 20);
    assert!(service.manager().is_empty());
}

#[tokio::test]
async fn test_erased_queue_rejects_foreign_items() {
    let service = service_with(QueueSettings::new("mail"));
    let queue = service
        .create_queue("mail", handle_fn(|_batch| async {}), Exemplar::of::<Mail>())
        .unwrap();

    assert!(queue.push(Data::new(mail("a@example.com"))).await.is_ok());
    let err = queue.push(Data::new("not a mail")).await.unwrap_err();
    assert!(matches!(err, QueueError::TypeMismatch { .. }));
    assert!(err.to_string().contains("mail"));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_administrative_cancel_of_base_workers() {
    let service = service_with(QueueSettings::new("mail").with_workers(2));
    let queue = service
        .create_typed_queue("mail", |_mails: Vec<Mail>| async {})
        .unwrap();
    queue.run();

    let record = service.manager().find_by_name("mail").unwrap();
    let batch = record.workers()[0].id;
    assert_eq!(record.worker_number(), 2);

    let extra = record.add_worker(1, Some(Duration::from_millis(100)));
    assert_eq!(record.number_of_workers(), 3);

    assert!(record.cancel_worker(batch));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(extra.is_cancelled());
    assert_eq!(record.number_of_workers(), 0);
    assert!(record.workers().is_empty());

    let json = serde_json::to_value(service.manager().summaries()).unwrap();
    assert_eq!(json[0]["name"], "mail");
    assert_eq!(json[0]["number_of_workers"], 0);
}

#[tokio::test]
async fn test_lock_scenario_second_caller_gets_new_token() {
    let locker = Arc::new(InMemoryLocker::new());
    let cancel = CancellationToken::new();
    let key = user_file_lock_key(7);

    let first = locker.lock(&cancel, &key, LockOptions::default()).await.unwrap();

    let mut second = tokio_test::task::spawn(locker.lock(&cancel, &key, LockOptions::default()));
    assert_pending!(second.poll());

    locker.unlock(&cancel, &key, &first).await.unwrap();
    assert!(second.is_woken());
    let token = assert_ready!(second.poll()).unwrap();
    assert_ne!(token, first);

    locker.unlock(&cancel, &key, &token).await.unwrap();
    assert!(locker.is_empty());
}

#[tokio::test]
async fn test_lock_attempt_limit() {
    let locker = InMemoryLocker::new();
    let cancel = CancellationToken::new();
    let key = user_file_lock_key(7);
    let _held = locker.lock(&cancel, &key, LockOptions::default()).await.unwrap();

    let result = locker
        .lock(&cancel, &key, LockOptions::new().with_max_attempts(1))
        .await;
    assert_eq!(result, Err(LockError::MaxAttempts));
}

#[test_log::test(tokio::test)]
async fn test_lock_serializes_file_tree_mutations() {
    let registry = LockerRegistry::new();
    let locker = registry.create("memory", "").unwrap();
    let tree = Arc::new(Mutex::new(Vec::<String>::new()));
    let inside = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..8 {
        let locker = Arc::clone(&locker);
        let tree = Arc::clone(&tree);
        let inside = Arc::clone(&inside);
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let key = user_file_lock_key(1);
            with_lock(locker.as_ref(), &cancel, &key, LockOptions::default(), async {
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                tree.lock().push(format!("file-{i}"));
                inside.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, LockError>(())
            })
            .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(tree.lock().len(), 8);
}
