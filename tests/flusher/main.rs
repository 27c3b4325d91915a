#[path = "../support/mod.rs"]
mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use outbox_rust::{
    listener_fn, DeliveryFailure, FlusherConfig, FlusherWorker, InMemoryStore, ListenerError,
    NewOutboxRecord, OutboxStore, RecordStatus, SkipReason, StoreError, TransactionalEmitter,
};
use support::{Recorder, User, UserCreated, UserDeleted};

fn flusher_config() -> FlusherConfig {
    support::config()
        .flusher_config()
        .with_worker_id("flusher-test")
}

fn deleted(user_id: &str) -> UserDeleted {
    UserDeleted {
        user_id: user_id.to_string(),
    }
}

// =============================================================================
// processAllPendingEvents
// =============================================================================

#[tokio::test]
async fn delivered_record_is_deleted() {
    support::init_tracing();
    let emitter = support::emitter(InMemoryStore::new());
    let recorder = Recorder::new();
    emitter
        .add_listener::<UserDeleted, _>("audit", recorder.clone())
        .unwrap();
    let record = emitter.emit(&deleted("alice"), vec![]).unwrap();

    let report = emitter
        .flusher(flusher_config())
        .process_all_pending_events()
        .await
        .unwrap();

    assert_eq!(report.claimed(), 1);
    assert_eq!(report.delivered(), 1);
    assert_eq!(recorder.seen(), vec!["alice"]);
    assert!(emitter.store().get_record(record.id).unwrap().is_none());
}

#[tokio::test]
async fn failing_listener_schedules_retry_and_keeps_record() {
    let emitter = support::emitter(InMemoryStore::new());
    emitter
        .add_listener::<UserDeleted, _>("audit", Recorder::failing())
        .unwrap();
    let record = emitter.emit(&deleted("bob"), vec![]).unwrap();
    let before = Utc::now();

    let report = emitter
        .flusher(flusher_config())
        .process_all_pending_events()
        .await
        .unwrap();

    assert_eq!(report.retried(), 1);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].1, "audit");
    assert!(matches!(failures[0].2, DeliveryFailure::Handler(err) if err.to_string() == "recorder failure"));

    let stored = emitter.store().get_record(record.id).unwrap().unwrap();
    assert!(stored.delivered_to_listeners.is_empty());
    // No readyToRetryAfterTTL for this event, so the 30s retry interval applies.
    let ready = stored.ready_to_retry_after.unwrap();
    assert!(ready >= before + chrono::Duration::seconds(30));
    assert!(stored.claimed_by.is_none());
}

#[tokio::test]
async fn user_created_failure_leaves_record_with_no_deliveries() {
    let emitter = support::emitter(InMemoryStore::new());
    emitter
        .add_listener::<UserCreated, _>("mailer", Recorder::failing())
        .unwrap();
    let t0 = Utc::now();
    let record = emitter
        .emit(&UserCreated::for_user(&User::new("carol")), vec![])
        .unwrap();

    let flusher = emitter.flusher(flusher_config());
    // The 5s retry delay keeps a fresh UserCreated out of the due set.
    let report = flusher.process_all_pending_events().await.unwrap();
    assert!(report.is_empty());

    let outcome = flusher.deliver(record.id).await.unwrap();
    assert!(outcome.is_retry_scheduled());

    let stored = emitter.store().get_record(record.id).unwrap().unwrap();
    assert!(stored.delivered_to_listeners.is_empty());
    assert!(stored.expire_at >= t0 + chrono::Duration::milliseconds(60_000));
    assert!(stored.ready_to_retry_after.unwrap() > Utc::now());
}

#[tokio::test]
async fn partial_delivery_only_retries_pending_listeners() {
    let emitter = support::emitter(InMemoryStore::new());
    let mailer = Recorder::new();
    let crm = Recorder::failing();
    emitter
        .add_listener::<UserDeleted, _>("mailer", mailer.clone())
        .unwrap();
    emitter
        .add_listener::<UserDeleted, _>("crm", crm.clone())
        .unwrap();
    let record = emitter.emit(&deleted("dave"), vec![]).unwrap();
    let flusher = emitter.flusher(flusher_config());

    let first = flusher.process_all_pending_events().await.unwrap();
    assert_eq!(first.retried(), 1);
    let stored = emitter.store().get_record(record.id).unwrap().unwrap();
    assert_eq!(stored.delivered_to_listeners, vec!["mailer".to_string()]);

    crm.set_failing(false);
    let outcome = flusher.deliver(record.id).await.unwrap();

    assert!(outcome.is_delivered());
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(outcome.attempts[0].listener, "crm");
    assert_eq!(mailer.calls(), 1);
    assert_eq!(crm.calls(), 2);
    assert!(emitter.store().get_record(record.id).unwrap().is_none());
}

#[tokio::test]
async fn later_listeners_still_run_after_a_failure() {
    let emitter = support::emitter(InMemoryStore::new());
    let first = Recorder::failing();
    let second = Recorder::new();
    emitter
        .add_listener::<UserDeleted, _>("first", first.clone())
        .unwrap();
    emitter
        .add_listener::<UserDeleted, _>("second", second.clone())
        .unwrap();
    let record = emitter.emit(&deleted("erin"), vec![]).unwrap();

    let report = emitter
        .flusher(flusher_config())
        .process_all_pending_events()
        .await
        .unwrap();

    let outcome = &report.records[0];
    let listeners: Vec<_> = outcome.attempts.iter().map(|a| a.listener.as_str()).collect();
    assert_eq!(listeners, vec!["first", "second"]);
    assert!(!outcome.attempts[0].is_delivered());
    assert!(outcome.attempts[1].is_delivered());
    assert_eq!(second.calls(), 1);

    let stored = emitter.store().get_record(record.id).unwrap().unwrap();
    assert_eq!(stored.delivered_to_listeners, vec!["second".to_string()]);
}

#[tokio::test]
async fn slow_listener_times_out_without_losing_other_deliveries() {
    let config = support::short_lived(Duration::from_millis(50));
    let emitter = TransactionalEmitter::from_config(InMemoryStore::new(), &config).unwrap();
    emitter
        .add_listener::<UserDeleted, _>("fast", Recorder::new())
        .unwrap();
    emitter
        .add_listener::<UserDeleted, _>(
            "slow",
            listener_fn(|_: UserDeleted| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<(), ListenerError>(())
            }),
        )
        .unwrap();
    let record = emitter.emit(&deleted("frank"), vec![]).unwrap();

    let report = emitter
        .flusher(config.flusher_config())
        .process_all_pending_events()
        .await
        .unwrap();

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].1, "slow");
    assert!(matches!(failures[0].2, DeliveryFailure::TimedOut(limit) if *limit == Duration::from_millis(50)));

    let stored = emitter.store().get_record(record.id).unwrap().unwrap();
    assert_eq!(stored.delivered_to_listeners, vec!["fast".to_string()]);
}

#[tokio::test]
async fn batch_size_limits_one_run() {
    let emitter = support::emitter(InMemoryStore::new());
    let recorder = Recorder::new();
    emitter
        .add_listener::<UserDeleted, _>("audit", recorder.clone())
        .unwrap();
    for n in 0..7 {
        emitter.emit(&deleted(&format!("user-{n}")), vec![]).unwrap();
    }
    let flusher = emitter.flusher(flusher_config().with_batch_size(3));

    let first = flusher.process_all_pending_events().await.unwrap();
    assert_eq!(first.claimed(), 3);
    assert_eq!(
        recorder.seen(),
        vec!["user-0", "user-1", "user-2"],
        "records are delivered in id order"
    );

    flusher.process_all_pending_events().await.unwrap();
    let last = flusher.process_all_pending_events().await.unwrap();
    assert_eq!(last.claimed(), 1);
    assert!(emitter.store().list_records().unwrap().is_empty());
    assert_eq!(recorder.calls(), 7);
}

#[tokio::test]
async fn future_retry_time_excludes_record() {
    let store = InMemoryStore::new();
    let now = Utc::now();
    let later = now + chrono::Duration::seconds(30);
    let payload = serde_json::json!({ "user_id": "grace" });
    store
        .commit(
            &[],
            vec![
                NewOutboxRecord::create("user.deleted", payload.clone(), later, Some(later)),
                NewOutboxRecord::create("user.deleted", payload, later, None),
            ],
        )
        .unwrap();
    let emitter = support::emitter(store);
    let recorder = Recorder::new();
    emitter
        .add_listener::<UserDeleted, _>("audit", recorder.clone())
        .unwrap();

    let report = emitter
        .flusher(flusher_config())
        .process_all_pending_events()
        .await
        .unwrap();

    assert_eq!(report.claimed(), 1);
    assert_eq!(report.records[0].record_id, 2);
    assert_eq!(emitter.store().list_records().unwrap().len(), 1);
}

#[tokio::test]
async fn expired_records_are_left_in_storage() {
    let store = InMemoryStore::new();
    let expired_at = Utc::now() - chrono::Duration::seconds(1);
    let id = store
        .commit(
            &[],
            vec![NewOutboxRecord::create(
                "user.deleted",
                serde_json::json!({ "user_id": "heidi" }),
                expired_at,
                None,
            )],
        )
        .unwrap()[0]
        .id;
    let emitter = support::emitter(store);
    let recorder = Recorder::new();
    emitter
        .add_listener::<UserDeleted, _>("audit", recorder.clone())
        .unwrap();
    let flusher = emitter.flusher(flusher_config());

    let report = flusher.process_all_pending_events().await.unwrap();
    assert!(report.is_empty());

    let outcome = flusher.deliver(id).await.unwrap();
    assert!(matches!(outcome.status, RecordStatus::Skipped(SkipReason::NotClaimable)));
    assert_eq!(recorder.calls(), 0);
    assert!(emitter.store().get_record(id).unwrap().is_some());
}

#[tokio::test]
async fn record_without_listeners_waits_for_registration() {
    let emitter = support::emitter(InMemoryStore::new());
    let record = emitter.emit(&deleted("ivan"), vec![]).unwrap();
    let flusher = emitter.flusher(flusher_config());

    let report = flusher.process_all_pending_events().await.unwrap();
    assert!(matches!(
        report.records[0].status,
        RecordStatus::Skipped(SkipReason::NoListeners)
    ));
    assert!(emitter.store().get_record(record.id).unwrap().is_some());

    let recorder = Recorder::new();
    emitter
        .add_listener::<UserDeleted, _>("audit", recorder.clone())
        .unwrap();
    let report = flusher.process_all_pending_events().await.unwrap();
    assert_eq!(report.delivered(), 1);
    assert_eq!(recorder.calls(), 1);
}

#[tokio::test]
async fn unconfigured_record_is_skipped() {
    let store = InMemoryStore::new();
    store
        .commit(
            &[],
            vec![NewOutboxRecord::create(
                "LegacyEvent",
                serde_json::json!({}),
                Utc::now() + chrono::Duration::seconds(60),
                None,
            )],
        )
        .unwrap();
    let emitter = support::emitter(store);

    let report = emitter
        .flusher(flusher_config())
        .process_all_pending_events()
        .await
        .unwrap();

    assert!(matches!(
        report.records[0].status,
        RecordStatus::Skipped(SkipReason::UnknownEvent)
    ));
    assert_eq!(emitter.store().list_records().unwrap().len(), 1);
}

#[tokio::test]
async fn payload_that_no_longer_decodes_is_a_delivery_failure() {
    let store = InMemoryStore::new();
    store
        .commit(
            &[],
            vec![NewOutboxRecord::create(
                "user.deleted",
                serde_json::json!({ "unexpected": true }),
                Utc::now() + chrono::Duration::seconds(60),
                None,
            )],
        )
        .unwrap();
    let emitter = support::emitter(store);
    let recorder = Recorder::new();
    emitter
        .add_listener::<UserDeleted, _>("audit", recorder.clone())
        .unwrap();

    let report = emitter
        .flusher(flusher_config())
        .process_all_pending_events()
        .await
        .unwrap();

    let failures: Vec<_> = report.failures().collect();
    assert!(matches!(failures[0].2, DeliveryFailure::Decode(_)));
    assert_eq!(recorder.calls(), 0);
}

// =============================================================================
// concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_flushers_invoke_each_listener_once() {
    let emitter = support::emitter(InMemoryStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    emitter
        .add_listener::<UserDeleted, _>(
            "audit",
            listener_fn(move |_: UserDeleted| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok::<(), ListenerError>(())
                }
            }),
        )
        .unwrap();
    for n in 0..40 {
        emitter.emit(&deleted(&format!("user-{n}")), vec![]).unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..4 {
        let flusher = emitter.flusher(
            flusher_config()
                .with_worker_id(format!("flusher-{worker}"))
                .with_batch_size(5),
        );
        handles.push(tokio::spawn(async move {
            let mut delivered = 0;
            loop {
                let report = flusher.process_all_pending_events().await.unwrap();
                if report.is_empty() {
                    break delivered;
                }
                delivered += report.delivered();
            }
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }

    assert_eq!(total, 40);
    assert_eq!(calls.load(Ordering::SeqCst), 40);
    assert!(emitter.store().list_records().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_lease_never_overlaps_a_running_listener() {
    let config = support::short_lived(Duration::from_secs(2));
    let emitter = TransactionalEmitter::from_config(InMemoryStore::new(), &config).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    {
        let (calls, in_flight, max_in_flight) = (
            Arc::clone(&calls),
            Arc::clone(&in_flight),
            Arc::clone(&max_in_flight),
        );
        emitter
            .add_listener::<UserDeleted, _>(
                "slow-audit",
                listener_fn(move |_: UserDeleted| {
                    let calls = Arc::clone(&calls);
                    let in_flight = Arc::clone(&in_flight);
                    let max_in_flight = Arc::clone(&max_in_flight);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let running = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(running, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<(), ListenerError>(())
                    }
                }),
            )
            .unwrap();
    }
    emitter.emit(&deleted("oscar"), vec![]).unwrap();

    let settings = |worker_id: &str| {
        config
            .flusher_config()
            .with_worker_id(worker_id)
            .with_lease(Duration::from_millis(50))
    };
    let first = emitter.flusher(settings("flusher-a"));
    let second = emitter.flusher(settings("flusher-b"));

    let running = tokio::spawn(async move { first.process_all_pending_events().await.unwrap() });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let late = second.process_all_pending_events().await.unwrap();
    let report = running.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(report.delivered(), 1);
    assert_eq!(late.claimed(), 0);
    assert!(emitter.store().list_records().unwrap().is_empty());
}

#[tokio::test]
async fn flusher_that_lost_its_claim_leaves_the_record_alone() {
    let emitter = support::emitter(InMemoryStore::new());
    let record = emitter.emit(&deleted("peggy"), vec![]).unwrap();
    let id = record.id;
    let store = Arc::clone(emitter.store());
    emitter
        .add_listener::<UserDeleted, _>(
            "audit",
            listener_fn(move |_: UserDeleted| {
                let store = Arc::clone(&store);
                async move {
                    // The lease ran out and another flusher took the record over.
                    store.release(id, "flusher-test").unwrap();
                    store
                        .claim_record(id, "flusher-other", Utc::now(), Duration::from_secs(60))
                        .unwrap()
                        .unwrap();
                    Ok::<(), ListenerError>(())
                }
            }),
        )
        .unwrap();

    let report = emitter
        .flusher(flusher_config())
        .process_all_pending_events()
        .await
        .unwrap();

    assert_eq!(report.aborted(), 1);
    assert!(matches!(
        &report.records[0].status,
        RecordStatus::Aborted(StoreError::ClaimLost { worker_id, .. }) if worker_id == "flusher-test"
    ));
    let stored = emitter.store().get_record(id).unwrap().unwrap();
    assert_eq!(stored.claimed_by.as_deref(), Some("flusher-other"));
    assert!(stored.delivered_to_listeners.is_empty());
    assert!(stored.ready_to_retry_after.is_none());
}

#[tokio::test]
async fn expired_lease_hands_the_record_to_the_next_flusher() {
    let emitter = support::emitter(InMemoryStore::new());
    let recorder = Recorder::new();
    emitter
        .add_listener::<UserDeleted, _>("audit", recorder.clone())
        .unwrap();
    let record = emitter.emit(&deleted("quinn"), vec![]).unwrap();

    // A flusher that crashed after claiming.
    let store = emitter.store();
    let claimed_at = Utc::now() - chrono::Duration::seconds(5);
    store
        .claim_record(record.id, "crashed", claimed_at, Duration::from_secs(1))
        .unwrap()
        .unwrap();

    let report = emitter
        .flusher(flusher_config())
        .process_all_pending_events()
        .await
        .unwrap();

    assert_eq!(report.delivered(), 1);
    assert_eq!(recorder.calls(), 1);
    assert!(matches!(
        store.complete(record.id, "crashed"),
        Err(StoreError::RecordNotFound(_))
    ));
}

#[tokio::test]
async fn emits_during_a_flush_are_picked_up_next_run() {
    let emitter = support::emitter(InMemoryStore::new());
    let recorder = Recorder::new();
    emitter
        .add_listener::<UserDeleted, _>("audit", recorder.clone())
        .unwrap();
    let flusher = emitter.flusher(flusher_config());

    emitter.emit(&deleted("judy"), vec![]).unwrap();
    let running = {
        let flusher = flusher.clone();
        tokio::spawn(async move { flusher.process_all_pending_events().await })
    };
    emitter.emit(&deleted("mallory"), vec![]).unwrap();
    running.await.unwrap().unwrap();
    flusher.process_all_pending_events().await.unwrap();

    let mut seen = recorder.seen();
    seen.sort();
    assert_eq!(seen, vec!["judy", "mallory"]);
    assert!(emitter.store().list_records().unwrap().is_empty());
}

// =============================================================================
// worker
// =============================================================================

#[tokio::test]
async fn worker_flushes_until_stopped() {
    let emitter = support::emitter(InMemoryStore::new());
    let recorder = Recorder::new();
    emitter
        .add_listener::<UserDeleted, _>("audit", recorder.clone())
        .unwrap();
    for n in 0..3 {
        emitter.emit(&deleted(&format!("user-{n}")), vec![]).unwrap();
    }

    let worker = FlusherWorker::spawn(
        emitter.flusher(flusher_config().with_poll_interval(Duration::from_millis(10))),
    );
    for _ in 0..100 {
        if emitter.store().list_records().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!worker.is_finished());
    let stats = worker.stop().await;

    assert!(stats.cycles >= 1);
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.errors, 0);
    assert_eq!(recorder.calls(), 3);
}
