//! Integration tests against a live Redis server.
//!
//! Each test uses its own key prefix so runs never share state.
//! Run with: REDIS_HOST=localhost cargo test --test queue_integration -- --ignored

use std::time::Duration;

use bistro_queue::broker::Broker;
use bistro_queue::config::BrokerConfig;
use bistro_queue::scheduler::{
    default_job_name, Backoff, BackoffKind, FailureOutcome, JobEvent, JobOptions, JobQueue,
    LifecycleReporter, QueueOptions,
};
use bistro_queue::{BrokerError, QueueError};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Email {
    to: String,
    subject: String,
}

fn email(to: &str) -> Email {
    Email {
        to: to.to_string(),
        subject: "Your order is ready".to_string(),
    }
}

fn test_broker(label: &str) -> Broker {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let config = BrokerConfig::from_env()
        .expect("broker environment should be valid")
        .with_prefix(format!("bistro-test-{label}-{nanos}"));
    Broker::new(config).expect("broker should build")
}

async fn next_event(stream: &mut bistro_queue::scheduler::EventStream) -> JobEvent {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("event should arrive in time")
        .expect("stream should stay open")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test queue_integration -- --ignored
async fn test_submit_applies_queue_defaults() {
    let broker = test_broker("defaults");
    let queue = JobQueue::<Email>::new("email", &broker, None).expect("queue should build");

    let handle = queue
        .submit(&email("a@example.com"), None)
        .await
        .expect("submit should succeed");
    assert!(!handle.id.is_empty());
    assert_eq!(handle.name, default_job_name("email"));

    let record = queue
        .get_job(&handle.id)
        .await
        .expect("lookup should succeed")
        .expect("job should exist");
    assert_eq!(record.opts.attempts, 3);
    assert_eq!(record.opts.backoff.kind, BackoffKind::Exponential);
    assert_eq!(record.opts.backoff.delay, 1000);
    assert_eq!(record.payload::<Email>().expect("payload"), email("a@example.com"));

    let counts = queue.counts().await.expect("counts");
    assert_eq!(counts.waiting, 1);

    broker.close().await;
}

#[tokio::test]
#[ignore]
async fn test_submit_override_keeps_other_defaults() {
    let broker = test_broker("override");
    let queue = JobQueue::<Email>::new("email", &broker, None).expect("queue should build");

    let handle = queue
        .submit(&email("b@example.com"), Some(JobOptions::new().with_attempts(5)))
        .await
        .expect("submit should succeed");

    let record = queue
        .get_job(&handle.id)
        .await
        .expect("lookup should succeed")
        .expect("job should exist");
    assert_eq!(record.opts.attempts, 5);
    assert_eq!(record.opts.backoff, Backoff::exponential(1000));

    broker.close().await;
}

#[tokio::test]
#[ignore]
async fn test_facades_for_same_queue_share_jobs() {
    let broker = test_broker("shared");
    let first = JobQueue::<Email>::new("email", &broker, None).expect("queue should build");
    let second = JobQueue::<Email>::new("email", &broker, None).expect("queue should build");

    let a = first.submit(&email("a@example.com"), None).await.expect("submit");
    let b = second.submit(&email("b@example.com"), None).await.expect("submit");
    assert_ne!(a.id, b.id);

    assert!(second.get_job(&a.id).await.expect("lookup").is_some());
    assert_eq!(first.counts().await.expect("counts").waiting, 2);

    broker.close().await;
}

#[tokio::test]
#[ignore]
async fn test_events_are_isolated_per_queue() {
    let broker = test_broker("isolation");
    let orders = JobQueue::<serde_json::Value>::new("orders", &broker, None).expect("queue");
    let invoices = JobQueue::<serde_json::Value>::new("invoices", &broker, None).expect("queue");

    let mut order_events = orders.events().subscribe().await.expect("subscribe");
    let mut invoice_events = invoices.events().subscribe().await.expect("subscribe");

    let handle = invoices
        .submit(&serde_json::json!({ "invoice": 7 }), None)
        .await
        .expect("submit");

    let event = next_event(&mut invoice_events).await;
    assert_eq!(event.job_id(), handle.id);
    assert_eq!(event.kind(), "added");

    let leaked = tokio::time::timeout(Duration::from_millis(300), order_events.next()).await;
    assert!(leaked.is_err(), "orders subscriber saw an invoices event");

    broker.close().await;
}

#[tokio::test]
#[ignore]
async fn test_deduplicated_submit_returns_existing_job() {
    let broker = test_broker("dedup");
    let queue = JobQueue::<Email>::new("email", &broker, None).expect("queue should build");
    let options = JobOptions::new().with_dedup_id("order-42");

    let first = queue
        .submit(&email("a@example.com"), Some(options.clone()))
        .await
        .expect("submit");
    let second = queue
        .submit(&email("a@example.com"), Some(options.clone()))
        .await
        .expect("submit");

    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.id, second.id);
    assert_eq!(queue.counts().await.expect("counts").waiting, 1);

    assert!(queue.remove(&first.id).await.expect("remove"));
    let third = queue
        .submit(&email("a@example.com"), Some(options))
        .await
        .expect("submit");
    assert!(!third.deduplicated);
    assert_ne!(third.id, first.id);

    broker.close().await;
}

#[tokio::test]
#[ignore]
async fn test_failed_job_retries_then_fails() {
    let broker = test_broker("retry");
    let defaults = QueueOptions::new()
        .with_attempts(2)
        .with_backoff(Backoff::fixed(0));
    let queue = JobQueue::<Email>::new("email", &broker, Some(defaults)).expect("queue");
    let reporter = LifecycleReporter::new("email", &broker);
    let mut events = queue.events().subscribe().await.expect("subscribe");

    let handle = queue.submit(&email("a@example.com"), None).await.expect("submit");
    assert_eq!(next_event(&mut events).await.kind(), "added");

    assert_eq!(reporter.mark_active(&handle.id).await.expect("activate"), 1);
    let outcome = reporter.mark_failed(&handle.id, "smtp timeout").await.expect("fail");
    assert_eq!(outcome, FailureOutcome::Retrying { delay_ms: 0 });
    assert_eq!(next_event(&mut events).await.kind(), "retrying");

    assert_eq!(reporter.promote_delayed().await.expect("promote"), 1);
    assert_eq!(reporter.mark_active(&handle.id).await.expect("activate"), 2);
    let outcome = reporter.mark_failed(&handle.id, "smtp timeout").await.expect("fail");
    assert!(matches!(outcome, FailureOutcome::Failed { evicted: 0 }));

    let event = next_event(&mut events).await;
    assert_eq!(event.kind(), "failed");
    assert_eq!(event.reason(), Some("smtp timeout"));

    let record = queue.get_job(&handle.id).await.expect("lookup").expect("job");
    assert_eq!(record.failed_reason.as_deref(), Some("smtp timeout"));
    assert_eq!(queue.counts().await.expect("counts").failed, 1);

    broker.close().await;
}

#[tokio::test]
#[ignore]
async fn test_completed_retention_evicts_oldest() {
    let broker = test_broker("retention");
    let queue = JobQueue::<Email>::new("email", &broker, None).expect("queue");
    let reporter = LifecycleReporter::new("email", &broker);
    let options = JobOptions::new().with_keep_completed(1);

    let mut ids = Vec::new();
    for to in ["a@example.com", "b@example.com", "c@example.com"] {
        let handle = queue
            .submit(&email(to), Some(options.clone()))
            .await
            .expect("submit");
        ids.push(handle.id);
    }

    for id in &ids {
        reporter.mark_active(id).await.expect("activate");
        reporter
            .mark_completed(id, serde_json::json!({ "sent": true }))
            .await
            .expect("complete");
    }

    assert_eq!(queue.counts().await.expect("counts").completed, 1);
    assert!(queue.get_job(&ids[0]).await.expect("lookup").is_none());

    let last = queue.get_job(&ids[2]).await.expect("lookup").expect("job");
    assert_eq!(last.return_value, Some(serde_json::json!({ "sent": true })));

    broker.close().await;
}

#[tokio::test]
#[ignore]
async fn test_closed_broker_rejects_submit() {
    let broker = test_broker("closed");
    let queue = JobQueue::<Email>::new("email", &broker, None).expect("queue");
    broker.ping().await.expect("broker should be reachable");

    broker.close().await;
    let result = queue.submit(&email("a@example.com"), None).await;

    assert!(matches!(
        result,
        Err(QueueError::Broker(BrokerError::Closed))
    ));
}

#[tokio::test]
#[ignore]
async fn test_retention_keeps_latest_finished_job() {
    let broker = test_broker("finish-order");
    let queue = JobQueue::<Email>::new("email", &broker, None).expect("queue");
    let reporter = LifecycleReporter::new("email", &broker);
    let options = JobOptions::new().with_keep_completed(1);

    let mut ids = Vec::new();
    for n in 0..10 {
        let handle = queue
            .submit(&email(&format!("user{n}@example.com")), Some(options.clone()))
            .await
            .expect("submit");
        ids.push(handle.id);
    }
    assert_eq!(ids[8], "9");
    assert_eq!(ids[9], "10");

    for id in &ids[8..] {
        reporter.mark_active(id).await.expect("activate");
    }
    reporter
        .mark_completed("9", serde_json::json!("nine"))
        .await
        .expect("complete");
    let evicted = reporter
        .mark_completed("10", serde_json::json!("ten"))
        .await
        .expect("complete");

    assert_eq!(evicted, 1);
    assert!(queue.get_job("9").await.expect("lookup").is_none());
    let kept = queue.get_job("10").await.expect("lookup").expect("job");
    assert_eq!(kept.return_value, Some(serde_json::json!("ten")));

    broker.close().await;
}

#[tokio::test]
#[ignore]
async fn test_transitions_require_source_state() {
    let broker = test_broker("states");
    let defaults = QueueOptions::new().with_backoff(Backoff::fixed(60_000));
    let queue = JobQueue::<Email>::new("email", &broker, Some(defaults)).expect("queue");
    let reporter = LifecycleReporter::new("email", &broker);
    let handle = queue.submit(&email("a@example.com"), None).await.expect("submit");

    let err = reporter
        .mark_stalled(&handle.id, "lock expired")
        .await
        .expect_err("waiting job cannot stall");
    assert!(matches!(err, QueueError::UnexpectedState { expected: "active", .. }));

    let err = reporter
        .mark_completed(&handle.id, serde_json::Value::Null)
        .await
        .expect_err("waiting job cannot complete");
    assert!(matches!(err, QueueError::UnexpectedState { expected: "active", .. }));

    let err = reporter
        .mark_failed(&handle.id, "boom")
        .await
        .expect_err("waiting job cannot fail");
    assert!(matches!(err, QueueError::UnexpectedState { expected: "active", .. }));

    let counts = queue.counts().await.expect("counts");
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.completed, 0);
    assert_eq!(counts.delayed, 0);

    reporter.mark_active(&handle.id).await.expect("activate");
    let outcome = reporter.mark_failed(&handle.id, "boom").await.expect("fail");
    assert_eq!(outcome, FailureOutcome::Retrying { delay_ms: 60_000 });

    let err = reporter
        .mark_active(&handle.id)
        .await
        .expect_err("delayed job cannot start");
    assert!(matches!(err, QueueError::UnexpectedState { expected: "waiting", .. }));

    let counts = queue.counts().await.expect("counts");
    assert_eq!(counts.waiting, 0);
    assert_eq!(counts.active, 0);
    assert_eq!(counts.delayed, 1);

    assert!(queue.remove(&handle.id).await.expect("remove"));
    let err = reporter
        .mark_active(&handle.id)
        .await
        .expect_err("removed job cannot start");
    assert!(matches!(err, QueueError::JobNotFound(_)));

    broker.close().await;
}
