//! Submission, ordering, statistics and health through the public API

#[macro_use]
mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use souk_queue::{
    BackoffStrategy, Clock, Job, JobOptions, JobStatus, Ledger, QueueConfig, QueueStats,
    QueueStore,
};

use common::{fast_config, fixture};

#[tokio::test]
async fn test_identical_submissions_collapse() {
    let fx = fixture(fast_config());
    let payload = json!({ "to": "a@x.com", "template": "welcome" });

    let first = fx
        .queue
        .add_job("emails", "welcome", payload.clone(), JobOptions::new())
        .await
        .unwrap();
    let second = fx
        .queue
        .add_job("emails", "welcome", payload.clone(), JobOptions::new())
        .await
        .unwrap();
    assert_eq!(first, second);
    assert!(first.starts_with("welcome:"));
    assert_eq!(fx.queue.get_queue_stats("emails").await.unwrap().waiting, 1);

    // A later instant is a new submission
    fx.clock.advance(Duration::from_millis(1));
    let third = fx
        .queue
        .add_job("emails", "welcome", payload, JobOptions::new())
        .await
        .unwrap();
    assert_ne!(first, third);
    assert_eq!(fx.queue.get_queue_stats("emails").await.unwrap().waiting, 2);
}

#[tokio::test]
async fn test_job_record_reflects_submission() {
    let fx = fixture(fast_config());
    let id = fx
        .queue
        .add_job(
            "emails",
            "digest",
            json!({ "user": 42 }),
            JobOptions::new()
                .with_delay(Duration::from_secs(60))
                .with_priority(3)
                .with_max_attempts(5),
        )
        .await
        .unwrap();

    let job = fx.queue.get_job_status(&id).await.unwrap().unwrap();
    assert_eq!(job.queue, "emails");
    assert_eq!(job.job_type, "digest");
    assert_eq!(job.payload, json!({ "user": 42 }));
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 5);
    assert_eq!(job.delay, Some(60_000));
    assert_eq!(job.priority, Some(3));
    assert_eq!(job.status_at(fx.clock.now()), JobStatus::Scheduled);
    assert_eq!(
        (job.run_at - job.created_at).num_milliseconds(),
        60_000
    );

    assert!(fx.queue.get_job_status("digest:missing:0").await.unwrap().is_none());
}

#[tokio::test]
async fn test_priority_and_age_order_dispatch() {
    let config = QueueConfig {
        priority_weight_ms: 1000,
        ..fast_config()
    };
    let fx = fixture(config);
    let order: Arc<Mutex<Vec<String>>> = Arc::default();

    let record = order.clone();
    fx.queue.register_fn("work", "task", move |job: Job| {
        let record = record.clone();
        async move {
            record
                .lock()
                .unwrap()
                .push(job.payload["name"].as_str().unwrap_or_default().to_string());
            Ok(())
        }
    });

    for (name, priority) in [("old", 0), ("urgent", 10), ("normal", 0)] {
        fx.queue
            .add_job(
                "work",
                "task",
                json!({ "name": name }),
                JobOptions::new().with_priority(priority),
            )
            .await
            .unwrap();
        fx.clock.advance(Duration::from_millis(100));
    }

    fx.queue.start_processing("work", 1).await.unwrap();
    eventually!(fx.queue.get_queue_stats("work").await.unwrap().completed == 3);
    fx.queue.shutdown().await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["urgent", "old", "normal"]);
}

#[tokio::test]
async fn test_stats_total_is_consistent() {
    let config = QueueConfig {
        default_max_attempts: 1,
        backoff: BackoffStrategy::Constant { ms: 0 },
        ..fast_config()
    };
    let fx = fixture(config);
    fx.queue.register_fn("mixed", "ok", |_job: Job| async { Ok::<(), anyhow::Error>(()) });
    fx.queue.register_fn("mixed", "bad", |_job: Job| async {
        Err::<(), anyhow::Error>(anyhow::anyhow!("nope"))
    });

    for n in 0..3 {
        fx.queue
            .add_job("mixed", "ok", json!({ "n": n }), JobOptions::new())
            .await
            .unwrap();
    }
    fx.queue
        .add_job("mixed", "bad", json!({}), JobOptions::new())
        .await
        .unwrap();
    fx.queue.start_processing("mixed", 2).await.unwrap();
    eventually!({
        let stats = fx.queue.get_queue_stats("mixed").await.unwrap();
        stats.completed == 3 && stats.failed == 1
    });
    fx.queue.stop_processing("mixed").await.unwrap();

    fx.queue
        .add_job("mixed", "ok", json!({ "n": 99 }), JobOptions::new())
        .await
        .unwrap();
    fx.queue
        .add_job(
            "mixed",
            "ok",
            json!({ "n": 100 }),
            JobOptions::new().with_delay(Duration::from_secs(30)),
        )
        .await
        .unwrap();

    let stats = fx.queue.get_queue_stats("mixed").await.unwrap();
    assert_eq!(
        stats,
        QueueStats {
            waiting: 1,
            active: 0,
            completed: 3,
            failed: 1,
            delayed: 1,
            total: 6,
        }
    );

    let empty = fx.queue.get_queue_stats("never-used").await.unwrap();
    assert_eq!(empty, QueueStats::default());
}

#[tokio::test]
async fn test_clear_ledgers_spans_queues() {
    let config = QueueConfig {
        default_max_attempts: 1,
        ..fast_config()
    };
    let fx = fixture(config);
    for queue in ["a", "b"] {
        fx.queue.register_fn(queue, "ok", |_job: Job| async { Ok::<(), anyhow::Error>(()) });
        fx.queue.register_fn(queue, "bad", |_job: Job| async {
            Err::<(), anyhow::Error>(anyhow::anyhow!("nope"))
        });
        fx.queue
            .add_job(queue, "ok", json!({}), JobOptions::new())
            .await
            .unwrap();
        fx.queue
            .add_job(queue, "bad", json!({}), JobOptions::new())
            .await
            .unwrap();
        fx.queue.start_processing(queue, 1).await.unwrap();
    }

    for queue in ["a", "b"] {
        eventually!({
            let stats = fx.queue.get_queue_stats(queue).await.unwrap();
            stats.completed == 1 && stats.failed == 1
        });
    }
    fx.queue.shutdown().await.unwrap();

    let completed_ids = fx.queue.recent_jobs("a", Ledger::Completed, 10).await.unwrap();
    assert_eq!(completed_ids.len(), 1);

    assert_eq!(fx.queue.clear_completed_jobs().await.unwrap(), 2);
    assert_eq!(fx.queue.clear_completed_jobs().await.unwrap(), 0);
    assert_eq!(fx.queue.get_queue_stats("a").await.unwrap().failed, 1);

    assert_eq!(fx.queue.clear_failed_jobs().await.unwrap(), 2);
    let stats = fx.queue.get_queue_stats("b").await.unwrap();
    assert_eq!(stats.completed + stats.failed, 0);

    // Records outlive their ledger entries
    let job = fx
        .queue
        .get_job_status(&completed_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status_at(fx.clock.now()), JobStatus::Completed);
}

#[tokio::test]
async fn test_health_check_reports_queues_and_outages() {
    let fx = fixture(fast_config());
    fx.queue
        .add_job("emails", "welcome", json!({}), JobOptions::new())
        .await
        .unwrap();
    fx.queue
        .add_job("sms", "otp", json!({}), JobOptions::new())
        .await
        .unwrap();
    fx.queue.start_processing("emails", 1).await.unwrap();

    let report = fx.queue.health_check().await;
    assert!(report.healthy);
    assert!(report.store_connected);
    assert!(report.processing);
    assert!(report.error.is_none());
    assert_eq!(
        report.queues.keys().cloned().collect::<Vec<_>>(),
        vec!["emails", "sms"]
    );
    assert_eq!(report.queues["sms"].waiting, 1);

    fx.store.set_available(false);
    let report = fx.queue.health_check().await;
    assert!(!report.healthy);
    assert!(!report.store_connected);
    assert!(report.processing);
    assert_eq!(report.queues.len(), 1);
    assert_eq!(report.queues["emails"], QueueStats::default());
    assert!(report.error.unwrap().contains("unavailable"));

    fx.store.set_available(true);
    fx.queue.shutdown().await.unwrap();
    assert!(!fx.queue.health_check().await.processing);
}

#[tokio::test]
async fn test_expired_records_disappear() {
    let fx = fixture(fast_config());
    let id = fx
        .queue
        .add_job("emails", "welcome", json!({}), JobOptions::new())
        .await
        .unwrap();

    fx.clock.advance(Duration::from_secs(24 * 60 * 60 + 1));
    assert!(fx.queue.get_job_status(&id).await.unwrap().is_none());
    assert!(fx.store.get_job(&id).await.unwrap().is_none());
}
