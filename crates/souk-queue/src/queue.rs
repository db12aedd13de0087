//! The queue facade: submission, processor registration, worker control,
//! status and statistics.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, QueueEvent};
use crate::job::{waiting_score, Job, JobId, JobOptions};
use crate::registry::{FnProcessor, Processor, ProcessorRegistry};
use crate::retry::RetryPolicy;
use crate::stats::{ActiveJobs, HealthReport, QueueStats};
use crate::store::{Ledger, Placement, QueueStore};
use crate::worker::WorkerPool;

/// State shared between the facade and its worker loops
pub(crate) struct QueueInner {
    pub(crate) store: Arc<dyn QueueStore>,
    pub(crate) config: QueueConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) registry: ProcessorRegistry,
    pub(crate) events: EventBus,
    pub(crate) active: ActiveJobs,
    pub(crate) retry: RetryPolicy,
}

impl QueueInner {
    pub(crate) async fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        let counts = self.store.counts(queue).await?;
        Ok(QueueStats::from_counts(counts, self.active.get(queue)))
    }
}

/// Handle to a job queue. Cheap to clone; clones share processors, workers
/// and counters. Workers stop once every handle is dropped.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
    pool: Arc<WorkerPool>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn QueueStore>, config: QueueConfig) -> QueueResult<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn QueueStore>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        config.validate()?;

        let inner = QueueInner {
            store,
            retry: RetryPolicy::new(config.backoff),
            events: EventBus::new(config.event_capacity),
            config,
            clock,
            registry: ProcessorRegistry::new(),
            active: ActiveJobs::default(),
        };

        Ok(Self {
            inner: Arc::new(inner),
            pool: Arc::new(WorkerPool::new()),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Submit a job. Resubmitting an identical job within the same instant
    /// returns the existing id without enqueueing anything.
    pub async fn add_job(
        &self,
        queue: &str,
        job_type: &str,
        payload: Value,
        options: JobOptions,
    ) -> QueueResult<JobId> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let job = Job::new(
            queue,
            job_type,
            payload,
            &options,
            inner.config.default_max_attempts,
            now,
        );

        let placement = match options.effective_delay() {
            Some(_) => Placement::Delayed {
                ready_at: job.run_at.timestamp_millis(),
            },
            None => Placement::Waiting {
                score: waiting_score(
                    now.timestamp_millis(),
                    job.priority(),
                    inner.config.priority_weight_ms,
                ),
            },
        };

        if !inner.store.submit(&job, placement).await? {
            debug!(queue, job_id = %job.id, "Duplicate submission, job already enqueued");
            return Ok(job.id);
        }

        debug!(
            queue,
            job_id = %job.id,
            job_type,
            delay_ms = job.delay,
            priority = job.priority(),
            "Job added"
        );
        inner.events.emit(QueueEvent::JobAdded {
            queue: queue.to_string(),
            job_id: job.id.clone(),
            job_type: job_type.to_string(),
        });

        Ok(job.id)
    }

    /// Register the handler for `(queue, job_type)`, replacing any earlier one
    pub fn register_processor<P: Processor + 'static>(
        &self,
        queue: &str,
        job_type: &str,
        processor: P,
    ) {
        if self
            .inner
            .registry
            .register(queue, job_type, Arc::new(processor))
        {
            warn!(queue, job_type, "Replaced existing processor");
        }
    }

    /// Register an async closure as the handler for `(queue, job_type)`
    pub fn register_fn<F, Fut>(&self, queue: &str, job_type: &str, f: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_processor(queue, job_type, FnProcessor::new(f));
    }

    /// Spawn `concurrency` worker loops for `queue`. A no-op if the queue is
    /// already being processed.
    pub async fn start_processing(&self, queue: &str, concurrency: usize) -> QueueResult<()> {
        self.pool
            .start(self.inner.clone(), queue, concurrency)
            .await
    }

    /// Signal the queue's workers to stop and wait for them. In-flight jobs
    /// run to completion.
    pub async fn stop_processing(&self, queue: &str) -> QueueResult<()> {
        if !self.pool.stop(queue).await? {
            debug!(queue, "Stop requested for a queue that was not running");
        }
        Ok(())
    }

    /// Stop every running queue
    pub async fn shutdown(&self) -> QueueResult<()> {
        self.pool.stop_all().await
    }

    pub async fn is_processing(&self, queue: &str) -> bool {
        self.pool.is_running(queue).await
    }

    pub async fn get_job_status(&self, job_id: &str) -> QueueResult<Option<Job>> {
        self.inner.store.get_job(job_id).await
    }

    pub async fn get_queue_stats(&self, queue: &str) -> QueueResult<QueueStats> {
        self.inner.stats(queue).await
    }

    /// Empty the completed ledgers of every queue. Job records are kept until
    /// they expire.
    pub async fn clear_completed_jobs(&self) -> QueueResult<u64> {
        self.clear_ledger(Ledger::Completed).await
    }

    /// Empty the failed ledgers of every queue
    pub async fn clear_failed_jobs(&self) -> QueueResult<u64> {
        self.clear_ledger(Ledger::Failed).await
    }

    async fn clear_ledger(&self, ledger: Ledger) -> QueueResult<u64> {
        let cleared = self.inner.store.clear_ledger(ledger).await?;
        info!(ledger = ledger.as_str(), cleared, "Cleared outcome ledger");
        Ok(cleared)
    }

    /// Ids from a queue's outcome ledger, most recent first
    pub async fn recent_jobs(
        &self,
        queue: &str,
        ledger: Ledger,
        limit: usize,
    ) -> QueueResult<Vec<JobId>> {
        self.inner.store.ledger(queue, ledger, limit).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Connectivity, worker state and per-queue stats. Never fails: errors
    /// are reported as an unhealthy result with zeroed stats.
    pub async fn health_check(&self) -> HealthReport {
        let running = self.pool.running_queues().await;
        let processing = !running.is_empty();

        if let Err(err) = self.inner.store.ping().await {
            return Self::unhealthy(false, processing, running, err);
        }

        match self.collect_stats().await {
            Ok(queues) => HealthReport {
                healthy: true,
                store_connected: true,
                processing,
                queues,
                error: None,
            },
            Err(err) => Self::unhealthy(true, processing, running, err),
        }
    }

    async fn collect_stats(&self) -> QueueResult<BTreeMap<String, QueueStats>> {
        let mut queues = BTreeMap::new();
        for queue in self.inner.store.queues().await? {
            let stats = self.inner.stats(&queue).await?;
            queues.insert(queue, stats);
        }
        Ok(queues)
    }

    fn unhealthy(
        store_connected: bool,
        processing: bool,
        running: Vec<String>,
        err: QueueError,
    ) -> HealthReport {
        warn!(error = %err, "Health check failed");
        HealthReport {
            healthy: false,
            store_connected,
            processing,
            queues: running
                .into_iter()
                .map(|queue| (queue, QueueStats::default()))
                .collect(),
            error: Some(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;
    use crate::store::StoreCounts;
    use serde_json::json;
    use std::time::Duration;

    fn queue_with_clock() -> (JobQueue, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::with_config(Default::default(), clock.clone()));
        let queue =
            JobQueue::with_clock(store.clone(), QueueConfig::default(), clock.clone()).unwrap();
        (queue, store, clock)
    }

    #[tokio::test]
    async fn test_add_job_places_by_delay() {
        let (queue, store, _clock) = queue_with_clock();

        queue
            .add_job("emails", "welcome", json!({ "to": "a@x.com" }), JobOptions::new())
            .await
            .unwrap();
        queue
            .add_job(
                "emails",
                "digest",
                json!({}),
                JobOptions::new().with_delay(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert_eq!(
            store.counts("emails").await.unwrap(),
            StoreCounts {
                waiting: 1,
                delayed: 1,
                completed: 0,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_add_job_emits_event_once() {
        let (queue, _store, _clock) = queue_with_clock();
        let mut events = queue.subscribe();

        let first = queue
            .add_job("emails", "welcome", json!({ "to": "a@x.com" }), JobOptions::new())
            .await
            .unwrap();
        let second = queue
            .add_job("emails", "welcome", json!({ "to": "a@x.com" }), JobOptions::new())
            .await
            .unwrap();
        assert_eq!(first, second);

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            QueueEvent::JobAdded {
                queue: "emails".into(),
                job_id: first,
                job_type: "welcome".into(),
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_priority_orders_waiting_jobs() {
        let (queue, store, clock) = queue_with_clock();

        let low = queue
            .add_job("q", "low", json!({}), JobOptions::new())
            .await
            .unwrap();
        clock.advance(Duration::from_millis(10));
        let high = queue
            .add_job("q", "high", json!({}), JobOptions::new().with_priority(5))
            .await
            .unwrap();

        assert_eq!(store.pop_next("q", None).await.unwrap(), Some(high));
        assert_eq!(store.pop_next("q", None).await.unwrap(), Some(low));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let store = Arc::new(MemoryStore::new());
        let config = QueueConfig {
            default_max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(
            JobQueue::new(store, config),
            Err(QueueError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_add_job_surfaces_store_outage() {
        let (queue, store, _clock) = queue_with_clock();
        store.set_available(false);

        let err = queue
            .add_job("emails", "welcome", json!({}), JobOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_health_check_degrades() {
        let (queue, store, _clock) = queue_with_clock();
        queue
            .add_job("emails", "welcome", json!({}), JobOptions::new())
            .await
            .unwrap();

        let report = queue.health_check().await;
        assert!(report.healthy);
        assert!(report.store_connected);
        assert!(!report.processing);
        assert_eq!(report.queues["emails"].waiting, 1);

        store.set_available(false);
        let report = queue.health_check().await;
        assert!(!report.healthy);
        assert!(!report.store_connected);
        assert!(report.queues.is_empty());
        assert!(report.error.is_some());
    }
}
