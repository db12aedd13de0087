//! Worker pool: per-queue sets of polling loops that dispatch jobs to their
//! registered processors.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::duration_ms;
use crate::error::{DispatchError, QueueError, QueueResult};
use crate::events::QueueEvent;
use crate::job::Job;
use crate::queue::QueueInner;
use crate::retry::RetryDecision;
use crate::store::Settlement;

struct RunningQueue {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Default)]
pub(crate) struct WorkerPool {
    running: Mutex<HashMap<String, RunningQueue>>,
}

impl WorkerPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn start(
        &self,
        inner: Arc<QueueInner>,
        queue: &str,
        concurrency: usize,
    ) -> QueueResult<()> {
        if concurrency == 0 {
            return Err(QueueError::InvalidConfig(
                "concurrency must be at least 1".into(),
            ));
        }

        let mut running = self.running.lock().await;
        if running.contains_key(queue) {
            warn!(queue, "Queue is already being processed");
            return Ok(());
        }

        let (stop, stop_rx) = watch::channel(false);
        let handles = (0..concurrency)
            .map(|index| {
                let worker = Worker {
                    inner: inner.clone(),
                    queue: queue.to_string(),
                    index,
                    stop: stop_rx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        running.insert(queue.to_string(), RunningQueue { stop, handles });
        info!(queue, concurrency, "Started processing queue");
        Ok(())
    }

    /// Returns false if the queue was not running
    pub(crate) async fn stop(&self, queue: &str) -> QueueResult<bool> {
        let entry = self.running.lock().await.remove(queue);
        let Some(RunningQueue { stop, handles }) = entry else {
            return Ok(false);
        };

        // Err only means every worker already exited
        let _ = stop.send(true);

        let mut first_error = None;
        for handle in handles {
            if let Err(err) = handle.await {
                error!(queue, error = %err, "Worker task did not shut down cleanly");
                first_error.get_or_insert(QueueError::Join(err.to_string()));
            }
        }

        info!(queue, "Stopped processing queue");
        first_error.map_or(Ok(true), Err)
    }

    pub(crate) async fn stop_all(&self) -> QueueResult<()> {
        for queue in self.running_queues().await {
            self.stop(&queue).await?;
        }
        Ok(())
    }

    pub(crate) async fn is_running(&self, queue: &str) -> bool {
        self.running.lock().await.contains_key(queue)
    }

    pub(crate) async fn running_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.running.lock().await.keys().cloned().collect();
        queues.sort();
        queues
    }
}

enum Tick {
    Processed,
    Idle,
}

struct Worker {
    inner: Arc<QueueInner>,
    queue: String,
    index: usize,
    stop: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!(queue = %self.queue, worker = self.index, "Worker started");

        loop {
            if *self.stop.borrow() || self.stop.has_changed().is_err() {
                break;
            }

            let pause = match self.tick().await {
                Ok(Tick::Processed) => continue,
                Ok(Tick::Idle) => self.inner.config.worker.poll_interval,
                Err(err) if err.is_unavailable() => {
                    error!(queue = %self.queue, worker = self.index, error = %err, "Store unavailable, cooling down");
                    self.inner.config.worker.store_error_cooldown
                }
                Err(err) => {
                    error!(queue = %self.queue, worker = self.index, error = %err, "Worker iteration failed");
                    self.inner.config.worker.poll_interval
                }
            };

            if self.pause(pause).await {
                break;
            }
        }

        debug!(queue = %self.queue, worker = self.index, "Worker stopped");
    }

    /// Sleep, waking early on a stop request. Returns true if the worker
    /// should exit.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = self.stop.changed() => changed.is_err() || *self.stop.borrow(),
        }
    }

    async fn tick(&self) -> QueueResult<Tick> {
        let inner = &self.inner;
        let now_ms = inner.clock.now_ms();
        let claim_timeout = inner.config.worker.claim_timeout;

        if let Some(timeout) = claim_timeout {
            // Claims held by this process are alive whatever the clock says
            let held = inner.active.ids(&self.queue);
            if !held.is_empty() {
                let until = now_ms.saturating_add(duration_ms(timeout));
                inner.store.extend_claims(&self.queue, &held, until).await?;
            }

            let reclaimed = inner
                .store
                .reclaim_stale(&self.queue, now_ms, inner.config.priority_weight_ms)
                .await?;
            for id in reclaimed {
                warn!(queue = %self.queue, job_id = %id, "Reclaimed job with expired claim");
            }
        }

        let promoted = inner
            .store
            .promote_due(&self.queue, now_ms, inner.config.priority_weight_ms)
            .await?;
        if promoted > 0 {
            debug!(queue = %self.queue, promoted, "Promoted delayed jobs");
        }

        let claim_until = claim_timeout.map(|t| now_ms.saturating_add(duration_ms(t)));
        match inner.store.pop_next(&self.queue, claim_until).await? {
            Some(id) => {
                self.dispatch(&id).await?;
                Ok(Tick::Processed)
            }
            None => Ok(Tick::Idle),
        }
    }

    async fn dispatch(&self, id: &str) -> QueueResult<()> {
        let inner = &self.inner;
        let active = inner.active.enter(&self.queue, id);

        let Some(mut job) = inner.store.get_job(id).await? else {
            debug!(queue = %self.queue, job_id = %id, "Job record expired before dispatch");
            return inner.store.forget(&self.queue, id).await;
        };

        job.attempts += 1;
        job.processed_at = Some(inner.clock.now());
        inner.store.put_job(&job).await?;

        debug!(
            queue = %self.queue,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "Processing job"
        );

        let outcome = self.execute_claimed(&job).await;
        let now = inner.clock.now();

        let event = match outcome {
            Ok(()) => {
                job.completed_at = Some(now);
                inner.store.settle(&job, Settlement::Completed).await?;
                info!(queue = %self.queue, job_id = %job.id, attempts = job.attempts, "Job completed");
                QueueEvent::JobCompleted {
                    queue: self.queue.clone(),
                    job_id: job.id.clone(),
                    attempts: job.attempts,
                }
            }
            Err(failure) => {
                let message = failure.to_string();
                job.failed_at = Some(now);
                job.error = Some(message.clone());

                let will_retry = match inner.retry.decide(job.attempts, job.max_attempts) {
                    RetryDecision::Retry { delay } => {
                        job.run_at = now
                            .checked_add_signed(chrono::Duration::milliseconds(duration_ms(delay)))
                            .unwrap_or(DateTime::<Utc>::MAX_UTC);
                        inner
                            .store
                            .settle(
                                &job,
                                Settlement::Retry {
                                    ready_at: job.run_at.timestamp_millis(),
                                },
                            )
                            .await?;
                        warn!(
                            queue = %self.queue,
                            job_id = %job.id,
                            attempt = job.attempts,
                            max_attempts = job.max_attempts,
                            delay_ms = duration_ms(delay),
                            error = %message,
                            "Job failed, scheduling retry with backoff"
                        );
                        true
                    }
                    RetryDecision::Exhausted => {
                        inner.store.settle(&job, Settlement::Failed).await?;
                        error!(
                            queue = %self.queue,
                            job_id = %job.id,
                            attempts = job.attempts,
                            error = %message,
                            "Job failed permanently"
                        );
                        false
                    }
                };

                QueueEvent::JobFailed {
                    queue: self.queue.clone(),
                    job_id: job.id.clone(),
                    attempts: job.attempts,
                    error: message,
                    will_retry,
                }
            }
        };

        drop(active);
        inner.events.emit(event);

        if inner.events.has_subscribers() {
            match inner.stats(&self.queue).await {
                Ok(stats) => inner.events.emit(QueueEvent::StatsUpdated {
                    queue: self.queue.clone(),
                    stats,
                }),
                Err(err) => debug!(queue = %self.queue, error = %err, "Could not refresh stats"),
            }
        }

        Ok(())
    }

    /// Run the processor, pushing the claim deadline out every third of the
    /// claim timeout so a long job is never handed to a second worker.
    async fn execute_claimed(&self, job: &Job) -> Result<(), DispatchError> {
        let Some(timeout) = self.inner.config.worker.claim_timeout else {
            return self.execute(job).await;
        };

        let period = (timeout / 3).max(Duration::from_millis(1));
        let mut heartbeat = time::interval_at(time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ids = [job.id.clone()];

        let execution = self.execute(job);
        tokio::pin!(execution);

        loop {
            tokio::select! {
                outcome = &mut execution => return outcome,
                _ = heartbeat.tick() => {
                    let until = self.inner.clock.now_ms().saturating_add(duration_ms(timeout));
                    if let Err(err) = self.inner.store.extend_claims(&self.queue, &ids, until).await {
                        warn!(queue = %self.queue, job_id = %job.id, error = %err, "Could not extend job claim");
                    }
                }
            }
        }
    }

    async fn execute(&self, job: &Job) -> Result<(), DispatchError> {
        let Some(processor) = self.inner.registry.get(&self.queue, &job.job_type) else {
            warn!(queue = %self.queue, job_type = %job.job_type, "No processor registered");
            return Err(DispatchError::ProcessorNotRegistered {
                queue: self.queue.clone(),
                job_type: job.job_type.clone(),
            });
        };

        match AssertUnwindSafe(processor.process(job)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(DispatchError::Processing(format!("{err:#}"))),
            Err(payload) => Err(DispatchError::Panicked(panic_message(&*payload))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
