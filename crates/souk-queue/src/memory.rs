//! In-memory store with ordered-set scheduling.
//!
//! Mirrors the Redis keyspace with plain collections behind one lock, so each
//! trait operation is atomic the same way a Lua script or MULTI block is.
//! Expiry is evaluated lazily against the injected clock.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::{duration_ms, Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{waiting_score, Job};
use crate::store::{Ledger, Placement, QueueStore, Settlement, StoreCounts};

/// Ordered-set member - sorts by score, then id, like a Redis sorted set
#[derive(Debug, Clone, Eq, PartialEq)]
struct ScoredEntry {
    score: i64,
    id: String,
}

impl Ord for ScoredEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for ScoredEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct ScoredSet {
    entries: BTreeSet<ScoredEntry>,
    scores: HashMap<String, i64>,
}

impl ScoredSet {
    /// Insert or re-score a member
    fn insert(&mut self, id: &str, score: i64) {
        if let Some(old) = self.scores.insert(id.to_string(), score) {
            self.entries.remove(&ScoredEntry {
                score: old,
                id: id.to_string(),
            });
        }
        self.entries.insert(ScoredEntry {
            score,
            id: id.to_string(),
        });
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.scores.remove(id) {
            Some(score) => self.entries.remove(&ScoredEntry {
                score,
                id: id.to_string(),
            }),
            None => false,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.scores.contains_key(id)
    }

    fn pop_min(&mut self) -> Option<String> {
        let entry = self.entries.pop_first()?;
        self.scores.remove(&entry.id);
        Some(entry.id)
    }

    /// Remove and return every member scored `<= max_score`, lowest first
    fn drain_due(&mut self, max_score: i64) -> Vec<String> {
        let mut due = Vec::new();
        while let Some(first) = self.entries.first() {
            if first.score > max_score {
                break;
            }
            if let Some(id) = self.pop_min() {
                due.push(id);
            }
        }
        due
    }

    fn len(&self) -> u64 {
        self.entries.len() as u64
    }
}

#[derive(Debug, Default)]
struct QueueState {
    waiting: ScoredSet,
    delayed: ScoredSet,
    active: ScoredSet,
    priorities: HashMap<String, i32>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
}

impl QueueState {
    fn ledger_mut(&mut self, ledger: Ledger) -> &mut VecDeque<String> {
        match ledger {
            Ledger::Completed => &mut self.completed,
            Ledger::Failed => &mut self.failed,
        }
    }
}

#[derive(Debug)]
struct StoredJob {
    job: Job,
    expires_at: i64,
}

/// Minimum spacing between sweeps of expired markers and records
const SWEEP_INTERVAL_MS: i64 = 1_000;

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<String, StoredJob>,
    markers: HashMap<String, i64>,
    queues: BTreeMap<String, QueueState>,
    next_sweep_at: i64,
}

impl State {
    /// Drop expired idempotency markers and job records, at most once per
    /// sweep interval
    fn sweep_expired(&mut self, now_ms: i64) {
        if now_ms < self.next_sweep_at {
            return;
        }
        self.markers.retain(|_, expires_at| *expires_at > now_ms);
        self.jobs.retain(|_, stored| stored.expires_at > now_ms);
        self.next_sweep_at = now_ms.saturating_add(SWEEP_INTERVAL_MS);
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default(), Arc::new(SystemClock))
    }

    pub fn with_config(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            config,
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// `QueueError::StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::SeqCst);
    }

    fn ensure_available(&self) -> QueueResult<()> {
        if self.available.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::StoreUnavailable("memory store offline".into()))
        }
    }

    fn job_expiry(&self, now_ms: i64) -> i64 {
        now_ms.saturating_add(duration_ms(self.config.job_ttl))
    }

    fn push_ledger(&self, queue: &mut QueueState, ledger: Ledger, id: &str) {
        let list = queue.ledger_mut(ledger);
        list.push_front(id.to_string());
        list.truncate(self.config.ledger_cap);
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn ping(&self) -> QueueResult<()> {
        self.ensure_available()
    }

    async fn submit(&self, job: &Job, placement: Placement) -> QueueResult<bool> {
        self.ensure_available()?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;
        state.sweep_expired(now);

        if let Some(expires_at) = state.markers.get(&job.id) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        state.markers.insert(
            job.id.clone(),
            now.saturating_add(duration_ms(self.config.idempotency_ttl)),
        );
        state.jobs.insert(
            job.id.clone(),
            StoredJob {
                job: job.clone(),
                expires_at: self.job_expiry(now),
            },
        );

        let queue = state.queues.entry(job.queue.clone()).or_default();
        match placement {
            Placement::Waiting { score } => queue.waiting.insert(&job.id, score),
            Placement::Delayed { ready_at } => queue.delayed.insert(&job.id, ready_at),
        }
        if job.priority() != 0 {
            queue.priorities.insert(job.id.clone(), job.priority());
        }

        Ok(true)
    }

    async fn get_job(&self, id: &str) -> QueueResult<Option<Job>> {
        self.ensure_available()?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;

        match state.jobs.get(id) {
            Some(stored) if stored.expires_at > now => Ok(Some(stored.job.clone())),
            Some(_) => {
                state.jobs.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put_job(&self, job: &Job) -> QueueResult<()> {
        self.ensure_available()?;
        let expires_at = self.job_expiry(self.clock.now_ms());
        let mut state = self.state.lock().await;
        state.jobs.insert(
            job.id.clone(),
            StoredJob {
                job: job.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn promote_due(
        &self,
        queue: &str,
        now_ms: i64,
        priority_weight_ms: i64,
    ) -> QueueResult<u64> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let Some(queue) = state.queues.get_mut(queue) else {
            return Ok(0);
        };

        let due = queue.delayed.drain_due(now_ms);
        for id in &due {
            let priority = queue.priorities.get(id).copied().unwrap_or(0);
            queue
                .waiting
                .insert(id, waiting_score(now_ms, priority, priority_weight_ms));
        }
        Ok(due.len() as u64)
    }

    async fn pop_next(&self, queue: &str, claim_until: Option<i64>) -> QueueResult<Option<String>> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let Some(queue) = state.queues.get_mut(queue) else {
            return Ok(None);
        };

        let popped = queue.waiting.pop_min();
        if let (Some(id), Some(deadline)) = (&popped, claim_until) {
            queue.active.insert(id, deadline);
        }
        Ok(popped)
    }

    async fn extend_claims(&self, queue: &str, ids: &[String], until: i64) -> QueueResult<()> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let Some(queue) = state.queues.get_mut(queue) else {
            return Ok(());
        };

        for id in ids {
            if queue.active.contains(id) {
                queue.active.insert(id, until);
            }
        }
        Ok(())
    }

    async fn forget(&self, queue: &str, id: &str) -> QueueResult<()> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        if let Some(queue) = state.queues.get_mut(queue) {
            queue.active.remove(id);
            queue.priorities.remove(id);
        }
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        queue: &str,
        now_ms: i64,
        priority_weight_ms: i64,
    ) -> QueueResult<Vec<String>> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let Some(queue) = state.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let stale = queue.active.drain_due(now_ms);
        for id in &stale {
            let priority = queue.priorities.get(id).copied().unwrap_or(0);
            queue
                .waiting
                .insert(id, waiting_score(now_ms, priority, priority_weight_ms));
        }
        Ok(stale)
    }

    async fn settle(&self, job: &Job, settlement: Settlement) -> QueueResult<()> {
        self.ensure_available()?;
        let now = self.clock.now_ms();
        let expires_at = self.job_expiry(now);
        let mut state = self.state.lock().await;
        state.sweep_expired(now);

        state.jobs.insert(
            job.id.clone(),
            StoredJob {
                job: job.clone(),
                expires_at,
            },
        );

        let queue = state.queues.entry(job.queue.clone()).or_default();
        queue.active.remove(&job.id);
        match settlement {
            Settlement::Completed => {
                queue.priorities.remove(&job.id);
                self.push_ledger(queue, Ledger::Completed, &job.id);
            }
            Settlement::Retry { ready_at } => queue.delayed.insert(&job.id, ready_at),
            Settlement::Failed => {
                queue.priorities.remove(&job.id);
                self.push_ledger(queue, Ledger::Failed, &job.id);
            }
        }
        Ok(())
    }

    async fn counts(&self, queue: &str) -> QueueResult<StoreCounts> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(queue)
            .map(|q| StoreCounts {
                waiting: q.waiting.len(),
                delayed: q.delayed.len(),
                completed: q.completed.len() as u64,
                failed: q.failed.len() as u64,
            })
            .unwrap_or_default())
    }

    async fn ledger(&self, queue: &str, ledger: Ledger, limit: usize) -> QueueResult<Vec<String>> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        Ok(state
            .queues
            .get_mut(queue)
            .map(|q| q.ledger_mut(ledger).iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_ledger(&self, ledger: Ledger) -> QueueResult<u64> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let mut cleared = 0u64;
        for queue in state.queues.values_mut() {
            let list = queue.ledger_mut(ledger);
            cleared += list.len() as u64;
            list.clear();
        }
        Ok(cleared)
    }

    async fn queues(&self) -> QueueResult<Vec<String>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.queues.keys().cloned().collect())
    }
}
