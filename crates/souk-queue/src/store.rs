//! Queue Store Trait
//!
//! Every mutation a store exposes must be atomic with respect to concurrent
//! callers in any process: two workers may never pop the same id, and a job
//! is never observable in both (or neither of) its waiting and delayed sets.

use async_trait::async_trait;

use crate::error::QueueResult;
use crate::job::Job;

/// Which outcome ledger to address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ledger {
    Completed,
    Failed,
}

impl Ledger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Where a freshly submitted job goes, with its ordered-set score
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Waiting { score: i64 },
    Delayed { ready_at: i64 },
}

/// How a dispatched job was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    /// Back into the delayed set, eligible again at `ready_at`
    Retry { ready_at: i64 },
    Failed,
}

/// Raw set and ledger sizes for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Connectivity check
    async fn ping(&self) -> QueueResult<()>;

    /// Create the idempotency marker and, only if it was absent, persist the
    /// record and enqueue its id, all as one unit. Returns `false` when the
    /// marker already existed and nothing was written.
    async fn submit(&self, job: &Job, placement: Placement) -> QueueResult<bool>;

    async fn get_job(&self, id: &str) -> QueueResult<Option<Job>>;

    /// Overwrite a record, refreshing its TTL
    async fn put_job(&self, job: &Job) -> QueueResult<()>;

    /// Move every delayed member with `ready_at <= now_ms` into the waiting
    /// set, scored `now_ms` less its priority weighting. Returns the count.
    async fn promote_due(&self, queue: &str, now_ms: i64, priority_weight_ms: i64)
        -> QueueResult<u64>;

    /// Pop the lowest-scored waiting id. With `claim_until`, the id is
    /// recorded in the queue's claim set in the same step.
    async fn pop_next(&self, queue: &str, claim_until: Option<i64>) -> QueueResult<Option<String>>;

    /// Push the deadline of each listed claim out to `until`. Ids that are
    /// no longer claimed are left alone.
    async fn extend_claims(&self, queue: &str, ids: &[String], until: i64) -> QueueResult<()>;

    /// Drop the claim and priority entry of an id whose record is gone
    async fn forget(&self, queue: &str, id: &str) -> QueueResult<()>;

    /// Return claims whose deadline is `<= now_ms` to the waiting set, scored
    /// like a promotion. Returns the reclaimed ids.
    async fn reclaim_stale(
        &self,
        queue: &str,
        now_ms: i64,
        priority_weight_ms: i64,
    ) -> QueueResult<Vec<String>>;

    /// Persist the final state of an attempt, drop its claim and route the id
    /// to a ledger or back to the delayed set, atomically.
    async fn settle(&self, job: &Job, settlement: Settlement) -> QueueResult<()>;

    async fn counts(&self, queue: &str) -> QueueResult<StoreCounts>;

    /// Most recent first
    async fn ledger(&self, queue: &str, ledger: Ledger, limit: usize) -> QueueResult<Vec<String>>;

    /// Empty the given ledger of every known queue. Job records are left to
    /// expire on their own.
    async fn clear_ledger(&self, ledger: Ledger) -> QueueResult<u64>;

    /// Every queue name that has ever received a job
    async fn queues(&self) -> QueueResult<Vec<String>>;
}
