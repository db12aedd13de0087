//! Redis-backed store.
//!
//! Multi-key steps run as Lua scripts or MULTI/EXEC pipelines so they stay
//! atomic across any number of workers and processes. Scores are Unix
//! milliseconds.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};

use crate::clock::duration_ms;
use crate::config::StoreConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::store::{Ledger, Placement, QueueStore, Settlement, StoreCounts};

const SUBMIT_LUA: &str = include_str!("lua/submit.lua");
const PROMOTE_LUA: &str = include_str!("lua/promote.lua");
const CLAIM_LUA: &str = include_str!("lua/claim.lua");
const RECLAIM_LUA: &str = include_str!("lua/reclaim.lua");

impl From<RedisError> for QueueError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            QueueError::StoreUnavailable(err.to_string())
        } else {
            QueueError::Store(err.to_string())
        }
    }
}

/// Key naming for the queue's keyspace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn idempotency(&self, id: &str) -> String {
        format!("{}idempotency:{id}", self.prefix)
    }

    pub fn job(&self, id: &str) -> String {
        format!("{}job:{id}", self.prefix)
    }

    pub fn waiting(&self, queue: &str) -> String {
        format!("{}{queue}:waiting", self.prefix)
    }

    pub fn delayed(&self, queue: &str) -> String {
        format!("{}{queue}:delayed", self.prefix)
    }

    /// Claimed (in-flight) ids scored by claim deadline
    pub fn active(&self, queue: &str) -> String {
        format!("{}{queue}:active", self.prefix)
    }

    pub fn priority(&self, queue: &str) -> String {
        format!("{}{queue}:priority", self.prefix)
    }

    pub fn ledger(&self, queue: &str, ledger: Ledger) -> String {
        format!("{}{queue}:{}", self.prefix, ledger.as_str())
    }

    pub fn queues(&self) -> String {
        format!("{}queues", self.prefix)
    }
}

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    keys: KeySpace,
    config: StoreConfig,
    submit_script: Script,
    promote_script: Script,
    claim_script: Script,
    reclaim_script: Script,
}

impl RedisStore {
    /// Connect using `config.redis_url`. The connection manager reconnects
    /// on its own after a dropped connection.
    pub async fn connect(config: StoreConfig) -> QueueResult<Self> {
        config.validate()?;
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await.map_err(|err| {
            tracing::error!(error = %err, "Failed to connect to Redis");
            QueueError::from(err)
        })?;
        Ok(Self::with_connection(config, conn))
    }

    pub fn with_connection(config: StoreConfig, conn: ConnectionManager) -> Self {
        Self {
            conn,
            keys: KeySpace::new(config.key_prefix.clone()),
            config,
            submit_script: Script::new(SUBMIT_LUA),
            promote_script: Script::new(PROMOTE_LUA),
            claim_script: Script::new(CLAIM_LUA),
            reclaim_script: Script::new(RECLAIM_LUA),
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    fn job_ttl_ms(&self) -> i64 {
        duration_ms(self.config.job_ttl).max(1)
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn submit(&self, job: &Job, placement: Placement) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let record = serde_json::to_string(job)?;
        let (target, score) = match placement {
            Placement::Waiting { score } => (self.keys.waiting(&job.queue), score),
            Placement::Delayed { ready_at } => (self.keys.delayed(&job.queue), ready_at),
        };

        let mut invocation = self.submit_script.prepare_invoke();
        invocation
            .key(self.keys.idempotency(&job.id))
            .key(self.keys.job(&job.id))
            .key(target)
            .key(self.keys.priority(&job.queue))
            .key(self.keys.queues())
            .arg(&job.id)
            .arg(record)
            .arg(score)
            .arg(duration_ms(self.config.idempotency_ttl).max(1))
            .arg(self.job_ttl_ms())
            .arg(job.priority())
            .arg(&job.queue);
        let created: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(created == 1)
    }

    async fn get_job(&self, id: &str) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.keys.job(id)).await?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    async fn put_job(&self, job: &Job) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.keys.job(&job.id))
            .arg(serde_json::to_string(job)?)
            .arg("PX")
            .arg(self.job_ttl_ms())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn promote_due(
        &self,
        queue: &str,
        now_ms: i64,
        priority_weight_ms: i64,
    ) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let mut invocation = self.promote_script.prepare_invoke();
        invocation
            .key(self.keys.delayed(queue))
            .key(self.keys.waiting(queue))
            .key(self.keys.priority(queue))
            .arg(now_ms)
            .arg(priority_weight_ms);
        let promoted: u64 = invocation.invoke_async(&mut conn).await?;
        Ok(promoted)
    }

    async fn pop_next(&self, queue: &str, claim_until: Option<i64>) -> QueueResult<Option<String>> {
        let mut conn = self.conn.clone();
        let mut invocation = self.claim_script.prepare_invoke();
        invocation
            .key(self.keys.waiting(queue))
            .key(self.keys.active(queue))
            .arg(claim_until.unwrap_or(0));
        let popped: Option<String> = invocation.invoke_async(&mut conn).await?;
        Ok(popped)
    }

    async fn extend_claims(&self, queue: &str, ids: &[String], until: i64) -> QueueResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let key = self.keys.active(queue);
        let mut pipe = redis::pipe();
        for id in ids {
            // XX: never recreate a claim that was settled or reclaimed
            pipe.cmd("ZADD").arg(&key).arg("XX").arg(until).arg(id).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn forget(&self, queue: &str, id: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zrem(self.keys.active(queue), id).ignore();
        pipe.hdel(self.keys.priority(queue), id).ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        queue: &str,
        now_ms: i64,
        priority_weight_ms: i64,
    ) -> QueueResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut invocation = self.reclaim_script.prepare_invoke();
        invocation
            .key(self.keys.active(queue))
            .key(self.keys.waiting(queue))
            .key(self.keys.priority(queue))
            .arg(now_ms)
            .arg(priority_weight_ms);
        let stale: Vec<String> = invocation.invoke_async(&mut conn).await?;
        Ok(stale)
    }

    async fn settle(&self, job: &Job, settlement: Settlement) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let record = serde_json::to_string(job)?;
        let cap = isize::try_from(self.config.ledger_cap).unwrap_or(isize::MAX);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SET")
            .arg(self.keys.job(&job.id))
            .arg(record)
            .arg("PX")
            .arg(self.job_ttl_ms())
            .ignore();
        pipe.zrem(self.keys.active(&job.queue), &job.id).ignore();

        let ledger = match settlement {
            Settlement::Completed => Some(Ledger::Completed),
            Settlement::Failed => Some(Ledger::Failed),
            Settlement::Retry { ready_at } => {
                pipe.zadd(self.keys.delayed(&job.queue), &job.id, ready_at)
                    .ignore();
                None
            }
        };
        if let Some(ledger) = ledger {
            let key = self.keys.ledger(&job.queue, ledger);
            pipe.lpush(&key, &job.id).ignore();
            pipe.ltrim(&key, 0, cap - 1).ignore();
            pipe.hdel(self.keys.priority(&job.queue), &job.id).ignore();
        }

        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn counts(&self, queue: &str) -> QueueResult<StoreCounts> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zcard(self.keys.waiting(queue));
        pipe.zcard(self.keys.delayed(queue));
        pipe.llen(self.keys.ledger(queue, Ledger::Completed));
        pipe.llen(self.keys.ledger(queue, Ledger::Failed));
        let (waiting, delayed, completed, failed): (u64, u64, u64, u64) =
            pipe.query_async(&mut conn).await?;

        Ok(StoreCounts {
            waiting,
            delayed,
            completed,
            failed,
        })
    }

    async fn ledger(&self, queue: &str, ledger: Ledger, limit: usize) -> QueueResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let ids: Vec<String> = conn.lrange(self.keys.ledger(queue, ledger), 0, stop).await?;
        Ok(ids)
    }

    async fn clear_ledger(&self, ledger: Ledger) -> QueueResult<u64> {
        let queues = self.queues().await?;
        if queues.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for queue in &queues {
            let key = self.keys.ledger(queue, ledger);
            pipe.llen(&key);
            pipe.del(&key).ignore();
        }
        let lengths: Vec<u64> = pipe.query_async(&mut conn).await?;
        Ok(lengths.into_iter().sum())
    }

    async fn queues(&self) -> QueueResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = conn.smembers(self.keys.queues()).await?;
        names.sort();
        Ok(names)
    }
}
