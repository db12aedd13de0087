//! # Souk Queue
//!
//! Redis-backed background job queue.
//!
//! Features:
//! - Idempotent submission: identical jobs submitted in the same instant
//!   collapse into one
//! - Delayed scheduling and priority ordering
//! - Per-queue worker loops with configurable concurrency
//! - Retry with exponential backoff and outcome ledgers
//! - Pluggable stores (Redis, in-memory)
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use souk_queue::{JobOptions, JobQueue, QueueConfig, RedisStore, StoreConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = RedisStore::connect(StoreConfig::from_env()).await?;
//! let queue = JobQueue::new(Arc::new(store), QueueConfig::from_env())?;
//!
//! queue.register_fn("emails", "welcome", |job| async move {
//!     println!("sending welcome mail to {}", job.payload["to"]);
//!     Ok(())
//! });
//! queue.start_processing("emails", 4).await?;
//!
//! queue
//!     .add_job("emails", "welcome", json!({ "to": "a@x.com" }), JobOptions::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod memory;
pub mod queue;
pub mod redis_store;
pub mod registry;
pub mod retry;
pub mod stats;
pub mod store;
pub mod telemetry;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{QueueConfig, StoreConfig, WorkerConfig};
pub use error::{DispatchError, QueueError, QueueResult};
pub use events::QueueEvent;
pub use job::{make_job_id, BackoffStrategy, Job, JobId, JobOptions, JobStatus};
pub use memory::MemoryStore;
pub use queue::JobQueue;
pub use redis_store::RedisStore;
pub use registry::{FnProcessor, Processor};
pub use stats::{HealthReport, QueueStats};
pub use store::{Ledger, QueueStore};
pub use telemetry::init_tracing;
