//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use souk_queue::{JobQueue, ManualClock, MemoryStore, QueueConfig, StoreConfig, WorkerConfig};

/// Poll `$cond` until it holds, failing the test after five seconds
macro_rules! eventually {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met in time: {}",
                stringify!($cond)
            );
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }};
}

pub struct Fixture {
    pub queue: JobQueue,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

/// Worker tuning that keeps tests fast: 5ms idle polls, short cooldowns
pub fn fast_config() -> QueueConfig {
    QueueConfig {
        worker: WorkerConfig {
            poll_interval: Duration::from_millis(5),
            store_error_cooldown: Duration::from_millis(20),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn fixture(config: QueueConfig) -> Fixture {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryStore::with_config(
        StoreConfig::default(),
        clock.clone(),
    ));
    let queue = JobQueue::with_clock(store.clone(), config, clock.clone())
        .expect("test config is valid");
    Fixture {
        queue,
        store,
        clock,
    }
}

/// Give idle workers a few poll cycles to act (or not act)
pub async fn settle_workers() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
