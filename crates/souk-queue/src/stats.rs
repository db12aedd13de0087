//! Queue statistics and health reporting

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::store::StoreCounts;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    /// Sum of the other five
    pub total: u64,
}

impl QueueStats {
    pub fn from_counts(counts: StoreCounts, active: u64) -> Self {
        Self {
            waiting: counts.waiting,
            active,
            completed: counts.completed,
            failed: counts.failed,
            delayed: counts.delayed,
            total: counts.waiting + counts.delayed + counts.completed + counts.failed + active,
        }
    }
}

/// Result of `JobQueue::health_check`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store_connected: bool,
    /// True while any queue has running workers
    pub processing: bool,
    pub queues: BTreeMap<String, QueueStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type InFlight = Arc<Mutex<HashMap<String, usize>>>;

fn lock(set: &InFlight) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

/// Jobs this process is currently executing, per queue. The ids are what
/// workers refresh claims for.
#[derive(Debug, Default)]
pub struct ActiveJobs {
    queues: Mutex<HashMap<String, InFlight>>,
}

impl ActiveJobs {
    fn in_flight(&self, queue: &str) -> InFlight {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.entry(queue.to_string()).or_default().clone()
    }

    pub fn get(&self, queue: &str) -> u64 {
        lock(&self.in_flight(queue)).values().map(|n| *n as u64).sum()
    }

    pub fn ids(&self, queue: &str) -> Vec<String> {
        lock(&self.in_flight(queue)).keys().cloned().collect()
    }

    /// Count `id` as active until the returned guard is dropped
    pub fn enter(&self, queue: &str, id: &str) -> ActiveGuard {
        let set = self.in_flight(queue);
        *lock(&set).entry(id.to_string()).or_default() += 1;
        ActiveGuard {
            set,
            id: id.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ActiveGuard {
    set: InFlight,
    id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut set = lock(&self.set);
        if let Some(n) = set.get_mut(&self.id) {
            *n -= 1;
            if *n == 0 {
                set.remove(&self.id);
            }
        }
    }
}
