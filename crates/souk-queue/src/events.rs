//! Typed queue events, fanned out over a broadcast channel

use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::JobId;
use crate::stats::QueueStats;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    JobAdded {
        queue: String,
        job_id: JobId,
        job_type: String,
    },
    JobCompleted {
        queue: String,
        job_id: JobId,
        attempts: u32,
    },
    JobFailed {
        queue: String,
        job_id: JobId,
        attempts: u32,
        error: String,
        /// False when the failure was terminal
        will_retry: bool,
    },
    StatsUpdated {
        queue: String,
        stats: QueueStats,
    },
}

/// Lagging subscribers lose the oldest events; emitting never blocks.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: QueueEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}
