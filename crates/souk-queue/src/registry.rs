//! Processor registry keyed by `(queue, job_type)`

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::job::Job;

/// Handles jobs of one type on one queue. Any error returned (or panic
/// raised) counts as a failed attempt.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &Job) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`Processor`]
pub struct FnProcessor<F>(F);

impl<F> FnProcessor<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process(&self, job: &Job) -> anyhow::Result<()> {
        (self.0)(job.clone()).await
    }
}

type ProcessorKey = (String, String);

#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<ProcessorKey, Arc<dyn Processor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `(queue, job_type)`, replacing any previous
    /// one. Returns true if a handler was replaced.
    pub fn register(&self, queue: &str, job_type: &str, processor: Arc<dyn Processor>) -> bool {
        self.processors
            .write()
            .expect("Processor registry RwLock poisoned")
            .insert((queue.to_string(), job_type.to_string()), processor)
            .is_some()
    }

    pub fn get(&self, queue: &str, job_type: &str) -> Option<Arc<dyn Processor>> {
        self.processors
            .read()
            .expect("Processor registry RwLock poisoned")
            .get(&(queue.to_string(), job_type.to_string()))
            .cloned()
    }
}
