//! # Task-Queue Client Interface
//!
//! Explicit queue abstraction for out-of-band work (notification payloads,
//! external submission hand-offs). Components receive a client by injection;
//! unit tests use the in-memory fake.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;

/// Enqueue a payload on a named queue. Implementations are expected to be
/// cheap and non-blocking relative to the caller's unit of work.
#[async_trait]
pub trait TaskQueueClient: Send + Sync {
    async fn enqueue(&self, queue: &str, payload: Value) -> Result<()>;
}

/// In-memory queue fake for tests and single-process embedders.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    queues: DashMap<String, Vec<Value>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything currently on a queue.
    pub fn drain(&self, queue: &str) -> Vec<Value> {
        self.queues
            .remove(queue)
            .map(|(_, payloads)| payloads)
            .unwrap_or_default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.queues.get(queue).map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TaskQueueClient for InMemoryQueue {
    async fn enqueue(&self, queue: &str, payload: Value) -> Result<()> {
        debug!(queue = %queue, "enqueued payload");
        self.queues.entry(queue.to_string()).or_default().push(payload);
        Ok(())
    }
}
