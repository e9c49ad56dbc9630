//! Background task dispatch.
//!
//! Merge commits finish inside one transaction; the bulk repointing of the
//! source user's documents happens later, driven by a queued migration task.
//! The queue is a seam: production hosts bridge it to their task runner, tests
//! and standalone embedding use the in-process queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Errors surfaced by task queue implementations.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task dispatch failed: {0}")]
    Dispatch(String),
}

/// Payload for the post-merge data migration worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationTask {
    pub merge_job_id: String,
    pub source_uid: String,
    pub target_uid: String,
    pub target_account_id: String,
}

/// Interface for enqueueing background work.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue the data migration that follows a committed merge.
    async fn enqueue_merge_migration(&self, task: MigrationTask) -> Result<(), TaskError>;
}

/// In-process queue that records enqueued tasks for inspection.
#[derive(Default)]
pub struct InProcessTaskQueue {
    tasks: Mutex<Vec<MigrationTask>>,
}

impl InProcessTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything enqueued so far, in order.
    pub async fn enqueued(&self) -> Vec<MigrationTask> {
        self.tasks.lock().await.clone()
    }
}

#[async_trait]
impl TaskQueue for InProcessTaskQueue {
    async fn enqueue_merge_migration(&self, task: MigrationTask) -> Result<(), TaskError> {
        self.tasks.lock().await.push(task);
        Ok(())
    }
}
