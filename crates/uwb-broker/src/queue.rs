//! Durable named job queues on top of the bus.
//!
//! A queue item names a worker function and its serialized arguments; items
//! survive worker restarts because they stay in the broker list until popped.
//! De-queue is destructive, job state in the relational store stays
//! authoritative.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use uwb_core::error::CoreError;
use uwb_core::ports::Bus;

pub const QUEUE_BUILDS: &str = "unica-wb:builds";
pub const QUEUE_CONTROLS: &str = "unica-wb:controls";

/// One unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Fresh opaque id per enqueue, stored on the job row.
    pub queue_job_id: String,
    /// Worker dispatch-table key.
    pub function: String,
    pub args: Value,
}

/// Producer/consumer handle for the two named queues.
#[derive(Clone)]
pub struct JobQueue {
    bus: Arc<dyn Bus>,
}

impl JobQueue {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Enqueue a work item. A failed push surfaces to the HTTP caller.
    pub async fn enqueue(
        &self,
        queue: &str,
        function: &str,
        args: Value,
    ) -> Result<QueueItem, CoreError> {
        let item = QueueItem {
            queue_job_id: uuid::Uuid::new_v4().simple().to_string(),
            function: function.to_string(),
            args,
        };
        let payload = serde_json::to_value(&item)
            .map_err(|e| CoreError::Infra(format!("queue item serialization: {e}")))?;
        if self.bus.queue_push(queue, &payload).await {
            Ok(item)
        } else {
            Err(CoreError::Infra("queue unavailable".to_string()))
        }
    }

    /// Block up to `timeout_secs` for the oldest item (FIFO within a queue).
    pub async fn pop(&self, queue: &str, timeout_secs: u64) -> Option<QueueItem> {
        let payload = self.bus.queue_pop(queue, timeout_secs).await?;
        match serde_json::from_value(payload) {
            Ok(item) => Some(item),
            Err(error) => {
                tracing::warn!(queue, %error, "dropping undecodable queue item");
                None
            }
        }
    }

    /// Best-effort removal of a queued-but-not-started item.
    pub async fn remove(&self, queue: &str, item: &QueueItem) -> bool {
        match serde_json::to_value(item) {
            Ok(payload) => self.bus.queue_remove(queue, &payload).await,
            Err(_) => false,
        }
    }

    /// Best-effort removal by the opaque id recorded on the job row.
    pub async fn remove_by_queue_job_id(&self, queue: &str, queue_job_id: &str) -> bool {
        self.bus
            .queue_remove_matching(queue, "queue_job_id", queue_job_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBus;
    use serde_json::json;

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(MemoryBus::new()))
    }

    #[tokio::test]
    async fn enqueue_assigns_fresh_ids_and_pops_fifo() {
        let queue = queue();
        let a = queue
            .enqueue(QUEUE_BUILDS, "build", json!({"job_id": "1"}))
            .await
            .unwrap();
        let b = queue
            .enqueue(QUEUE_BUILDS, "build", json!({"job_id": "2"}))
            .await
            .unwrap();
        assert_ne!(a.queue_job_id, b.queue_job_id);

        let first = queue.pop(QUEUE_BUILDS, 1).await.unwrap();
        assert_eq!(first.args["job_id"], "1");
        let second = queue.pop(QUEUE_BUILDS, 1).await.unwrap();
        assert_eq!(second.args["job_id"], "2");
        assert!(queue.pop(QUEUE_BUILDS, 0).await.is_none());
    }

    #[tokio::test]
    async fn queues_are_independent() {
        let queue = queue();
        queue
            .enqueue(QUEUE_CONTROLS, "stop_job", json!({"job_id": "x"}))
            .await
            .unwrap();
        assert!(queue.pop(QUEUE_BUILDS, 0).await.is_none());
        assert!(queue.pop(QUEUE_CONTROLS, 1).await.is_some());
    }

    #[tokio::test]
    async fn remove_cancels_a_waiting_item() {
        let queue = queue();
        let item = queue
            .enqueue(QUEUE_BUILDS, "build", json!({"job_id": "1"}))
            .await
            .unwrap();
        assert!(queue.remove(QUEUE_BUILDS, &item).await);
        assert!(!queue.remove(QUEUE_BUILDS, &item).await);
        assert!(queue.pop(QUEUE_BUILDS, 0).await.is_none());
    }
}
