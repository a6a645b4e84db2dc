//! Watched-state sync queue
//!
//! Pulls watched events from the configured tracker on request. The sync is
//! single-flight: while one runs or waits, further requests collapse.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::db::Database;
use crate::queue::core::{TaskQueue, TaskRunner, UidAllocator};
use crate::queue::error::QueueError;
use crate::queue::task::{ActionKind, QueuedTask, TaskSpec};
use crate::services::WatchedService;

pub struct WatchedQueue {
    queue: TaskQueue,
}

impl WatchedQueue {
    pub fn new(db: &Database, service: Arc<WatchedService>, uids: Arc<UidAllocator>) -> Self {
        let runner = Arc::new(WatchedTaskRunner { service });
        Self {
            queue: TaskQueue::new(
                "watched_queue",
                runner,
                uids,
                Some(db.queue("watched_queue")),
            ),
        }
    }

    /// Queue a sync pass. Returns None when one is already pending or
    /// running.
    pub async fn queue_sync(&self) -> Result<Option<QueuedTask>, QueueError> {
        let spec = TaskSpec::new(ActionKind::WatchedSync, "Watched State Sync");
        match self
            .queue
            .try_add(spec, |view| {
                if view.any(|t| t.spec.kind == ActionKind::WatchedSync) {
                    return Err(QueueError::SyncInFlight);
                }
                Ok(())
            })
            .await
        {
            Ok(task) => Ok(Some(task)),
            Err(QueueError::SyncInFlight) => {
                debug!("watched sync already in flight");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn tick(&self) {
        self.queue.tick().await;
    }

    pub async fn load(&self) -> Result<Vec<QueuedTask>> {
        self.queue.load().await
    }

    pub async fn save(&self) -> Result<()> {
        self.queue.save().await
    }

    pub async fn queue_length(&self) -> usize {
        self.queue.queue_length().await
    }

    pub async fn is_busy(&self) -> bool {
        self.queue.is_busy().await
    }
}

struct WatchedTaskRunner {
    service: Arc<WatchedService>,
}

#[async_trait]
impl TaskRunner for WatchedTaskRunner {
    async fn run(&self, _task: QueuedTask, cancel: CancellationToken) -> Result<()> {
        let stats = self.service.sync(&cancel).await?;
        info!(
            applied = stats.applied,
            unknown_show = stats.unknown_show,
            unknown_episode = stats.unknown_episode,
            "watched state synced"
        );
        Ok(())
    }
}
