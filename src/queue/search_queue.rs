//! Episode search queue
//!
//! Nothing here is persisted: search tasks are rebuilt from catalog state,
//! so a restart simply waits for the next backlog cycle. One task covers
//! one show; which episodes it covers is
//! carried as a segment and resolved against the database when the task
//! runs, so state changes between enqueue and run are respected.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::db::{Database, EpisodeRecord, EpisodeStatus};
use crate::providers::SourceKey;
use crate::queue::core::{TaskQueue, TaskRunner, UidAllocator};
use crate::queue::error::QueueError;
use crate::queue::task::{ActionKind, QueuedTask, SearchSegment, TaskPriority, TaskSpec};
use crate::registry::ShowRegistry;
use crate::services::EpisodeSearcher;

pub struct SearchQueue {
    queue: TaskQueue,
    registry: Arc<ShowRegistry>,
}

impl SearchQueue {
    pub fn new(
        db: Database,
        registry: Arc<ShowRegistry>,
        searcher: Arc<dyn EpisodeSearcher>,
        uids: Arc<UidAllocator>,
    ) -> Self {
        let runner = Arc::new(SearchTaskRunner {
            db,
            registry: Arc::clone(&registry),
            searcher,
        });
        Self {
            // No store: search tasks do not survive a restart.
            queue: TaskQueue::new("search_queue", runner, uids, None),
            registry,
        }
    }

    /// Backlog pass over one show: the listed wanted episodes.
    pub async fn queue_backlog(
        &self,
        key: SourceKey,
        episode_ids: Vec<i64>,
    ) -> Result<QueuedTask, QueueError> {
        self.queue_search(
            key,
            ActionKind::BacklogSearch,
            TaskPriority::Low,
            SearchSegment::Episodes(episode_ids),
        )
        .await
    }

    /// Recent pass over one show: wanted episodes aired in the last `days`.
    pub async fn queue_recent(&self, key: SourceKey, days: i64) -> Result<QueuedTask, QueueError> {
        self.queue_search(
            key,
            ActionKind::RecentSearch,
            TaskPriority::Normal,
            SearchSegment::RecentDays(days),
        )
        .await
    }

    /// Operator-requested search for specific episodes. Jumps the line.
    pub async fn queue_manual(
        &self,
        key: SourceKey,
        episode_ids: Vec<i64>,
    ) -> Result<QueuedTask, QueueError> {
        self.queue_search(
            key,
            ActionKind::ManualSearch,
            TaskPriority::VeryHigh,
            SearchSegment::Episodes(episode_ids),
        )
        .await
    }

    async fn queue_search(
        &self,
        key: SourceKey,
        kind: ActionKind,
        priority: TaskPriority,
        segment: SearchSegment,
    ) -> Result<QueuedTask, QueueError> {
        let entry = self
            .registry
            .resolve(key)
            .ok_or(QueueError::UnknownShow { key })?;
        let key = entry.key;

        let mut spec = TaskSpec::new(kind, format!("{}: {}", kind.label(), entry.name));
        spec.show = Some(key);
        spec.priority = priority;
        spec.segment = Some(segment);

        self.queue
            .try_add(spec, move |view| {
                if view.any(|t| t.spec.kind == kind && t.key() == Some(key)) {
                    return Err(QueueError::AlreadyQueued { kind, key });
                }
                Ok(())
            })
            .await
    }

    pub async fn tick(&self) {
        self.queue.tick().await;
    }

    pub async fn pause(&self) {
        self.queue.pause().await;
    }

    pub async fn unpause(&self) {
        self.queue.unpause().await;
    }

    pub async fn queue_length(&self) -> usize {
        self.queue.queue_length().await
    }

    pub async fn is_busy(&self) -> bool {
        self.queue.is_busy().await
    }

    pub async fn clear(&self) -> Result<usize> {
        self.queue.clear(None).await
    }
}

struct SearchTaskRunner {
    db: Database,
    registry: Arc<ShowRegistry>,
    searcher: Arc<dyn EpisodeSearcher>,
}

#[async_trait]
impl TaskRunner for SearchTaskRunner {
    async fn run(&self, task: QueuedTask, cancel: CancellationToken) -> Result<()> {
        let key = task
            .key()
            .ok_or_else(|| anyhow!("search task {} has no show key", task.uid))?;
        let Some(entry) = self.registry.resolve(key) else {
            debug!(key = %key, "search for an untracked show; skipping");
            return Ok(());
        };
        let show = self
            .db
            .shows()
            .get(entry.show_id)
            .await?
            .ok_or_else(|| anyhow!("show {} vanished from the catalog", entry.show_id))?;

        let episodes = match &task.spec.segment {
            Some(SearchSegment::Episodes(ids)) => {
                let all = self.db.episodes().for_show(show.id).await?;
                let manual = task.spec.kind == ActionKind::ManualSearch;
                all.into_iter()
                    .filter(|e| ids.contains(&e.id))
                    // Backlog segments were resolved at enqueue time; drop
                    // episodes that stopped being wanted since.
                    .filter(|e| manual || e.status == EpisodeStatus::Wanted)
                    .collect::<Vec<EpisodeRecord>>()
            }
            Some(SearchSegment::RecentDays(days)) => {
                let since = Utc::now().date_naive() - Duration::days(*days);
                self.db.episodes().wanted_recent(show.id, since).await?
            }
            None => bail!("search task {} has no segment", task.uid),
        };
        if episodes.is_empty() {
            debug!(show = %show.name, "nothing left to search for");
            return Ok(());
        }

        let outcome = self.searcher.search(&show, &episodes, &cancel).await?;
        for id in &outcome.snatched {
            self.db
                .episodes()
                .set_status(*id, EpisodeStatus::Snatched)
                .await?;
        }
        if !outcome.snatched.is_empty() {
            info!(
                show = %show.name,
                snatched = outcome.snatched.len(),
                "search grabbed releases"
            );
        }
        Ok(())
    }
}
