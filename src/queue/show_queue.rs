//! Show queue: per-show actions and their admission rules
//!
//! All add/update/refresh/rename/subtitle/switch work for tracked shows
//! funnels through here. The factories enforce the per-show exclusion rules
//! atomically with insertion:
//!
//! - one add per show at a time, and none for an already-tracked show;
//! - one pending update (of any flavor) per show;
//! - a refresh is skipped, not queued, while an update for the show is
//!   pending, because updates end with an implicit refresh;
//! - a source switch excludes every other action for that show, in both
//!   directions, until the switch settles.
//!
//! The rules are checked against this queue's own pending and current tasks
//! only; other queues are not consulted.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::{Database, new_switch_op};
use crate::providers::{Source, SourceKey};
use crate::queue::core::{HookId, TaskOutcome, TaskQueue, TaskRunner, UidAllocator};
use crate::queue::error::QueueError;
use crate::queue::people_queue::PeopleQueue;
use crate::queue::switch::SwitchEngine;
use crate::queue::task::{
    ActionKind, QueuedTask, TaskFlags, TaskPriority, TaskSnapshot, TaskSpec,
};
use crate::registry::{RegistryEntry, ShowRegistry};
use crate::services::{AddShowOptions, CatalogService, FileService, SubtitleService};

/// Parameters of a requested source switch.
#[derive(Debug, Clone)]
pub struct SwitchRequest {
    pub new_source: Source,
    /// Explicit target id; None asks the verify phase to resolve one
    /// through cross-source id mappings.
    pub new_source_id: Option<i64>,
    /// Skip the verification fetch and plausibility check.
    pub force: bool,
    /// Issued by a job rather than an operator; honors the per-show
    /// auto-switch setting.
    pub automatic: bool,
}

pub struct ShowQueue {
    queue: TaskQueue,
    db: Database,
    registry: Arc<ShowRegistry>,
}

impl ShowQueue {
    pub fn new(
        db: Database,
        registry: Arc<ShowRegistry>,
        catalog: Arc<CatalogService>,
        files: Arc<FileService>,
        subtitles: Arc<SubtitleService>,
        switcher: Arc<SwitchEngine>,
        people: Arc<PeopleQueue>,
        uids: Arc<UidAllocator>,
    ) -> Self {
        let runner = Arc::new(ShowTaskRunner {
            registry: Arc::clone(&registry),
            catalog,
            files,
            subtitles,
            switcher,
            people,
        });
        let queue = TaskQueue::new("show_queue", runner, uids, Some(db.queue("show_queue")));
        Self {
            queue,
            db,
            registry,
        }
    }

    // =========================================================================
    // Factories
    // =========================================================================

    /// Queue tracking a new show.
    pub async fn add_show(
        &self,
        key: SourceKey,
        name: &str,
        wanted_backfill: bool,
    ) -> Result<QueuedTask, QueueError> {
        if self.registry.contains(key) {
            return Err(QueueError::AlreadyTracked { key });
        }
        let mut spec = TaskSpec::new(ActionKind::Add, format!("Add Show: {name}"));
        spec.show = Some(key);
        spec.flags.wanted_backfill = wanted_backfill;
        self.queue
            .try_add(spec, move |view| {
                if view.any(|t| t.spec.kind == ActionKind::Add && t.key() == Some(key)) {
                    return Err(QueueError::AlreadyAdding { key });
                }
                Ok(())
            })
            .await
    }

    /// Queue a routine metadata update.
    pub async fn update_show(
        &self,
        key: SourceKey,
        automatic: bool,
    ) -> Result<QueuedTask, QueueError> {
        let flags = TaskFlags {
            automatic,
            ..Default::default()
        };
        self.queue_update(key, ActionKind::Update, TaskPriority::Normal, flags)
            .await
    }

    /// Queue an update that bypasses freshness checks.
    pub async fn force_update_show(&self, key: SourceKey) -> Result<QueuedTask, QueueError> {
        let flags = TaskFlags {
            force: true,
            ..Default::default()
        };
        self.queue_update(key, ActionKind::ForceUpdate, TaskPriority::High, flags)
            .await
    }

    /// Forced update requested from an interactive surface.
    pub async fn web_force_update_show(&self, key: SourceKey) -> Result<QueuedTask, QueueError> {
        let flags = TaskFlags {
            force: true,
            web: true,
            ..Default::default()
        };
        self.queue_update(key, ActionKind::WebForceUpdate, TaskPriority::High, flags)
            .await
    }

    async fn queue_update(
        &self,
        key: SourceKey,
        kind: ActionKind,
        priority: TaskPriority,
        flags: TaskFlags,
    ) -> Result<QueuedTask, QueueError> {
        let entry = self.resolve(key)?;
        let key = entry.key;

        let mut spec = TaskSpec::new(kind, format!("{}: {}", kind.label(), entry.name));
        spec.show = Some(key);
        spec.priority = priority;
        spec.flags = flags;

        self.queue
            .try_add(spec, move |view| {
                if view.any(|t| t.spec.kind == ActionKind::SwitchSource && t.key() == Some(key)) {
                    return Err(QueueError::SwitchPending { kind, key });
                }
                if view.any(|t| t.spec.kind.is_update() && t.key() == Some(key)) {
                    return Err(QueueError::AlreadyQueued { kind, key });
                }
                Ok(())
            })
            .await
    }

    /// Queue a disk reconcile. Returns None without queuing when an update
    /// for the show is already pending (updates end with a refresh) or a
    /// refresh is already queued.
    pub async fn refresh_show(&self, key: SourceKey) -> Result<Option<QueuedTask>, QueueError> {
        let entry = self.resolve(key)?;
        let key = entry.key;

        let mut spec = TaskSpec::new(
            ActionKind::Refresh,
            format!("Refresh: {}", entry.name),
        );
        spec.show = Some(key);
        spec.priority = TaskPriority::High;

        match self
            .queue
            .try_add(spec, move |view| {
                if view.any(|t| t.spec.kind == ActionKind::SwitchSource && t.key() == Some(key)) {
                    return Err(QueueError::SwitchPending {
                        kind: ActionKind::Refresh,
                        key,
                    });
                }
                let covered = view.any(|t| {
                    t.key() == Some(key)
                        && (t.spec.kind.is_update() || t.spec.kind == ActionKind::Refresh)
                });
                if covered {
                    return Err(QueueError::AlreadyQueued {
                        kind: ActionKind::Refresh,
                        key,
                    });
                }
                Ok(())
            })
            .await
        {
            Ok(task) => Ok(Some(task)),
            Err(QueueError::AlreadyQueued { .. }) => {
                debug!(key = %key, "refresh covered by pending work; skipping");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Queue renaming the show's files to the canonical pattern.
    pub async fn rename_show(&self, key: SourceKey) -> Result<QueuedTask, QueueError> {
        self.queue_simple(key, ActionKind::Rename, TaskPriority::Normal)
            .await
    }

    /// Queue fetching missing subtitles for downloaded episodes.
    pub async fn download_subtitles(&self, key: SourceKey) -> Result<QueuedTask, QueueError> {
        self.queue_simple(key, ActionKind::Subtitle, TaskPriority::Normal)
            .await
    }

    async fn queue_simple(
        &self,
        key: SourceKey,
        kind: ActionKind,
        priority: TaskPriority,
    ) -> Result<QueuedTask, QueueError> {
        let entry = self.resolve(key)?;
        let key = entry.key;

        let mut spec = TaskSpec::new(kind, format!("{}: {}", kind.label(), entry.name));
        spec.show = Some(key);
        spec.priority = priority;

        self.queue
            .try_add(spec, move |view| {
                if view.any(|t| t.spec.kind == ActionKind::SwitchSource && t.key() == Some(key)) {
                    return Err(QueueError::SwitchPending { kind, key });
                }
                if view.any(|t| t.spec.kind == kind && t.key() == Some(key)) {
                    return Err(QueueError::AlreadyQueued { kind, key });
                }
                Ok(())
            })
            .await
    }

    /// Queue a source switch. The switch row is written with the task's uid
    /// so the operation survives a restart.
    pub async fn switch_source(
        &self,
        key: SourceKey,
        request: SwitchRequest,
    ) -> Result<QueuedTask, QueueError> {
        let entry = self.resolve(key)?;
        let key = entry.key;

        // Another pending switch aiming at the same target is rejected up
        // front when the target is explicit; verify re-checks either way.
        if let Some(id) = request.new_source_id {
            let target = SourceKey::new(request.new_source, id);
            let duplicate = self
                .db
                .switch_ops()
                .find_by_target(target, key)
                .await
                .map_err(QueueError::Persist)?;
            if duplicate.is_some() {
                return Err(QueueError::DuplicateSwitch { target });
            }
        }

        let mut spec = TaskSpec::new(
            ActionKind::SwitchSource,
            format!("Switch Source: {}", entry.name),
        );
        spec.show = Some(key);
        spec.priority = TaskPriority::High;
        spec.flags.force = request.force;
        spec.flags.automatic = request.automatic;

        let task = self
            .queue
            .try_add(spec, move |view| {
                if let Some(existing) = view.iter().find(|t| t.key() == Some(key)) {
                    return Err(QueueError::ActionInProgress {
                        kind: existing.spec.kind,
                        key,
                    });
                }
                Ok(())
            })
            .await?;

        let op = new_switch_op(
            key,
            request.new_source,
            request.new_source_id,
            task.uid,
            request.force,
        );
        if let Err(e) = self.db.switch_ops().upsert(&op).await {
            // Without its row the task would fail anyway; take it back out.
            let _ = self.queue.remove(&[task.uid], false).await;
            return Err(QueueError::Persist(e));
        }
        Ok(task)
    }

    /// Re-queue an interrupted or failed switch from its persisted phase.
    pub async fn resume_switch(&self, key: SourceKey) -> Result<QueuedTask, QueueError> {
        let op = self
            .db
            .switch_ops()
            .get(key)
            .await
            .map_err(QueueError::Persist)?
            .ok_or(QueueError::UnknownSwitch { key })?;

        let name = self
            .registry
            .resolve(key)
            .map(|entry| entry.name)
            .unwrap_or_else(|| key.to_string());
        let mut spec = TaskSpec::new(
            ActionKind::SwitchSource,
            format!("Resume Switch: {name}"),
        );
        spec.show = Some(key);
        spec.priority = TaskPriority::High;
        spec.flags.resume = true;
        spec.flags.force = op.force;

        let task = self
            .queue
            .try_add(spec, move |view| {
                if let Some(existing) = view.iter().find(|t| t.key() == Some(key)) {
                    return Err(QueueError::ActionInProgress {
                        kind: existing.spec.kind,
                        key,
                    });
                }
                Ok(())
            })
            .await?;

        let ops = self.db.switch_ops();
        let rewire = async {
            ops.set_uid(key, task.uid).await?;
            ops.set_status(key, crate::db::SwitchStatus::Normal).await
        };
        if let Err(e) = rewire.await {
            let _ = self.queue.remove(&[task.uid], false).await;
            return Err(QueueError::Persist(e));
        }
        Ok(task)
    }

    fn resolve(&self, key: SourceKey) -> Result<RegistryEntry, QueueError> {
        self.registry
            .resolve(key)
            .ok_or(QueueError::UnknownShow { key })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn is_being_added(&self, key: SourceKey) -> bool {
        self.any_task(|t| t.kind == ActionKind::Add && t.show == Some(key))
            .await
    }

    pub async fn is_being_updated(&self, key: SourceKey) -> bool {
        self.any_task(|t| t.kind.is_update() && t.show == Some(key))
            .await
    }

    pub async fn is_being_refreshed(&self, key: SourceKey) -> bool {
        self.any_task(|t| t.kind == ActionKind::Refresh && t.show == Some(key))
            .await
    }

    pub async fn has_pending_switch(&self, key: SourceKey) -> bool {
        self.any_task(|t| t.kind == ActionKind::SwitchSource && t.show == Some(key))
            .await
    }

    async fn any_task<F>(&self, predicate: F) -> bool
    where
        F: Fn(&TaskSnapshot) -> bool,
    {
        self.queue
            .queue_data()
            .await
            .values()
            .flatten()
            .any(predicate)
    }

    // =========================================================================
    // Lifecycle and delegation
    // =========================================================================

    pub async fn tick(&self) {
        self.queue.tick().await;
    }

    pub async fn pause(&self) {
        self.queue.pause().await;
    }

    pub async fn unpause(&self) {
        self.queue.unpause().await;
    }

    pub async fn remove(&self, uids: &[i64], force: bool) -> Result<usize> {
        self.queue.remove(uids, force).await
    }

    pub async fn clear(&self, kinds: Option<&[ActionKind]>) -> Result<usize> {
        self.queue.clear(kinds).await
    }

    pub fn on<F>(&self, filter: Option<ActionKind>, callback: F) -> HookId
    where
        F: Fn(&QueuedTask, TaskOutcome) + Send + Sync + 'static,
    {
        self.queue.on(filter, callback)
    }

    pub fn off(&self, id: HookId) {
        self.queue.off(id);
    }

    pub async fn queue_data(
        &self,
    ) -> std::collections::HashMap<ActionKind, Vec<TaskSnapshot>> {
        self.queue.queue_data().await
    }

    pub async fn queue_length(&self) -> usize {
        self.queue.queue_length().await
    }

    pub async fn is_busy(&self) -> bool {
        self.queue.is_busy().await
    }

    pub async fn save(&self) -> Result<()> {
        self.queue.save().await
    }

    /// Restore persisted tasks. Restored switch tasks get their switch row
    /// pointed at the new uid; a switch task whose row is gone is dropped.
    pub async fn load(&self) -> Result<Vec<QueuedTask>> {
        let restored = self.queue.load().await?;
        let mut kept = Vec::with_capacity(restored.len());
        for task in restored {
            if task.spec.kind == ActionKind::SwitchSource {
                let Some(key) = task.key() else {
                    continue;
                };
                match self.db.switch_ops().get(key).await? {
                    Some(_) => self.db.switch_ops().set_uid(key, task.uid).await?,
                    None => {
                        warn!(key = %key, "restored switch task has no switch row; dropping");
                        self.queue.remove(&[task.uid], false).await?;
                        continue;
                    }
                }
            }
            kept.push(task);
        }
        Ok(kept)
    }
}

struct ShowTaskRunner {
    registry: Arc<ShowRegistry>,
    catalog: Arc<CatalogService>,
    files: Arc<FileService>,
    subtitles: Arc<SubtitleService>,
    switcher: Arc<SwitchEngine>,
    people: Arc<PeopleQueue>,
}

#[async_trait]
impl TaskRunner for ShowTaskRunner {
    async fn run(&self, task: QueuedTask, cancel: CancellationToken) -> Result<()> {
        match task.spec.kind {
            ActionKind::Add => self.run_add(&task, &cancel).await,
            kind if kind.is_update() => self.run_update(&task, &cancel).await,
            ActionKind::Refresh => {
                let entry = self.entry(&task)?;
                self.files.refresh_show(entry.show_id, &cancel).await?;
                Ok(())
            }
            ActionKind::Rename => {
                let entry = self.entry(&task)?;
                self.files.rename_show(entry.show_id, &cancel).await?;
                Ok(())
            }
            ActionKind::Subtitle => {
                let entry = self.entry(&task)?;
                self.subtitles.fetch_for_show(entry.show_id, &cancel).await?;
                Ok(())
            }
            ActionKind::SwitchSource => self.switcher.run(&task, &cancel).await,
            other => bail!("the show queue cannot run {other} tasks"),
        }
    }
}

impl ShowTaskRunner {
    fn entry(&self, task: &QueuedTask) -> Result<RegistryEntry> {
        let key = task
            .key()
            .ok_or_else(|| anyhow!("task {} has no show key", task.uid))?;
        self.registry
            .resolve(key)
            .ok_or_else(|| anyhow!("show {key} is not tracked"))
    }

    async fn run_add(&self, task: &QueuedTask, cancel: &CancellationToken) -> Result<()> {
        let key = task
            .key()
            .ok_or_else(|| anyhow!("task {} has no show key", task.uid))?;
        let record = self
            .catalog
            .add_show(
                key,
                AddShowOptions {
                    location: None,
                    wanted_backfill: task.spec.flags.wanted_backfill,
                },
                cancel,
            )
            .await?;
        self.chain_cast_update(record.key(), &record.name).await;
        Ok(())
    }

    async fn run_update(&self, task: &QueuedTask, cancel: &CancellationToken) -> Result<()> {
        let entry = self.entry(task)?;
        self.catalog.update_from_source(entry.show_id, cancel).await?;
        if cancel.is_cancelled() {
            return Ok(());
        }
        // Updates end with a reconcile against disk unless suppressed.
        if !task.spec.flags.skip_refresh {
            self.files.refresh_show(entry.show_id, cancel).await?;
        }
        self.chain_cast_update(entry.key, &entry.name).await;
        Ok(())
    }

    /// Billing refreshes ride the people queue; a refusal there never fails
    /// the show task.
    async fn chain_cast_update(&self, key: SourceKey, name: &str) {
        if let Err(e) = self.people.queue_cast_update(key, name).await {
            warn!(key = %key, "could not queue cast update: {e}");
        }
    }
}
