//! Backlog search rotation
//!
//! Searching every wanted episode of every show in one pass would hammer the
//! indexers, so the catalog is split into numbered parts sized by wanted
//! count and one part is drained per cycle. The split is persisted; restarts
//! resume the rotation instead of rebuilding it. Shows waiting for their
//! turn still get a narrow recent-window search each cycle so a freshly
//! aired episode is never stuck behind the rotation.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::db::{BacklogPartRecord, Database, SettingsRepository, WantedByShow};
use crate::providers::SourceKey;
use crate::queue::{QueueError, SearchQueue};
use crate::registry::ShowRegistry;
use crate::scheduler::CycleAction;

/// Cycle length the current rotation was built for.
const FREQUENCY_KEY: &str = "backlog.frequency_secs";
/// Part count of the current rotation.
const PARTS_KEY: &str = "backlog.parts";

pub struct BacklogSearcher {
    db: Database,
    registry: Arc<ShowRegistry>,
    search: Arc<SearchQueue>,
    cycle_secs: i64,
    target_per_cycle: i64,
    recent_days: i64,
    active: AtomicBool,
}

impl BacklogSearcher {
    pub fn new(
        db: Database,
        registry: Arc<ShowRegistry>,
        search: Arc<SearchQueue>,
        cycle_time: Duration,
        target_per_cycle: i64,
        recent_days: i64,
    ) -> Self {
        Self {
            db,
            registry,
            search,
            cycle_secs: cycle_time.as_secs() as i64,
            target_per_cycle: target_per_cycle.max(1),
            recent_days,
            active: AtomicBool::new(false),
        }
    }

    async fn cycle(&self) -> Result<()> {
        let settings = self.db.settings();
        self.remap_on_cadence_change(&settings).await?;

        let counts = self.db.episodes().wanted_counts_by_show().await?;
        if self.db.backlog().count().await? == 0 {
            self.build_split(&settings, &counts).await?;
        }

        let drained = self.drain_next_part().await?;
        self.queue_recent_searches(&counts, &drained).await
    }

    /// Split the wanted catalog into parts of roughly `target_per_cycle`
    /// episodes, walking shows in name order so the split is stable.
    async fn build_split(
        &self,
        settings: &SettingsRepository,
        counts: &[WantedByShow],
    ) -> Result<()> {
        let total: i64 = counts.iter().map(|c| c.wanted).sum();
        if total == 0 {
            return Ok(());
        }
        let parts = ((total + self.target_per_cycle - 1) / self.target_per_cycle).max(1);
        let threshold = (total / parts).max(1);

        let mut assignments = Vec::with_capacity(counts.len());
        let mut part = 1;
        let mut acc = 0;
        for c in counts {
            assignments.push(BacklogPartRecord {
                part,
                key: SourceKey::new(c.source, c.source_id),
                wanted: c.wanted,
            });
            acc += c.wanted;
            if acc > threshold && part < parts {
                part += 1;
                acc = 0;
            }
        }

        self.db.backlog().replace_all(&assignments).await?;
        settings.set_i64(PARTS_KEY, parts).await?;
        settings.set_i64(FREQUENCY_KEY, self.cycle_secs).await?;
        info!(
            shows = assignments.len(),
            parts,
            total_wanted = total,
            "built backlog rotation"
        );
        Ok(())
    }

    /// When the configured cycle length changed mid-rotation, renumber the
    /// remaining parts so the rotation still spans roughly the same wall
    /// time: `new_parts = ceil(old_parts * old_secs / new_secs)`.
    async fn remap_on_cadence_change(&self, settings: &SettingsRepository) -> Result<()> {
        let Some(old_secs) = settings.get_i64(FREQUENCY_KEY).await? else {
            return Ok(());
        };
        if old_secs <= 0 || old_secs == self.cycle_secs {
            return Ok(());
        }

        let old_parts = settings.get_i64(PARTS_KEY).await?.unwrap_or(0);
        if old_parts > 0 && self.db.backlog().count().await? > 0 {
            let new_parts = ((old_parts * old_secs + self.cycle_secs - 1) / self.cycle_secs).max(1);
            self.db.backlog().remap_parts(old_parts, new_parts).await?;
            settings.set_i64(PARTS_KEY, new_parts).await?;
            info!(old_parts, new_parts, "remapped backlog rotation for new cadence");
        }
        settings.set_i64(FREQUENCY_KEY, self.cycle_secs).await?;
        Ok(())
    }

    /// Queue a full wanted-episode search for every show in the lowest
    /// remaining part, then delete the part. Returns the keys it covered.
    async fn drain_next_part(&self) -> Result<HashSet<SourceKey>> {
        let mut drained = HashSet::new();
        let parts = self.db.backlog().current_parts().await?;
        let Some(&lowest) = parts.first() else {
            return Ok(drained);
        };

        let rows = self.db.backlog().shows_in_part(lowest).await?;
        debug!(part = lowest, shows = rows.len(), "draining backlog part");
        for row in rows {
            drained.insert(row.key);
            let Some(entry) = self.registry.resolve(row.key) else {
                debug!(key = %row.key, "backlog entry no longer tracked; skipping");
                continue;
            };
            drained.insert(entry.key);

            let wanted = self.db.episodes().wanted_for_show(entry.show_id).await?;
            if wanted.is_empty() {
                continue;
            }
            let ids: Vec<i64> = wanted.iter().map(|e| e.id).collect();
            match self.search.queue_backlog(entry.key, ids).await {
                Ok(task) => debug!(uid = task.uid, key = %entry.key, "queued backlog search"),
                Err(QueueError::AlreadyQueued { .. }) => {
                    debug!(key = %entry.key, "backlog search already queued; skipping");
                }
                Err(e) => warn!(key = %entry.key, "could not queue backlog search: {e}"),
            }
        }
        self.db.backlog().delete_part(lowest).await?;
        Ok(drained)
    }

    /// Narrow search over recently aired wanted episodes for every show not
    /// covered by this cycle's part.
    async fn queue_recent_searches(
        &self,
        counts: &[WantedByShow],
        drained: &HashSet<SourceKey>,
    ) -> Result<()> {
        for c in counts {
            let key = SourceKey::new(c.source, c.source_id);
            if drained.contains(&key) {
                continue;
            }
            match self.search.queue_recent(key, self.recent_days).await {
                Ok(task) => debug!(uid = task.uid, key = %key, "queued recent search"),
                Err(QueueError::AlreadyQueued { .. }) => {
                    debug!(key = %key, "recent search already queued; skipping");
                }
                Err(QueueError::UnknownShow { .. }) => {
                    debug!(key = %key, "show vanished before recent search");
                }
                Err(e) => warn!(key = %key, "could not queue recent search: {e}"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CycleAction for BacklogSearcher {
    fn name(&self) -> &str {
        "backlog_search"
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn run(&self) -> Result<()> {
        self.active.store(true, Ordering::SeqCst);
        let result = self.cycle().await;
        self.active.store(false, Ordering::SeqCst);
        result
    }
}
