//! Source switch engine
//!
//! Moving a show from one metadata source to another runs in four persisted
//! phases: verify the target identity, switch the stored identity, repopulate
//! episodes from the new source, refresh against disk. The phase reached is
//! written through to the switch op row before it runs, so an interrupted
//! switch resumes where it stopped instead of starting over.
//!
//! Verify settles on a status code instead of erroring when the switch must
//! not proceed; transport failures bubble as errors and leave the row
//! resumable in its current phase. Until verify passes, nothing about the
//! show is mutated.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{Database, ShowRecord, SwitchOpRecord, SwitchPhase, SwitchStatus};
use crate::providers::{ProviderError, ProviderRegistry, ProviderShow, SourceKey};
use crate::queue::task::QueuedTask;
use crate::registry::ShowRegistry;
use crate::services::{CatalogService, FileService, Notifier};

/// Jaro-Winkler floor for accepting that two names describe the same show.
const NAME_SIMILARITY_FLOOR: f64 = 0.85;

/// How verify concluded.
enum Verdict {
    /// Target id confirmed; proceed to the identity switch.
    Proceed(i64),
    /// The switch must not happen; settle the row with this code.
    Settle(SwitchStatus),
}

pub struct SwitchEngine {
    db: Database,
    registry: Arc<ShowRegistry>,
    providers: Arc<ProviderRegistry>,
    catalog: Arc<CatalogService>,
    files: Arc<FileService>,
    notifier: Arc<dyn Notifier>,
}

impl SwitchEngine {
    pub fn new(
        db: Database,
        registry: Arc<ShowRegistry>,
        providers: Arc<ProviderRegistry>,
        catalog: Arc<CatalogService>,
        files: Arc<FileService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            db,
            registry,
            providers,
            catalog,
            files,
            notifier,
        }
    }

    /// Drive the switch behind `task` from its persisted phase to the end.
    pub async fn run(&self, task: &QueuedTask, cancel: &CancellationToken) -> Result<()> {
        let old_key = task
            .key()
            .ok_or_else(|| anyhow!("switch task {} has no show key", task.uid))?;
        let Some(mut op) = self.db.switch_ops().get(old_key).await? else {
            return Err(anyhow!("no switch op row for {old_key}"));
        };
        let show = self.resolve_show(&op).await?;

        let mut phase = op.phase;
        loop {
            if cancel.is_cancelled() {
                info!(show = %show.name, phase = %phase, "switch interrupted; will resume");
                return Ok(());
            }
            match phase {
                SwitchPhase::Verify => {
                    match self.verify(&op, &show, task).await? {
                        Verdict::Settle(status) => {
                            return self.settle_failure(&op, &show.name, status).await;
                        }
                        Verdict::Proceed(new_id) => {
                            if op.new_source_id != Some(new_id) {
                                self.db
                                    .switch_ops()
                                    .set_new_source_id(op.old, new_id)
                                    .await?;
                                op.new_source_id = Some(new_id);
                            }
                            self.advance(&mut op, SwitchPhase::SwitchIdentity).await?;
                        }
                    }
                    phase = op.phase;
                }
                SwitchPhase::SwitchIdentity => {
                    let new_key = op
                        .target()
                        .ok_or_else(|| anyhow!("switch for {} has no resolved target", op.old))?;
                    // Resuming after a crash between the row update and the
                    // phase write: the identity may already be switched.
                    if let Some(current) = self.db.shows().get_by_key(op.old).await? {
                        self.db.shows().switch_source(current.id, new_key).await?;
                    }
                    self.registry.rekey(op.old, new_key);
                    info!(show = %show.name, from = %op.old, to = %new_key, "show identity switched");
                    self.advance(&mut op, SwitchPhase::Repopulate).await?;
                    phase = op.phase;
                }
                SwitchPhase::Repopulate => {
                    let stats = self.catalog.update_from_source(show.id, cancel).await?;
                    if !stats.completed {
                        // Cancelled mid-sync; stay in this phase.
                        return Ok(());
                    }
                    self.advance(&mut op, SwitchPhase::Refresh).await?;
                    phase = op.phase;
                }
                SwitchPhase::Refresh => {
                    self.files.refresh_show(show.id, cancel).await?;
                    self.db.switch_ops().delete(op.old).await?;
                    info!(show = %show.name, target = %op.target().map(|k| k.to_string()).unwrap_or_default(), "source switch completed");
                    return Ok(());
                }
            }
        }
    }

    /// Decide whether the switch may proceed, and to which id.
    async fn verify(
        &self,
        op: &SwitchOpRecord,
        show: &ShowRecord,
        task: &QueuedTask,
    ) -> Result<Verdict> {
        let Some(new_provider) = self.providers.get(op.new_source) else {
            return Ok(Verdict::Settle(SwitchStatus::SourceNotFound));
        };

        let candidate = match op.new_source_id {
            Some(id) => id,
            None => match self.resolve_candidate(op, new_provider.source()).await? {
                Some(id) => id,
                None => return Ok(Verdict::Settle(SwitchStatus::NoNewId)),
            },
        };

        if op.new_source == op.old.source && candidate == op.old.source_id {
            return Ok(Verdict::Settle(SwitchStatus::SameId));
        }

        let new_key = SourceKey::new(op.new_source, candidate);
        if self.registry.find_conflict(new_key, show.id).is_some() {
            return Ok(Verdict::Settle(SwitchStatus::IdConflict));
        }
        if self
            .db
            .switch_ops()
            .find_by_target(new_key, op.old)
            .await?
            .is_some()
        {
            return Ok(Verdict::Settle(SwitchStatus::Duplicate));
        }
        if task.spec.flags.automatic && !show.auto_switch {
            return Ok(Verdict::Settle(SwitchStatus::NoAutomaticChange));
        }

        if op.force {
            debug!(show = %show.name, target = %new_key, "forced switch; skipping verification fetch");
            return Ok(Verdict::Proceed(candidate));
        }

        let fetched = match new_provider.fetch_show(candidate).await {
            Ok(fetched) => fetched,
            Err(ProviderError::NotFound(_)) => {
                return Ok(Verdict::Settle(SwitchStatus::NotFound));
            }
            Err(ProviderError::Other(e)) => {
                return Err(e.context("verification fetch failed"));
            }
        };

        // The target's own cross-references must not point at a different
        // show on the current source.
        if let Some(back_id) = fetched.externals.for_source(op.old.source) {
            if back_id != op.old.source_id {
                warn!(
                    show = %show.name,
                    target = %new_key,
                    maps_back_to = back_id,
                    "target maps back to a different id"
                );
                return Ok(Verdict::Settle(SwitchStatus::Mismatch));
            }
        }

        if !plausible_match(show, &fetched) {
            warn!(
                show = %show.name,
                target_name = %fetched.name,
                "target failed the name and year check"
            );
            return Ok(Verdict::Settle(SwitchStatus::VerifyError));
        }

        Ok(Verdict::Proceed(candidate))
    }

    /// Find the show's id on the new source through cross-source ids.
    async fn resolve_candidate(
        &self,
        op: &SwitchOpRecord,
        new_source: crate::providers::Source,
    ) -> Result<Option<i64>> {
        let Some(old_provider) = self.providers.get(op.old.source) else {
            debug!(key = %op.old, "current source unconfigured; cannot resolve a target id");
            return Ok(None);
        };
        let ids = match old_provider.external_ids(op.old.source_id).await {
            Ok(ids) => ids,
            Err(ProviderError::NotFound(_)) => return Ok(None),
            Err(ProviderError::Other(e)) => {
                return Err(e.context("failed to fetch external ids"));
            }
        };
        if let Some(direct) = ids.for_source(new_source) {
            return Ok(Some(direct));
        }
        if ids.is_empty() {
            return Ok(None);
        }
        let Some(new_provider) = self.providers.get(new_source) else {
            return Ok(None);
        };
        match new_provider.lookup_external(&ids).await {
            Ok(found) => Ok(found),
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(ProviderError::Other(e)) => Err(e.context("external id lookup failed")),
        }
    }

    async fn advance(&self, op: &mut SwitchOpRecord, next: SwitchPhase) -> Result<()> {
        self.db.switch_ops().set_phase(op.old, next).await?;
        op.phase = next;
        debug!(key = %op.old, phase = %next, "switch phase advanced");
        Ok(())
    }

    async fn settle_failure(
        &self,
        op: &SwitchOpRecord,
        show_name: &str,
        status: SwitchStatus,
    ) -> Result<()> {
        self.db.switch_ops().set_status(op.old, status).await?;
        warn!(show = %show_name, key = %op.old, status = %status, "source switch did not proceed");
        let body = format!("{show_name}: {}", status.describe());
        if let Err(e) = self
            .notifier
            .notify("switch_failed", "Source switch failed", &body)
            .await
        {
            warn!("could not deliver switch notification: {e:#}");
        }
        Ok(())
    }

    /// The show row may carry the old key (before the identity phase) or the
    /// target key (after it).
    async fn resolve_show(&self, op: &SwitchOpRecord) -> Result<ShowRecord> {
        if let Some(show) = self.db.shows().get_by_key(op.old).await? {
            return Ok(show);
        }
        if let Some(target) = op.target() {
            if let Some(show) = self.db.shows().get_by_key(target).await? {
                return Ok(show);
            }
        }
        Err(anyhow!("no tracked show for switch op {}", op.old))
    }
}

/// Name similarity plus premiere year tolerance. Missing years pass; the
/// year check only rejects when both sides disagree by more than one.
fn plausible_match(show: &ShowRecord, fetched: &ProviderShow) -> bool {
    let similarity = strsim::jaro_winkler(
        &show.name.to_lowercase(),
        &fetched.name.to_lowercase(),
    );
    if similarity < NAME_SIMILARITY_FLOOR {
        return false;
    }
    match (show.year, fetched.year) {
        (Some(a), Some(b)) => (a - b).abs() <= 1,
        _ => true,
    }
}
