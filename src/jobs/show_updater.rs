//! Daily metadata update sweep
//!
//! Runs on a one-hour cycle gated to a configured start hour, so the sweep
//! fires once per day. Shows whose last update is older than the staleness
//! cutoff are queued for a routine update; per-show refusals from the queue
//! (already queued, switch pending) are expected and skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::queue::{QueueError, ShowQueue};
use crate::scheduler::CycleAction;

/// A show updated within this many hours is left alone. Slightly under a
/// day, so yesterday's sweep never masks today's.
const STALENESS_HOURS: i64 = 20;

pub struct ShowUpdater {
    db: Database,
    shows: Arc<ShowQueue>,
    active: AtomicBool,
}

impl ShowUpdater {
    pub fn new(db: Database, shows: Arc<ShowQueue>) -> Self {
        Self {
            db,
            shows,
            active: AtomicBool::new(false),
        }
    }

    async fn cycle(&self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::hours(STALENESS_HOURS);
        let stale = self.db.shows().stale(cutoff).await?;
        if stale.is_empty() {
            debug!("no stale shows to update");
            return Ok(());
        }

        info!(count = stale.len(), "queuing updates for stale shows");
        for show in stale {
            match self.shows.update_show(show.key(), true).await {
                Ok(task) => debug!(uid = task.uid, key = %show.key(), "queued update"),
                Err(QueueError::AlreadyQueued { .. }) => {
                    debug!(key = %show.key(), "update already queued; skipping");
                }
                Err(QueueError::SwitchPending { .. }) => {
                    debug!(key = %show.key(), "switch pending; skipping update");
                }
                Err(e) => warn!(key = %show.key(), "could not queue update: {e}"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CycleAction for ShowUpdater {
    fn name(&self) -> &str {
        "show_updater"
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
