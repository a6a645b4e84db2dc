//! Persisted state for source switch operations
//!
//! One row per show with a switch in flight, keyed by the show's current
//! (old) source identity. The row carries the phase reached and the last
//! status code, so an interrupted switch can resume and a failed one can be
//! reported. Rows are deleted when the switch completes cleanly.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::db::sqlite_helpers::{bool_to_int, datetime_to_str, int_to_bool, str_to_datetime};
use crate::db::with_lock_retry;
use crate::providers::{Source, SourceKey};

/// Phases of a switch, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchPhase {
    Verify,
    SwitchIdentity,
    Repopulate,
    Refresh,
}

impl SwitchPhase {
    pub const ALL: &[SwitchPhase] = &[
        SwitchPhase::Verify,
        SwitchPhase::SwitchIdentity,
        SwitchPhase::Repopulate,
        SwitchPhase::Refresh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchPhase::Verify => "verify",
            SwitchPhase::SwitchIdentity => "switch_identity",
            SwitchPhase::Repopulate => "repopulate",
            SwitchPhase::Refresh => "refresh",
        }
    }

    pub fn parse(s: &str) -> Option<SwitchPhase> {
        SwitchPhase::ALL.iter().copied().find(|p| p.as_str() == s)
    }
}

impl std::fmt::Display for SwitchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome codes a switch can settle on. `Normal` while in flight and on
/// success; anything else marks why the switch stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchStatus {
    Normal,
    NotFound,
    Mismatch,
    NoAutomaticChange,
    SameId,
    NoNewId,
    IdConflict,
    VerifyError,
    Duplicate,
    SourceNotFound,
}

impl SwitchStatus {
    pub const ALL: &[SwitchStatus] = &[
        SwitchStatus::Normal,
        SwitchStatus::NotFound,
        SwitchStatus::Mismatch,
        SwitchStatus::NoAutomaticChange,
        SwitchStatus::SameId,
        SwitchStatus::NoNewId,
        SwitchStatus::IdConflict,
        SwitchStatus::VerifyError,
        SwitchStatus::Duplicate,
        SwitchStatus::SourceNotFound,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchStatus::Normal => "normal",
            SwitchStatus::NotFound => "not_found",
            SwitchStatus::Mismatch => "mismatch",
            SwitchStatus::NoAutomaticChange => "no_automatic_change",
            SwitchStatus::SameId => "same_id",
            SwitchStatus::NoNewId => "no_new_id",
            SwitchStatus::IdConflict => "id_conflict",
            SwitchStatus::VerifyError => "verify_error",
            SwitchStatus::Duplicate => "duplicate",
            SwitchStatus::SourceNotFound => "source_not_found",
        }
    }

    pub fn parse(s: &str) -> Option<SwitchStatus> {
        SwitchStatus::ALL.iter().copied().find(|v| v.as_str() == s)
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, SwitchStatus::Normal)
    }

    /// Message fragment for operator-facing notifications.
    pub fn describe(&self) -> &'static str {
        match self {
            SwitchStatus::Normal => "completed",
            SwitchStatus::NotFound => "the show was not found at the new source",
            SwitchStatus::Mismatch => "the new source maps back to a different show",
            SwitchStatus::NoAutomaticChange => "automatic switching is disabled for this show",
            SwitchStatus::SameId => "the new identity is the same as the current one",
            SwitchStatus::NoNewId => "no identity at the new source could be determined",
            SwitchStatus::IdConflict => "another tracked show already has the new identity",
            SwitchStatus::VerifyError => "the new source's data does not match this show",
            SwitchStatus::Duplicate => "another pending switch already targets the new identity",
            SwitchStatus::SourceNotFound => "the new source is not configured",
        }
    }
}

impl std::fmt::Display for SwitchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SwitchOpRecord {
    /// The show's identity before the switch. Primary key.
    pub old: SourceKey,
    pub new_source: Source,
    /// Explicit target id, or None when the id must be resolved in verify.
    pub new_source_id: Option<i64>,
    /// Uid of the queue task driving this switch.
    pub uid: i64,
    pub phase: SwitchPhase,
    pub status: SwitchStatus,
    pub force: bool,
    pub added_at: DateTime<Utc>,
}

impl SwitchOpRecord {
    /// The resolved target key, once `new_source_id` is known.
    pub fn target(&self) -> Option<SourceKey> {
        self.new_source_id
            .map(|id| SourceKey::new(self.new_source, id))
    }
}

fn decode_source(row: &SqliteRow, column: &str) -> std::result::Result<Source, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    Source::parse(&raw).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: column.into(),
        source: format!("unknown source '{raw}'").into(),
    })
}

impl sqlx::FromRow<'_, SqliteRow> for SwitchOpRecord {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let old_source = decode_source(row, "old_source")?;
        let new_source = decode_source(row, "new_source")?;

        let phase_raw: String = row.try_get("phase")?;
        let phase = SwitchPhase::parse(&phase_raw).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "phase".into(),
            source: format!("unknown switch phase '{phase_raw}'").into(),
        })?;

        let status_raw: String = row.try_get("status")?;
        let status = SwitchStatus::parse(&status_raw).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: format!("unknown switch status '{status_raw}'").into(),
        })?;

        let added_raw: String = row.try_get("added_at")?;
        let added_at = str_to_datetime(&added_raw).map_err(|e| sqlx::Error::ColumnDecode {
            index: "added_at".into(),
            source: e.into(),
        })?;

        Ok(Self {
            old: SourceKey::new(old_source, row.try_get("old_source_id")?),
            new_source,
            new_source_id: row.try_get("new_source_id")?,
            uid: row.try_get("uid")?,
            phase,
            status,
            force: int_to_bool(row.try_get("force")?),
            added_at,
        })
    }
}

#[derive(Clone)]
pub struct SwitchOpRepository {
    pool: SqlitePool,
}

impl SwitchOpRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite the row for `record.old`.
    pub async fn upsert(&self, record: &SwitchOpRecord) -> Result<()> {
        let record = record.clone();
        with_lock_retry("switch op upsert", || {
            let record = record.clone();
            let pool = self.pool.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO switch_ops
                        (old_source, old_source_id, new_source, new_source_id,
                         uid, phase, status, force, added_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(record.old.source.as_str())
                .bind(record.old.source_id)
                .bind(record.new_source.as_str())
                .bind(record.new_source_id)
                .bind(record.uid)
                .bind(record.phase.as_str())
                .bind(record.status.as_str())
                .bind(bool_to_int(record.force))
                .bind(datetime_to_str(record.added_at))
                .execute(&pool)
                .await
                .context("failed to upsert switch op")?;
                Ok(())
            }
        })
        .await
    }

    pub async fn get(&self, old: SourceKey) -> Result<Option<SwitchOpRecord>> {
        let record = sqlx::query_as::<_, SwitchOpRecord>(
            "SELECT * FROM switch_ops WHERE old_source = ? AND old_source_id = ?",
        )
        .bind(old.source.as_str())
        .bind(old.source_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch switch op")?;
        Ok(record)
    }

    pub async fn list(&self) -> Result<Vec<SwitchOpRecord>> {
        let records = sqlx::query_as::<_, SwitchOpRecord>(
            "SELECT * FROM switch_ops ORDER BY added_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list switch ops")?;
        Ok(records)
    }

    /// A pending switch whose resolved target matches `target`, other than
    /// the one owned by `excluding`. Used to reject duplicate switches.
    pub async fn find_by_target(
        &self,
        target: SourceKey,
        excluding: SourceKey,
    ) -> Result<Option<SwitchOpRecord>> {
        let record = sqlx::query_as::<_, SwitchOpRecord>(
            r#"
            SELECT * FROM switch_ops
            WHERE new_source = ? AND new_source_id = ?
              AND NOT (old_source = ? AND old_source_id = ?)
            "#,
        )
        .bind(target.source.as_str())
        .bind(target.source_id)
        .bind(excluding.source.as_str())
        .bind(excluding.source_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to search switch ops by target")?;
        Ok(record)
    }

    pub async fn set_phase(&self, old: SourceKey, phase: SwitchPhase) -> Result<()> {
        self.update_column("phase", old, phase.as_str()).await
    }

    pub async fn set_status(&self, old: SourceKey, status: SwitchStatus) -> Result<()> {
        self.update_column("status", old, status.as_str()).await
    }

    /// Record the resolved target id once verify has determined it.
    pub async fn set_new_source_id(&self, old: SourceKey, new_source_id: i64) -> Result<()> {
        with_lock_retry("switch op set target", || {
            let pool = self.pool.clone();
            async move {
                sqlx::query(
                    "UPDATE switch_ops SET new_source_id = ? WHERE old_source = ? AND old_source_id = ?",
                )
                .bind(new_source_id)
                .bind(old.source.as_str())
                .bind(old.source_id)
                .execute(&pool)
                .await
                .context("failed to set switch op target")?;
                Ok(())
            }
        })
        .await
    }

    /// Point the row at a new queue task, after a reload reassigned uids.
    pub async fn set_uid(&self, old: SourceKey, uid: i64) -> Result<()> {
        with_lock_retry("switch op set uid", || {
            let pool = self.pool.clone();
            async move {
                sqlx::query(
                    "UPDATE switch_ops SET uid = ? WHERE old_source = ? AND old_source_id = ?",
                )
                .bind(uid)
                .bind(old.source.as_str())
                .bind(old.source_id)
                .execute(&pool)
                .await
                .context("failed to set switch op uid")?;
                Ok(())
            }
        })
        .await
    }

    pub async fn delete(&self, old: SourceKey) -> Result<()> {
        with_lock_retry("switch op delete", || {
            let pool = self.pool.clone();
            async move {
                sqlx::query("DELETE FROM switch_ops WHERE old_source = ? AND old_source_id = ?")
                    .bind(old.source.as_str())
                    .bind(old.source_id)
                    .execute(&pool)
                    .await
                    .context("failed to delete switch op")?;
                Ok(())
            }
        })
        .await
    }

    async fn update_column(&self, column: &'static str, old: SourceKey, value: &str) -> Result<()> {
        let sql = format!(
            "UPDATE switch_ops SET {column} = ? WHERE old_source = ? AND old_source_id = ?"
        );
        let value = value.to_string();
        with_lock_retry("switch op update", || {
            let pool = self.pool.clone();
            let sql = sql.clone();
            let value = value.clone();
            async move {
                sqlx::query(&sql)
                    .bind(&value)
                    .bind(old.source.as_str())
                    .bind(old.source_id)
                    .execute(&pool)
                    .await
                    .context("failed to update switch op")?;
                Ok(())
            }
        })
        .await
    }
}

/// A fresh row in the verify phase.
pub fn new_switch_op(
    old: SourceKey,
    new_source: Source,
    new_source_id: Option<i64>,
    uid: i64,
    force: bool,
) -> SwitchOpRecord {
    SwitchOpRecord {
        old,
        new_source,
        new_source_id,
        uid,
        phase: SwitchPhase::Verify,
        status: SwitchStatus::Normal,
        force,
        added_at: Utc::now(),
    }
}
