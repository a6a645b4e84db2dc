//! Persisted backlog partition assignments
//!
//! When the backlog job splits the wanted catalog into parts, the split is
//! written here and drained one part per cycle. Rows survive restarts so a
//! rotation picks up where it left off instead of rebuilding and re-searching
//! shows that already had their turn.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::db::with_lock_retry;
use crate::providers::{Source, SourceKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogPartRecord {
    /// 1-based part number within the current rotation.
    pub part: i64,
    pub key: SourceKey,
    /// Wanted-episode count at the time the split was built.
    pub wanted: i64,
}

impl sqlx::FromRow<'_, SqliteRow> for BacklogPartRecord {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let raw: String = row.try_get("source")?;
        let source = Source::parse(&raw).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "source".into(),
            source: format!("unknown source '{raw}'").into(),
        })?;
        Ok(Self {
            part: row.try_get("part")?,
            key: SourceKey::new(source, row.try_get("source_id")?),
            wanted: row.try_get("wanted")?,
        })
    }
}

#[derive(Clone)]
pub struct BacklogRepository {
    pool: SqlitePool,
}

impl BacklogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Replace the whole rotation with a freshly built split.
    pub async fn replace_all(&self, assignments: &[BacklogPartRecord]) -> Result<()> {
        let assignments = assignments.to_vec();
        with_lock_retry("backlog replace", || {
            let assignments = assignments.clone();
            let pool = self.pool.clone();
            async move {
                let mut tx = pool.begin().await.context("failed to begin transaction")?;
                sqlx::query("DELETE FROM backlog_parts")
                    .execute(&mut *tx)
                    .await
                    .context("failed to clear backlog parts")?;
                for record in &assignments {
                    sqlx::query(
                        r#"
                        INSERT INTO backlog_parts (part, source, source_id, wanted)
                        VALUES (?, ?, ?, ?)
                        "#,
                    )
                    .bind(record.part)
                    .bind(record.key.source.as_str())
                    .bind(record.key.source_id)
                    .bind(record.wanted)
                    .execute(&mut *tx)
                    .await
                    .context("failed to insert backlog part")?;
                }
                tx.commit()
                    .await
                    .context("failed to commit backlog replace")?;
                Ok(())
            }
        })
        .await
    }

    /// Part numbers still waiting their turn, lowest first.
    pub async fn current_parts(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT DISTINCT part FROM backlog_parts ORDER BY part ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed to list backlog parts")?;
        rows.iter().map(|row| Ok(row.try_get("part")?)).collect()
    }

    pub async fn shows_in_part(&self, part: i64) -> Result<Vec<BacklogPartRecord>> {
        let records = sqlx::query_as::<_, BacklogPartRecord>(
            "SELECT * FROM backlog_parts WHERE part = ? ORDER BY source, source_id",
        )
        .bind(part)
        .fetch_all(&self.pool)
        .await
        .context("failed to load backlog part")?;
        Ok(records)
    }

    /// Shows that still have a pending part, regardless of which.
    pub async fn assigned_keys(&self) -> Result<Vec<SourceKey>> {
        let records = sqlx::query_as::<_, BacklogPartRecord>("SELECT * FROM backlog_parts")
            .fetch_all(&self.pool)
            .await
            .context("failed to load backlog assignments")?;
        Ok(records.into_iter().map(|r| r.key).collect())
    }

    pub async fn delete_part(&self, part: i64) -> Result<()> {
        with_lock_retry("backlog delete part", || {
            let pool = self.pool.clone();
            async move {
                sqlx::query("DELETE FROM backlog_parts WHERE part = ?")
                    .bind(part)
                    .execute(&pool)
                    .await
                    .context("failed to delete backlog part")?;
                Ok(())
            }
        })
        .await
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM backlog_parts")
            .fetch_one(&self.pool)
            .await
            .context("failed to count backlog parts")?;
        Ok(row.try_get("n")?)
    }

    /// Renumber pending parts proportionally after the cadence changed, so a
    /// rotation sized for the old interval finishes on the new schedule.
    /// Each part maps to `ceil(part * new_count / old_count)`, clamped to
    /// `[1, new_count]`.
    pub async fn remap_parts(&self, old_count: i64, new_count: i64) -> Result<()> {
        if old_count <= 0 || new_count <= 0 || old_count == new_count {
            return Ok(());
        }
        let parts = self.current_parts().await?;
        if parts.is_empty() {
            return Ok(());
        }

        with_lock_retry("backlog remap", || {
            let parts = parts.clone();
            let pool = self.pool.clone();
            async move {
                let mut tx = pool.begin().await.context("failed to begin transaction")?;
                // Stage with negated numbers first so renumbering cannot
                // collide with rows not yet visited.
                for part in &parts {
                    let mapped = ((part * new_count + old_count - 1) / old_count).clamp(1, new_count);
                    sqlx::query("UPDATE backlog_parts SET part = ? WHERE part = ?")
                        .bind(-mapped)
                        .bind(part)
                        .execute(&mut *tx)
                        .await
                        .context("failed to stage backlog remap")?;
                }
                sqlx::query("UPDATE backlog_parts SET part = -part WHERE part < 0")
                    .execute(&mut *tx)
                    .await
                    .context("failed to finish backlog remap")?;
                tx.commit()
                    .await
                    .context("failed to commit backlog remap")?;
                Ok(())
            }
        })
        .await
    }
}
