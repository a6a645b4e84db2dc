//! Persistence for queue tasks
//!
//! Each domain queue owns one table out of `schema::QUEUE_TABLES`, all with
//! the same shape. Tasks are written when accepted, flagged when they start
//! running and deleted when they finish, so a restart sees exactly the work
//! that had not completed.

use anyhow::{Context, Result, bail};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::db::sqlite_helpers::{
    bool_to_int, datetime_to_str, from_json, from_json_opt, int_to_bool, str_to_datetime, to_json,
};
use crate::db::with_lock_retry;
use crate::providers::{Source, SourceKey};
use crate::queue::task::{ActionKind, QueuedTask, TaskFlags, TaskPriority, TaskSpec};

/// One persisted queue row, still in storage form.
#[derive(Debug, Clone)]
pub struct QueueItemRecord {
    pub uid: i64,
    pub kind: String,
    pub name: String,
    pub source: Option<String>,
    pub source_id: Option<i64>,
    pub priority: i32,
    pub flags: String,
    pub segment: Option<String>,
    pub in_progress: bool,
    pub added_at: String,
}

impl sqlx::FromRow<'_, SqliteRow> for QueueItemRecord {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            uid: row.try_get("uid")?,
            kind: row.try_get("kind")?,
            name: row.try_get("name")?,
            source: row.try_get("source")?,
            source_id: row.try_get("source_id")?,
            priority: row.try_get("priority")?,
            flags: row.try_get("flags")?,
            segment: row.try_get("segment")?,
            in_progress: int_to_bool(row.try_get("in_progress")?),
            added_at: row.try_get("added_at")?,
        })
    }
}

impl QueueItemRecord {
    pub fn from_task(task: &QueuedTask) -> Self {
        Self {
            uid: task.uid,
            kind: task.spec.kind.as_str().to_string(),
            name: task.spec.name.clone(),
            source: task.spec.show.map(|key| key.source.as_str().to_string()),
            source_id: task.spec.show.map(|key| key.source_id),
            priority: task.spec.priority.value(),
            flags: to_json(&task.spec.flags),
            segment: task.spec.segment.as_ref().map(to_json),
            in_progress: task.in_progress,
            added_at: datetime_to_str(task.added_at),
        }
    }

    /// Rehydrate into the runtime shape. Fails on rows written by an
    /// incompatible version; callers skip those with a warning.
    pub fn into_task(self) -> Result<QueuedTask> {
        let Some(kind) = ActionKind::parse(&self.kind) else {
            bail!("unknown task kind '{}'", self.kind);
        };
        let Some(priority) = TaskPriority::from_value(self.priority) else {
            bail!("unknown task priority {}", self.priority);
        };
        let show = match (self.source.as_deref(), self.source_id) {
            (Some(source), Some(source_id)) => {
                let Some(source) = Source::parse(source) else {
                    bail!("unknown source '{source}'");
                };
                Some(SourceKey::new(source, source_id))
            }
            _ => None,
        };
        let flags: TaskFlags = from_json(&self.flags).context("failed to parse task flags")?;
        let segment = from_json_opt(self.segment.as_deref())?;
        let added_at =
            str_to_datetime(&self.added_at).context("failed to parse task timestamp")?;

        Ok(QueuedTask {
            uid: self.uid,
            spec: TaskSpec {
                name: self.name,
                kind,
                priority,
                show,
                flags,
                segment,
            },
            added_at,
            in_progress: self.in_progress,
        })
    }
}

/// Store for one queue's table. Every write runs under the shared
/// locked-database retry policy.
#[derive(Clone)]
pub struct QueueStore {
    pool: SqlitePool,
    table: &'static str,
}

impl QueueStore {
    /// `table` must be one of `schema::QUEUE_TABLES`.
    pub fn new(pool: SqlitePool, table: &'static str) -> Self {
        Self { pool, table }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub async fn insert(&self, task: &QueuedTask) -> Result<()> {
        let record = QueueItemRecord::from_task(task);
        let sql = format!(
            r#"
            INSERT OR REPLACE INTO {}
                (uid, kind, name, source, source_id, priority, flags, segment, in_progress, added_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            self.table
        );

        with_lock_retry("queue insert", || {
            let record = record.clone();
            let pool = self.pool.clone();
            let sql = sql.clone();
            async move {
                sqlx::query(&sql)
                    .bind(record.uid)
                    .bind(&record.kind)
                    .bind(&record.name)
                    .bind(&record.source)
                    .bind(record.source_id)
                    .bind(record.priority)
                    .bind(&record.flags)
                    .bind(&record.segment)
                    .bind(bool_to_int(record.in_progress))
                    .bind(&record.added_at)
                    .execute(&pool)
                    .await
                    .context("failed to insert queue item")?;
                Ok(())
            }
        })
        .await
    }

    pub async fn mark_in_progress(&self, uid: i64) -> Result<()> {
        let sql = format!("UPDATE {} SET in_progress = 1 WHERE uid = ?", self.table);

        with_lock_retry("queue mark in progress", || {
            let pool = self.pool.clone();
            let sql = sql.clone();
            async move {
                sqlx::query(&sql)
                    .bind(uid)
                    .execute(&pool)
                    .await
                    .context("failed to mark queue item in progress")?;
                Ok(())
            }
        })
        .await
    }

    pub async fn delete(&self, uid: i64) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE uid = ?", self.table);

        with_lock_retry("queue delete", || {
            let pool = self.pool.clone();
            let sql = sql.clone();
            async move {
                sqlx::query(&sql)
                    .bind(uid)
                    .execute(&pool)
                    .await
                    .context("failed to delete queue item")?;
                Ok(())
            }
        })
        .await
    }

    pub async fn load_all(&self) -> Result<Vec<QueueItemRecord>> {
        let sql = format!("SELECT * FROM {} ORDER BY added_at ASC, uid ASC", self.table);
        let records = sqlx::query_as::<_, QueueItemRecord>(&sql)
            .fetch_all(&self.pool)
            .await
            .context("failed to load queue items")?;
        Ok(records)
    }

    /// Rewrite the whole table to match the given tasks in one transaction.
    /// Used on save and after a reload reassigns uids.
    pub async fn replace_all(&self, tasks: &[QueuedTask]) -> Result<()> {
        let records: Vec<QueueItemRecord> = tasks.iter().map(QueueItemRecord::from_task).collect();
        let insert_sql = format!(
            r#"
            INSERT INTO {}
                (uid, kind, name, source, source_id, priority, flags, segment, in_progress, added_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            self.table
        );
        let delete_sql = format!("DELETE FROM {}", self.table);

        with_lock_retry("queue replace", || {
            let records = records.clone();
            let pool = self.pool.clone();
            let insert_sql = insert_sql.clone();
            let delete_sql = delete_sql.clone();
            async move {
                let mut tx = pool.begin().await.context("failed to begin transaction")?;
                sqlx::query(&delete_sql)
                    .execute(&mut *tx)
                    .await
                    .context("failed to clear queue table")?;
                for record in &records {
                    sqlx::query(&insert_sql)
                        .bind(record.uid)
                        .bind(&record.kind)
                        .bind(&record.name)
                        .bind(&record.source)
                        .bind(record.source_id)
                        .bind(record.priority)
                        .bind(&record.flags)
                        .bind(&record.segment)
                        .bind(bool_to_int(record.in_progress))
                        .bind(&record.added_at)
                        .execute(&mut *tx)
                        .await
                        .context("failed to insert queue item")?;
                }
                tx.commit().await.context("failed to commit queue replace")?;
                Ok(())
            }
        })
        .await
    }
}
