//! Operator notifications
//!
//! Failed switches and other events an operator should see end up here.
//! Delivery surfaces read and acknowledge them; this layer only stores.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use uuid::Uuid;

use crate::db::sqlite_helpers::{
    bool_to_int, datetime_to_str, int_to_bool, str_to_datetime, str_to_uuid, uuid_to_str,
};
use crate::db::with_lock_retry;

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

impl sqlx::FromRow<'_, SqliteRow> for NotificationRecord {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let id_str: String = row.try_get("id")?;
        let created_str: String = row.try_get("created_at")?;

        Ok(Self {
            id: str_to_uuid(&id_str).map_err(|e| sqlx::Error::Decode(e.into()))?,
            kind: row.try_get("kind")?,
            title: row.try_get("title")?,
            body: row.try_get("body")?,
            created_at: str_to_datetime(&created_str)
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
            read: int_to_bool(row.try_get("read")?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CreateNotification {
    pub kind: String,
    pub title: String,
    pub body: String,
}

#[derive(Clone)]
pub struct NotificationRepository {
    pool: SqlitePool,
}

impl NotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: &CreateNotification) -> Result<NotificationRecord> {
        let record = NotificationRecord {
            id: Uuid::new_v4(),
            kind: input.kind.clone(),
            title: input.title.clone(),
            body: input.body.clone(),
            created_at: Utc::now(),
            read: false,
        };

        let stored = record.clone();
        with_lock_retry("notification create", || {
            let record = stored.clone();
            let pool = self.pool.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO notifications (id, kind, title, body, created_at, read)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(uuid_to_str(record.id))
                .bind(&record.kind)
                .bind(&record.title)
                .bind(&record.body)
                .bind(datetime_to_str(record.created_at))
                .bind(bool_to_int(record.read))
                .execute(&pool)
                .await
                .context("failed to insert notification")?;
                Ok(())
            }
        })
        .await?;

        Ok(record)
    }

    pub async fn list_unread(&self) -> Result<Vec<NotificationRecord>> {
        let records = sqlx::query_as::<_, NotificationRecord>(
            "SELECT * FROM notifications WHERE read = 0 ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list notifications")?;
        Ok(records)
    }

    pub async fn mark_read(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE notifications SET read = 1 WHERE id = ?")
            .bind(uuid_to_str(id))
            .execute(&self.pool)
            .await
            .context("failed to mark notification read")?;
        Ok(())
    }
}
