//! Small key/value store for runtime bookkeeping
//!
//! Holds values that must survive restarts but do not deserve a table of
//! their own, like the backlog cadence the last rotation was built for.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

use crate::db::with_lock_retry;

#[derive(Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read setting")?;
        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    pub async fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        let value = self.get(key).await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        with_lock_retry("setting write", || {
            let pool = self.pool.clone();
            let key = key.clone();
            let value = value.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO settings (key, value) VALUES (?, ?)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value
                    "#,
                )
                .bind(&key)
                .bind(&value)
                .execute(&pool)
                .await
                .context("failed to write setting")?;
                Ok(())
            }
        })
        .await
    }

    pub async fn set_i64(&self, key: &str, value: i64) -> Result<()> {
        self.set(key, &value.to_string()).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("failed to delete setting")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_set_get_overwrite_delete() {
        let db = Database::connect_memory().await.unwrap();
        let settings = db.settings();

        assert!(settings.get("backlog.frequency_secs").await.unwrap().is_none());

        settings.set_i64("backlog.frequency_secs", 86400).await.unwrap();
        assert_eq!(
            settings.get_i64("backlog.frequency_secs").await.unwrap(),
            Some(86400)
        );

        settings.set_i64("backlog.frequency_secs", 3600).await.unwrap();
        assert_eq!(
            settings.get_i64("backlog.frequency_secs").await.unwrap(),
            Some(3600)
        );

        settings.delete("backlog.frequency_secs").await.unwrap();
        assert!(settings.get("backlog.frequency_secs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_numeric_value_reads_as_none() {
        let db = Database::connect_memory().await.unwrap();
        let settings = db.settings();
        settings.set("marker", "done").await.unwrap();
        assert_eq!(settings.get_i64("marker").await.unwrap(), None);
        assert_eq!(settings.get("marker").await.unwrap().as_deref(), Some("done"));
    }
}
