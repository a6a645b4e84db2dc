//! Tracked show database operations

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::sqlite_helpers::{
    bool_to_int, datetime_to_str, int_to_bool, now_iso8601, str_to_datetime, str_to_datetime_opt,
};
use crate::providers::{Source, SourceKey};

/// A tracked show row
#[derive(Debug, Clone)]
pub struct ShowRecord {
    pub id: i64,
    pub source: Source,
    pub source_id: i64,
    pub name: String,
    pub year: Option<i32>,
    pub status: Option<String>,
    pub location: Option<String>,
    pub paused: bool,
    pub auto_switch: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub added_at: DateTime<Utc>,
}

impl ShowRecord {
    pub fn key(&self) -> SourceKey {
        SourceKey::new(self.source, self.source_id)
    }
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for ShowRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        let source_str: String = row.try_get("source")?;
        let source = Source::parse(&source_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown source tag '{}'", source_str).into())
        })?;
        let last_updated: Option<String> = row.try_get("last_updated")?;
        let added_str: String = row.try_get("added_at")?;
        let paused: i32 = row.try_get("paused")?;
        let auto_switch: i32 = row.try_get("auto_switch")?;

        Ok(Self {
            id: row.try_get("id")?,
            source,
            source_id: row.try_get("source_id")?,
            name: row.try_get("name")?,
            year: row.try_get("year")?,
            status: row.try_get("status")?,
            location: row.try_get("location")?,
            paused: int_to_bool(paused),
            auto_switch: int_to_bool(auto_switch),
            last_updated: str_to_datetime_opt(last_updated.as_deref())
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
            added_at: str_to_datetime(&added_str).map_err(|e| sqlx::Error::Decode(e.into()))?,
        })
    }
}

/// Fields for creating a show
#[derive(Debug, Clone)]
pub struct CreateShow {
    pub key: SourceKey,
    pub name: String,
    pub year: Option<i32>,
    pub status: Option<String>,
    pub location: Option<String>,
}

/// Fields for updating a show (None = leave unchanged)
#[derive(Debug, Clone, Default)]
pub struct UpdateShow {
    pub name: Option<String>,
    pub year: Option<i32>,
    pub status: Option<String>,
    pub location: Option<String>,
    pub paused: Option<bool>,
    pub auto_switch: Option<bool>,
}

/// Repository for show operations
pub struct ShowRepository {
    pool: SqlitePool,
}

impl ShowRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, show: CreateShow) -> Result<ShowRecord> {
        let result = sqlx::query(
            r#"
            INSERT INTO shows (source, source_id, name, year, status, location, added_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(show.key.source.as_str())
        .bind(show.key.source_id)
        .bind(&show.name)
        .bind(show.year)
        .bind(&show.status)
        .bind(&show.location)
        .bind(now_iso8601())
        .execute(&self.pool)
        .await
        .context("Failed to insert show")?;

        let id = result.last_insert_rowid();
        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Show {} vanished after insert", id))
    }

    pub async fn get(&self, id: i64) -> Result<Option<ShowRecord>> {
        sqlx::query_as::<_, ShowRecord>("SELECT * FROM shows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch show")
    }

    pub async fn get_by_key(&self, key: SourceKey) -> Result<Option<ShowRecord>> {
        sqlx::query_as::<_, ShowRecord>("SELECT * FROM shows WHERE source = ? AND source_id = ?")
            .bind(key.source.as_str())
            .bind(key.source_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch show by key")
    }

    pub async fn list(&self) -> Result<Vec<ShowRecord>> {
        sqlx::query_as::<_, ShowRecord>("SELECT * FROM shows ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list shows")
    }

    pub async fn update(&self, id: i64, update: UpdateShow) -> Result<()> {
        let mut sets: Vec<&str> = Vec::new();

        if update.name.is_some() {
            sets.push("name = ?");
        }
        if update.year.is_some() {
            sets.push("year = ?");
        }
        if update.status.is_some() {
            sets.push("status = ?");
        }
        if update.location.is_some() {
            sets.push("location = ?");
        }
        if update.paused.is_some() {
            sets.push("paused = ?");
        }
        if update.auto_switch.is_some() {
            sets.push("auto_switch = ?");
        }

        if sets.is_empty() {
            return Ok(());
        }

        let sql = format!("UPDATE shows SET {} WHERE id = ?", sets.join(", "));
        let mut query = sqlx::query(&sql);
        if let Some(name) = &update.name {
            query = query.bind(name);
        }
        if let Some(year) = update.year {
            query = query.bind(year);
        }
        if let Some(status) = &update.status {
            query = query.bind(status);
        }
        if let Some(location) = &update.location {
            query = query.bind(location);
        }
        if let Some(paused) = update.paused {
            query = query.bind(bool_to_int(paused));
        }
        if let Some(auto_switch) = update.auto_switch {
            query = query.bind(bool_to_int(auto_switch));
        }
        query
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update show")?;
        Ok(())
    }

    /// Stamp the show as updated now.
    pub async fn touch_last_updated(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE shows SET last_updated = ? WHERE id = ?")
            .bind(datetime_to_str(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to stamp last_updated")?;
        Ok(())
    }

    /// Rewrite the source pointer. This is the persistence half of a source
    /// switch; the registry rekey is the in-memory half.
    pub async fn switch_source(&self, id: i64, new_key: SourceKey) -> Result<()> {
        sqlx::query("UPDATE shows SET source = ?, source_id = ? WHERE id = ?")
            .bind(new_key.source.as_str())
            .bind(new_key.source_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to switch show source")?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM shows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete show")?;
        Ok(())
    }

    /// Unpaused shows whose last update is missing or older than the cutoff.
    pub async fn stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ShowRecord>> {
        sqlx::query_as::<_, ShowRecord>(
            r#"
            SELECT * FROM shows
            WHERE paused = 0 AND (last_updated IS NULL OR last_updated < ?)
            ORDER BY last_updated ASC
            "#,
        )
        .bind(datetime_to_str(cutoff))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list stale shows")
    }
}
