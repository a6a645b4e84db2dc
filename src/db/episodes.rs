//! Episode database operations

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::SqlitePool;

use crate::db::sqlite_helpers::{bool_to_int, from_json, int_to_bool, to_json};
use crate::providers::Source;

const DATE_FMT: &str = "%Y-%m-%d";

/// Lifecycle status of one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeStatus {
    Unaired,
    Wanted,
    Skipped,
    Snatched,
    Downloaded,
    Archived,
    Ignored,
}

impl EpisodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::Unaired => "unaired",
            EpisodeStatus::Wanted => "wanted",
            EpisodeStatus::Skipped => "skipped",
            EpisodeStatus::Snatched => "snatched",
            EpisodeStatus::Downloaded => "downloaded",
            EpisodeStatus::Archived => "archived",
            EpisodeStatus::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Option<EpisodeStatus> {
        match s {
            "unaired" => Some(EpisodeStatus::Unaired),
            "wanted" => Some(EpisodeStatus::Wanted),
            "skipped" => Some(EpisodeStatus::Skipped),
            "snatched" => Some(EpisodeStatus::Snatched),
            "downloaded" => Some(EpisodeStatus::Downloaded),
            "archived" => Some(EpisodeStatus::Archived),
            "ignored" => Some(EpisodeStatus::Ignored),
            _ => None,
        }
    }

    /// Whether this status represents something worth keeping when the
    /// source stops listing the episode. Anything snatched or on disk is
    /// retained; the rest can be dropped.
    pub fn has_retained_value(&self) -> bool {
        matches!(
            self,
            EpisodeStatus::Snatched | EpisodeStatus::Downloaded | EpisodeStatus::Archived
        )
    }
}

impl std::fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An episode row
#[derive(Debug, Clone)]
pub struct EpisodeRecord {
    pub id: i64,
    pub show_id: i64,
    pub season: i64,
    pub episode: i64,
    pub title: Option<String>,
    pub air_date: Option<NaiveDate>,
    pub status: EpisodeStatus,
    pub watched: bool,
    pub location: Option<String>,
    pub subtitles: Vec<String>,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for EpisodeRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        let status_str: String = row.try_get("status")?;
        let status = EpisodeStatus::parse(&status_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown episode status '{}'", status_str).into())
        })?;
        let air_date: Option<String> = row.try_get("air_date")?;
        let watched: i32 = row.try_get("watched")?;
        let subtitles_str: String = row.try_get("subtitles")?;

        Ok(Self {
            id: row.try_get("id")?,
            show_id: row.try_get("show_id")?,
            season: row.try_get("season")?,
            episode: row.try_get("episode")?,
            title: row.try_get("title")?,
            air_date: air_date
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, DATE_FMT).ok()),
            status,
            watched: int_to_bool(watched),
            location: row.try_get("location")?,
            subtitles: from_json(&subtitles_str).map_err(|e| sqlx::Error::Decode(e.into()))?,
        })
    }
}

/// Fields for creating (or refreshing) an episode
#[derive(Debug, Clone)]
pub struct CreateEpisode {
    pub show_id: i64,
    pub season: i64,
    pub episode: i64,
    pub title: Option<String>,
    pub air_date: Option<NaiveDate>,
    pub status: EpisodeStatus,
}

/// Wanted-episode count for one show, joined against the show's key.
#[derive(Debug, Clone)]
pub struct WantedByShow {
    pub show_id: i64,
    pub source: Source,
    pub source_id: i64,
    pub wanted: i64,
}

/// Repository for episode operations
pub struct EpisodeRepository {
    pool: SqlitePool,
}

impl EpisodeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert the episode or, if the (show, season, episode) slot already
    /// exists, refresh its title and air date. Status is only written on
    /// insert; an existing row keeps whatever lifecycle state it reached.
    pub async fn upsert(&self, episode: CreateEpisode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO episodes (show_id, season, episode, title, air_date, status)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(show_id, season, episode)
            DO UPDATE SET title = excluded.title, air_date = excluded.air_date
            "#,
        )
        .bind(episode.show_id)
        .bind(episode.season)
        .bind(episode.episode)
        .bind(&episode.title)
        .bind(episode.air_date.map(|d| d.format(DATE_FMT).to_string()))
        .bind(episode.status.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to upsert episode")?;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<EpisodeRecord>> {
        sqlx::query_as::<_, EpisodeRecord>("SELECT * FROM episodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch episode")
    }

    pub async fn for_show(&self, show_id: i64) -> Result<Vec<EpisodeRecord>> {
        sqlx::query_as::<_, EpisodeRecord>(
            "SELECT * FROM episodes WHERE show_id = ? ORDER BY season, episode",
        )
        .bind(show_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list episodes for show")
    }

    pub async fn set_status(&self, id: i64, status: EpisodeStatus) -> Result<()> {
        sqlx::query("UPDATE episodes SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to set episode status")?;
        Ok(())
    }

    pub async fn set_location(&self, id: i64, location: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE episodes SET location = ? WHERE id = ?")
            .bind(location)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to set episode location")?;
        Ok(())
    }

    /// Mark one episode watched/unwatched by its number. Returns false when
    /// the show has no such episode.
    pub async fn set_watched(
        &self,
        show_id: i64,
        season: i64,
        episode: i64,
        watched: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE episodes SET watched = ? WHERE show_id = ? AND season = ? AND episode = ?",
        )
        .bind(bool_to_int(watched))
        .bind(show_id)
        .bind(season)
        .bind(episode)
        .execute(&self.pool)
        .await
        .context("Failed to set watched flag")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_subtitles(&self, id: i64, langs: &[String]) -> Result<()> {
        sqlx::query("UPDATE episodes SET subtitles = ? WHERE id = ?")
            .bind(to_json(&langs))
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to set episode subtitles")?;
        Ok(())
    }

    /// Delete a batch of episodes by id.
    pub async fn delete_many(&self, ids: &[i64]) -> Result<u64> {
        let mut deleted = 0;
        for chunk in ids.chunks(500) {
            let placeholders: Vec<&str> = chunk.iter().map(|_| "?").collect();
            let sql = format!(
                "DELETE FROM episodes WHERE id IN ({})",
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            let result = query
                .execute(&self.pool)
                .await
                .context("Failed to delete episodes")?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    /// Wanted episodes for one show, oldest first.
    pub async fn wanted_for_show(&self, show_id: i64) -> Result<Vec<EpisodeRecord>> {
        sqlx::query_as::<_, EpisodeRecord>(
            r#"
            SELECT * FROM episodes
            WHERE show_id = ? AND status = 'wanted'
            ORDER BY season, episode
            "#,
        )
        .bind(show_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list wanted episodes")
    }

    /// Wanted episodes for one show that aired on or after the given date.
    pub async fn wanted_recent(&self, show_id: i64, since: NaiveDate) -> Result<Vec<EpisodeRecord>> {
        sqlx::query_as::<_, EpisodeRecord>(
            r#"
            SELECT * FROM episodes
            WHERE show_id = ? AND status = 'wanted' AND air_date IS NOT NULL AND air_date >= ?
            ORDER BY season, episode
            "#,
        )
        .bind(show_id)
        .bind(since.format(DATE_FMT).to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list recent wanted episodes")
    }

    /// Per-show wanted counts across the whole catalog, skipping paused
    /// shows. The ordering (by show name) is what makes backlog partition
    /// builds deterministic.
    pub async fn wanted_counts_by_show(&self) -> Result<Vec<WantedByShow>> {
        use sqlx::Row;

        let rows = sqlx::query(
            r#"
            SELECT s.id AS show_id, s.source, s.source_id, COUNT(e.id) AS wanted
            FROM shows s
            JOIN episodes e ON e.show_id = s.id AND e.status = 'wanted'
            WHERE s.paused = 0
            GROUP BY s.id
            ORDER BY s.name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count wanted episodes")?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let source_str: String = row.try_get("source")?;
            let source = Source::parse(&source_str)
                .ok_or_else(|| anyhow::anyhow!("unknown source tag '{}'", source_str))?;
            counts.push(WantedByShow {
                show_id: row.try_get("show_id")?,
                source,
                source_id: row.try_get("source_id")?,
                wanted: row.try_get("wanted")?,
            });
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreateShow, Database};
    use crate::providers::SourceKey;

    async fn seeded_show(db: &Database, source_id: i64) -> i64 {
        db.shows()
            .create(CreateShow {
                key: SourceKey::new(Source::TvMaze, source_id),
                name: format!("Show {}", source_id),
                year: None,
                status: None,
                location: None,
            })
            .await
            .unwrap()
            .id
    }

    fn ep(show_id: i64, season: i64, episode: i64, status: EpisodeStatus) -> CreateEpisode {
        CreateEpisode {
            show_id,
            season,
            episode,
            title: Some(format!("S{:02}E{:02}", season, episode)),
            air_date: NaiveDate::from_ymd_opt(2024, 1, episode as u32),
            status,
        }
    }

    #[tokio::test]
    async fn test_upsert_preserves_status() {
        let db = Database::connect_memory().await.unwrap();
        let show_id = seeded_show(&db, 1).await;
        let repo = db.episodes();

        repo.upsert(ep(show_id, 1, 1, EpisodeStatus::Wanted)).await.unwrap();
        let first = repo.for_show(show_id).await.unwrap().remove(0);
        repo.set_status(first.id, EpisodeStatus::Downloaded).await.unwrap();

        // Second upsert carries a new title but must not clobber the status
        let mut refreshed = ep(show_id, 1, 1, EpisodeStatus::Wanted);
        refreshed.title = Some("Pilot".to_string());
        repo.upsert(refreshed).await.unwrap();

        let after = repo.for_show(show_id).await.unwrap().remove(0);
        assert_eq!(after.status, EpisodeStatus::Downloaded);
        assert_eq!(after.title.as_deref(), Some("Pilot"));
    }

    #[tokio::test]
    async fn test_wanted_queries() {
        let db = Database::connect_memory().await.unwrap();
        let show_id = seeded_show(&db, 1).await;
        let repo = db.episodes();

        repo.upsert(ep(show_id, 1, 1, EpisodeStatus::Wanted)).await.unwrap();
        repo.upsert(ep(show_id, 1, 2, EpisodeStatus::Downloaded)).await.unwrap();
        repo.upsert(ep(show_id, 1, 3, EpisodeStatus::Wanted)).await.unwrap();

        let wanted = repo.wanted_for_show(show_id).await.unwrap();
        assert_eq!(wanted.len(), 2);

        let recent = repo
            .wanted_recent(show_id, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].episode, 3);
    }

    #[tokio::test]
    async fn test_wanted_counts_skip_paused_shows() {
        let db = Database::connect_memory().await.unwrap();
        let active = seeded_show(&db, 1).await;
        let paused = seeded_show(&db, 2).await;
        db.shows()
            .update(
                paused,
                crate::db::UpdateShow {
                    paused: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let repo = db.episodes();
        repo.upsert(ep(active, 1, 1, EpisodeStatus::Wanted)).await.unwrap();
        repo.upsert(ep(paused, 1, 1, EpisodeStatus::Wanted)).await.unwrap();

        let counts = repo.wanted_counts_by_show().await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].show_id, active);
        assert_eq!(counts[0].wanted, 1);
    }

    #[tokio::test]
    async fn test_delete_many_and_retained_value() {
        let db = Database::connect_memory().await.unwrap();
        let show_id = seeded_show(&db, 1).await;
        let repo = db.episodes();

        repo.upsert(ep(show_id, 1, 1, EpisodeStatus::Skipped)).await.unwrap();
        repo.upsert(ep(show_id, 1, 2, EpisodeStatus::Downloaded)).await.unwrap();

        let all = repo.for_show(show_id).await.unwrap();
        let droppable: Vec<i64> = all
            .iter()
            .filter(|e| !e.status.has_retained_value())
            .map(|e| e.id)
            .collect();
        assert_eq!(repo.delete_many(&droppable).await.unwrap(), 1);
        assert_eq!(repo.for_show(show_id).await.unwrap().len(), 1);
    }
}
