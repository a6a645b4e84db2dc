//! Cast members attached to a show

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::db::with_lock_retry;

#[derive(Debug, Clone)]
pub struct PersonRecord {
    pub id: i64,
    pub show_id: i64,
    pub source_person_id: i64,
    pub name: String,
    pub role: Option<String>,
    pub sort_order: i64,
}

impl sqlx::FromRow<'_, SqliteRow> for PersonRecord {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            show_id: row.try_get("show_id")?,
            source_person_id: row.try_get("source_person_id")?,
            name: row.try_get("name")?,
            role: row.try_get("role")?,
            sort_order: row.try_get("sort_order")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UpsertPerson {
    pub source_person_id: i64,
    pub name: String,
    pub role: Option<String>,
    pub sort_order: i64,
}

#[derive(Clone)]
pub struct PersonRepository {
    pool: SqlitePool,
}

impl PersonRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Sync the cast list for a show: upsert everyone provided, drop anyone
    /// no longer billed.
    pub async fn replace_for_show(&self, show_id: i64, people: &[UpsertPerson]) -> Result<()> {
        let people = people.to_vec();
        with_lock_retry("cast replace", || {
            let people = people.clone();
            let pool = self.pool.clone();
            async move {
                let mut tx = pool.begin().await.context("failed to begin transaction")?;
                for person in &people {
                    sqlx::query(
                        r#"
                        INSERT INTO people (show_id, source_person_id, name, role, sort_order)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT(show_id, source_person_id) DO UPDATE SET
                            name = excluded.name,
                            role = excluded.role,
                            sort_order = excluded.sort_order
                        "#,
                    )
                    .bind(show_id)
                    .bind(person.source_person_id)
                    .bind(&person.name)
                    .bind(&person.role)
                    .bind(person.sort_order)
                    .execute(&mut *tx)
                    .await
                    .context("failed to upsert cast member")?;
                }

                if people.is_empty() {
                    sqlx::query("DELETE FROM people WHERE show_id = ?")
                        .bind(show_id)
                        .execute(&mut *tx)
                        .await
                        .context("failed to clear cast")?;
                } else {
                    let placeholders = vec!["?"; people.len()].join(", ");
                    let sql = format!(
                        "DELETE FROM people WHERE show_id = ? AND source_person_id NOT IN ({placeholders})"
                    );
                    let mut query = sqlx::query(&sql).bind(show_id);
                    for person in &people {
                        query = query.bind(person.source_person_id);
                    }
                    query
                        .execute(&mut *tx)
                        .await
                        .context("failed to prune departed cast")?;
                }

                tx.commit().await.context("failed to commit cast replace")?;
                Ok(())
            }
        })
        .await
    }

    pub async fn for_show(&self, show_id: i64) -> Result<Vec<PersonRecord>> {
        let records = sqlx::query_as::<_, PersonRecord>(
            "SELECT * FROM people WHERE show_id = ? ORDER BY sort_order ASC, name ASC",
        )
        .bind(show_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load cast")?;
        Ok(records)
    }

    pub async fn delete_for_show(&self, show_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM people WHERE show_id = ?")
            .bind(show_id)
            .execute(&self.pool)
            .await
            .context("failed to delete cast")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreateShow, Database};
    use crate::providers::{Source, SourceKey};

    fn member(id: i64, name: &str, order: i64) -> UpsertPerson {
        UpsertPerson {
            source_person_id: id,
            name: name.to_string(),
            role: Some(format!("{name} (self)")),
            sort_order: order,
        }
    }

    async fn seed_show(db: &Database) -> i64 {
        let show = db
            .shows()
            .create(CreateShow {
                key: SourceKey::new(Source::TvMaze, 82),
                name: "Game of Thrones".to_string(),
                year: Some(2011),
                status: Some("Ended".to_string()),
                location: None,
            })
            .await
            .unwrap();
        show.id
    }

    #[tokio::test]
    async fn test_replace_upserts_and_prunes() {
        let db = Database::connect_memory().await.unwrap();
        let show_id = seed_show(&db).await;
        let repo = db.people();

        repo.replace_for_show(show_id, &[member(1, "Alpha", 0), member(2, "Beta", 1)])
            .await
            .unwrap();

        // Beta departs, Gamma joins, Alpha gets a new billing slot.
        repo.replace_for_show(show_id, &[member(1, "Alpha", 1), member(3, "Gamma", 0)])
            .await
            .unwrap();

        let cast = repo.for_show(show_id).await.unwrap();
        let names: Vec<&str> = cast.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Gamma", "Alpha"]);
    }

    #[tokio::test]
    async fn test_empty_replace_clears_cast() {
        let db = Database::connect_memory().await.unwrap();
        let show_id = seed_show(&db).await;
        let repo = db.people();

        repo.replace_for_show(show_id, &[member(1, "Alpha", 0)])
            .await
            .unwrap();
        repo.replace_for_show(show_id, &[]).await.unwrap();
        assert!(repo.for_show(show_id).await.unwrap().is_empty());
    }
}
