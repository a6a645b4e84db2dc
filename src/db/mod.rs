//! Database connection and operations

pub mod backlog;
pub mod episodes;
pub mod notifications;
pub mod people;
pub mod queue_items;
pub mod schema;
pub mod settings;
pub mod shows;
pub mod sqlite_helpers;
pub mod switch_ops;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::warn;

pub use backlog::{BacklogPartRecord, BacklogRepository};
pub use episodes::{CreateEpisode, EpisodeRecord, EpisodeRepository, EpisodeStatus, WantedByShow};
pub use notifications::{CreateNotification, NotificationRecord, NotificationRepository};
pub use people::{PersonRecord, PersonRepository, UpsertPerson};
pub use queue_items::{QueueItemRecord, QueueStore};
pub use settings::SettingsRepository;
pub use shows::{CreateShow, ShowRecord, ShowRepository, UpdateShow};
pub use switch_ops::{
    SwitchOpRecord, SwitchOpRepository, SwitchPhase, SwitchStatus, new_switch_op,
};

/// How often a transiently locked database operation is retried before the
/// error is treated as fatal.
pub const LOCK_RETRY_ATTEMPTS: u32 = 5;

/// Delay between lock retries.
pub const LOCK_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn get_max_connections() -> u32 {
        std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5)
    }

    /// Open (creating if missing) the database file and apply the schema.
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::get_max_connections())
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Open the database, retrying every `retry_interval` until it succeeds.
    pub async fn connect_with_retry(path: &Path, retry_interval: Duration) -> Self {
        loop {
            match Self::connect(path).await {
                Ok(db) => return db,
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_secs = retry_interval.as_secs(),
                        "Database connection failed, retrying"
                    );
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }

    /// In-memory database for tests; single connection so every query sees
    /// the same database.
    pub async fn connect_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;
        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get a show repository
    pub fn shows(&self) -> ShowRepository {
        ShowRepository::new(self.pool.clone())
    }

    /// Get an episode repository
    pub fn episodes(&self) -> EpisodeRepository {
        EpisodeRepository::new(self.pool.clone())
    }

    /// Get the task store backing one queue table
    pub fn queue(&self, table: &'static str) -> QueueStore {
        QueueStore::new(self.pool.clone(), table)
    }

    /// Get a switch-operation repository
    pub fn switch_ops(&self) -> SwitchOpRepository {
        SwitchOpRepository::new(self.pool.clone())
    }

    /// Get a backlog partition repository
    pub fn backlog(&self) -> BacklogRepository {
        BacklogRepository::new(self.pool.clone())
    }

    /// Get a people repository
    pub fn people(&self) -> PersonRepository {
        PersonRepository::new(self.pool.clone())
    }

    /// Get a settings repository
    pub fn settings(&self) -> SettingsRepository {
        SettingsRepository::new(self.pool.clone())
    }

    /// Get a notification repository
    pub fn notifications(&self) -> NotificationRepository {
        NotificationRepository::new(self.pool.clone())
    }

    /// Highest task uid seen across every queue table and the switch-op
    /// table. Queues share one id namespace, so the allocator is seeded from
    /// the global maximum.
    pub async fn max_task_uid(&self) -> Result<i64> {
        let mut max_uid: i64 = 0;
        for table in schema::QUEUE_TABLES {
            let row: (Option<i64>,) = sqlx::query_as(&format!("SELECT MAX(uid) FROM {}", table))
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("Failed to read max uid from {}", table))?;
            max_uid = max_uid.max(row.0.unwrap_or(0));
        }
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(uid) FROM switch_ops")
            .fetch_one(&self.pool)
            .await
            .context("Failed to read max uid from switch_ops")?;
        Ok(max_uid.max(row.0.unwrap_or(0)))
    }
}

/// True when the error chain contains one of the two SQLite contention
/// messages worth waiting out.
pub fn is_transient_lock_error(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        let msg = cause.to_string();
        msg.contains("database is locked") || msg.contains("unable to open database file")
    })
}

/// Run a persistence operation, retrying transient lock errors up to
/// `LOCK_RETRY_ATTEMPTS` times with `LOCK_RETRY_DELAY` between tries. Any
/// other error propagates immediately.
pub async fn with_lock_retry<T, Fut, F>(operation_name: &str, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient_lock_error(&e) && attempts < LOCK_RETRY_ATTEMPTS => {
                warn!(
                    operation = %operation_name,
                    attempt = attempts,
                    error = %e,
                    "Database busy, retrying"
                );
                tokio::time::sleep(LOCK_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("{} failed", operation_name));
            }
        }
    }
}
