//! Boot-time schema creation
//!
//! The schema is small enough to live as static DDL applied at startup;
//! every statement is idempotent (`CREATE TABLE IF NOT EXISTS`), so a
//! restart against an existing database is a no-op.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

const CREATE_SHOWS: &str = r#"
CREATE TABLE IF NOT EXISTS shows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    source_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    year INTEGER,
    status TEXT,
    location TEXT,
    paused INTEGER NOT NULL DEFAULT 0,
    auto_switch INTEGER NOT NULL DEFAULT 1,
    last_updated TEXT,
    added_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(source, source_id)
)
"#;

const CREATE_EPISODES: &str = r#"
CREATE TABLE IF NOT EXISTS episodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    show_id INTEGER NOT NULL REFERENCES shows(id) ON DELETE CASCADE,
    season INTEGER NOT NULL,
    episode INTEGER NOT NULL,
    title TEXT,
    air_date TEXT,
    status TEXT NOT NULL DEFAULT 'unaired',
    watched INTEGER NOT NULL DEFAULT 0,
    location TEXT,
    subtitles TEXT NOT NULL DEFAULT '[]',
    UNIQUE(show_id, season, episode)
)
"#;

const CREATE_EPISODES_SHOW_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_episodes_show_status ON episodes(show_id, status)";

// One table per persisted queue, identical layout. The search queue keeps no
// table: its work is rebuilt from backlog_parts and the recent window.
const QUEUE_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS {table} (
    uid INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    source TEXT,
    source_id INTEGER,
    priority INTEGER NOT NULL,
    flags TEXT NOT NULL DEFAULT '{}',
    segment TEXT,
    in_progress INTEGER NOT NULL DEFAULT 0,
    added_at TEXT NOT NULL
)
"#;

pub const QUEUE_TABLES: &[&str] = &["show_queue", "people_queue", "watched_queue"];

const CREATE_SWITCH_OPS: &str = r#"
CREATE TABLE IF NOT EXISTS switch_ops (
    old_source TEXT NOT NULL,
    old_source_id INTEGER NOT NULL,
    new_source TEXT NOT NULL,
    new_source_id INTEGER,
    uid INTEGER NOT NULL,
    phase TEXT NOT NULL DEFAULT 'verify',
    status TEXT NOT NULL DEFAULT 'normal',
    force INTEGER NOT NULL DEFAULT 0,
    added_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (old_source, old_source_id)
)
"#;

const CREATE_BACKLOG_PARTS: &str = r#"
CREATE TABLE IF NOT EXISTS backlog_parts (
    part INTEGER NOT NULL,
    source TEXT NOT NULL,
    source_id INTEGER NOT NULL,
    wanted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (source, source_id)
)
"#;

const CREATE_PEOPLE: &str = r#"
CREATE TABLE IF NOT EXISTS people (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    show_id INTEGER NOT NULL REFERENCES shows(id) ON DELETE CASCADE,
    source_person_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    role TEXT,
    sort_order INTEGER NOT NULL DEFAULT 0,
    UNIQUE(show_id, source_person_id)
)
"#;

const CREATE_SETTINGS: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

const CREATE_NOTIFICATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    read INTEGER NOT NULL DEFAULT 0
)
"#;

/// Create all tables that do not exist yet.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let mut statements: Vec<String> = vec![
        CREATE_SHOWS.to_string(),
        CREATE_EPISODES.to_string(),
        CREATE_EPISODES_SHOW_INDEX.to_string(),
        CREATE_SWITCH_OPS.to_string(),
        CREATE_BACKLOG_PARTS.to_string(),
        CREATE_PEOPLE.to_string(),
        CREATE_SETTINGS.to_string(),
        CREATE_NOTIFICATIONS.to_string(),
    ];
    for table in QUEUE_TABLES {
        statements.push(QUEUE_TABLE_DDL.replace("{table}", table));
    }

    for statement in &statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to apply schema statement: {}", first_line(statement)))?;
    }

    debug!(statements = statements.len(), "Schema initialized");
    Ok(())
}

/// Check whether a table exists (used by tests and startup diagnostics).
pub async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(pool)
            .await
            .context("Failed to query sqlite_master")?;
    Ok(row.is_some())
}

fn first_line(sql: &str) -> &str {
    sql.trim_start().lines().next().unwrap_or("")
}
