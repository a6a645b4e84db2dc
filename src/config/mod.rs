//! Application configuration management

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Backlog cadence floor. Rotations shorter than this would re-search the
/// catalog faster than the indexers tolerate.
const MIN_BACKLOG_FREQUENCY_SECS: u64 = 600;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// State directory (database, logs)
    pub data_dir: PathBuf,

    /// SQLite database path
    pub database_path: PathBuf,

    /// Seconds between backlog search cycles
    pub backlog_frequency_secs: u64,

    /// Wanted episodes to aim for per backlog cycle; drives the part split
    pub backlog_target_per_cycle: i64,

    /// Recent-window width in days for the per-cycle limited search
    pub recent_search_days: i64,

    /// Hour of day (0-23) the daily metadata update sweep runs
    pub update_hour: u32,

    /// Enable the periodic watched-state sync
    pub watched_sync_enabled: bool,

    /// Seconds between watched-state sync passes
    pub watched_sync_frequency_secs: u64,

    /// TMDB API key; the TMDB provider is only registered when set
    pub tmdb_api_key: Option<String>,

    /// Override the TVmaze base URL (self-hosted mirror or test stub)
    pub tvmaze_base_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("showrunner.db"));

        let backlog_frequency_secs = env::var("BACKLOG_FREQUENCY_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse::<u64>()
            .context("Invalid BACKLOG_FREQUENCY_SECS")?
            .max(MIN_BACKLOG_FREQUENCY_SECS);

        Ok(Self {
            data_dir,

            database_path,

            backlog_frequency_secs,

            backlog_target_per_cycle: env::var("BACKLOG_TARGET_PER_CYCLE")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .context("Invalid BACKLOG_TARGET_PER_CYCLE")?,

            recent_search_days: env::var("RECENT_SEARCH_DAYS")
                .unwrap_or_else(|_| "7".to_string())
                .parse()
                .context("Invalid RECENT_SEARCH_DAYS")?,

            update_hour: env::var("UPDATE_HOUR")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),

            watched_sync_enabled: env::var("WATCHED_SYNC_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),

            watched_sync_frequency_secs: env::var("WATCHED_SYNC_FREQUENCY_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .unwrap_or(3600),

            tmdb_api_key: env::var("TMDB_API_KEY").ok(),

            tvmaze_base_url: env::var("TVMAZE_BASE_URL").ok(),
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            database_path: PathBuf::from(":memory:"),
            backlog_frequency_secs: 86400,
            backlog_target_per_cycle: 300,
            recent_search_days: 7,
            update_hour: 3,
            watched_sync_enabled: false,
            watched_sync_frequency_secs: 3600,
            tmdb_api_key: None,
            tvmaze_base_url: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("showrunner"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}
