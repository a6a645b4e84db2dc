//! Disk reconciliation for show folders
//!
//! A refresh walks the show's folder, matches video files to episode slots
//! by their SxxEyy marker and reconciles episode locations and statuses
//! with what is actually on disk. A rename pass rewrites files into the
//! canonical naming scheme.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::db::{Database, EpisodeRecord, EpisodeStatus};

const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "m4v", "mov", "wmv", "ts", "webm"];

/// Extract the (season, episode) slot from a release-style filename.
pub fn parse_episode_slot(filename: &str) -> Option<(i64, i64)> {
    let sxxexx = Regex::new(r"(?i)[Ss](\d{1,2})[Ee](\d{1,3})").unwrap();
    if let Some(caps) = sxxexx.captures(filename) {
        let season = caps.get(1)?.as_str().parse().ok()?;
        let episode = caps.get(2)?.as_str().parse().ok()?;
        return Some((season, episode));
    }
    let nxnn = Regex::new(r"(?i)\b(\d{1,2})x(\d{2,3})\b").unwrap();
    if let Some(caps) = nxnn.captures(filename) {
        let season = caps.get(1)?.as_str().parse().ok()?;
        let episode = caps.get(2)?.as_str().parse().ok()?;
        return Some((season, episode));
    }
    None
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshStats {
    pub files_found: usize,
    pub locations_set: usize,
    pub locations_cleared: usize,
    pub became_wanted: usize,
}

pub struct FileService {
    db: Database,
}

impl FileService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Walk the show folder and reconcile episode rows with the files found.
    /// A file appearing marks its episode Downloaded; a tracked file going
    /// missing clears the location and puts a Downloaded episode back to
    /// Wanted. Archived episodes keep their status either way.
    pub async fn refresh_show(
        &self,
        show_id: i64,
        cancel: &CancellationToken,
    ) -> Result<RefreshStats> {
        let show = self
            .db
            .shows()
            .get(show_id)
            .await?
            .ok_or_else(|| anyhow!("show {show_id} is not in the catalog"))?;
        let Some(location) = show.location.as_deref() else {
            debug!(show = %show.name, "no folder configured; skipping refresh");
            return Ok(RefreshStats::default());
        };
        let root = Path::new(location);
        if !root.exists() {
            // An unmounted drive must not wipe locations.
            warn!(show = %show.name, path = %location, "show folder missing; refresh skipped");
            return Ok(RefreshStats::default());
        }

        let mut found: HashMap<(i64, i64), PathBuf> = HashMap::new();
        for entry in WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() || !is_video(path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(slot) = parse_episode_slot(name) else {
                debug!(file = %name, "no episode marker in filename");
                continue;
            };
            // First match wins when a slot has several files.
            found.entry(slot).or_insert_with(|| path.to_path_buf());
        }

        let mut stats = RefreshStats {
            files_found: found.len(),
            ..Default::default()
        };

        let episodes = self.db.episodes().for_show(show.id).await?;
        for record in &episodes {
            if cancel.is_cancelled() {
                info!(show = %show.name, "refresh cancelled");
                return Ok(stats);
            }
            match found.get(&(record.season, record.episode)) {
                Some(path) => {
                    let path_str = path.to_string_lossy().to_string();
                    if record.location.as_deref() != Some(path_str.as_str()) {
                        self.db
                            .episodes()
                            .set_location(record.id, Some(&path_str))
                            .await?;
                        stats.locations_set += 1;
                    }
                    if matches!(
                        record.status,
                        EpisodeStatus::Unaired
                            | EpisodeStatus::Wanted
                            | EpisodeStatus::Skipped
                            | EpisodeStatus::Snatched
                    ) {
                        self.db
                            .episodes()
                            .set_status(record.id, EpisodeStatus::Downloaded)
                            .await?;
                    }
                }
                None => {
                    let still_there = record
                        .location
                        .as_deref()
                        .map(|loc| Path::new(loc).exists())
                        .unwrap_or(false);
                    if record.location.is_some() && !still_there {
                        self.db.episodes().set_location(record.id, None).await?;
                        stats.locations_cleared += 1;
                        if record.status == EpisodeStatus::Downloaded {
                            self.db
                                .episodes()
                                .set_status(record.id, EpisodeStatus::Wanted)
                                .await?;
                            stats.became_wanted += 1;
                        }
                    }
                }
            }
        }

        info!(
            show = %show.name,
            files = stats.files_found,
            set = stats.locations_set,
            cleared = stats.locations_cleared,
            "show folder refreshed"
        );
        Ok(stats)
    }

    /// Rename located episode files into the canonical scheme:
    /// `Show - SxxEyy - Title.ext`. Returns how many files moved.
    pub async fn rename_show(&self, show_id: i64, cancel: &CancellationToken) -> Result<usize> {
        let show = self
            .db
            .shows()
            .get(show_id)
            .await?
            .ok_or_else(|| anyhow!("show {show_id} is not in the catalog"))?;

        let episodes = self.db.episodes().for_show(show.id).await?;
        let mut renamed = 0usize;
        for record in &episodes {
            if cancel.is_cancelled() {
                info!(show = %show.name, "rename cancelled");
                break;
            }
            let Some(location) = record.location.as_deref() else {
                continue;
            };
            let path = Path::new(location);
            if !path.exists() {
                continue;
            }
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let desired = canonical_name(&show.name, record, ext);
            let current = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if current == desired {
                continue;
            }
            let target = path.with_file_name(&desired);
            tokio::fs::rename(path, &target)
                .await
                .with_context(|| format!("failed to rename {}", path.display()))?;
            self.db
                .episodes()
                .set_location(record.id, Some(&target.to_string_lossy()))
                .await?;
            debug!(from = %current, to = %desired, "episode file renamed");
            renamed += 1;
        }

        if renamed > 0 {
            info!(show = %show.name, renamed, "episode files renamed");
        }
        Ok(renamed)
    }
}

fn canonical_name(show_name: &str, episode: &EpisodeRecord, ext: &str) -> String {
    let stem = match episode.title.as_deref() {
        Some(title) => format!(
            "{} - S{:02}E{:02} - {}",
            show_name, episode.season, episode.episode, title
        ),
        None => format!("{} - S{:02}E{:02}", show_name, episode.season, episode.episode),
    };
    format!("{}.{}", sanitize_filename::sanitize(stem), ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreateEpisode, CreateShow};
    use crate::providers::{Source, SourceKey};

    #[test]
    fn test_parse_episode_slot() {
        assert_eq!(
            parse_episode_slot("Game.of.Thrones.S01E03.1080p.mkv"),
            Some((1, 3))
        );
        assert_eq!(parse_episode_slot("show 2x07 hdtv.avi"), Some((2, 7)));
        assert_eq!(parse_episode_slot("s10e124.mkv"), Some((10, 124)));
        assert_eq!(parse_episode_slot("behind-the-scenes.mkv"), None);
    }

    async fn seed(db: &Database, location: Option<&str>) -> i64 {
        let show = db
            .shows()
            .create(CreateShow {
                key: SourceKey::new(Source::TvMaze, 82),
                name: "Game of Thrones".to_string(),
                year: Some(2011),
                status: Some("Ended".to_string()),
                location: location.map(str::to_string),
            })
            .await
            .unwrap();
        for number in 1..=2 {
            db.episodes()
                .upsert(CreateEpisode {
                    show_id: show.id,
                    season: 1,
                    episode: number,
                    title: Some(format!("Episode {number}")),
                    air_date: None,
                    status: EpisodeStatus::Wanted,
                })
                .await
                .unwrap();
        }
        show.id
    }

    fn episode_row(episodes: &[EpisodeRecord], number: i64) -> &EpisodeRecord {
        episodes.iter().find(|e| e.episode == number).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_marks_found_files_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("GoT S01E01 1080p.mkv"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let db = Database::connect_memory().await.unwrap();
        let show_id = seed(&db, dir.path().to_str()).await;
        let service = FileService::new(db.clone());

        let stats = service
            .refresh_show(show_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.files_found, 1);
        assert_eq!(stats.locations_set, 1);

        let episodes = db.episodes().for_show(show_id).await.unwrap();
        assert_eq!(episode_row(&episodes, 1).status, EpisodeStatus::Downloaded);
        assert!(episode_row(&episodes, 1).location.is_some());
        assert_eq!(episode_row(&episodes, 2).status, EpisodeStatus::Wanted);
    }

    #[tokio::test]
    async fn test_refresh_reverts_missing_file_to_wanted() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("GoT S01E01.mkv");
        std::fs::write(&file, b"x").unwrap();

        let db = Database::connect_memory().await.unwrap();
        let show_id = seed(&db, dir.path().to_str()).await;
        let service = FileService::new(db.clone());
        service
            .refresh_show(show_id, &CancellationToken::new())
            .await
            .unwrap();

        std::fs::remove_file(&file).unwrap();
        let stats = service
            .refresh_show(show_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.locations_cleared, 1);
        assert_eq!(stats.became_wanted, 1);

        let episodes = db.episodes().for_show(show_id).await.unwrap();
        assert_eq!(episode_row(&episodes, 1).status, EpisodeStatus::Wanted);
        assert!(episode_row(&episodes, 1).location.is_none());
    }

    #[tokio::test]
    async fn test_refresh_skips_when_folder_unavailable() {
        let db = Database::connect_memory().await.unwrap();
        let show_id = seed(&db, Some("/definitely/not/mounted")).await;
        let service = FileService::new(db.clone());

        // Pretend a file had been tracked before the drive went away.
        let episodes = db.episodes().for_show(show_id).await.unwrap();
        db.episodes()
            .set_location(episodes[0].id, Some("/definitely/not/mounted/GoT S01E01.mkv"))
            .await
            .unwrap();
        db.episodes()
            .set_status(episodes[0].id, EpisodeStatus::Downloaded)
            .await
            .unwrap();

        let stats = service
            .refresh_show(show_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.locations_cleared, 0);

        let episodes = db.episodes().for_show(show_id).await.unwrap();
        assert_eq!(episode_row(&episodes, 1).status, EpisodeStatus::Downloaded);
        assert!(episode_row(&episodes, 1).location.is_some());
    }

    #[tokio::test]
    async fn test_rename_moves_file_to_canonical_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("got.s01e01.1080p-GRP.mkv"), b"x").unwrap();

        let db = Database::connect_memory().await.unwrap();
        let show_id = seed(&db, dir.path().to_str()).await;
        let service = FileService::new(db.clone());
        service
            .refresh_show(show_id, &CancellationToken::new())
            .await
            .unwrap();

        let renamed = service
            .rename_show(show_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(renamed, 1);

        let expected = dir.path().join("Game of Thrones - S01E01 - Episode 1.mkv");
        assert!(expected.exists());

        let episodes = db.episodes().for_show(show_id).await.unwrap();
        assert_eq!(
            episode_row(&episodes, 1).location.as_deref(),
            Some(expected.to_string_lossy().as_ref())
        );

        // Second pass is a no-op.
        let renamed = service
            .rename_show(show_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(renamed, 0);
    }
}
