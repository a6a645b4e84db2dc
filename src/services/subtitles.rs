//! Subtitle fetching for downloaded episodes

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::db::{Database, EpisodeStatus};

#[derive(Debug, Clone)]
pub struct SubtitleRequest {
    pub show_name: String,
    pub season: i64,
    pub episode: i64,
    pub video_path: PathBuf,
    /// Languages still missing for this episode.
    pub languages: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadedSubtitle {
    pub language: String,
    pub path: PathBuf,
}

/// Backend that actually locates and downloads subtitle files.
#[async_trait]
pub trait SubtitleProvider: Send + Sync {
    /// Languages this provider is configured to fetch.
    fn languages(&self) -> Vec<String>;

    async fn fetch(&self, request: &SubtitleRequest) -> Result<Vec<DownloadedSubtitle>>;
}

/// Stand-in when no subtitle backend is configured.
pub struct NoopSubtitleProvider;

#[async_trait]
impl SubtitleProvider for NoopSubtitleProvider {
    fn languages(&self) -> Vec<String> {
        Vec::new()
    }

    async fn fetch(&self, _request: &SubtitleRequest) -> Result<Vec<DownloadedSubtitle>> {
        Ok(Vec::new())
    }
}

pub struct SubtitleService {
    db: Database,
    provider: Arc<dyn SubtitleProvider>,
}

impl SubtitleService {
    pub fn new(db: Database, provider: Arc<dyn SubtitleProvider>) -> Self {
        Self { db, provider }
    }

    /// Fetch missing subtitle languages for every episode of the show that
    /// has a file on disk. Returns how many subtitle files were fetched.
    pub async fn fetch_for_show(&self, show_id: i64, cancel: &CancellationToken) -> Result<usize> {
        let wanted_languages = self.provider.languages();
        if wanted_languages.is_empty() {
            debug!(show_id, "no subtitle languages configured");
            return Ok(0);
        }
        let show = self
            .db
            .shows()
            .get(show_id)
            .await?
            .ok_or_else(|| anyhow!("show {show_id} is not in the catalog"))?;

        let episodes = self.db.episodes().for_show(show.id).await?;
        let mut fetched = 0usize;
        for record in &episodes {
            if cancel.is_cancelled() {
                info!(show = %show.name, "subtitle fetch cancelled");
                break;
            }
            if !matches!(
                record.status,
                EpisodeStatus::Downloaded | EpisodeStatus::Archived
            ) {
                continue;
            }
            let Some(location) = record.location.as_deref() else {
                continue;
            };
            let missing: Vec<String> = wanted_languages
                .iter()
                .filter(|lang| !record.subtitles.contains(lang))
                .cloned()
                .collect();
            if missing.is_empty() {
                continue;
            }

            let results = self
                .provider
                .fetch(&SubtitleRequest {
                    show_name: show.name.clone(),
                    season: record.season,
                    episode: record.episode,
                    video_path: PathBuf::from(location),
                    languages: missing,
                })
                .await?;
            if results.is_empty() {
                continue;
            }

            let mut languages = record.subtitles.clone();
            for subtitle in &results {
                if !languages.contains(&subtitle.language) {
                    languages.push(subtitle.language.clone());
                }
            }
            languages.sort();
            self.db.episodes().set_subtitles(record.id, &languages).await?;
            fetched += results.len();
        }

        if fetched > 0 {
            info!(show = %show.name, fetched, "subtitles fetched");
        }
        Ok(fetched)
    }
}
