//! Watched-state synchronization
//!
//! Pulls play-state events from an external tracker and applies them to
//! episode rows. Lookups go through the registry's remap table, so events
//! recorded against a show's pre-switch identity still land.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::providers::SourceKey;
use crate::registry::ShowRegistry;

#[derive(Debug, Clone)]
pub struct WatchedEvent {
    pub key: SourceKey,
    pub season: i64,
    pub episode: i64,
    pub watched: bool,
}

/// External tracker the sync pulls from.
#[async_trait]
pub trait WatchedStateSource: Send + Sync {
    async fn pull(&self) -> Result<Vec<WatchedEvent>>;
}

/// Stand-in when no tracker is configured.
pub struct NoopWatchedSource;

#[async_trait]
impl WatchedStateSource for NoopWatchedSource {
    async fn pull(&self) -> Result<Vec<WatchedEvent>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchedStats {
    pub applied: usize,
    pub unknown_show: usize,
    pub unknown_episode: usize,
}

pub struct WatchedService {
    db: Database,
    registry: Arc<ShowRegistry>,
    source: Arc<dyn WatchedStateSource>,
}

impl WatchedService {
    pub fn new(
        db: Database,
        registry: Arc<ShowRegistry>,
        source: Arc<dyn WatchedStateSource>,
    ) -> Self {
        Self {
            db,
            registry,
            source,
        }
    }

    /// Pull pending events and apply them.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<WatchedStats> {
        let events = self.source.pull().await?;
        self.apply(&events, cancel).await
    }

    pub async fn apply(
        &self,
        events: &[WatchedEvent],
        cancel: &CancellationToken,
    ) -> Result<WatchedStats> {
        let mut stats = WatchedStats::default();
        for event in events {
            if cancel.is_cancelled() {
                info!("watched sync cancelled");
                break;
            }
            let Some(entry) = self.registry.resolve(event.key) else {
                debug!(key = %event.key, "watched event for untracked show");
                stats.unknown_show += 1;
                continue;
            };
            let applied = self
                .db
                .episodes()
                .set_watched(entry.show_id, event.season, event.episode, event.watched)
                .await?;
            if applied {
                stats.applied += 1;
            } else {
                warn!(
                    show = %entry.name,
                    season = event.season,
                    episode = event.episode,
                    "watched event for unknown episode slot"
                );
                stats.unknown_episode += 1;
            }
        }
        if stats.applied > 0 {
            info!(applied = stats.applied, "watched states applied");
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreateEpisode, CreateShow, EpisodeStatus};
    use crate::providers::Source;

    async fn seed(db: &Database, registry: &ShowRegistry) -> i64 {
        let show = db
            .shows()
            .create(CreateShow {
                key: SourceKey::new(Source::TvMaze, 82),
                name: "Game of Thrones".to_string(),
                year: None,
                status: None,
                location: None,
            })
            .await
            .unwrap();
        db.episodes()
            .upsert(CreateEpisode {
                show_id: show.id,
                season: 1,
                episode: 1,
                title: None,
                air_date: None,
                status: EpisodeStatus::Downloaded,
            })
            .await
            .unwrap();
        registry.hydrate(&[show.clone()]);
        show.id
    }

    #[tokio::test]
    async fn test_apply_follows_remapped_identity() {
        let db = Database::connect_memory().await.unwrap();
        let registry = Arc::new(ShowRegistry::new());
        let show_id = seed(&db, &registry).await;

        // The show switched sources after the tracker last saw it.
        let old = SourceKey::new(Source::TvMaze, 82);
        let new = SourceKey::new(Source::Tmdb, 1399);
        registry.rekey(old, new);

        let service = WatchedService::new(db.clone(), registry, Arc::new(NoopWatchedSource));
        let stats = service
            .apply(
                &[
                    WatchedEvent {
                        key: old,
                        season: 1,
                        episode: 1,
                        watched: true,
                    },
                    WatchedEvent {
                        key: old,
                        season: 9,
                        episode: 9,
                        watched: true,
                    },
                    WatchedEvent {
                        key: SourceKey::new(Source::TvMaze, 999),
                        season: 1,
                        episode: 1,
                        watched: true,
                    },
                ],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(stats.applied, 1);
        assert_eq!(stats.unknown_episode, 1);
        assert_eq!(stats.unknown_show, 1);

        let episodes = db.episodes().for_show(show_id).await.unwrap();
        assert!(episodes[0].watched);
    }
}
