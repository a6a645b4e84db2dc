//! Episode search backend seam
//!
//! Search tasks hand a show and a set of wanted episodes to a searcher.
//! What "searching" means (indexers, RSS, a downloader) lives behind this
//! trait; episodes the searcher reports as grabbed get marked Snatched by
//! the caller.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::db::{EpisodeRecord, ShowRecord};

#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    /// Episode row ids a release was grabbed for.
    pub snatched: Vec<i64>,
}

#[async_trait]
pub trait EpisodeSearcher: Send + Sync {
    async fn search(
        &self,
        show: &ShowRecord,
        episodes: &[EpisodeRecord],
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome>;
}

/// Default searcher: records what would have been searched and grabs
/// nothing. Used until a real backend is wired in.
pub struct LoggingSearcher;

#[async_trait]
impl EpisodeSearcher for LoggingSearcher {
    async fn search(
        &self,
        show: &ShowRecord,
        episodes: &[EpisodeRecord],
        _cancel: &CancellationToken,
    ) -> Result<SearchOutcome> {
        info!(
            show = %show.name,
            episodes = episodes.len(),
            "search requested; no search backend configured"
        );
        Ok(SearchOutcome::default())
    }
}
