//! Metadata source abstraction
//!
//! Every tracked show is backed by exactly one external source at a time,
//! identified by a `SourceKey`. Providers implement `MetadataProvider`; the
//! `ProviderRegistry` holds the configured set and is how the rest of the
//! system asks "who can answer for this source".

pub mod rate_limit;
pub mod tmdb;
pub mod tvmaze;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// External metadata source a show can be backed by.
///
/// `TheTvDb` is recognized as a source identity (it appears in external-id
/// maps) but no client is shipped for it; asking the registry for it yields
/// `None`, which the switch task reports as `source_not_found`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    TvMaze,
    TheTvDb,
    Tmdb,
}

impl Source {
    pub const ALL: &[Source] = &[Source::TvMaze, Source::TheTvDb, Source::Tmdb];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::TvMaze => "tvmaze",
            Source::TheTvDb => "thetvdb",
            Source::Tmdb => "tmdb",
        }
    }

    pub fn parse(s: &str) -> Option<Source> {
        match s {
            "tvmaze" => Some(Source::TvMaze),
            "thetvdb" => Some(Source::TheTvDb),
            "tmdb" => Some(Source::Tmdb),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a show on one source. The dedup key for queue invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    pub source: Source,
    pub source_id: i64,
}

impl SourceKey {
    pub fn new(source: Source, source_id: i64) -> Self {
        Self { source, source_id }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.source_id)
    }
}

/// Cross-source identifier set for one show, as reported by a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    pub tvmaze: Option<i64>,
    pub thetvdb: Option<i64>,
    pub tmdb: Option<i64>,
    pub imdb: Option<String>,
}

impl ExternalIds {
    /// Numeric id carried for the given source, if any.
    pub fn for_source(&self, source: Source) -> Option<i64> {
        match source {
            Source::TvMaze => self.tvmaze,
            Source::TheTvDb => self.thetvdb,
            Source::Tmdb => self.tmdb,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tvmaze.is_none() && self.thetvdb.is_none() && self.tmdb.is_none() && self.imdb.is_none()
    }
}

/// Show metadata in provider-neutral form.
#[derive(Debug, Clone)]
pub struct ProviderShow {
    pub source_id: i64,
    pub name: String,
    pub year: Option<i32>,
    pub status: Option<String>,
    pub externals: ExternalIds,
}

/// One episode in provider-neutral form.
#[derive(Debug, Clone)]
pub struct ProviderEpisode {
    pub season: i64,
    pub episode: i64,
    pub title: Option<String>,
    pub air_date: Option<NaiveDate>,
}

/// One cast member in provider-neutral form.
#[derive(Debug, Clone)]
pub struct ProviderPerson {
    pub person_id: i64,
    pub name: String,
    pub role: Option<String>,
    pub sort_order: i64,
}

/// Provider failures the switch verifier needs to tell apart from plain
/// transport errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("show {0} not found on source")]
    NotFound(i64),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A metadata source client.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    fn source(&self) -> Source;

    async fn fetch_show(&self, source_id: i64) -> Result<ProviderShow, ProviderError>;

    async fn fetch_episodes(&self, source_id: i64) -> Result<Vec<ProviderEpisode>, ProviderError>;

    async fn fetch_cast(&self, source_id: i64) -> Result<Vec<ProviderPerson>, ProviderError>;

    /// The cross-source id set this provider knows for one of its shows.
    async fn external_ids(&self, source_id: i64) -> Result<ExternalIds, ProviderError>;

    /// Find this provider's own id for a show known only by its ids on other
    /// sources. `Ok(None)` means the mapping genuinely has no candidate.
    async fn lookup_external(&self, ids: &ExternalIds) -> Result<Option<i64>, ProviderError>;
}

/// The configured set of providers, keyed by source.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<Source, Arc<dyn MetadataProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn MetadataProvider>) {
        self.providers.insert(provider.source(), provider);
    }

    pub fn get(&self, source: Source) -> Option<Arc<dyn MetadataProvider>> {
        self.providers.get(&source).cloned()
    }

    pub fn configured(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = self.providers.keys().copied().collect();
        sources.sort();
        sources
    }
}
