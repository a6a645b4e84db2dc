//! TMDB (The Movie Database) API client for TV metadata
//!
//! Requires an API key. Base URL: https://api.themoviedb.org/3
//!
//! Rate limiting: TMDB allows ~40 requests per 10 seconds. This client uses
//! rate limiting and retry logic to handle this gracefully.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::rate_limit::{RateLimitedClient, RetryConfig, retry_async};
use super::{
    ExternalIds, MetadataProvider, ProviderEpisode, ProviderError, ProviderPerson, ProviderShow,
    Source,
};

/// TMDB API client with rate limiting and retry logic
pub struct TmdbClient {
    client: Arc<RateLimitedClient>,
    base_url: String,
    api_key: String,
    retry_config: RetryConfig,
}

/// TV series details from TMDB
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmdbSeries {
    pub id: i64,
    pub name: String,
    pub first_air_date: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub seasons: Vec<TmdbSeasonSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmdbSeasonSummary {
    pub season_number: i64,
    pub episode_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmdbSeason {
    pub season_number: i64,
    #[serde(default)]
    pub episodes: Vec<TmdbSeasonEpisode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmdbSeasonEpisode {
    pub season_number: i64,
    pub episode_number: i64,
    pub name: Option<String>,
    pub air_date: Option<String>,
}

/// External ids for a TV series from TMDB
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmdbExternalIds {
    pub imdb_id: Option<String>,
    pub tvdb_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmdbCredits {
    pub cast: Vec<TmdbCastMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmdbCastMember {
    pub id: i64,
    pub name: String,
    pub character: Option<String>,
    pub order: Option<i64>,
}

/// Result of a /find lookup by external id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmdbFindResults {
    #[serde(default)]
    pub tv_results: Vec<TmdbFindSeries>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmdbFindSeries {
    pub id: i64,
}

impl TmdbClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Arc::new(RateLimitedClient::for_tmdb()),
            base_url: "https://api.themoviedb.org/3".to_string(),
            api_key,
            retry_config: RetryConfig {
                max_retries: 3,
                initial_interval: Duration::from_millis(500),
                max_interval: Duration::from_secs(10),
                multiplier: 2.0,
            },
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        what: &str,
    ) -> Result<T, ProviderError> {
        if !self.has_api_key() {
            return Err(ProviderError::Other(anyhow::anyhow!(
                "TMDB API key not configured"
            )));
        }

        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let url_owned = url.to_string();

        let parsed = retry_async(
            || {
                let client = client.clone();
                let url = url_owned.clone();
                let key = api_key.clone();
                async move {
                    let response = client.get_with_query(&url, &[("api_key", &key)]).await?;

                    if response.status().as_u16() == 429 {
                        warn!("TMDB rate limit hit, will retry");
                        anyhow::bail!("Rate limited (429)");
                    }
                    if response.status().as_u16() == 401 {
                        anyhow::bail!("TMDB API key is invalid");
                    }
                    if response.status().as_u16() == 404 {
                        return Ok(None);
                    }
                    if !response.status().is_success() {
                        anyhow::bail!("TMDB request failed with status: {}", response.status());
                    }

                    let value: T = response
                        .json()
                        .await
                        .context("Failed to parse TMDB response")?;
                    Ok(Some(value))
                }
            },
            &self.retry_config,
            what,
        )
        .await
        .map_err(ProviderError::Other)?;

        parsed.ok_or_else(|| ProviderError::NotFound(0))
    }

    async fn get_series(&self, tmdb_id: i64) -> Result<TmdbSeries, ProviderError> {
        debug!(tmdb_id, "Fetching series details from TMDB");
        let url = format!("{}/tv/{}", self.base_url, tmdb_id);
        self.get_json::<TmdbSeries>(&url, "tmdb_get_series")
            .await
            .map_err(|e| match e {
                ProviderError::NotFound(_) => ProviderError::NotFound(tmdb_id),
                other => other,
            })
    }

    async fn get_series_external_ids(&self, tmdb_id: i64) -> Result<TmdbExternalIds, ProviderError> {
        let url = format!("{}/tv/{}/external_ids", self.base_url, tmdb_id);
        self.get_json::<TmdbExternalIds>(&url, "tmdb_get_external_ids")
            .await
            .map_err(|e| match e {
                ProviderError::NotFound(_) => ProviderError::NotFound(tmdb_id),
                other => other,
            })
    }
}

fn first_air_year(first_air_date: Option<&str>) -> Option<i32> {
    let date = first_air_date?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .map(|d| chrono::Datelike::year(&d))
}

#[async_trait]
impl MetadataProvider for TmdbClient {
    fn source(&self) -> Source {
        Source::Tmdb
    }

    async fn fetch_show(&self, source_id: i64) -> Result<ProviderShow, ProviderError> {
        let series = self.get_series(source_id).await?;
        let externals = self.get_series_external_ids(source_id).await?;

        Ok(ProviderShow {
            source_id: series.id,
            name: series.name,
            year: first_air_year(series.first_air_date.as_deref()),
            status: series.status,
            externals: ExternalIds {
                tvmaze: None,
                thetvdb: externals.tvdb_id,
                tmdb: Some(series.id),
                imdb: externals.imdb_id,
            },
        })
    }

    async fn fetch_episodes(&self, source_id: i64) -> Result<Vec<ProviderEpisode>, ProviderError> {
        let series = self.get_series(source_id).await?;
        let mut episodes = Vec::new();

        for season in &series.seasons {
            // Season 0 is specials; they are not tracked
            if season.season_number == 0 {
                continue;
            }

            let url = format!(
                "{}/tv/{}/season/{}",
                self.base_url, source_id, season.season_number
            );
            let season_detail: TmdbSeason =
                self.get_json(&url, "tmdb_get_season").await.map_err(|e| match e {
                    ProviderError::NotFound(_) => ProviderError::NotFound(source_id),
                    other => other,
                })?;

            for ep in season_detail.episodes {
                episodes.push(ProviderEpisode {
                    season: ep.season_number,
                    episode: ep.episode_number,
                    title: ep.name,
                    air_date: ep
                        .air_date
                        .as_deref()
                        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
                });
            }
        }

        debug!(count = episodes.len(), "TMDB returned episodes");
        Ok(episodes)
    }

    async fn fetch_cast(&self, source_id: i64) -> Result<Vec<ProviderPerson>, ProviderError> {
        let url = format!("{}/tv/{}/credits", self.base_url, source_id);
        let credits: TmdbCredits =
            self.get_json(&url, "tmdb_get_credits").await.map_err(|e| match e {
                ProviderError::NotFound(_) => ProviderError::NotFound(source_id),
                other => other,
            })?;

        Ok(credits
            .cast
            .into_iter()
            .enumerate()
            .map(|(idx, member)| ProviderPerson {
                person_id: member.id,
                name: member.name,
                role: member.character,
                sort_order: member.order.unwrap_or(idx as i64),
            })
            .collect())
    }

    async fn external_ids(&self, source_id: i64) -> Result<ExternalIds, ProviderError> {
        let externals = self.get_series_external_ids(source_id).await?;
        Ok(ExternalIds {
            tvmaze: None,
            thetvdb: externals.tvdb_id,
            tmdb: Some(source_id),
            imdb: externals.imdb_id,
        })
    }

    async fn lookup_external(&self, ids: &ExternalIds) -> Result<Option<i64>, ProviderError> {
        // /find accepts one external id per call; imdb ids give the most
        // reliable matches, tvdb ids as fallback
        let mut lookups: Vec<(String, &str)> = Vec::new();
        if let Some(imdb) = &ids.imdb {
            lookups.push((imdb.clone(), "imdb_id"));
        }
        if let Some(tvdb) = ids.thetvdb {
            lookups.push((tvdb.to_string(), "tvdb_id"));
        }

        for (external_id, source_name) in lookups {
            if !self.has_api_key() {
                return Err(ProviderError::Other(anyhow::anyhow!(
                    "TMDB API key not configured"
                )));
            }

            let url = format!("{}/find/{}", self.base_url, external_id);
            let client = self.client.clone();
            let api_key = self.api_key.clone();
            let source_owned = source_name.to_string();

            let results: Option<TmdbFindResults> = retry_async(
                || {
                    let client = client.clone();
                    let url = url.clone();
                    let key = api_key.clone();
                    let external_source = source_owned.clone();
                    async move {
                        let response = client
                            .get_with_query(
                                &url,
                                &[("api_key", key), ("external_source", external_source)],
                            )
                            .await?;

                        if response.status().as_u16() == 429 {
                            warn!("TMDB rate limit hit, will retry");
                            anyhow::bail!("Rate limited (429)");
                        }
                        if response.status().as_u16() == 404 {
                            return Ok(None);
                        }
                        if !response.status().is_success() {
                            anyhow::bail!(
                                "TMDB find failed with status: {}",
                                response.status()
                            );
                        }

                        let found: TmdbFindResults = response
                            .json()
                            .await
                            .context("Failed to parse TMDB find response")?;
                        Ok(Some(found))
                    }
                },
                &self.retry_config,
                "tmdb_find_external",
            )
            .await
            .map_err(ProviderError::Other)?;

            if let Some(found) = results {
                if let Some(series) = found.tv_results.first() {
                    debug!(external_id = %source_owned, tmdb_id = series.id, "TMDB find matched");
                    return Ok(Some(series.id));
                }
            }
        }

        Ok(None)
    }
}
