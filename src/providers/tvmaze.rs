//! TVMaze API client for TV show metadata
//!
//! TVMaze is a free API that doesn't require authentication.
//! Base URL: https://api.tvmaze.com

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::rate_limit::{RateLimitedClient, RetryConfig, retry_async};
use super::{
    ExternalIds, MetadataProvider, ProviderEpisode, ProviderError, ProviderPerson, ProviderShow,
    Source,
};

/// TVMaze API client
pub struct TvMazeClient {
    client: Arc<RateLimitedClient>,
    base_url: String,
    retry_config: RetryConfig,
}

/// Show details from TVMaze
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvMazeShow {
    pub id: i64,
    pub name: String,
    pub status: Option<String>,
    pub premiered: Option<String>,
    pub externals: Option<TvMazeExternals>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvMazeExternals {
    pub tvrage: Option<i64>,
    pub thetvdb: Option<i64>,
    pub imdb: Option<String>,
}

/// Episode from TVMaze
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvMazeEpisode {
    pub id: i64,
    pub name: Option<String>,
    pub season: i64,
    pub number: Option<i64>,
    pub airdate: Option<String>,
}

/// Cast entry from TVMaze (person + character pair)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvMazeCastEntry {
    pub person: TvMazePerson,
    pub character: Option<TvMazeCharacter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvMazePerson {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvMazeCharacter {
    pub id: i64,
    pub name: Option<String>,
}

impl TvMazeClient {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            client: Arc::new(RateLimitedClient::for_tvmaze()),
            base_url: base_url.unwrap_or_else(|| "https://api.tvmaze.com".to_string()),
            retry_config: RetryConfig::default(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        what: &str,
    ) -> Result<T, ProviderError> {
        let client = self.client.clone();
        let url_owned = url.to_string();

        let parsed = retry_async(
            || {
                let client = client.clone();
                let url = url_owned.clone();
                async move {
                    let response = client.get(&url).await?;

                    if response.status().as_u16() == 404 {
                        return Ok(None);
                    }
                    if response.status().as_u16() == 429 {
                        anyhow::bail!("Rate limited (429)");
                    }
                    if !response.status().is_success() {
                        anyhow::bail!("TVMaze request failed with status: {}", response.status());
                    }

                    let value: T = response
                        .json()
                        .await
                        .context("Failed to parse TVMaze response")?;
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

    async fn get_show_raw(&self, tvmaze_id: i64) -> Result<TvMazeShow, ProviderError> {
        debug!(tvmaze_id, "Fetching show from TVMaze");
        let url = format!("{}/shows/{}", self.base_url, tvmaze_id);
        self.get_json::<TvMazeShow>(&url, "tvmaze_get_show")
            .await
            .map_err(|e| match e {
                ProviderError::NotFound(_) => ProviderError::NotFound(tvmaze_id),
                other => other,
            })
    }
}

fn premiere_year(premiered: Option<&str>) -> Option<i32> {
    let date = premiered?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .map(|d| chrono::Datelike::year(&d))
}

fn to_provider_show(show: TvMazeShow) -> ProviderShow {
    let externals = show.externals.unwrap_or(TvMazeExternals {
        tvrage: None,
        thetvdb: None,
        imdb: None,
    });
    ProviderShow {
        source_id: show.id,
        name: show.name,
        year: premiere_year(show.premiered.as_deref()),
        status: show.status,
        externals: ExternalIds {
            tvmaze: Some(show.id),
            thetvdb: externals.thetvdb,
            tmdb: None,
            imdb: externals.imdb,
        },
    }
}

#[async_trait]
impl MetadataProvider for TvMazeClient {
    fn source(&self) -> Source {
        Source::TvMaze
    }

    async fn fetch_show(&self, source_id: i64) -> Result<ProviderShow, ProviderError> {
        let show = self.get_show_raw(source_id).await?;
        Ok(to_provider_show(show))
    }

    async fn fetch_episodes(&self, source_id: i64) -> Result<Vec<ProviderEpisode>, ProviderError> {
        debug!(tvmaze_id = source_id, "Fetching episodes from TVMaze");
        let url = format!("{}/shows/{}/episodes", self.base_url, source_id);
        let episodes: Vec<TvMazeEpisode> = self
            .get_json(&url, "tvmaze_get_episodes")
            .await
            .map_err(|e| match e {
                ProviderError::NotFound(_) => ProviderError::NotFound(source_id),
                other => other,
            })?;

        debug!(count = episodes.len(), "TVMaze returned episodes");
        Ok(episodes
            .into_iter()
            .filter_map(|ep| {
                // Specials come back with number = null; they are not tracked
                let number = ep.number?;
                Some(ProviderEpisode {
                    season: ep.season,
                    episode: number,
                    title: ep.name,
                    air_date: ep
                        .airdate
                        .as_deref()
                        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
                })
            })
            .collect())
    }

    async fn fetch_cast(&self, source_id: i64) -> Result<Vec<ProviderPerson>, ProviderError> {
        debug!(tvmaze_id = source_id, "Fetching cast from TVMaze");
        let url = format!("{}/shows/{}/cast", self.base_url, source_id);
        let cast: Vec<TvMazeCastEntry> = self
            .get_json(&url, "tvmaze_get_cast")
            .await
            .map_err(|e| match e {
                ProviderError::NotFound(_) => ProviderError::NotFound(source_id),
                other => other,
            })?;

        Ok(cast
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| ProviderPerson {
                person_id: entry.person.id,
                name: entry.person.name,
                role: entry.character.and_then(|c| c.name),
                sort_order: idx as i64,
            })
            .collect())
    }

    async fn external_ids(&self, source_id: i64) -> Result<ExternalIds, ProviderError> {
        let show = self.get_show_raw(source_id).await?;
        Ok(to_provider_show(show).externals)
    }

    async fn lookup_external(&self, ids: &ExternalIds) -> Result<Option<i64>, ProviderError> {
        // /lookup/shows answers one external id per request; thetvdb tends to
        // give the cleanest hits, imdb is the fallback
        let mut queries: Vec<(&str, String)> = Vec::new();
        if let Some(thetvdb) = ids.thetvdb {
            queries.push(("thetvdb", thetvdb.to_string()));
        }
        if let Some(imdb) = &ids.imdb {
            queries.push(("imdb", imdb.clone()));
        }

        for (param, value) in queries {
            let url = format!("{}/lookup/shows", self.base_url);
            let client = self.client.clone();
            let param_owned = param.to_string();
            let value_owned = value.clone();

            let found: Option<TvMazeShow> = retry_async(
                || {
                    let client = client.clone();
                    let url = url.clone();
                    let param = param_owned.clone();
                    let value = value_owned.clone();
                    async move {
                        let response = client.get_with_query(&url, &[(param, value)]).await?;
                        if response.status().as_u16() == 404 {
                            return Ok(None);
                        }
                        if !response.status().is_success() {
                            anyhow::bail!(
                                "TVMaze lookup failed with status: {}",
                                response.status()
                            );
                        }
                        let show: TvMazeShow = response
                            .json()
                            .await
                            .context("Failed to parse TVMaze lookup response")?;
                        Ok(Some(show))
                    }
                },
                &self.retry_config,
                "tvmaze_lookup_external",
            )
            .await
            .map_err(ProviderError::Other)?;

            if let Some(show) = found {
                debug!(param, value, tvmaze_id = show.id, "TVMaze lookup matched");
                return Ok(Some(show.id));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_premiere_year() {
        assert_eq!(premiere_year(Some("2011-04-17")), Some(2011));
        assert_eq!(premiere_year(Some("not-a-date")), None);
        assert_eq!(premiere_year(None), None);
    }

    #[test]
    fn test_to_provider_show_maps_externals() {
        let show = TvMazeShow {
            id: 82,
            name: "Game of Thrones".to_string(),
            status: Some("Ended".to_string()),
            premiered: Some("2011-04-17".to_string()),
            externals: Some(TvMazeExternals {
                tvrage: Some(24493),
                thetvdb: Some(121361),
                imdb: Some("tt0944947".to_string()),
            }),
        };

        let mapped = to_provider_show(show);
        assert_eq!(mapped.source_id, 82);
        assert_eq!(mapped.year, Some(2011));
        assert_eq!(mapped.externals.tvmaze, Some(82));
        assert_eq!(mapped.externals.thetvdb, Some(121361));
        assert_eq!(mapped.externals.imdb.as_deref(), Some("tt0944947"));
        assert_eq!(mapped.externals.tmdb, None);
    }

    #[test]
    fn test_specials_filtered_from_episode_mapping() {
        let raw = TvMazeEpisode {
            id: 1,
            name: Some("Special".to_string()),
            season: 1,
            number: None,
            airdate: None,
        };
        assert!(raw.number.is_none());
    }
}
