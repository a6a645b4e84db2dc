//! Catalog maintenance against metadata providers
//!
//! Owns the add/update/remove lifecycle of a tracked show: fetching the
//! provider's view, diffing it into the local tables and keeping the
//! registry in step. Episode lifecycle state is never clobbered by a
//! refresh; only titles and air dates follow the provider.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{NaiveDate, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{
    CreateEpisode, CreateShow, Database, EpisodeStatus, ShowRecord, UpdateShow, UpsertPerson,
};
use crate::providers::{MetadataProvider, ProviderRegistry, SourceKey};
use crate::registry::{RegistryEntry, ShowRegistry};

#[derive(Debug, Clone, Default)]
pub struct AddShowOptions {
    pub location: Option<String>,
    /// Aired episodes start out Wanted instead of Skipped.
    pub wanted_backfill: bool,
}

/// What an update pass changed.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateStats {
    pub episodes_added: usize,
    pub episodes_refreshed: usize,
    pub episodes_removed: usize,
    pub became_wanted: usize,
    /// False when the pass stopped early on cancellation.
    pub completed: bool,
}

pub struct CatalogService {
    db: Database,
    registry: Arc<ShowRegistry>,
    providers: Arc<ProviderRegistry>,
}

impl CatalogService {
    pub fn new(db: Database, registry: Arc<ShowRegistry>, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            db,
            registry,
            providers,
        }
    }

    fn provider(&self, key: SourceKey) -> Result<Arc<dyn MetadataProvider>> {
        self.providers
            .get(key.source)
            .ok_or_else(|| anyhow!("source {} is not configured", key.source))
    }

    /// Fetch a show from its source and start tracking it.
    pub async fn add_show(
        &self,
        key: SourceKey,
        options: AddShowOptions,
        cancel: &CancellationToken,
    ) -> Result<ShowRecord> {
        if self.registry.contains(key) {
            bail!("show {key} is already tracked");
        }
        let provider = self.provider(key)?;
        let fetched = provider
            .fetch_show(key.source_id)
            .await
            .with_context(|| format!("failed to fetch {key}"))?;

        let record = self
            .db
            .shows()
            .create(CreateShow {
                key,
                name: fetched.name.clone(),
                year: fetched.year,
                status: fetched.status.clone(),
                location: options.location.clone(),
            })
            .await?;
        self.registry.insert(RegistryEntry::from_record(&record));

        let episodes = provider.fetch_episodes(key.source_id).await?;
        let today = Utc::now().date_naive();
        let mut seeded = 0usize;
        for episode in &episodes {
            if cancel.is_cancelled() {
                info!(show = %record.name, "add interrupted; remaining episodes arrive on next update");
                break;
            }
            let status = if aired(episode.air_date, today) {
                if options.wanted_backfill {
                    EpisodeStatus::Wanted
                } else {
                    EpisodeStatus::Skipped
                }
            } else {
                EpisodeStatus::Unaired
            };
            self.db
                .episodes()
                .upsert(CreateEpisode {
                    show_id: record.id,
                    season: episode.season,
                    episode: episode.episode,
                    title: episode.title.clone(),
                    air_date: episode.air_date,
                    status,
                })
                .await?;
            seeded += 1;
        }

        info!(
            show = %record.name,
            key = %key,
            episodes = seeded,
            "show added to catalog"
        );
        Ok(record)
    }

    /// Re-fetch a show and reconcile the local tables with the provider:
    /// new episodes appear, known ones get fresh titles and dates, vanished
    /// ones are pruned unless they reached a state worth keeping.
    pub async fn update_from_source(
        &self,
        show_id: i64,
        cancel: &CancellationToken,
    ) -> Result<UpdateStats> {
        let show = self
            .db
            .shows()
            .get(show_id)
            .await?
            .ok_or_else(|| anyhow!("show {show_id} is not in the catalog"))?;
        let provider = self.provider(show.key())?;

        let fetched = provider
            .fetch_show(show.source_id)
            .await
            .with_context(|| format!("failed to fetch {}", show.key()))?;
        self.db
            .shows()
            .update(
                show.id,
                UpdateShow {
                    name: Some(fetched.name.clone()),
                    year: fetched.year,
                    status: fetched.status.clone(),
                    ..Default::default()
                },
            )
            .await?;
        if fetched.name != show.name {
            self.registry.insert(RegistryEntry {
                show_id: show.id,
                key: show.key(),
                name: fetched.name.clone(),
                year: fetched.year.or(show.year),
            });
        }

        let remote = provider.fetch_episodes(show.source_id).await?;
        let existing = self.db.episodes().for_show(show.id).await?;
        let existing_by_slot: HashMap<(i64, i64), _> = existing
            .iter()
            .map(|e| ((e.season, e.episode), e))
            .collect();
        let mut remote_slots: HashSet<(i64, i64)> = HashSet::with_capacity(remote.len());

        let today = Utc::now().date_naive();
        let mut stats = UpdateStats::default();

        for episode in &remote {
            if cancel.is_cancelled() {
                info!(show = %show.name, "update cancelled before finishing episode sync");
                return Ok(stats);
            }
            remote_slots.insert((episode.season, episode.episode));

            match existing_by_slot.get(&(episode.season, episode.episode)) {
                None => {
                    let status = if aired(episode.air_date, today) {
                        EpisodeStatus::Wanted
                    } else {
                        EpisodeStatus::Unaired
                    };
                    self.db
                        .episodes()
                        .upsert(CreateEpisode {
                            show_id: show.id,
                            season: episode.season,
                            episode: episode.episode,
                            title: episode.title.clone(),
                            air_date: episode.air_date,
                            status,
                        })
                        .await?;
                    stats.episodes_added += 1;
                    if status == EpisodeStatus::Wanted {
                        stats.became_wanted += 1;
                    }
                }
                Some(known) => {
                    let changed =
                        known.title != episode.title || known.air_date != episode.air_date;
                    if changed {
                        self.db
                            .episodes()
                            .upsert(CreateEpisode {
                                show_id: show.id,
                                season: episode.season,
                                episode: episode.episode,
                                title: episode.title.clone(),
                                air_date: episode.air_date,
                                status: known.status,
                            })
                            .await?;
                        stats.episodes_refreshed += 1;
                    }
                    // Air date reached while we were not looking.
                    let effective_date = episode.air_date.or(known.air_date);
                    if known.status == EpisodeStatus::Unaired && aired(effective_date, today) {
                        self.db
                            .episodes()
                            .set_status(known.id, EpisodeStatus::Wanted)
                            .await?;
                        stats.became_wanted += 1;
                    }
                }
            }
        }

        // Episodes the provider no longer lists.
        let mut prune = Vec::new();
        for record in &existing {
            if remote_slots.contains(&(record.season, record.episode)) {
                continue;
            }
            if record.status.has_retained_value() {
                warn!(
                    show = %show.name,
                    season = record.season,
                    episode = record.episode,
                    status = %record.status,
                    "episode vanished from source but has local state; keeping"
                );
            } else {
                prune.push(record.id);
            }
        }
        if !prune.is_empty() {
            stats.episodes_removed = self.db.episodes().delete_many(&prune).await? as usize;
        }

        if cancel.is_cancelled() {
            return Ok(stats);
        }
        self.db.shows().touch_last_updated(show.id).await?;
        stats.completed = true;

        info!(
            show = %show.name,
            added = stats.episodes_added,
            refreshed = stats.episodes_refreshed,
            removed = stats.episodes_removed,
            wanted = stats.became_wanted,
            "show updated from source"
        );
        Ok(stats)
    }

    /// Replace the stored cast with the provider's current billing.
    pub async fn update_cast(&self, show_id: i64, cancel: &CancellationToken) -> Result<usize> {
        let show = self
            .db
            .shows()
            .get(show_id)
            .await?
            .ok_or_else(|| anyhow!("show {show_id} is not in the catalog"))?;
        let provider = self.provider(show.key())?;

        let cast = provider.fetch_cast(show.source_id).await?;
        if cancel.is_cancelled() {
            debug!(show = %show.name, "cast update cancelled before write");
            return Ok(0);
        }
        let people: Vec<UpsertPerson> = cast
            .into_iter()
            .map(|person| UpsertPerson {
                source_person_id: person.person_id,
                name: person.name,
                role: person.role,
                sort_order: person.sort_order,
            })
            .collect();
        let count = people.len();
        self.db.people().replace_for_show(show.id, &people).await?;
        debug!(show = %show.name, people = count, "cast updated");
        Ok(count)
    }

    /// Drop a show and everything attached to it.
    pub async fn remove_show(&self, show_id: i64) -> Result<()> {
        let show = self
            .db
            .shows()
            .get(show_id)
            .await?
            .ok_or_else(|| anyhow!("show {show_id} is not in the catalog"))?;

        let episodes = self.db.episodes().for_show(show.id).await?;
        let ids: Vec<i64> = episodes.iter().map(|e| e.id).collect();
        if !ids.is_empty() {
            self.db.episodes().delete_many(&ids).await?;
        }
        self.db.people().delete_for_show(show.id).await?;
        self.db.switch_ops().delete(show.key()).await?;
        self.db.shows().delete(show.id).await?;
        self.registry.remove(show.key());

        info!(show = %show.name, key = %show.key(), "show removed from catalog");
        Ok(())
    }
}

fn aired(date: Option<NaiveDate>, today: NaiveDate) -> bool {
    date.is_some_and(|d| d <= today)
}
