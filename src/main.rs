//! Daemon entry point. Restores persisted queue state, wires the per-show
//! task queues to their services, and runs everything from cycle schedulers
//! until shut down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use showrunner::config::Config;
use showrunner::db::Database;
use showrunner::jobs::{self, JobParams};
use showrunner::providers::ProviderRegistry;
use showrunner::providers::tmdb::TmdbClient;
use showrunner::providers::tvmaze::TvMazeClient;
use showrunner::queue::{
    ActionKind, PeopleQueue, SearchQueue, ShowQueue, SwitchEngine, TaskOutcome, UidAllocator,
    WatchedQueue,
};
use showrunner::registry::ShowRegistry;
use showrunner::services::{
    CatalogService, DbNotifier, FileService, LoggingSearcher, NoopSubtitleProvider,
    NoopWatchedSource, SubtitleService, WatchedService,
};

/// Settings marker written once the first full catalog update completes.
const FIRST_UPDATE_KEY: &str = "catalog.first_update_done";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "showrunner=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Showrunner");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;
    let db = Database::connect(&config.database_path).await?;
    tracing::info!(path = %config.database_path.display(), "Database connected");

    // The in-memory key index mirrors the shows table for the queues'
    // synchronous admission checks.
    let registry = Arc::new(ShowRegistry::new());
    let shows = db.shows().list().await?;
    registry.hydrate(&shows);
    tracing::info!(shows = shows.len(), "Registry hydrated");

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(TvMazeClient::new(config.tvmaze_base_url.clone())));
    if let Some(key) = config.tmdb_api_key.clone() {
        providers.register(Arc::new(TmdbClient::new(key)));
    }
    let providers = Arc::new(providers);
    tracing::info!(sources = ?providers.configured(), "Metadata providers ready");

    // Task uids keep growing across restarts.
    let max_uid = db.max_task_uid().await?;
    let uids = Arc::new(UidAllocator::new(max_uid + 1));

    let catalog = Arc::new(CatalogService::new(
        db.clone(),
        Arc::clone(&registry),
        Arc::clone(&providers),
    ));
    let files = Arc::new(FileService::new(db.clone()));
    let subtitles = Arc::new(SubtitleService::new(
        db.clone(),
        Arc::new(NoopSubtitleProvider),
    ));
    let notifier = Arc::new(DbNotifier::new(db.notifications()));
    let switcher = Arc::new(SwitchEngine::new(
        db.clone(),
        Arc::clone(&registry),
        Arc::clone(&providers),
        Arc::clone(&catalog),
        Arc::clone(&files),
        notifier,
    ));
    let watched_service = Arc::new(WatchedService::new(
        db.clone(),
        Arc::clone(&registry),
        Arc::new(NoopWatchedSource),
    ));

    let people = Arc::new(PeopleQueue::new(
        &db,
        Arc::clone(&registry),
        Arc::clone(&catalog),
        Arc::clone(&uids),
    ));
    let show_queue = Arc::new(ShowQueue::new(
        db.clone(),
        Arc::clone(&registry),
        catalog,
        files,
        subtitles,
        switcher,
        Arc::clone(&people),
        Arc::clone(&uids),
    ));
    let search = Arc::new(SearchQueue::new(
        db.clone(),
        Arc::clone(&registry),
        Arc::new(LoggingSearcher),
        Arc::clone(&uids),
    ));
    let watched = Arc::new(WatchedQueue::new(&db, watched_service, Arc::clone(&uids)));

    let restored_shows = show_queue.load().await?;
    let restored_people = people.load().await?;
    let restored_watched = watched.load().await?;
    tracing::info!(
        show = restored_shows.len(),
        people = restored_people.len(),
        watched = restored_watched.len(),
        "Queues restored"
    );

    if db.settings().get(FIRST_UPDATE_KEY).await?.is_none() {
        register_first_update_hook(&show_queue, db.clone());
    }

    let schedulers = jobs::start_schedulers(JobParams {
        db: db.clone(),
        registry: Arc::clone(&registry),
        shows: Arc::clone(&show_queue),
        search: Arc::clone(&search),
        people: Arc::clone(&people),
        watched: Arc::clone(&watched),
        config: Arc::clone(&config),
    });

    tracing::info!("Showrunner running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    schedulers.shutdown().await;
    db.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// One-shot hook: record in settings when the first routine update finishes,
/// so first-run migrations elsewhere can tell a populated catalog from a
/// fresh one.
fn register_first_update_hook(show_queue: &ShowQueue, db: Database) {
    let fired = Arc::new(AtomicBool::new(false));
    show_queue.on(Some(ActionKind::Update), move |task, outcome| {
        if outcome != TaskOutcome::Completed || fired.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(uid = task.uid, "first catalog update completed");
        let db = db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.settings().set(FIRST_UPDATE_KEY, "1").await {
                tracing::warn!("could not record first-update marker: {e:#}");
            }
        });
    });
}
