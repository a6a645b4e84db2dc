//! Background jobs and their schedulers
//!
//! Every periodic concern runs on its own [`CycleScheduler`]: one short-cycle
//! tick driver per queue, the backlog rotation, the daily show-update sweep,
//! and the watched-state sync. `start_schedulers` wires and starts them all;
//! `Schedulers::shutdown` stops the loops and then saves queue state.

pub mod backlog;
pub mod show_updater;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveTime;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::queue::{PeopleQueue, SearchQueue, ShowQueue, WatchedQueue};
use crate::registry::ShowRegistry;
use crate::scheduler::{CycleAction, CycleScheduler, SchedulerConfig};

use backlog::BacklogSearcher;
use show_updater::ShowUpdater;

/// Queue selection cadence. Short, since a tick with nothing to do is cheap.
const QUEUE_TICK: Duration = Duration::from_secs(3);
/// First backlog pass waits for startup load to settle.
const BACKLOG_STARTUP_DELAY: Duration = Duration::from_secs(60);
/// The update sweep polls hourly; the start-hour window makes it daily.
const UPDATER_CYCLE: Duration = Duration::from_secs(3600);
/// First watched sync shortly after startup.
const WATCHED_STARTUP_DELAY: Duration = Duration::from_secs(30);

pub struct JobParams {
    pub db: Database,
    pub registry: Arc<ShowRegistry>,
    pub shows: Arc<ShowQueue>,
    pub search: Arc<SearchQueue>,
    pub people: Arc<PeopleQueue>,
    pub watched: Arc<WatchedQueue>,
    pub config: Arc<Config>,
}

pub struct Schedulers {
    schedulers: Vec<CycleScheduler>,
    shows: Arc<ShowQueue>,
    people: Arc<PeopleQueue>,
    watched: Arc<WatchedQueue>,
}

/// Build and start every scheduler. Each is independent; a slow job never
/// delays another queue's ticks.
pub fn start_schedulers(params: JobParams) -> Schedulers {
    let mut schedulers = Vec::new();

    let ticks: [(&'static str, Arc<dyn TickTarget>); 4] = [
        ("show_queue", Arc::clone(&params.shows) as Arc<dyn TickTarget>),
        ("search_queue", Arc::clone(&params.search) as Arc<dyn TickTarget>),
        ("people_queue", Arc::clone(&params.people) as Arc<dyn TickTarget>),
        ("watched_queue", Arc::clone(&params.watched) as Arc<dyn TickTarget>),
    ];
    for (name, target) in ticks {
        let config = SchedulerConfig {
            silent: true,
            ..SchedulerConfig::new(QUEUE_TICK)
        };
        let scheduler = CycleScheduler::new(Arc::new(QueueTick { name, target }), config);
        scheduler.start();
        schedulers.push(scheduler);
    }

    let backlog_cycle = Duration::from_secs(params.config.backlog_frequency_secs);
    let backlog = Arc::new(BacklogSearcher::new(
        params.db.clone(),
        Arc::clone(&params.registry),
        Arc::clone(&params.search),
        backlog_cycle,
        params.config.backlog_target_per_cycle,
        params.config.recent_search_days,
    ));
    let scheduler = CycleScheduler::new(
        backlog,
        SchedulerConfig {
            initial_delay: BACKLOG_STARTUP_DELAY,
            ..SchedulerConfig::new(backlog_cycle)
        },
    );
    scheduler.start();
    schedulers.push(scheduler);

    let updater = Arc::new(ShowUpdater::new(
        params.db.clone(),
        Arc::clone(&params.shows),
    ));
    let start_hour = params.config.update_hour.min(23);
    let scheduler = CycleScheduler::new(
        updater,
        SchedulerConfig {
            start_time: NaiveTime::from_hms_opt(start_hour, 0, 0),
            ..SchedulerConfig::new(UPDATER_CYCLE)
        },
    );
    scheduler.start();
    schedulers.push(scheduler);

    let sync = Arc::new(WatchedSyncJob {
        queue: Arc::clone(&params.watched),
        enabled: params.config.watched_sync_enabled,
    });
    let scheduler = CycleScheduler::new(
        sync,
        SchedulerConfig {
            initial_delay: WATCHED_STARTUP_DELAY,
            ..SchedulerConfig::new(Duration::from_secs(
                params.config.watched_sync_frequency_secs,
            ))
        },
    );
    scheduler.start();
    schedulers.push(scheduler);

    info!(count = schedulers.len(), "schedulers started");
    Schedulers {
        schedulers,
        shows: params.shows,
        people: params.people,
        watched: params.watched,
    }
}

impl Schedulers {
    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }

    /// Stop every loop, waiting out in-flight cycles, then persist queue
    /// state so pending tasks survive the restart.
    pub async fn shutdown(&self) {
        for scheduler in &self.schedulers {
            scheduler.stop().await;
        }
        for (name, result) in [
            ("show_queue", self.shows.save().await),
            ("people_queue", self.people.save().await),
            ("watched_queue", self.watched.save().await),
        ] {
            if let Err(e) = result {
                warn!(queue = name, "could not save queue state: {e:#}");
            }
        }
        info!("schedulers stopped and queue state saved");
    }
}

/// Minimal queue surface a tick driver needs.
#[async_trait]
trait TickTarget: Send + Sync {
    async fn tick(&self);
}

#[async_trait]
impl TickTarget for ShowQueue {
    async fn tick(&self) {
        ShowQueue::tick(self).await;
    }
}

#[async_trait]
impl TickTarget for SearchQueue {
    async fn tick(&self) {
        SearchQueue::tick(self).await;
    }
}

#[async_trait]
impl TickTarget for PeopleQueue {
    async fn tick(&self) {
        PeopleQueue::tick(self).await;
    }
}

#[async_trait]
impl TickTarget for WatchedQueue {
    async fn tick(&self) {
        WatchedQueue::tick(self).await;
    }
}

/// Drives one queue's selection from a scheduler cycle.
struct QueueTick {
    name: &'static str,
    target: Arc<dyn TickTarget>,
}

#[async_trait]
impl CycleAction for QueueTick {
    fn name(&self) -> &str {
        self.name
    }

    fn is_active(&self) -> bool {
        // Ticks are serialized by the queue's own lock.
        false
    }

    async fn run(&self) -> Result<()> {
        self.target.tick().await;
        Ok(())
    }
}

/// Enqueues a watched-state sync once per long cycle. The queue's own guard
/// keeps at most one sync queued or running.
struct WatchedSyncJob {
    queue: Arc<WatchedQueue>,
    enabled: bool,
}

#[async_trait]
impl CycleAction for WatchedSyncJob {
    fn name(&self) -> &str {
        "watched_sync"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn is_active(&self) -> bool {
        false
    }

    async fn run(&self) -> Result<()> {
        if self.queue.queue_sync().await?.is_none() {
            debug!("watched sync already in flight");
        }
        Ok(())
    }
}
