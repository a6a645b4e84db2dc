//! Integration tests for the backlog rotation
//!
//! The rotation's split is persisted, so these tests cover what the
//! in-process tests cannot: progress survives a real restart, and a cadence
//! change renumbers the remaining parts without re-searching shows whose
//! part already drained.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use showrunner::db::{CreateEpisode, CreateShow, Database, EpisodeRecord, EpisodeStatus, ShowRecord};
use showrunner::jobs::backlog::BacklogSearcher;
use showrunner::providers::{Source, SourceKey};
use showrunner::queue::{SearchQueue, UidAllocator};
use showrunner::registry::{RegistryEntry, ShowRegistry};
use showrunner::scheduler::CycleAction;
use showrunner::services::{EpisodeSearcher, SearchOutcome};

/// Records which shows were searched. Grabs nothing, so episode state stays
/// wanted between cycles.
struct RecordingSearcher {
    calls: Mutex<Vec<SourceKey>>,
}

impl RecordingSearcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn searched_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.calls.lock().iter().map(|key| key.source_id).collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl EpisodeSearcher for RecordingSearcher {
    async fn search(
        &self,
        show: &ShowRecord,
        _episodes: &[EpisodeRecord],
        _cancel: &CancellationToken,
    ) -> Result<SearchOutcome> {
        self.calls.lock().push(show.key());
        Ok(SearchOutcome {
            snatched: Vec::new(),
        })
    }
}

struct Stack {
    db: Database,
    registry: Arc<ShowRegistry>,
    search: Arc<SearchQueue>,
    searcher: Arc<RecordingSearcher>,
}

/// Open the database at `path` and wire a registry, recorder, and search
/// queue the way the daemon does at boot.
async fn boot(path: &Path) -> Stack {
    let db = Database::connect(path).await.unwrap();
    let registry = Arc::new(ShowRegistry::new());
    registry.hydrate(&db.shows().list().await.unwrap());
    let searcher = RecordingSearcher::new();
    let search = Arc::new(SearchQueue::new(
        db.clone(),
        Arc::clone(&registry),
        Arc::clone(&searcher) as Arc<dyn EpisodeSearcher>,
        Arc::new(UidAllocator::new(db.max_task_uid().await.unwrap() + 1)),
    ));
    Stack {
        db,
        registry,
        search,
        searcher,
    }
}

fn job(stack: &Stack, cycle: Duration, target: i64) -> BacklogSearcher {
    BacklogSearcher::new(
        stack.db.clone(),
        Arc::clone(&stack.registry),
        Arc::clone(&stack.search),
        cycle,
        target,
        7,
    )
}

/// Show with `wanted` wanted episodes, all aired long before the recent
/// window, so the recent pass never reaches the searcher for it.
async fn seed_show(stack: &Stack, source_id: i64, name: &str, wanted: i64) -> SourceKey {
    let key = SourceKey::new(Source::TvMaze, source_id);
    let record = stack
        .db
        .shows()
        .create(CreateShow {
            key,
            name: name.to_string(),
            year: Some(2012),
            status: None,
            location: None,
        })
        .await
        .unwrap();
    stack.registry.insert(RegistryEntry::from_record(&record));
    let aired = Utc::now().date_naive() - chrono::Duration::days(300);
    for n in 1..=wanted {
        stack
            .db
            .episodes()
            .upsert(CreateEpisode {
                show_id: record.id,
                season: 1,
                episode: n,
                title: None,
                air_date: Some(aired),
                status: EpisodeStatus::Wanted,
            })
            .await
            .unwrap();
    }
    key
}

/// Tick the search queue until it drains. Search tasks finish on their own,
/// so no gating is needed.
async fn drain(search: &SearchQueue) {
    for _ in 0..200 {
        search.tick().await;
        if search.queue_length().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("search queue did not drain");
}

#[tokio::test]
async fn rotation_progress_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("showrunner.db");

    // 14 wanted episodes at 5 per cycle: Alpha alone fills part 1, Bravo and
    // Charlie share part 2, Delta lands in part 3.
    let parts;
    {
        let stack = boot(&path).await;
        seed_show(&stack, 1, "Alpha", 5).await;
        seed_show(&stack, 2, "Bravo", 3).await;
        seed_show(&stack, 3, "Charlie", 4).await;
        seed_show(&stack, 4, "Delta", 2).await;

        let job = job(&stack, Duration::from_secs(86400), 5);
        job.run().await.unwrap();
        drain(&stack.search).await;

        parts = stack
            .db
            .settings()
            .get_i64("backlog.parts")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parts, 3);
        assert_eq!(stack.searcher.searched_ids(), vec![1]);
        stack.db.close().await;
    }

    // A fresh process resumes the rotation where the old one stopped instead
    // of rebuilding the split.
    let stack = boot(&path).await;
    assert_eq!(
        stack.db.settings().get_i64("backlog.parts").await.unwrap(),
        Some(3)
    );
    assert_eq!(stack.db.backlog().count().await.unwrap(), 3);

    let job = job(&stack, Duration::from_secs(86400), 5);
    for _ in 1..parts {
        job.run().await.unwrap();
        drain(&stack.search).await;
    }
    assert_eq!(stack.db.backlog().count().await.unwrap(), 0);
    // Only the shows the first process never reached.
    assert_eq!(stack.searcher.searched_ids(), vec![2, 3, 4]);
    stack.db.close().await;
}

#[tokio::test]
async fn cadence_change_never_re_searches_drained_shows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("showrunner.db");

    let stack = boot(&path).await;
    for (id, name) in [(1, "Alpha"), (2, "Bravo"), (3, "Charlie"), (4, "Delta")] {
        seed_show(&stack, id, name, 3).await;
    }

    // 12 wanted at 4 per cycle builds a 3-part rotation; the first daily
    // cycle drains part 1, which holds Alpha and Bravo.
    let daily = job(&stack, Duration::from_secs(86400), 4);
    daily.run().await.unwrap();
    drain(&stack.search).await;
    assert_eq!(stack.searcher.searched_ids(), vec![1, 2]);

    // Halving the cycle doubles the remaining part numbers; the next cycle
    // picks up the renumbered rotation mid-flight.
    let half = job(&stack, Duration::from_secs(43200), 4);
    half.run().await.unwrap();
    drain(&stack.search).await;
    assert_eq!(
        stack.db.settings().get_i64("backlog.parts").await.unwrap(),
        Some(6)
    );
    assert_eq!(
        stack
            .db
            .settings()
            .get_i64("backlog.frequency_secs")
            .await
            .unwrap(),
        Some(43200)
    );

    // Every show searched exactly once across the cadence change.
    assert_eq!(stack.searcher.searched_ids(), vec![1, 2, 3, 4]);
    assert_eq!(stack.db.backlog().count().await.unwrap(), 0);
    stack.db.close().await;
}
