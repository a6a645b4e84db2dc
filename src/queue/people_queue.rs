//! Cast update queue
//!
//! Billing refreshes are slow provider calls with no urgency, so they run on
//! their own queue instead of blocking show work. Updates and adds chain a
//! cast task here; duplicates for the same show collapse silently.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::Database;
use crate::providers::SourceKey;
use crate::queue::core::{TaskQueue, TaskRunner, UidAllocator};
use crate::queue::error::QueueError;
use crate::queue::task::{ActionKind, QueuedTask, TaskPriority, TaskSpec};
use crate::registry::ShowRegistry;
use crate::services::CatalogService;

pub struct PeopleQueue {
    queue: TaskQueue,
}

impl PeopleQueue {
    pub fn new(
        db: &Database,
        registry: Arc<ShowRegistry>,
        catalog: Arc<CatalogService>,
        uids: Arc<UidAllocator>,
    ) -> Self {
        let runner = Arc::new(PeopleTaskRunner { registry, catalog });
        Self {
            queue: TaskQueue::new(
                "people_queue",
                runner,
                uids,
                Some(db.queue("people_queue")),
            ),
        }
    }

    /// Queue a billing refresh for one show. Returns None when one is
    /// already pending or running for that show.
    pub async fn queue_cast_update(
        &self,
        key: SourceKey,
        show_name: &str,
    ) -> Result<Option<QueuedTask>, QueueError> {
        let mut spec = TaskSpec::new(ActionKind::CastUpdate, format!("Cast Update: {show_name}"));
        spec.show = Some(key);
        spec.priority = TaskPriority::Low;

        match self
            .queue
            .try_add(spec, move |view| {
                if view.any(|t| t.spec.kind == ActionKind::CastUpdate && t.key() == Some(key)) {
                    return Err(QueueError::AlreadyQueued {
                        kind: ActionKind::CastUpdate,
                        key,
                    });
                }
                Ok(())
            })
            .await
        {
            Ok(task) => Ok(Some(task)),
            Err(QueueError::AlreadyQueued { .. }) => {
                debug!(key = %key, "cast update already queued");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn tick(&self) {
        self.queue.tick().await;
    }

    pub async fn load(&self) -> Result<Vec<QueuedTask>> {
        self.queue.load().await
    }

    pub async fn save(&self) -> Result<()> {
        self.queue.save().await
    }

    pub async fn queue_length(&self) -> usize {
        self.queue.queue_length().await
    }

    pub async fn is_busy(&self) -> bool {
        self.queue.is_busy().await
    }
}

struct PeopleTaskRunner {
    registry: Arc<ShowRegistry>,
    catalog: Arc<CatalogService>,
}

#[async_trait]
impl TaskRunner for PeopleTaskRunner {
    async fn run(&self, task: QueuedTask, cancel: CancellationToken) -> Result<()> {
        let key = task
            .key()
            .ok_or_else(|| anyhow!("cast task {} has no show key", task.uid))?;
        let Some(entry) = self.registry.resolve(key) else {
            // The show was removed while this task waited.
            warn!(key = %key, "cast update for an untracked show; skipping");
            return Ok(());
        };
        self.catalog.update_cast(entry.show_id, &cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::fake::FakeProvider;
    use crate::providers::{
        ExternalIds, MetadataProvider, ProviderPerson, ProviderRegistry, ProviderShow, Source,
    };
    use crate::services::AddShowOptions;
    use std::time::Duration;

    struct Harness {
        db: Database,
        catalog: Arc<CatalogService>,
        fake: Arc<FakeProvider>,
        queue: PeopleQueue,
    }

    async fn harness() -> Harness {
        let db = Database::connect_memory().await.unwrap();
        let registry = Arc::new(ShowRegistry::new());
        let fake = Arc::new(FakeProvider::new(Source::TvMaze));
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::clone(&fake) as Arc<dyn MetadataProvider>);
        let catalog = Arc::new(CatalogService::new(
            db.clone(),
            Arc::clone(&registry),
            Arc::new(providers),
        ));
        let queue = PeopleQueue::new(
            &db,
            registry,
            Arc::clone(&catalog),
            Arc::new(UidAllocator::new(1)),
        );
        Harness {
            db,
            catalog,
            fake,
            queue,
        }
    }

    async fn drain(queue: &PeopleQueue) {
        for _ in 0..200 {
            queue.tick().await;
            if queue.queue_length().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("people queue did not drain");
    }

    #[tokio::test]
    async fn test_dedup_collapses_to_none() {
        let h = harness().await;
        let key = SourceKey::new(Source::TvMaze, 82);

        assert!(
            h.queue
                .queue_cast_update(key, "Game of Thrones")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            h.queue
                .queue_cast_update(key, "Game of Thrones")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(h.queue.queue_length().await, 1);
    }

    #[tokio::test]
    async fn test_runner_updates_billing() {
        let h = harness().await;
        h.fake.insert_show(ProviderShow {
            source_id: 82,
            name: "Game of Thrones".to_string(),
            year: Some(2011),
            status: Some("Ended".to_string()),
            externals: ExternalIds::default(),
        });
        h.fake.set_cast(
            82,
            vec![ProviderPerson {
                person_id: 9,
                name: "Peter Dinklage".to_string(),
                role: Some("Tyrion Lannister".to_string()),
                sort_order: 0,
            }],
        );
        let show = h
            .catalog
            .add_show(
                SourceKey::new(Source::TvMaze, 82),
                AddShowOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        h.queue
            .queue_cast_update(show.key(), &show.name)
            .await
            .unwrap();
        drain(&h.queue).await;

        let people = h.db.people().for_show(show.id).await.unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].name, "Peter Dinklage");
    }

    #[tokio::test]
    async fn test_untracked_show_completes_quietly() {
        let h = harness().await;
        h.queue
            .queue_cast_update(SourceKey::new(Source::TvMaze, 404), "Gone")
            .await
            .unwrap();
        drain(&h.queue).await;
        assert_eq!(h.queue.queue_length().await, 0);
    }
}
