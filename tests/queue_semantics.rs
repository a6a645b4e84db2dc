//! Integration tests for queue scheduling semantics
//!
//! These tests drive a [`TaskQueue`] through its public surface the way the
//! daemon does: enqueue through guards, advance with tick, and restore from
//! the persisted tables after a simulated restart.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use assert_matches::assert_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use showrunner::db::Database;
use showrunner::queue::{
    ActionKind, QueueError, QueuedTask, TaskPriority, TaskQueue, TaskRunner, TaskSpec,
    UidAllocator,
};

/// Runner whose tasks block until a permit is released, so tests control
/// exactly which task is "running" at any point.
struct GatedRunner {
    gate: Semaphore,
    finished: Mutex<Vec<i64>>,
}

impl GatedRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            finished: Mutex::new(Vec::new()),
        })
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    fn finished(&self) -> Vec<i64> {
        self.finished.lock().clone()
    }
}

#[async_trait]
impl TaskRunner for GatedRunner {
    async fn run(&self, task: QueuedTask, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            permit = self.gate.acquire() => {
                permit.unwrap().forget();
                self.finished.lock().push(task.uid);
                Ok(())
            }
            _ = cancel.cancelled() => Ok(()),
        }
    }
}

fn spec(kind: ActionKind, name: &str, priority: TaskPriority) -> TaskSpec {
    let mut spec = TaskSpec::new(kind, name);
    spec.priority = priority;
    spec
}

fn transient_queue(runner: Arc<GatedRunner>) -> TaskQueue {
    TaskQueue::new("test_queue", runner, Arc::new(UidAllocator::new(1)), None)
}

/// Tick until the queue is idle, releasing one permit per running task.
async fn drain(queue: &TaskQueue, runner: &GatedRunner) {
    for _ in 0..500 {
        queue.tick().await;
        if queue.queue_length().await == 0 {
            return;
        }
        runner.release(1);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("queue did not drain");
}

#[tokio::test(start_paused = true)]
async fn selection_order_is_priority_then_age() {
    let runner = GatedRunner::new();
    let queue = transient_queue(Arc::clone(&runner));

    // Enqueued low-first; priorities must dominate insertion order, and
    // equal priorities fall back to enqueue order.
    let low = queue
        .add(spec(ActionKind::CastUpdate, "low", TaskPriority::Low))
        .await
        .unwrap();
    let normal_a = queue
        .add(spec(ActionKind::Update, "normal a", TaskPriority::Normal))
        .await
        .unwrap();
    let normal_b = queue
        .add(spec(ActionKind::Update, "normal b", TaskPriority::Normal))
        .await
        .unwrap();
    let high = queue
        .add(spec(ActionKind::Refresh, "high", TaskPriority::High))
        .await
        .unwrap();

    drain(&queue, &runner).await;
    assert_eq!(
        runner.finished(),
        vec![high.uid, normal_a.uid, normal_b.uid, low.uid]
    );
}

#[tokio::test(start_paused = true)]
async fn running_task_is_never_preempted() {
    let runner = GatedRunner::new();
    let queue = transient_queue(Arc::clone(&runner));

    let refresh = queue
        .add(spec(ActionKind::Refresh, "refresh a", TaskPriority::High))
        .await
        .unwrap();
    let update = queue
        .add(spec(ActionKind::Update, "update b", TaskPriority::Normal))
        .await
        .unwrap();
    queue.tick().await;
    assert_eq!(queue.current_snapshot().await.unwrap().uid, refresh.uid);

    // A higher-priority arrival waits its turn while the refresh runs, but
    // jumps ahead of the older normal-priority task.
    let add = queue
        .add(spec(ActionKind::Add, "add c", TaskPriority::VeryHigh))
        .await
        .unwrap();
    queue.tick().await;
    assert_eq!(queue.current_snapshot().await.unwrap().uid, refresh.uid);

    drain(&queue, &runner).await;
    assert_eq!(runner.finished(), vec![refresh.uid, add.uid, update.uid]);
}

#[tokio::test(start_paused = true)]
async fn guard_rejection_leaves_the_queue_untouched() {
    let runner = GatedRunner::new();
    let queue = transient_queue(Arc::clone(&runner));

    queue
        .add(spec(ActionKind::Update, "only", TaskPriority::Normal))
        .await
        .unwrap();

    let result = queue
        .try_add(
            spec(ActionKind::Update, "duplicate", TaskPriority::Normal),
            |view| {
                if view.any(|t| t.spec.kind == ActionKind::Update) {
                    return Err(QueueError::SyncInFlight);
                }
                Ok(())
            },
        )
        .await;
    assert_matches!(result, Err(QueueError::SyncInFlight));
    assert_eq!(queue.queue_length().await, 1);
}

#[tokio::test(start_paused = true)]
async fn pause_holds_pending_work_but_not_the_running_task() {
    let runner = GatedRunner::new();
    let queue = transient_queue(Arc::clone(&runner));

    let first = queue
        .add(spec(ActionKind::Update, "first", TaskPriority::Normal))
        .await
        .unwrap();
    queue.tick().await;
    queue
        .add(spec(ActionKind::Refresh, "second", TaskPriority::High))
        .await
        .unwrap();
    queue.pause().await;

    // The in-flight task still completes.
    runner.release(1);
    for _ in 0..50 {
        queue.tick().await;
        if queue.current_snapshot().await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(runner.finished(), vec![first.uid]);

    // Nothing new is promoted while paused.
    for _ in 0..10 {
        queue.tick().await;
    }
    assert!(queue.current_snapshot().await.is_none());
    assert_eq!(queue.queue_length().await, 1);

    queue.unpause().await;
    drain(&queue, &runner).await;
    assert_eq!(runner.finished().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn remove_is_refused_for_running_tasks_unless_forced() {
    let runner = GatedRunner::new();
    let queue = transient_queue(Arc::clone(&runner));

    let task = queue
        .add(spec(ActionKind::Update, "running", TaskPriority::Normal))
        .await
        .unwrap();
    queue.tick().await;
    assert!(queue.is_busy().await);

    assert_eq!(queue.remove(&[task.uid], false).await.unwrap(), 0);

    // Forced removal cancels the worker rather than pulling it out directly,
    // so the removed count still covers pending tasks only.
    assert_eq!(queue.remove(&[task.uid], true).await.unwrap(), 0);
    let current = queue.current_snapshot().await.unwrap();
    assert!(current.cancel_requested);

    for _ in 0..50 {
        queue.tick().await;
        if queue.queue_length().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(queue.queue_length().await, 0);
    assert!(runner.finished().is_empty());
}

#[tokio::test]
async fn persisted_queue_survives_a_restart_with_fresh_uids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("showrunner.db");

    let first_uids;
    {
        let db = Database::connect(&path).await.unwrap();
        let runner = GatedRunner::new();
        let queue = TaskQueue::new(
            "show_queue",
            runner,
            Arc::new(UidAllocator::new(1)),
            Some(db.queue("show_queue")),
        );
        let a = queue
            .add(spec(ActionKind::Update, "update a", TaskPriority::Normal))
            .await
            .unwrap();
        let b = queue
            .add(spec(ActionKind::Refresh, "refresh b", TaskPriority::High))
            .await
            .unwrap();
        first_uids = vec![a.uid, b.uid];
        queue.save().await.unwrap();
        db.close().await;
    }

    let db = Database::connect(&path).await.unwrap();
    let max_uid = db.max_task_uid().await.unwrap();
    assert!(max_uid >= *first_uids.iter().max().unwrap());

    let runner = GatedRunner::new();
    let queue = TaskQueue::new(
        "show_queue",
        Arc::clone(&runner) as Arc<dyn TaskRunner>,
        Arc::new(UidAllocator::new(max_uid + 1)),
        Some(db.queue("show_queue")),
    );
    let restored = queue.load().await.unwrap();
    assert_eq!(restored.len(), 2);
    // Restored tasks get uids from the new allocator, above anything the
    // previous process handed out.
    for task in &restored {
        assert!(task.uid > max_uid);
        assert!(!first_uids.contains(&task.uid));
    }
    let names: Vec<&str> = restored.iter().map(|t| t.spec.name.as_str()).collect();
    assert!(names.contains(&"update a"));
    assert!(names.contains(&"refresh b"));

    // The restored queue still schedules by priority.
    drain(&queue, &runner).await;
    let data = queue.queue_data().await;
    assert!(data.is_empty());
    db.close().await;
}

#[tokio::test(start_paused = true)]
async fn completion_hooks_fire_with_kind_filter() {
    let runner = GatedRunner::new();
    let queue = transient_queue(Arc::clone(&runner));

    let seen: Arc<Mutex<Vec<(i64, ActionKind)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    queue.on(Some(ActionKind::Update), move |task, _outcome| {
        sink.lock().push((task.uid, task.spec.kind));
    });

    let update = queue
        .add(spec(ActionKind::Update, "update", TaskPriority::Normal))
        .await
        .unwrap();
    queue
        .add(spec(ActionKind::Refresh, "refresh", TaskPriority::Normal))
        .await
        .unwrap();
    drain(&queue, &runner).await;

    let fired = seen.lock().clone();
    assert_eq!(fired, vec![(update.uid, ActionKind::Update)]);
}
