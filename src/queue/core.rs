//! Generic single-worker task queue
//!
//! Each domain queue wraps one `TaskQueue`. Admission happens through
//! `try_add` under a guard closure so invariant checks and insertion are one
//! atomic step. Execution is pull-based: a scheduler calls `tick()`, which
//! finalizes a finished task and promotes the best pending one, spawning it
//! on the runtime. `tick()` never waits for task execution.
//!
//! Selection order is priority descending, then age ascending. A running
//! task is never preempted; a later, higher-priority task runs after the
//! current one finishes on its own or is cancelled through its token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::QueueStore;
use crate::queue::error::QueueError;
use crate::queue::task::{ActionKind, QueuedTask, TaskSnapshot, TaskSpec};

/// Gate value while paused; no defined priority reaches it.
const PAUSED_MIN_PRIORITY: i32 = i32::MAX;

/// Hands out task uids. Shared by every queue so uids are unique across the
/// whole system, and seeded above the highest uid ever persisted.
pub struct UidAllocator {
    next: AtomicI64,
}

impl UidAllocator {
    pub fn new(seed: i64) -> Self {
        Self {
            next: AtomicI64::new(seed),
        }
    }

    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// What actually executes a task. One implementation per domain queue.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: QueuedTask, cancel: CancellationToken) -> Result<()>;
}

/// How a task left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
}

pub type HookId = u64;

type HookFn = Arc<dyn Fn(&QueuedTask, TaskOutcome) + Send + Sync>;

struct Hook {
    id: HookId,
    filter: Option<ActionKind>,
    callback: HookFn,
}

struct RunningTask {
    task: QueuedTask,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    outcome: Arc<OnceLock<TaskOutcome>>,
    started_at: Instant,
}

struct QueueState {
    pending: Vec<QueuedTask>,
    current: Option<RunningTask>,
    /// A pending task runs only if its priority value is at least this.
    min_priority: i32,
}

/// Read-only view handed to admission guards.
pub struct QueueView<'a> {
    pub pending: &'a [QueuedTask],
    pub current: Option<&'a QueuedTask>,
}

impl QueueView<'_> {
    pub fn iter(&self) -> impl Iterator<Item = &QueuedTask> {
        self.current.into_iter().chain(self.pending.iter())
    }

    /// Any queued or running task matching the predicate.
    pub fn any<F>(&self, predicate: F) -> bool
    where
        F: Fn(&QueuedTask) -> bool,
    {
        self.iter().any(|task| predicate(task))
    }
}

pub struct TaskQueue {
    name: String,
    state: Mutex<QueueState>,
    store: Option<QueueStore>,
    uids: Arc<UidAllocator>,
    runner: Arc<dyn TaskRunner>,
    hooks: parking_lot::Mutex<Vec<Hook>>,
    next_hook_id: AtomicU64,
}

impl TaskQueue {
    /// `store` of None makes the queue transient: nothing survives restart.
    pub fn new(
        name: impl Into<String>,
        runner: Arc<dyn TaskRunner>,
        uids: Arc<UidAllocator>,
        store: Option<QueueStore>,
    ) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                current: None,
                min_priority: 0,
            }),
            store,
            uids,
            runner,
            hooks: parking_lot::Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Add a task if `guard` accepts the queue's current contents. The guard
    /// runs under the queue lock, so the check and the insert are atomic.
    pub async fn try_add<G>(&self, spec: TaskSpec, guard: G) -> Result<QueuedTask, QueueError>
    where
        G: FnOnce(&QueueView<'_>) -> Result<(), QueueError>,
    {
        let mut state = self.state.lock().await;
        {
            let view = QueueView {
                pending: &state.pending,
                current: state.current.as_ref().map(|r| &r.task),
            };
            guard(&view)?;
        }

        let task = QueuedTask {
            uid: self.uids.next(),
            spec,
            added_at: Utc::now(),
            in_progress: false,
        };
        if let Some(store) = &self.store {
            store.insert(&task).await.map_err(QueueError::Persist)?;
        }
        info!(
            queue = %self.name,
            uid = task.uid,
            task = %task.spec.name,
            priority = task.spec.priority.value(),
            "task queued"
        );
        state.pending.push(task.clone());
        Ok(task)
    }

    pub async fn add(&self, spec: TaskSpec) -> Result<QueuedTask, QueueError> {
        self.try_add(spec, |_| Ok(())).await
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// One scheduling step: finalize the current task if its worker has
    /// exited, then promote the best eligible pending task. Returns without
    /// waiting for any task to run.
    pub async fn tick(&self) {
        let mut finished: Option<(QueuedTask, TaskOutcome)> = None;

        {
            let mut state = self.state.lock().await;

            let done = state
                .current
                .as_ref()
                .map(|running| running.handle.is_finished())
                .unwrap_or(false);
            if done {
                if let Some(running) = state.current.take() {
                    let outcome = running
                        .outcome
                        .get()
                        .copied()
                        .unwrap_or(TaskOutcome::Failed);
                    info!(
                        queue = %self.name,
                        uid = running.task.uid,
                        task = %running.task.spec.name,
                        outcome = ?outcome,
                        elapsed_ms = running.started_at.elapsed().as_millis() as u64,
                        "task finished"
                    );
                    finished = Some((running.task, outcome));
                }
            }

            if state.current.is_none() {
                state.pending.sort_by(|a, b| {
                    b.spec
                        .priority
                        .value()
                        .cmp(&a.spec.priority.value())
                        .then_with(|| a.added_at.cmp(&b.added_at))
                        .then_with(|| a.uid.cmp(&b.uid))
                });
                let eligible = state
                    .pending
                    .first()
                    .map(|task| task.spec.priority.value() >= state.min_priority)
                    .unwrap_or(false);
                if eligible {
                    let mut task = state.pending.remove(0);
                    task.in_progress = true;
                    if let Some(store) = &self.store {
                        if let Err(e) = store.mark_in_progress(task.uid).await {
                            warn!(queue = %self.name, uid = task.uid, "could not persist task start: {e:#}");
                        }
                    }
                    state.current = Some(self.spawn_worker(task));
                }
            }
        }

        // Row cleanup and hooks happen outside the lock; a hook is allowed
        // to call back into this queue.
        if let Some((task, outcome)) = finished {
            if let Some(store) = &self.store {
                if let Err(e) = store.delete(task.uid).await {
                    warn!(queue = %self.name, uid = task.uid, "could not delete finished task row: {e:#}");
                }
            }
            self.fire_hooks(&task, outcome);
        }
    }

    fn spawn_worker(&self, task: QueuedTask) -> RunningTask {
        let cancel = CancellationToken::new();
        let outcome = Arc::new(OnceLock::new());
        info!(
            queue = %self.name,
            uid = task.uid,
            task = %task.spec.name,
            "task started"
        );

        let handle = tokio::spawn({
            let runner = Arc::clone(&self.runner);
            let queue_name = self.name.clone();
            let task = task.clone();
            let cancel = cancel.clone();
            let outcome = Arc::clone(&outcome);
            async move {
                let result = runner.run(task.clone(), cancel.clone()).await;
                let resolved = match &result {
                    _ if cancel.is_cancelled() => TaskOutcome::Cancelled,
                    Ok(()) => TaskOutcome::Completed,
                    Err(_) => TaskOutcome::Failed,
                };
                if let Err(e) = result {
                    error!(
                        queue = %queue_name,
                        uid = task.uid,
                        task = %task.spec.name,
                        "task failed: {e:#}"
                    );
                }
                let _ = outcome.set(resolved);
            }
        });

        RunningTask {
            task,
            handle,
            cancel,
            outcome,
            started_at: Instant::now(),
        }
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Stop promoting tasks. The current task keeps running.
    pub async fn pause(&self) {
        let mut state = self.state.lock().await;
        state.min_priority = PAUSED_MIN_PRIORITY;
        info!(queue = %self.name, "queue paused");
    }

    pub async fn unpause(&self) {
        let mut state = self.state.lock().await;
        state.min_priority = 0;
        info!(queue = %self.name, "queue unpaused");
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.min_priority == PAUSED_MIN_PRIORITY
    }

    /// Remove pending tasks by uid. With `force`, a matching current task
    /// gets its cancellation token tripped; it leaves the queue when its
    /// worker observes the token and returns.
    pub async fn remove(&self, uids: &[i64], force: bool) -> Result<usize> {
        let mut removed = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.pending.retain(|task| {
                if uids.contains(&task.uid) {
                    removed.push(task.clone());
                    false
                } else {
                    true
                }
            });
            if force {
                if let Some(running) = &state.current {
                    if uids.contains(&running.task.uid) && !running.cancel.is_cancelled() {
                        info!(
                            queue = %self.name,
                            uid = running.task.uid,
                            "cancellation requested for running task"
                        );
                        running.cancel.cancel();
                    }
                }
            }
        }

        for task in &removed {
            if let Some(store) = &self.store {
                store.delete(task.uid).await?;
            }
            debug!(queue = %self.name, uid = task.uid, task = %task.spec.name, "task removed");
        }
        Ok(removed.len())
    }

    /// Drop pending tasks, either every kind or just the listed ones.
    pub async fn clear(&self, kinds: Option<&[ActionKind]>) -> Result<usize> {
        let mut removed = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.pending.retain(|task| {
                let matches = kinds.is_none_or(|kinds| kinds.contains(&task.spec.kind));
                if matches {
                    removed.push(task.clone());
                }
                !matches
            });
        }
        for task in &removed {
            if let Some(store) = &self.store {
                store.delete(task.uid).await?;
            }
        }
        if !removed.is_empty() {
            info!(queue = %self.name, count = removed.len(), "pending tasks cleared");
        }
        Ok(removed.len())
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Run `callback` whenever a task finishes. `filter` of None matches
    /// every kind. Callbacks run on the tick that finalizes the task, after
    /// the queue lock is released.
    pub fn on<F>(&self, filter: Option<ActionKind>, callback: F) -> HookId
    where
        F: Fn(&QueuedTask, TaskOutcome) + Send + Sync + 'static,
    {
        let id = self.next_hook_id.fetch_add(1, Ordering::SeqCst);
        self.hooks.lock().push(Hook {
            id,
            filter,
            callback: Arc::new(callback),
        });
        id
    }

    pub fn off(&self, id: HookId) {
        self.hooks.lock().retain(|hook| hook.id != id);
    }

    fn fire_hooks(&self, task: &QueuedTask, outcome: TaskOutcome) {
        let callbacks: Vec<HookFn> = self
            .hooks
            .lock()
            .iter()
            .filter(|hook| hook.filter.is_none_or(|kind| kind == task.spec.kind))
            .map(|hook| Arc::clone(&hook.callback))
            .collect();
        for callback in callbacks {
            callback(task, outcome);
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Restore tasks persisted by an earlier run. Every restored task gets a
    /// fresh uid and goes back to pending, including tasks that were mid-run
    /// when the process stopped. Returns the restored tasks.
    pub async fn load(&self) -> Result<Vec<QueuedTask>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let records = store.load_all().await?;
        let mut tasks = Vec::with_capacity(records.len());
        for record in records {
            let old_uid = record.uid;
            match record.into_task() {
                Ok(mut task) => {
                    task.uid = self.uids.next();
                    task.in_progress = false;
                    tasks.push(task);
                }
                Err(e) => {
                    warn!(queue = %self.name, uid = old_uid, "dropping unreadable task row: {e:#}");
                }
            }
        }
        store.replace_all(&tasks).await?;

        let mut state = self.state.lock().await;
        state.pending = tasks.clone();
        if !tasks.is_empty() {
            info!(queue = %self.name, count = tasks.len(), "restored queued tasks");
        }
        Ok(tasks)
    }

    /// Write the full queue contents out. Rows are maintained incrementally,
    /// so this is only needed at shutdown as a consistency pass.
    pub async fn save(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let state = self.state.lock().await;
        let mut tasks = state.pending.clone();
        if let Some(running) = &state.current {
            let mut task = running.task.clone();
            task.in_progress = true;
            tasks.push(task);
        }
        store.replace_all(&tasks).await
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Pending plus current, grouped by kind, each group oldest first.
    pub async fn queue_data(&self) -> HashMap<ActionKind, Vec<TaskSnapshot>> {
        let state = self.state.lock().await;
        let mut data: HashMap<ActionKind, Vec<TaskSnapshot>> = HashMap::new();
        if let Some(running) = &state.current {
            let mut snapshot = running.task.snapshot();
            snapshot.cancel_requested = running.cancel.is_cancelled();
            data.entry(running.task.spec.kind).or_default().push(snapshot);
        }
        for task in &state.pending {
            data.entry(task.spec.kind).or_default().push(task.snapshot());
        }
        for group in data.values_mut() {
            group.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.uid.cmp(&b.uid)));
        }
        data
    }

    /// Pending plus current.
    pub async fn queue_length(&self) -> usize {
        let state = self.state.lock().await;
        state.pending.len() + usize::from(state.current.is_some())
    }

    pub async fn current_snapshot(&self) -> Option<TaskSnapshot> {
        let state = self.state.lock().await;
        state.current.as_ref().map(|running| {
            let mut snapshot = running.task.snapshot();
            snapshot.cancel_requested = running.cancel.is_cancelled();
            snapshot
        })
    }

    pub async fn is_busy(&self) -> bool {
        let state = self.state.lock().await;
        state.current.is_some() || !state.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::queue::task::TaskPriority;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Runner whose tasks block on a semaphore until the test releases them.
    struct GatedRunner {
        started: parking_lot::Mutex<Vec<i64>>,
        gate: Semaphore,
        fail: bool,
    }

    impl GatedRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: parking_lot::Mutex::new(Vec::new()),
                gate: Semaphore::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                started: parking_lot::Mutex::new(Vec::new()),
                gate: Semaphore::new(0),
                fail: true,
            })
        }

        fn started(&self) -> Vec<i64> {
            self.started.lock().clone()
        }
    }

    #[async_trait]
    impl TaskRunner for GatedRunner {
        async fn run(&self, task: QueuedTask, _cancel: CancellationToken) -> Result<()> {
            self.started.lock().push(task.uid);
            let _permit = self.gate.acquire().await.unwrap();
            if self.fail {
                anyhow::bail!("simulated task failure");
            }
            Ok(())
        }
    }

    fn queue_with(runner: Arc<GatedRunner>) -> TaskQueue {
        TaskQueue::new("test", runner, Arc::new(UidAllocator::new(1)), None)
    }

    fn spec(name: &str, priority: TaskPriority) -> TaskSpec {
        let mut spec = TaskSpec::new(ActionKind::Update, name);
        spec.priority = priority;
        spec
    }

    /// Tick until the queue drains, releasing one task at a time.
    async fn drain(queue: &TaskQueue, runner: &GatedRunner) {
        for _ in 0..200 {
            queue.tick().await;
            if queue.queue_length().await == 0 {
                return;
            }
            runner.gate.add_permits(1);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue did not drain");
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_is_priority_then_age() {
        let runner = GatedRunner::new();
        let queue = queue_with(Arc::clone(&runner));

        let t1 = queue.add(spec("first normal", TaskPriority::Normal)).await.unwrap();
        let t2 = queue.add(spec("high", TaskPriority::High)).await.unwrap();
        let t3 = queue.add(spec("second normal", TaskPriority::Normal)).await.unwrap();

        drain(&queue, &runner).await;
        assert_eq!(runner.started(), vec![t2.uid, t1.uid, t3.uid]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_task_is_never_preempted() {
        let runner = GatedRunner::new();
        let queue = queue_with(Arc::clone(&runner));

        let high = queue.add(spec("high", TaskPriority::High)).await.unwrap();
        queue.tick().await;
        assert_eq!(queue.current_snapshot().await.unwrap().uid, high.uid);

        let very_high = queue.add(spec("very high", TaskPriority::VeryHigh)).await.unwrap();
        queue.tick().await;
        queue.tick().await;
        // Still the first task; the later, higher-priority one waits.
        assert_eq!(queue.current_snapshot().await.unwrap().uid, high.uid);

        drain(&queue, &runner).await;
        assert_eq!(runner.started(), vec![high.uid, very_high.uid]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_gates_promotion() {
        let runner = GatedRunner::new();
        let queue = queue_with(Arc::clone(&runner));

        queue.pause().await;
        queue.add(spec("task", TaskPriority::VeryHigh)).await.unwrap();
        queue.tick().await;
        assert!(queue.current_snapshot().await.is_none());
        assert!(runner.started().is_empty());

        queue.unpause().await;
        queue.tick().await;
        // Let the worker task tick just spawned get polled before reading
        // the state it writes.
        tokio::task::yield_now().await;
        assert_eq!(runner.started().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_rejection_blocks_admission() {
        let runner = GatedRunner::new();
        let queue = queue_with(Arc::clone(&runner));

        queue.add(spec("task", TaskPriority::Normal)).await.unwrap();
        let result = queue
            .try_add(spec("dup", TaskPriority::Normal), |view| {
                if view.any(|t| t.spec.kind == ActionKind::Update) {
                    return Err(QueueError::AlreadyQueued {
                        kind: ActionKind::Update,
                        key: crate::providers::SourceKey::new(crate::providers::Source::TvMaze, 1),
                    });
                }
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(queue.queue_length().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hooks_fire_with_outcome_and_off_unregisters() {
        let runner = GatedRunner::new();
        let queue = queue_with(Arc::clone(&runner));

        let outcomes: Arc<parking_lot::Mutex<Vec<TaskOutcome>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        let hook = queue.on(Some(ActionKind::Update), move |_, outcome| {
            sink.lock().push(outcome);
        });

        queue.add(spec("task", TaskPriority::Normal)).await.unwrap();
        drain(&queue, &runner).await;
        assert_eq!(outcomes.lock().clone(), vec![TaskOutcome::Completed]);

        queue.off(hook);
        queue.add(spec("task 2", TaskPriority::Normal)).await.unwrap();
        drain(&queue, &runner).await;
        assert_eq!(outcomes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_reports_failure() {
        let runner = GatedRunner::failing();
        let queue = queue_with(Arc::clone(&runner));

        let outcomes: Arc<parking_lot::Mutex<Vec<TaskOutcome>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        queue.on(None, move |_, outcome| sink.lock().push(outcome));

        queue.add(spec("doomed", TaskPriority::Normal)).await.unwrap();
        drain(&queue, &runner).await;
        assert_eq!(outcomes.lock().clone(), vec![TaskOutcome::Failed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_remove_cancels_running_task() {
        let runner = GatedRunner::new();
        let queue = queue_with(Arc::clone(&runner));

        let outcomes: Arc<parking_lot::Mutex<Vec<TaskOutcome>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        queue.on(None, move |_, outcome| sink.lock().push(outcome));

        let task = queue.add(spec("task", TaskPriority::Normal)).await.unwrap();
        queue.tick().await;
        assert!(queue.current_snapshot().await.is_some());

        queue.remove(&[task.uid], true).await.unwrap();
        assert!(queue.current_snapshot().await.unwrap().cancel_requested);

        drain(&queue, &runner).await;
        assert_eq!(outcomes.lock().clone(), vec![TaskOutcome::Cancelled]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_without_force_leaves_current_running() {
        let runner = GatedRunner::new();
        let queue = queue_with(Arc::clone(&runner));

        let task = queue.add(spec("task", TaskPriority::Normal)).await.unwrap();
        queue.tick().await;
        let removed = queue.remove(&[task.uid], false).await.unwrap();
        assert_eq!(removed, 0);
        assert!(!queue.current_snapshot().await.unwrap().cancel_requested);

        drain(&queue, &runner).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_by_kind() {
        let runner = GatedRunner::new();
        let queue = queue_with(Arc::clone(&runner));
        queue.pause().await;

        queue.add(spec("update", TaskPriority::Normal)).await.unwrap();
        let mut refresh = TaskSpec::new(ActionKind::Refresh, "refresh");
        refresh.priority = TaskPriority::Normal;
        queue.add(refresh).await.unwrap();

        let cleared = queue.clear(Some(&[ActionKind::Update])).await.unwrap();
        assert_eq!(cleared, 1);
        assert_eq!(queue.queue_length().await, 1);

        let cleared = queue.clear(None).await.unwrap();
        assert_eq!(cleared, 1);
        assert_eq!(queue.queue_length().await, 0);
    }

    #[tokio::test]
    async fn test_reload_assigns_fresh_uids_and_resets_progress() {
        let db = Database::connect_memory().await.unwrap();
        let uids = Arc::new(UidAllocator::new(1));

        let runner = GatedRunner::new();
        let queue = TaskQueue::new(
            "persisted",
            Arc::clone(&runner) as Arc<dyn TaskRunner>,
            Arc::clone(&uids),
            Some(db.queue("show_queue")),
        );

        let t1 = queue.add(spec("one", TaskPriority::Normal)).await.unwrap();
        let t2 = queue.add(spec("two", TaskPriority::High)).await.unwrap();
        // Start the higher-priority task so one row is mid-run on "restart".
        queue.tick().await;
        queue.save().await.unwrap();

        // Seed the next run's allocator the way startup does.
        let max_uid = db.max_task_uid().await.unwrap();
        assert!(max_uid >= t2.uid);
        let next_uids = Arc::new(UidAllocator::new(max_uid + 1));
        let next_runner = GatedRunner::new();
        let reloaded = TaskQueue::new(
            "persisted",
            Arc::clone(&next_runner) as Arc<dyn TaskRunner>,
            next_uids,
            Some(db.queue("show_queue")),
        );

        let restored = reloaded.load().await.unwrap();
        assert_eq!(restored.len(), 2);
        let names: Vec<&str> = restored.iter().map(|t| t.spec.name.as_str()).collect();
        assert!(names.contains(&"one") && names.contains(&"two"));
        for task in &restored {
            assert!(task.uid > t1.uid.max(t2.uid));
            assert!(!task.in_progress);
        }

        // The rewritten rows carry the new uids.
        let rows = db.queue("show_queue").load_all().await.unwrap();
        let row_uids: Vec<i64> = rows.iter().map(|r| r.uid).collect();
        let task_uids: Vec<i64> = restored.iter().map(|t| t.uid).collect();
        for uid in task_uids {
            assert!(row_uids.contains(&uid));
        }
    }

    #[tokio::test]
    async fn test_finished_task_row_is_deleted() {
        let db = Database::connect_memory().await.unwrap();
        let runner = GatedRunner::new();
        let queue = TaskQueue::new(
            "persisted",
            Arc::clone(&runner) as Arc<dyn TaskRunner>,
            Arc::new(UidAllocator::new(1)),
            Some(db.queue("show_queue")),
        );

        queue.add(spec("task", TaskPriority::Normal)).await.unwrap();
        assert_eq!(db.queue("show_queue").load_all().await.unwrap().len(), 1);

        drain(&queue, &runner).await;
        assert!(db.queue("show_queue").load_all().await.unwrap().is_empty());
    }
}
