//! Task model shared by every queue
//!
//! A `TaskSpec` is what domain factories build; the queue stamps it with a
//! uid and timestamp when it accepts it, producing a `QueuedTask`. The kind
//! tag is closed so invariant checks and persistence stay exhaustive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::SourceKey;

/// Every kind of work the queues know how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Add,
    Update,
    ForceUpdate,
    WebForceUpdate,
    Refresh,
    Rename,
    Subtitle,
    SwitchSource,
    CastUpdate,
    WatchedSync,
    BacklogSearch,
    RecentSearch,
    ManualSearch,
}

impl ActionKind {
    pub const ALL: &[ActionKind] = &[
        ActionKind::Add,
        ActionKind::Update,
        ActionKind::ForceUpdate,
        ActionKind::WebForceUpdate,
        ActionKind::Refresh,
        ActionKind::Rename,
        ActionKind::Subtitle,
        ActionKind::SwitchSource,
        ActionKind::CastUpdate,
        ActionKind::WatchedSync,
        ActionKind::BacklogSearch,
        ActionKind::RecentSearch,
        ActionKind::ManualSearch,
    ];

    /// Stable tag used in persisted rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Add => "add",
            ActionKind::Update => "update",
            ActionKind::ForceUpdate => "force_update",
            ActionKind::WebForceUpdate => "web_force_update",
            ActionKind::Refresh => "refresh",
            ActionKind::Rename => "rename",
            ActionKind::Subtitle => "subtitle",
            ActionKind::SwitchSource => "switch_source",
            ActionKind::CastUpdate => "cast_update",
            ActionKind::WatchedSync => "watched_sync",
            ActionKind::BacklogSearch => "backlog_search",
            ActionKind::RecentSearch => "recent_search",
            ActionKind::ManualSearch => "manual_search",
        }
    }

    pub fn parse(s: &str) -> Option<ActionKind> {
        ActionKind::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Human label for queue displays and task names.
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Add => "Add",
            ActionKind::Update => "Update",
            ActionKind::ForceUpdate => "Force Update",
            ActionKind::WebForceUpdate => "Web Force Update",
            ActionKind::Refresh => "Refresh",
            ActionKind::Rename => "Rename",
            ActionKind::Subtitle => "Subtitles",
            ActionKind::SwitchSource => "Switch Source",
            ActionKind::CastUpdate => "Cast Update",
            ActionKind::WatchedSync => "Watched Sync",
            ActionKind::BacklogSearch => "Backlog Search",
            ActionKind::RecentSearch => "Recent Search",
            ActionKind::ManualSearch => "Manual Search",
        }
    }

    /// The update family shares one dedup slot per show.
    pub fn is_update(&self) -> bool {
        matches!(
            self,
            ActionKind::Update | ActionKind::ForceUpdate | ActionKind::WebForceUpdate
        )
    }

    pub fn is_search(&self) -> bool {
        matches!(
            self,
            ActionKind::BacklogSearch | ActionKind::RecentSearch | ActionKind::ManualSearch
        )
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority. Selection orders by value descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    VeryHigh,
}

impl TaskPriority {
    pub fn value(&self) -> i32 {
        match self {
            TaskPriority::Low => 10,
            TaskPriority::Normal => 20,
            TaskPriority::High => 30,
            TaskPriority::VeryHigh => 40,
        }
    }

    pub fn from_value(value: i32) -> Option<TaskPriority> {
        match value {
            10 => Some(TaskPriority::Low),
            20 => Some(TaskPriority::Normal),
            30 => Some(TaskPriority::High),
            40 => Some(TaskPriority::VeryHigh),
            _ => None,
        }
    }
}

/// Behavior toggles a task carries. Persisted as a JSON column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFlags {
    /// Skip safety checks where the kind supports it.
    #[serde(default)]
    pub force: bool,
    /// The request came from an interactive surface rather than a job.
    #[serde(default)]
    pub web: bool,
    /// Continue a previously interrupted multi-phase task.
    #[serde(default)]
    pub resume: bool,
    /// Suppress the implicit refresh at the end of an update.
    #[serde(default)]
    pub skip_refresh: bool,
    /// The task was issued by an automated job, not an operator.
    #[serde(default)]
    pub automatic: bool,
    /// On add, seed already-aired episodes as wanted instead of skipped.
    #[serde(default)]
    pub wanted_backfill: bool,
}

/// Which episodes a search task covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum SearchSegment {
    /// Explicit episode row ids, resolved when the task was enqueued.
    Episodes(Vec<i64>),
    /// Wanted episodes aired within the last N days, resolved at run time.
    RecentDays(i64),
}

/// What a factory hands to a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    pub kind: ActionKind,
    pub priority: TaskPriority,
    /// Owning entity, when the kind has one. This is the dedup key.
    pub show: Option<SourceKey>,
    pub flags: TaskFlags,
    pub segment: Option<SearchSegment>,
}

impl TaskSpec {
    pub fn new(kind: ActionKind, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            priority: TaskPriority::Normal,
            show: None,
            flags: TaskFlags::default(),
            segment: None,
        }
    }

    /// A sibling spec for a follow-up operation on the same show: shares the
    /// owning key and flags, carries nothing mutable from the original.
    pub fn derived(&self, kind: ActionKind, priority: TaskPriority, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            priority,
            show: self.show,
            flags: self.flags,
            segment: None,
        }
    }
}

/// A task accepted by a queue.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub uid: i64,
    pub spec: TaskSpec,
    pub added_at: DateTime<Utc>,
    pub in_progress: bool,
}

impl QueuedTask {
    pub fn key(&self) -> Option<SourceKey> {
        self.spec.show
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            uid: self.uid,
            name: self.spec.name.clone(),
            kind: self.spec.kind,
            priority: self.spec.priority,
            show: self.spec.show,
            flags: self.spec.flags,
            in_progress: self.in_progress,
            cancel_requested: false,
            added_at: self.added_at,
        }
    }
}

/// Read-model view of one pending or running task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub uid: i64,
    pub name: String,
    pub kind: ActionKind,
    pub priority: TaskPriority,
    pub show: Option<SourceKey>,
    pub flags: TaskFlags,
    pub in_progress: bool,
    /// True when the running task's token has been tripped.
    pub cancel_requested: bool,
    pub added_at: DateTime<Utc>,
}
