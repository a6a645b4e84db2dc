//! Task queues and their admission rules

pub mod core;
pub mod error;
pub mod people_queue;
pub mod search_queue;
pub mod show_queue;
pub mod switch;
pub mod task;
pub mod watched_queue;

pub use self::core::{HookId, TaskOutcome, TaskQueue, TaskRunner, UidAllocator};
pub use error::QueueError;
pub use people_queue::PeopleQueue;
pub use search_queue::SearchQueue;
pub use show_queue::{ShowQueue, SwitchRequest};
pub use switch::SwitchEngine;
pub use task::{
    ActionKind, QueuedTask, SearchSegment, TaskFlags, TaskPriority, TaskSnapshot, TaskSpec,
};
pub use watched_queue::WatchedQueue;
