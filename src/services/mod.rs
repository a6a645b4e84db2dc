//! Domain services the task runners dispatch to

pub mod catalog;
pub mod files;
pub mod notifier;
pub mod search;
pub mod subtitles;
pub mod watched;

pub use catalog::{AddShowOptions, CatalogService, UpdateStats};
pub use files::{FileService, RefreshStats, parse_episode_slot};
pub use notifier::{DbNotifier, LogNotifier, Notifier};
pub use search::{EpisodeSearcher, LoggingSearcher, SearchOutcome};
pub use subtitles::{
    DownloadedSubtitle, NoopSubtitleProvider, SubtitleProvider, SubtitleRequest, SubtitleService,
};
pub use watched::{
    NoopWatchedSource, WatchedEvent, WatchedService, WatchedStateSource, WatchedStats,
};
