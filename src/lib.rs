//! Showrunner - automated lifecycle service for a tracked show catalog
//!
//! The daemon keeps a catalog of TV shows in step with their metadata
//! sources and with the files on disk. All mutating work runs as tasks on
//! per-domain queues ([`queue`]), periodic concerns are driven by cycle
//! schedulers ([`scheduler`] and [`jobs`]), and the actual domain logic
//! lives in [`services`] over a SQLite database ([`db`]).

pub mod config;
pub mod db;
pub mod jobs;
pub mod providers;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod services;
