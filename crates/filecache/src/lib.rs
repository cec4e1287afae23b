// Deny unused code to catch dead code early
#![deny(unused)]
// Warn on unused dependencies
#![warn(unused_crate_dependencies)]
// Warn on redundant path prefixes (e.g., std::path::Path when Path is imported)
#![warn(unused_qualifications)]
// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Hierarchical file cache with move reconciliation and repair passes.
//!
//! - [`store`]: SQLite-backed entries, mounts and markers (`FileCache`)
//! - [`path_key`]: canonical storage-relative paths
//! - [`reconciler`]: transactional move/rename of whole subtrees
//! - [`checker`]: finds and repairs trees broken by partial moves
//! - [`dedup`]: collapses duplicate mount records
//! - [`repair`]: runs the checker and dedup across all storages
//! - [`aggregator`]: folder size calculation

pub mod aggregator;
pub mod checker;
pub mod config;
pub mod dedup;
pub mod path_key;
pub mod reconciler;
pub mod repair;
pub mod store;

#[cfg(test)]
mod repair_scenarios_test;

pub use checker::{Anomaly, CheckOptions, CheckReport, TreeChecker};
pub use config::RepairConfig;
pub use dedup::{DedupReport, MountDeduplicator};
pub use reconciler::{MoveOptions, MoveReconciler};
pub use repair::{LogSink, OutputSink, RepairHandle, RepairRunner, RepairSummary, spawn_repair};
pub use store::{CacheError, CacheStatus, Entry, EntryKind, EntryUpdate, FileCache, MountRecord, NewEntry, NewMount};
