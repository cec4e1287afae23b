//! Repair orchestration: checks every storage, then deduplicates mounts.
//!
//! Per-storage failures are collected into the summary instead of aborting the
//! run. Cancellation is honoured between storages and before the mount step,
//! never in the middle of a subtree.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::checker::{Anomaly, CheckReport, TreeChecker};
use crate::config::RepairConfig;
use crate::dedup::MountDeduplicator;
use crate::store::{CacheError, FileCache, Result};

/// Meta key written once mount deduplication has completed.
pub const DEDUP_DONE_MARKER: &str = "repair.dedup_mounts.done";

// ── Output ───────────────────────────────────────────────────────────

/// Where the runner reports progress and problems.
pub trait OutputSink {
    fn info(&self, message: &str);
    fn warning(&self, message: &str);
}

/// Routes output to the `log` facade.
pub struct LogSink;

impl OutputSink for LogSink {
    fn info(&self, message: &str) {
        log::info!("Repair: {message}");
    }

    fn warning(&self, message: &str) {
        log::warn!("Repair: {message}");
    }
}

/// Totals of one repair run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub storages_checked: u64,
    /// Stranded paths rewritten.
    pub entries_fixed: u64,
    pub duplicates_merged: u64,
    pub orphans_found: u64,
    pub orphans_removed: u64,
    pub mounts_removed: u64,
    /// Cycles and subtrees skipped at the depth bound.
    pub fatal_anomalies: u64,
    pub errors: Vec<String>,
    pub was_cancelled: bool,
}

impl RepairSummary {
    fn absorb(&mut self, report: &CheckReport) {
        self.entries_fixed += report.stranded_fixed;
        self.duplicates_merged += report.duplicates_merged;
        self.orphans_found += report.orphans_found;
        self.orphans_removed += report.orphans_removed;
        self.fatal_anomalies += report.fatal;
    }
}

// ── Runner ───────────────────────────────────────────────────────────

pub struct RepairRunner<'a> {
    cache: &'a FileCache,
    config: RepairConfig,
    sink: &'a dyn OutputSink,
}

impl<'a> RepairRunner<'a> {
    pub fn new(cache: &'a FileCache, config: RepairConfig, sink: &'a dyn OutputSink) -> Self {
        Self { cache, config, sink }
    }

    /// Run every step in order. Only failing to list storages aborts the run.
    pub fn run(&self, cancelled: &AtomicBool) -> Result<RepairSummary> {
        let start = Instant::now();
        let mut summary = RepairSummary::default();
        let checker = TreeChecker::new(self.cache, self.config.check_options());

        for storage_id in self.cache.storage_ids()? {
            if cancelled.load(Ordering::Relaxed) {
                return Ok(self.cancelled(summary));
            }
            summary.storages_checked += 1;
            match checker.repair_storage(storage_id) {
                Ok(report) => {
                    summary.absorb(&report);
                    self.report_anomalies(storage_id, &report);
                }
                Err(e) => {
                    self.sink.warning(&format!("Storage {storage_id}: check failed: {e}"));
                    summary.errors.push(format!("storage {storage_id}: {e}"));
                }
            }
        }

        if cancelled.load(Ordering::Relaxed) {
            return Ok(self.cancelled(summary));
        }
        self.dedup_mounts(&mut summary);

        self.sink.info(&format!(
            "Checked {} storages in {}ms: {} paths fixed, {} duplicates merged, {} orphans ({} rows removed), \
             {} mounts removed, {} fatal, {} errors",
            summary.storages_checked,
            start.elapsed().as_millis(),
            summary.entries_fixed,
            summary.duplicates_merged,
            summary.orphans_found,
            summary.orphans_removed,
            summary.mounts_removed,
            summary.fatal_anomalies,
            summary.errors.len(),
        ));
        Ok(summary)
    }

    fn dedup_mounts(&self, summary: &mut RepairSummary) {
        if self.config.skip_completed_steps {
            match self.cache.get_meta(DEDUP_DONE_MARKER) {
                Ok(Some(_)) => {
                    self.sink.info("Mount deduplication already done, skipping");
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    summary.errors.push(format!("mount dedup marker: {e}"));
                    return;
                }
            }
        }

        let result = MountDeduplicator::new(self.cache, self.config.mount_dedup_threshold)
            .run()
            .and_then(|report| {
                self.cache.set_meta(DEDUP_DONE_MARKER, "1")?;
                Ok(report)
            });
        match result {
            Ok(report) => {
                summary.mounts_removed = report.rows_removed;
                if report.rows_removed > 0 {
                    self.sink.info(&format!(
                        "Removed {} duplicate mounts in {} groups",
                        report.rows_removed, report.groups_examined
                    ));
                }
            }
            Err(e) => {
                self.sink.warning(&format!("Mount deduplication failed: {e}"));
                summary.errors.push(format!("mount dedup: {e}"));
            }
        }
    }

    /// Surface the anomalies a caller should know about. Plain repairs are only logged.
    fn report_anomalies(&self, storage_id: i64, report: &CheckReport) {
        for anomaly in &report.anomalies {
            match anomaly {
                Anomaly::StrandedPath { .. } | Anomaly::DuplicatePath { .. } => {}
                _ => self.sink.warning(&format!("Storage {storage_id}: {anomaly}")),
            }
        }
        if report.changes() > 0 {
            self.sink.info(&format!(
                "Storage {storage_id}: {} paths fixed, {} duplicates merged",
                report.stranded_fixed, report.duplicates_merged
            ));
        }
    }

    fn cancelled(&self, mut summary: RepairSummary) -> RepairSummary {
        self.sink.info(&format!("Cancelled after {} storages", summary.storages_checked));
        summary.was_cancelled = true;
        summary
    }
}

// ── Background run ───────────────────────────────────────────────────

/// Handle returned by [`spawn_repair`] for cancellation.
pub struct RepairHandle {
    cancelled: Arc<AtomicBool>,
}

impl RepairHandle {
    /// Ask the run to stop at the next storage boundary. Finished storages stay repaired.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Start a repair run on a background thread with its own DB connection.
pub fn spawn_repair(
    db_path: &Path,
    config: RepairConfig,
    sink: Arc<dyn OutputSink + Send + Sync>,
) -> Result<(RepairHandle, JoinHandle<Result<RepairSummary>>)> {
    let cancelled = Arc::new(AtomicBool::new(false));
    let handle = RepairHandle {
        cancelled: Arc::clone(&cancelled),
    };

    let db_path: PathBuf = db_path.to_path_buf();
    let thread_handle = std::thread::Builder::new()
        .name("cache-repair".into())
        .spawn(move || {
            let cache = FileCache::open(&db_path)?;
            RepairRunner::new(&cache, config, sink.as_ref()).run(&cancelled)
        })
        .map_err(CacheError::Io)?;

    Ok((handle, thread_handle))
}
