//! Tree consistency checker: finds and repairs subtrees broken by partial moves.
//!
//! A storage is walked top-down from its root(s) with an explicit stack. Each
//! child's expected path is its parent's (already corrected) path plus the
//! child's own name. Two anomalies are repaired on the way:
//!
//! - **Stranded path**: the child's path doesn't match the expected path. The
//!   path is rewritten and the walk continues below it with the new prefix.
//! - **Duplicate path**: the expected path is already taken by another entry.
//!   That entry wins; the stranded entry's children are re-parented onto it and
//!   the stranded entry is deleted.
//!
//! Entries not reachable from a root either hang off a missing parent (orphaned
//! subtree) or sit on a parent cycle. Cycles are reported and never touched.
//!
//! Each top-level subtree is repaired in its own transaction, so a walk that
//! trips the depth bound leaves its subtree exactly as it was.

use std::collections::{HashMap, HashSet};

use crate::path_key;
use crate::store::{CacheError, Entry, EntryUpdate, FileCache, Result};

// ── Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    /// Delete orphaned subtrees instead of only reporting them.
    pub delete_orphans: bool,
    /// Fixed depth bound. When unset, derived from the storage contents.
    pub max_depth: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    StrandedPath {
        entry_id: i64,
        path: String,
        expected: String,
    },
    DuplicatePath {
        stranded_id: i64,
        authoritative_id: i64,
        path: String,
    },
    /// A stranded folder with children collides with a file.
    UnresolvedConflict {
        stranded_id: i64,
        occupant_id: i64,
        path: String,
    },
    Orphan {
        entry_id: i64,
        path: String,
        missing_parent: i64,
    },
    Cycle {
        entry_ids: Vec<i64>,
    },
    DepthExceeded {
        top_id: i64,
        entry_id: i64,
        depth: usize,
    },
}

impl Anomaly {
    /// Anomalies with no safe repair; the affected entries are left untouched.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Anomaly::Cycle { .. } | Anomaly::DepthExceeded { .. })
    }
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::StrandedPath { entry_id, path, expected } => {
                write!(f, "Stranded entry {entry_id}: '{path}' should be '{expected}'")
            }
            Anomaly::DuplicatePath {
                stranded_id,
                authoritative_id,
                path,
            } => write!(
                f,
                "Duplicate entry {stranded_id} for '{path}', merged into {authoritative_id}"
            ),
            Anomaly::UnresolvedConflict {
                stranded_id,
                occupant_id,
                path,
            } => write!(
                f,
                "Stranded folder {stranded_id} collides with file {occupant_id} at '{path}', left as is"
            ),
            Anomaly::Orphan {
                entry_id,
                path,
                missing_parent,
            } => write!(f, "Orphaned entry {entry_id} at '{path}' (parent {missing_parent} missing)"),
            Anomaly::Cycle { entry_ids } => write!(f, "Parent cycle through entries {entry_ids:?}"),
            Anomaly::DepthExceeded { top_id, entry_id, depth } => write!(
                f,
                "Depth bound exceeded at entry {entry_id} (depth {depth}) below {top_id}, subtree skipped"
            ),
        }
    }
}

/// Outcome of one checker pass over one storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub storage_id: i64,
    pub stranded_fixed: u64,
    pub duplicates_merged: u64,
    pub orphans_found: u64,
    pub orphans_removed: u64,
    pub unresolved: u64,
    pub fatal: u64,
    pub anomalies: Vec<Anomaly>,
}

impl CheckReport {
    fn new(storage_id: i64) -> Self {
        Self {
            storage_id,
            ..Default::default()
        }
    }

    /// Number of rows written or deleted by the pass.
    pub fn changes(&self) -> u64 {
        self.stranded_fixed + self.duplicates_merged + self.orphans_removed
    }

    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }

    fn absorb(&mut self, other: CheckReport) {
        self.stranded_fixed += other.stranded_fixed;
        self.duplicates_merged += other.duplicates_merged;
        self.orphans_found += other.orphans_found;
        self.orphans_removed += other.orphans_removed;
        self.unresolved += other.unresolved;
        self.fatal += other.fatal;
        self.anomalies.extend(other.anomalies);
    }

    fn record_fatal(&mut self, anomaly: Anomaly) {
        log::warn!("Checker: storage {}: {anomaly}", self.storage_id);
        self.fatal += 1;
        self.anomalies.push(anomaly);
    }
}

/// Stack frame of the top-down walk.
struct Pending {
    id: i64,
    /// Corrected path of this entry; children are checked against it.
    path: String,
    depth: usize,
}

/// Walk stack that holds each id at most once until it is popped.
#[derive(Default)]
struct WalkStack {
    items: Vec<Pending>,
    queued: HashSet<i64>,
}

impl WalkStack {
    fn push(&mut self, pending: Pending) {
        if self.queued.insert(pending.id) {
            self.items.push(pending);
        }
    }

    fn pop(&mut self) -> Option<Pending> {
        let pending = self.items.pop()?;
        self.queued.remove(&pending.id);
        Some(pending)
    }
}

/// Where an unreachable entry's parent chain ends.
enum ChainEnd {
    /// Reaches something already walked or skipped.
    Settled,
    Orphan { top_id: i64, missing_parent: i64 },
    Cycle(Vec<i64>),
}

// ── TreeChecker ──────────────────────────────────────────────────────

pub struct TreeChecker<'a> {
    cache: &'a FileCache,
    options: CheckOptions,
}

impl<'a> TreeChecker<'a> {
    pub fn new(cache: &'a FileCache, options: CheckOptions) -> Self {
        Self { cache, options }
    }

    /// Detect anomalies without writing anything.
    pub fn check_storage(&self, storage_id: i64) -> Result<CheckReport> {
        self.run(storage_id, false)
    }

    /// Detect and repair anomalies. Running it twice in a row yields no changes the second time.
    pub fn repair_storage(&self, storage_id: i64) -> Result<CheckReport> {
        let report = self.run(storage_id, true)?;
        if report.changes() > 0 {
            log::info!(
                "Checker: storage {storage_id}: fixed {} stranded, merged {} duplicates, removed {} orphaned rows",
                report.stranded_fixed,
                report.duplicates_merged,
                report.orphans_removed,
            );
        }
        Ok(report)
    }

    fn run(&self, storage_id: i64, apply: bool) -> Result<CheckReport> {
        let mut report = CheckReport::new(storage_id);
        let entries = self.cache.entries_for_storage(storage_id)?;
        if entries.is_empty() {
            return Ok(report);
        }
        let bound = self.depth_bound(&entries);
        let mut visited = HashSet::new();
        let mut skipped = HashSet::new();

        for root in entries.iter().filter(|e| e.parent_id.is_none()) {
            self.repair_top(root, apply, bound, &mut visited, &mut skipped, &mut report)?;
        }

        // Merges may have deleted rows, so classify against the current state
        let remaining = if apply {
            self.cache.entries_for_storage(storage_id)?
        } else {
            entries
        };
        let (orphan_tops, cycles) = classify_unreachable(&remaining, &visited, &skipped);

        for cycle in cycles {
            report.record_fatal(Anomaly::Cycle { entry_ids: cycle });
        }

        let by_id: HashMap<i64, &Entry> = remaining.iter().map(|e| (e.id, e)).collect();
        for (top_id, missing_parent) in orphan_tops {
            let Some(top) = by_id.get(&top_id) else { continue };
            log::warn!("Checker: storage {storage_id}: orphaned subtree at '{}' ({top_id})", top.path);
            report.orphans_found += 1;
            report.anomalies.push(Anomaly::Orphan {
                entry_id: top_id,
                path: top.path.clone(),
                missing_parent,
            });

            if self.options.delete_orphans {
                if apply {
                    report.orphans_removed += self.cache.remove_subtree(top_id)?;
                }
            } else {
                // Keep the subtree but still make its inner paths consistent
                self.repair_top(top, apply, bound, &mut visited, &mut skipped, &mut report)?;
            }
        }

        Ok(report)
    }

    /// Deepest acyclic chain the walk may follow before it's treated as a cycle.
    fn depth_bound(&self, entries: &[Entry]) -> usize {
        if let Some(max) = self.options.max_depth {
            return max;
        }
        let deepest_path = entries.iter().map(|e| path_key::depth(&e.path)).max().unwrap_or(0);
        deepest_path.max(entries.len()) + 1
    }

    /// Walk one top-level subtree as a single atomic unit.
    fn repair_top(
        &self,
        top: &Entry,
        apply: bool,
        bound: usize,
        visited: &mut HashSet<i64>,
        skipped: &mut HashSet<i64>,
        report: &mut CheckReport,
    ) -> Result<()> {
        let result = if apply {
            self.cache
                .atomically(|| self.walk_subtree(top, true, bound, visited, skipped))
        } else {
            self.walk_subtree(top, false, bound, visited, skipped)
        };

        match result {
            Ok(sub) => report.absorb(sub),
            Err(CacheError::CycleDetected { entry_id, depth }) => {
                skipped.insert(top.id);
                report.record_fatal(Anomaly::DepthExceeded {
                    top_id: top.id,
                    entry_id,
                    depth,
                });
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn walk_subtree(
        &self,
        top: &Entry,
        apply: bool,
        bound: usize,
        visited: &mut HashSet<i64>,
        skipped: &mut HashSet<i64>,
    ) -> Result<CheckReport> {
        let storage_id = top.storage_id;
        let mut report = CheckReport::new(storage_id);
        let mut stack = WalkStack::default();
        stack.push(Pending {
            id: top.id,
            path: top.path.clone(),
            depth: 0,
        });

        while let Some(node) = stack.pop() {
            if node.depth > bound {
                return Err(CacheError::CycleDetected {
                    entry_id: node.id,
                    depth: node.depth,
                });
            }
            visited.insert(node.id);

            // Children are handled in id order, so among stranded siblings that
            // converge on one path the lowest id claims it
            for child in self.cache.children_of(node.id)? {
                if child.storage_id != storage_id {
                    continue;
                }
                let expected = path_key::join(&node.path, path_key::name_of(&child.path));
                let next_depth = node.depth + 1;

                if child.path == expected {
                    stack.push(Pending {
                        id: child.id,
                        path: expected,
                        depth: next_depth,
                    });
                    continue;
                }

                match self.cache.get_by_path(storage_id, &expected)? {
                    Some(occupant) if occupant.id != child.id => {
                        if self.merge_duplicate(&child, &occupant, &expected, apply, &mut report)? {
                            // A dry run leaves the stranded entry in place, so its
                            // children are checked against the occupant's path directly
                            let merged_id = if apply { occupant.id } else { child.id };
                            stack.push(Pending {
                                id: merged_id,
                                path: expected,
                                depth: next_depth,
                            });
                        } else {
                            skipped.insert(child.id);
                        }
                    }
                    _ => {
                        log::debug!("Checker: entry {} '{}' -> '{expected}'", child.id, child.path);
                        report.anomalies.push(Anomaly::StrandedPath {
                            entry_id: child.id,
                            path: child.path.clone(),
                            expected: expected.clone(),
                        });
                        if apply {
                            self.cache.update(child.id, EntryUpdate::path(&expected))?;
                            report.stranded_fixed += 1;
                        }
                        stack.push(Pending {
                            id: child.id,
                            path: expected,
                            depth: next_depth,
                        });
                    }
                }
            }
        }

        Ok(report)
    }

    /// Fold a stranded entry into the entry already sitting at its expected path.
    ///
    /// Returns `false` when the conflict can't be resolved (a folder with
    /// children colliding with a file).
    fn merge_duplicate(
        &self,
        stranded: &Entry,
        occupant: &Entry,
        path: &str,
        apply: bool,
        report: &mut CheckReport,
    ) -> Result<bool> {
        let children = self.cache.children_of(stranded.id)?;
        if !occupant.is_directory() && !children.is_empty() {
            let anomaly = Anomaly::UnresolvedConflict {
                stranded_id: stranded.id,
                occupant_id: occupant.id,
                path: path.to_string(),
            };
            log::warn!("Checker: storage {}: {anomaly}", stranded.storage_id);
            report.unresolved += 1;
            report.anomalies.push(anomaly);
            return Ok(false);
        }

        log::debug!(
            "Checker: merging {} ({} children) into {} at '{path}'",
            stranded.id,
            children.len(),
            occupant.id
        );
        report.anomalies.push(Anomaly::DuplicatePath {
            stranded_id: stranded.id,
            authoritative_id: occupant.id,
            path: path.to_string(),
        });
        if apply {
            for child in &children {
                self.cache.update(child.id, EntryUpdate::parent(occupant.id))?;
            }
            self.cache.delete(stranded.id)?;
            report.duplicates_merged += 1;
        }
        Ok(true)
    }
}

/// Follow the parent chain of every entry the walk didn't reach.
///
/// Returns orphan tops as `(top_id, missing_parent_id)` and the member ids of
/// each parent cycle. Entries hanging below a cycle are settled with it.
fn classify_unreachable(
    entries: &[Entry],
    visited: &HashSet<i64>,
    skipped: &HashSet<i64>,
) -> (Vec<(i64, i64)>, Vec<Vec<i64>>) {
    let by_id: HashMap<i64, &Entry> = entries.iter().map(|e| (e.id, e)).collect();
    let mut settled: HashSet<i64> = visited.union(skipped).copied().collect();
    let mut orphan_tops = Vec::new();
    let mut cycles = Vec::new();

    for entry in entries {
        if settled.contains(&entry.id) {
            continue;
        }

        let mut chain = vec![entry.id];
        let mut on_chain = HashSet::from([entry.id]);
        let mut current = entry;
        let end = loop {
            let Some(parent_id) = current.parent_id else {
                break ChainEnd::Settled;
            };
            if settled.contains(&parent_id) {
                break ChainEnd::Settled;
            }
            // Parents on another storage count as missing
            let Some(parent) = by_id.get(&parent_id) else {
                break ChainEnd::Orphan {
                    top_id: current.id,
                    missing_parent: parent_id,
                };
            };
            if !on_chain.insert(parent_id) {
                let start = chain.iter().position(|id| *id == parent_id).unwrap_or(0);
                break ChainEnd::Cycle(chain[start..].to_vec());
            }
            chain.push(parent_id);
            current = parent;
        };

        settled.extend(chain);
        match end {
            ChainEnd::Settled => {}
            ChainEnd::Orphan { top_id, missing_parent } => orphan_tops.push((top_id, missing_parent)),
            ChainEnd::Cycle(mut ids) => {
                ids.sort_unstable();
                cycles.push(ids);
            }
        }
    }

    (orphan_tops, cycles)
}
