//! Mount record deduplication.
//!
//! Rows sharing `(root_id, user_id, mount_point)` describe the same mount. When
//! a group has more rows than the threshold, only the row with the lowest
//! `storage_id` survives (row id breaks ties).

use std::collections::BTreeMap;

use crate::store::{FileCache, MountRecord, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupReport {
    /// Distinct mount keys seen.
    pub groups_examined: u64,
    pub rows_removed: u64,
}

pub struct MountDeduplicator<'a> {
    cache: &'a FileCache,
    threshold: usize,
}

impl<'a> MountDeduplicator<'a> {
    pub fn new(cache: &'a FileCache, threshold: usize) -> Self {
        Self { cache, threshold }
    }

    /// Collapse duplicate groups. All deletions are committed together.
    pub fn run(&self) -> Result<DedupReport> {
        let groups = group_by_key(self.cache.list_mounts()?);
        let mut report = DedupReport {
            groups_examined: groups.len() as u64,
            rows_removed: 0,
        };

        let doomed: Vec<&MountRecord> = groups
            .values()
            .filter(|rows| rows.len() > self.threshold)
            .flat_map(|rows| rows.iter().skip(1))
            .collect();
        if doomed.is_empty() {
            return Ok(report);
        }

        self.cache.atomically(|| {
            for mount in &doomed {
                log::debug!(
                    "Mount dedup: dropping {} (storage {}, user '{}', '{}')",
                    mount.id,
                    mount.storage_id,
                    mount.user_id,
                    mount.mount_point
                );
                self.cache.delete_mount(mount.id)?;
            }
            Ok(())
        })?;

        report.rows_removed = doomed.len() as u64;
        log::info!(
            "Mount dedup: removed {} rows across {} groups",
            report.rows_removed,
            report.groups_examined
        );
        Ok(report)
    }
}

/// Group mounts by key, each group sorted so the survivor comes first.
fn group_by_key(mounts: Vec<MountRecord>) -> BTreeMap<(i64, String, String), Vec<MountRecord>> {
    let mut groups: BTreeMap<(i64, String, String), Vec<MountRecord>> = BTreeMap::new();
    for mount in mounts {
        let key = (mount.root_id, mount.user_id.clone(), mount.mount_point.clone());
        groups.entry(key).or_default().push(mount);
    }
    for rows in groups.values_mut() {
        rows.sort_by_key(|m| (m.storage_id, m.id));
    }
    groups
}
