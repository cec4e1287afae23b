//! Transactional move/rename of an entry together with its whole subtree.
//!
//! The moved entry gets its new parent, name and path; every descendant path
//! is rebased from the old prefix to the new one. Descendants keep their parent
//! ids. Either everything is rewritten or nothing is.

use crate::path_key;
use crate::store::{CacheError, Entry, EntryUpdate, FileCache, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct MoveOptions {
    /// Replace an existing destination (and its subtree) instead of failing.
    pub overwrite: bool,
}

pub struct MoveReconciler<'a> {
    cache: &'a FileCache,
}

impl<'a> MoveReconciler<'a> {
    pub fn new(cache: &'a FileCache) -> Self {
        Self { cache }
    }

    /// Move `entry_id` below `new_parent_id` under `new_name`. Returns the moved entry.
    ///
    /// The entry takes over the parent's storage, so moves across storages work
    /// the same way as moves within one.
    pub fn move_entry(&self, entry_id: i64, new_parent_id: i64, new_name: &str, options: MoveOptions) -> Result<Entry> {
        if new_name.is_empty() || new_name.contains('/') {
            return Err(CacheError::InvalidName(new_name.to_string()));
        }
        let name = path_key::normalize(new_name);

        self.cache.atomically(|| {
            let entry = self.cache.get_by_id(entry_id)?.ok_or(CacheError::NotFound(entry_id))?;
            let parent = self.validate_parent(&entry, new_parent_id)?;

            let target_storage = parent.storage_id;
            let target_path = path_key::join(&parent.path, &name);
            if target_storage == entry.storage_id && target_path == entry.path {
                return Ok(entry);
            }

            if let Some(existing) = self.cache.get_by_path(target_storage, &target_path)? {
                let contains_entry =
                    existing.storage_id == entry.storage_id && path_key::is_within(&entry.path, &existing.path);
                if !options.overwrite || contains_entry {
                    return Err(CacheError::DestinationExists {
                        storage_id: target_storage,
                        path: target_path,
                    });
                }
                let removed = self.cache.remove_subtree(existing.id)?;
                log::debug!("Move: overwrote '{target_path}' ({removed} rows)");
            }

            let descendants = self.cache.descendants_with_path_prefix(entry.storage_id, &entry.path)?;
            let storage_change = (target_storage != entry.storage_id).then_some(target_storage);

            self.cache.update(
                entry.id,
                EntryUpdate {
                    storage_id: storage_change,
                    path: Some(target_path.clone()),
                    parent_id: Some(Some(parent.id)),
                    ..Default::default()
                },
            )?;

            let mut rebased = 0usize;
            for descendant in descendants.iter().filter(|d| d.id != entry.id) {
                let Some(new_path) = path_key::rebase(&descendant.path, &entry.path, &target_path) else {
                    continue;
                };
                self.cache.update(
                    descendant.id,
                    EntryUpdate {
                        storage_id: storage_change,
                        path: Some(new_path),
                        ..Default::default()
                    },
                )?;
                rebased += 1;
            }

            log::debug!(
                "Move: {} '{}' -> '{target_path}' on storage {target_storage} ({rebased} descendants)",
                entry.id,
                entry.path
            );
            self.cache.get_by_id(entry.id)?.ok_or(CacheError::NotFound(entry.id))
        })
    }

    /// Move by path within one storage. The target's dirname must be a cached folder.
    pub fn move_path(&self, storage_id: i64, source: &str, target: &str, options: MoveOptions) -> Result<Entry> {
        self.move_across(storage_id, source, storage_id, target, options)
    }

    /// Move by path from one storage to another.
    pub fn move_across(
        &self,
        source_storage: i64,
        source: &str,
        target_storage: i64,
        target: &str,
        options: MoveOptions,
    ) -> Result<Entry> {
        let source = path_key::normalize(source);
        let target = path_key::normalize(target);

        let entry_id = self
            .cache
            .get_id(source_storage, &source)?
            .ok_or(CacheError::PathNotFound {
                storage_id: source_storage,
                path: source,
            })?;
        let Some(parent_path) = path_key::parent_of(&target) else {
            // The root has no name to move to
            return Err(CacheError::InvalidName(target));
        };
        let parent_id = self
            .cache
            .get_id(target_storage, parent_path)?
            .ok_or_else(|| CacheError::ParentNotFound {
                storage_id: target_storage,
                path: target.clone(),
            })?;

        self.move_entry(entry_id, parent_id, path_key::name_of(&target), options)
    }

    /// The new parent must exist, be a folder, and not sit inside the moved subtree.
    fn validate_parent(&self, entry: &Entry, parent_id: i64) -> Result<Entry> {
        let invalid = |reason: &'static str| CacheError::InvalidParent { parent_id, reason };

        let parent = self
            .cache
            .get_by_id(parent_id)?
            .ok_or_else(|| invalid("parent does not exist"))?;
        if !parent.is_directory() {
            return Err(invalid("parent is not a folder"));
        }
        if parent.id == entry.id {
            return Err(invalid("cannot move an entry into itself"));
        }

        // Walk up from the new parent; meeting the entry means it's a descendant
        let mut seen = std::collections::HashSet::from([parent.id]);
        let mut current = parent.parent_id;
        while let Some(id) = current {
            if id == entry.id {
                return Err(invalid("parent is inside the moved subtree"));
            }
            if !seen.insert(id) {
                break;
            }
            current = self.cache.get_by_id(id)?.and_then(|e| e.parent_id);
        }

        Ok(parent)
    }
}
