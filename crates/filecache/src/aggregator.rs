//! Folder size computation.
//!
//! A folder's size is the sum of its direct children's sizes. While any child
//! is still unscanned (`-1`), the folder stays `-1` as well.

use crate::path_key;
use crate::store::{CacheError, EntryUpdate, FileCache, Result};

/// Recompute the size of one folder from its direct children and store it.
///
/// Files are returned unchanged. Returns the resulting size.
pub fn calculate_folder_size(cache: &FileCache, entry_id: i64) -> Result<i64> {
    let entry = cache.get_by_id(entry_id)?.ok_or(CacheError::NotFound(entry_id))?;
    if !entry.is_directory() {
        return Ok(entry.size);
    }

    let mut total = 0i64;
    for child in cache.children_of(entry_id)? {
        if child.size < 0 {
            total = -1;
            break;
        }
        total = total.saturating_add(child.size);
    }

    if total != entry.size {
        log::debug!("Folder size for '{}' changed {} -> {total}", entry.path, entry.size);
        cache.update(entry_id, EntryUpdate::size(total))?;
    }
    Ok(total)
}

/// Recompute the folder at `path` and every ancestor up to the storage root.
pub fn correct_folder_size(cache: &FileCache, storage_id: i64, path: &str) -> Result<()> {
    let path = path_key::normalize(path);
    cache.atomically(|| {
        let mut current = Some(path.as_str());
        while let Some(folder) = current {
            if let Some(id) = cache.get_id(storage_id, folder)? {
                calculate_folder_size(cache, id)?;
            }
            current = path_key::parent_of(folder);
        }
        Ok(())
    })
}
