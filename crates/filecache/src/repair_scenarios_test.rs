//! End-to-end repair scenarios: interrupted moves, checker repair, mount dedup.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;

use crate::checker::{CheckOptions, CheckReport, TreeChecker};
use crate::config::RepairConfig;
use crate::dedup::MountDeduplicator;
use crate::path_key;
use crate::reconciler::{MoveOptions, MoveReconciler};
use crate::repair::{LogSink, RepairRunner};
use crate::store::{CacheError, EntryUpdate, FileCache, NewEntry, NewMount};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_temp_cache() -> (FileCache, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let cache = FileCache::open(&dir.path().join("scenarios.db")).expect("failed to open cache");
    (cache, dir)
}

fn repair(cache: &FileCache, storage_id: i64) -> CheckReport {
    TreeChecker::new(cache, CheckOptions::default())
        .repair_storage(storage_id)
        .expect("repair failed")
}

/// Every non-root entry sits at `parent.path + "/" + name` on its parent's storage, and paths are unique.
fn assert_tree_consistent(cache: &FileCache, storage_id: i64) {
    let entries = cache.entries_for_storage(storage_id).unwrap();
    let mut paths = HashSet::new();
    for entry in &entries {
        assert!(paths.insert(entry.path.clone()), "duplicate path '{}'", entry.path);
        let Some(parent_id) = entry.parent_id else { continue };
        let parent = cache
            .get_by_id(parent_id)
            .unwrap()
            .unwrap_or_else(|| panic!("entry {} has missing parent {parent_id}", entry.id));
        assert_eq!(parent.storage_id, entry.storage_id, "entry {} crosses storages", entry.id);
        assert_eq!(
            entry.path,
            path_key::join(&parent.path, &entry.name),
            "entry {} is stranded",
            entry.id
        );
    }
}

struct MovedFolder {
    foo2: i64,
    bar: i64,
    asd: i64,
}

/// `foo/bar/asd` whose `bar` was moved to `foo2/bar` without its subtree following.
fn seed_interrupted_rename(cache: &FileCache) -> MovedFolder {
    cache.insert(NewEntry::directory(1, "")).unwrap();
    cache.insert(NewEntry::directory(1, "foo")).unwrap();
    let foo2 = cache.insert(NewEntry::directory(1, "foo2")).unwrap();
    let bar = cache.insert(NewEntry::directory(1, "foo/bar")).unwrap();
    let asd = cache.insert(NewEntry::directory(1, "foo/bar/asd")).unwrap();
    cache.update(bar, EntryUpdate::relocate("foo2/bar", foo2)).unwrap();
    MovedFolder { foo2, bar, asd }
}

#[test]
fn test_stranded_child_follows_renamed_parent() {
    init_logging();
    let (cache, _dir) = open_temp_cache();
    let t = seed_interrupted_rename(&cache);

    let report = repair(&cache, 1);

    let asd = cache.get_by_id(t.asd).unwrap().unwrap();
    assert_eq!(asd.path, "foo2/bar/asd");
    assert_eq!(asd.parent_id, Some(t.bar));
    assert_eq!(report.stranded_fixed, 1);
    assert_eq!(cache.get_by_id(t.bar).unwrap().unwrap().parent_id, Some(t.foo2));
    assert_tree_consistent(&cache, 1);
}

#[test]
fn test_stranded_child_merges_into_existing_destination() {
    init_logging();
    let (cache, _dir) = open_temp_cache();
    let t = seed_interrupted_rename(&cache);
    let leaf = cache.insert(NewEntry::file(1, "foo/bar/asd/leaf.txt", 3)).unwrap();
    // Already written at the destination before the rename was interrupted
    let existing = cache.insert(NewEntry::directory(1, "foo2/bar/asd")).unwrap();

    let report = repair(&cache, 1);
    assert_eq!(report.duplicates_merged, 1);

    assert!(cache.get_by_id(t.asd).unwrap().is_none());
    let at_destination = cache.get_by_path(1, "foo2/bar/asd").unwrap().unwrap();
    assert_eq!(at_destination.id, existing);
    assert_eq!(
        cache
            .all_entries()
            .unwrap()
            .iter()
            .filter(|e| e.path == "foo2/bar/asd")
            .count(),
        1
    );

    let leaf = cache.get_by_id(leaf).unwrap().unwrap();
    assert_eq!(leaf.parent_id, Some(existing));
    assert_eq!(leaf.path, "foo2/bar/asd/leaf.txt");
    assert_tree_consistent(&cache, 1);
}

#[test]
fn test_duplicate_mounts_collapse_to_lowest_storage() {
    init_logging();
    let (cache, _dir) = open_temp_cache();
    let rows = [
        (1, 1, "user1", "/user1/files/1.txt/"),
        (2, 1, "user1", "/user1/files/1.txt/"),
        (3, 1, "user1", "/user1/files/1.txt/"),
        (4, 2, "user1", "/user1/files/1.txt/"),
        (5, 1, "user2", "/user1/files/1.txt/"),
        (6, 1, "user1", "/user1/files/2.txt/"),
    ];
    for (storage_id, root_id, user_id, mount_point) in rows {
        cache
            .insert_mount(NewMount {
                storage_id,
                root_id,
                user_id: user_id.into(),
                mount_point: mount_point.into(),
            })
            .unwrap();
    }

    let report = MountDeduplicator::new(&cache, 1).run().unwrap();
    assert_eq!(report.groups_examined, 4);
    assert_eq!(report.rows_removed, 2);

    let mut storages: Vec<i64> = cache.list_mounts().unwrap().iter().map(|m| m.storage_id).collect();
    storages.sort_unstable();
    assert_eq!(storages, vec![1, 4, 5, 6]);

    // Stable on re-run
    let before = cache.list_mounts().unwrap();
    assert_eq!(MountDeduplicator::new(&cache, 1).run().unwrap().rows_removed, 0);
    assert_eq!(cache.list_mounts().unwrap(), before);
}

#[test]
fn test_move_to_missing_parent_leaves_store_unchanged() {
    init_logging();
    let (cache, _dir) = open_temp_cache();
    cache.insert(NewEntry::directory(1, "")).unwrap();
    cache.insert(NewEntry::directory(1, "a")).unwrap();
    cache.insert(NewEntry::directory(1, "a/b")).unwrap();
    cache.insert(NewEntry::directory(1, "a/b/c")).unwrap();
    let moved = cache.insert(NewEntry::directory(1, "a/b/c/d")).unwrap();
    cache.insert(NewEntry::file(1, "a/b/c/d/e.txt", 1)).unwrap();
    assert_eq!(moved, 5);

    let before = cache.all_entries().unwrap();
    let err = MoveReconciler::new(&cache)
        .move_entry(5, 9, "x", MoveOptions::default())
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidParent { parent_id: 9, .. }));
    assert_eq!(cache.all_entries().unwrap(), before);
}

#[test]
fn test_second_repair_changes_nothing() {
    init_logging();
    let (cache, _dir) = open_temp_cache();
    let t = seed_interrupted_rename(&cache);
    cache.insert(NewEntry::file(1, "foo/bar/asd/one", 1)).unwrap();
    cache.insert(NewEntry::directory(1, "foo/bar/asd/two")).unwrap();
    cache.insert(NewEntry::file(1, "foo/bar/asd/two/three", 1)).unwrap();
    cache.insert(NewEntry::directory(1, "lost").with_parent(t.asd + 1000)).unwrap();

    let first = repair(&cache, 1);
    assert!(first.changes() > 0);
    let snapshot = cache.all_entries().unwrap();

    let second = repair(&cache, 1);
    assert_eq!(second.changes(), 0);
    assert_eq!(cache.all_entries().unwrap(), snapshot);
}

#[test]
fn test_move_keeps_prefix_closure() {
    init_logging();
    let (cache, _dir) = open_temp_cache();
    cache.insert(NewEntry::directory(1, "")).unwrap();
    let src = cache.insert(NewEntry::directory(1, "src")).unwrap();
    let dst = cache.insert(NewEntry::directory(1, "dst")).unwrap();
    for i in 0..5 {
        let folder = format!("src/d{i}");
        cache.insert(NewEntry::directory(1, &folder)).unwrap();
        for j in 0..3 {
            cache.insert(NewEntry::file(1, &format!("{folder}/f{j}"), j)).unwrap();
        }
    }
    // Sibling sharing the name prefix must not be dragged along
    cache.insert(NewEntry::directory(1, "srcx")).unwrap();

    let below_before = cache.descendants_with_path_prefix(1, "src").unwrap().len();
    MoveReconciler::new(&cache)
        .move_entry(src, dst, "moved", MoveOptions::default())
        .unwrap();

    assert!(cache.descendants_with_path_prefix(1, "src").unwrap().is_empty());
    assert_eq!(cache.descendants_with_path_prefix(1, "dst/moved").unwrap().len(), below_before);
    assert!(cache.in_cache(1, "srcx").unwrap());
    assert_tree_consistent(&cache, 1);

    // A consistent tree gives the checker nothing to do
    assert!(repair(&cache, 1).is_clean());
}

#[test]
fn test_repair_restores_uniqueness_and_linkage_across_storages() {
    init_logging();
    let (cache, _dir) = open_temp_cache();

    for storage_id in [1, 2] {
        cache.insert(NewEntry::directory(storage_id, "")).unwrap();
        let photos = cache.insert(NewEntry::directory(storage_id, "photos")).unwrap();
        cache.insert(NewEntry::directory(storage_id, "photos/2024")).unwrap();
        cache.insert(NewEntry::file(storage_id, "photos/2024/a.jpg", 10)).unwrap();
        cache.insert(NewEntry::file(storage_id, "photos/2024/b.jpg", 10)).unwrap();
        // Interrupted rename of the top folder
        cache.update(photos, EntryUpdate::path("pictures")).unwrap();
    }
    // Storage 2 also got a partial copy at the destination
    cache.insert(NewEntry::directory(2, "pictures/2024")).unwrap();
    cache.insert(NewEntry::file(2, "pictures/2024/a.jpg", 10)).unwrap();

    let summary = RepairRunner::new(&cache, RepairConfig::default(), &LogSink)
        .run(&AtomicBool::new(false))
        .unwrap();
    assert_eq!(summary.storages_checked, 2);
    assert!(summary.errors.is_empty());
    assert!(summary.duplicates_merged >= 2);

    for storage_id in [1, 2] {
        assert_tree_consistent(&cache, storage_id);
        assert!(cache.in_cache(storage_id, "pictures/2024/a.jpg").unwrap());
        assert!(cache.in_cache(storage_id, "pictures/2024/b.jpg").unwrap());
        assert!(cache.descendants_with_path_prefix(storage_id, "photos").unwrap().is_empty());
    }
    assert_eq!(cache.entries_for_storage(2).unwrap().len(), 5);
}

#[test]
fn test_check_only_matches_what_repair_fixes() {
    init_logging();
    let (cache, _dir) = open_temp_cache();
    seed_interrupted_rename(&cache);
    cache.insert(NewEntry::file(1, "foo/bar/asd/x", 1)).unwrap();

    let before = cache.all_entries().unwrap();
    let checker = TreeChecker::new(&cache, CheckOptions::default());
    let preview = checker.check_storage(1).unwrap();
    assert_eq!(cache.all_entries().unwrap(), before);

    let fixed = checker.repair_storage(1).unwrap();
    assert_eq!(preview.anomalies, fixed.anomalies);
    assert_eq!(fixed.stranded_fixed, 2);
}

#[test]
fn test_check_only_matches_repair_across_merge() {
    init_logging();
    let (cache, _dir) = open_temp_cache();
    seed_interrupted_rename(&cache);
    cache.insert(NewEntry::file(1, "foo/bar/asd/leaf.txt", 3)).unwrap();
    cache.insert(NewEntry::directory(1, "foo/bar/asd/deeper")).unwrap();
    cache.insert(NewEntry::file(1, "foo/bar/asd/deeper/g", 1)).unwrap();
    cache.insert(NewEntry::directory(1, "foo2/bar/asd")).unwrap();

    let checker = TreeChecker::new(&cache, CheckOptions::default());
    let preview = checker.check_storage(1).unwrap();
    let fixed = checker.repair_storage(1).unwrap();

    // Same findings, possibly in a different order
    assert_eq!(preview.anomalies.len(), fixed.anomalies.len());
    for anomaly in &fixed.anomalies {
        assert!(preview.anomalies.contains(anomaly), "check-only missed {anomaly}");
    }
    assert_eq!(fixed.duplicates_merged, 1);
    assert_eq!(fixed.stranded_fixed, 3);
    assert_tree_consistent(&cache, 1);
}
