//! SQLite store for the file cache.
//!
//! One `filecache` table holds every entry of every storage, keyed by a
//! store-assigned `fileid` and unique on `(storage, path_hash)`. Mount records
//! and persisted markers live in their own tables in the same DB file.
//!
//! `update` never cascades a path change to descendants. Keeping subtrees
//! consistent is the job of the reconciler (moves) and the checker (repair
//! after the fact).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, Transaction, params};
use serde::{Deserialize, Serialize};

use crate::path_key;

const SCHEMA_VERSION: &str = "1";

/// Mimetype stored on folders.
pub const DIRECTORY_MIMETYPE: &str = "httpd/unix-directory";

// ── Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
}

/// A cached file or folder record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: i64,
    pub storage_id: i64,
    pub path: String,
    /// `None` for the storage root.
    pub parent_id: Option<i64>,
    pub name: String,
    pub kind: EntryKind,
    /// `-1` while a folder has not been fully scanned.
    pub size: i64,
    pub mtime: i64,
    pub mimetype: String,
    pub etag: String,
}

impl Entry {
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Data for a new cache row. The id is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub storage_id: i64,
    pub path: String,
    /// When `None` on a non-root path, the parent is looked up by path.
    pub parent_id: Option<i64>,
    pub kind: EntryKind,
    pub size: i64,
    pub mtime: i64,
    pub mimetype: String,
    pub etag: String,
}

impl NewEntry {
    pub fn directory(storage_id: i64, path: &str) -> Self {
        Self {
            storage_id,
            path: path.to_string(),
            parent_id: None,
            kind: EntryKind::Directory,
            size: 0,
            mtime: 0,
            mimetype: DIRECTORY_MIMETYPE.to_string(),
            etag: String::new(),
        }
    }

    pub fn file(storage_id: i64, path: &str, size: i64) -> Self {
        Self {
            storage_id,
            path: path.to_string(),
            parent_id: None,
            kind: EntryKind::File,
            size,
            mtime: 0,
            mimetype: "application/octet-stream".to_string(),
            etag: String::new(),
        }
    }

    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    pub fn with_mtime(mut self, mtime: i64) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn with_mimetype(mut self, mimetype: &str) -> Self {
        self.mimetype = mimetype.to_string();
        self
    }

    pub fn with_etag(mut self, etag: &str) -> Self {
        self.etag = etag.to_string();
        self
    }
}

/// Partial update for an existing row. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct EntryUpdate {
    pub storage_id: Option<i64>,
    pub path: Option<String>,
    /// `Some(None)` turns the entry into a root.
    pub parent_id: Option<Option<i64>>,
    pub kind: Option<EntryKind>,
    pub size: Option<i64>,
    pub mtime: Option<i64>,
    pub mimetype: Option<String>,
    pub etag: Option<String>,
}

impl EntryUpdate {
    pub fn path(path: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            ..Default::default()
        }
    }

    pub fn parent(parent_id: i64) -> Self {
        Self {
            parent_id: Some(Some(parent_id)),
            ..Default::default()
        }
    }

    pub fn relocate(path: &str, parent_id: i64) -> Self {
        Self {
            path: Some(path.to_string()),
            parent_id: Some(Some(parent_id)),
            ..Default::default()
        }
    }

    pub fn size(size: i64) -> Self {
        Self {
            size: Some(size),
            ..Default::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.storage_id.is_none()
            && self.path.is_none()
            && self.parent_id.is_none()
            && self.kind.is_none()
            && self.size.is_none()
            && self.mtime.is_none()
            && self.mimetype.is_none()
            && self.etag.is_none()
    }
}

/// Scan status of a path, as reported by [`FileCache::get_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    NotFound,
    /// In the cache, but the folder size is not known yet.
    Shallow,
    Complete,
}

/// A mount-point record binding a storage root into a user's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountRecord {
    pub id: i64,
    pub storage_id: i64,
    pub root_id: i64,
    pub user_id: String,
    pub mount_point: String,
}

#[derive(Debug, Clone)]
pub struct NewMount {
    pub storage_id: i64,
    pub root_id: i64,
    pub user_id: String,
    pub mount_point: String,
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum CacheError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Config(serde_json::Error),
    DuplicatePath { storage_id: i64, path: String },
    NotFound(i64),
    PathNotFound { storage_id: i64, path: String },
    ParentNotFound { storage_id: i64, path: String },
    InvalidParent { parent_id: i64, reason: &'static str },
    InvalidName(String),
    DestinationExists { storage_id: i64, path: String },
    CycleDetected { entry_id: i64, depth: usize },
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::Sqlite(err)
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Config(err)
    }
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            CacheError::Io(e) => write!(f, "I/O error: {e}"),
            CacheError::Config(e) => write!(f, "Invalid repair config: {e}"),
            CacheError::DuplicatePath { storage_id, path } => {
                write!(f, "Entry already exists at '{path}' on storage {storage_id}")
            }
            CacheError::NotFound(id) => write!(f, "No cache entry with id {id}"),
            CacheError::PathNotFound { storage_id, path } => {
                write!(f, "No cache entry at '{path}' on storage {storage_id}")
            }
            CacheError::ParentNotFound { storage_id, path } => {
                write!(f, "Parent folder not in cache for '{path}' on storage {storage_id}")
            }
            CacheError::InvalidParent { parent_id, reason } => write!(f, "Invalid parent {parent_id}: {reason}"),
            CacheError::InvalidName(name) => write!(f, "Invalid entry name: '{name}'"),
            CacheError::DestinationExists { storage_id, path } => {
                write!(f, "Destination '{path}' on storage {storage_id} already exists")
            }
            CacheError::CycleDetected { entry_id, depth } => {
                write!(f, "Parent cycle detected at entry {entry_id} (depth {depth})")
            }
        }
    }
}

impl std::error::Error for CacheError {}

/// Map a unique-constraint failure to `DuplicatePath`, pass anything else through.
fn map_unique_violation(err: rusqlite::Error, storage_id: i64, path: &str) -> CacheError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => CacheError::DuplicatePath {
            storage_id,
            path: path.to_string(),
        },
        _ => CacheError::Sqlite(err),
    }
}

// ── Schema ───────────────────────────────────────────────────────────

const CREATE_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS filecache (
        fileid       INTEGER PRIMARY KEY AUTOINCREMENT,
        storage      INTEGER NOT NULL,
        path         TEXT    NOT NULL,
        path_hash    TEXT    NOT NULL,
        parent       INTEGER,
        name         TEXT    NOT NULL,
        is_directory INTEGER NOT NULL DEFAULT 0,
        size         INTEGER NOT NULL DEFAULT 0,
        mtime        INTEGER NOT NULL DEFAULT 0,
        mimetype     TEXT    NOT NULL DEFAULT '',
        etag         TEXT    NOT NULL DEFAULT '',
        UNIQUE (storage, path_hash)
    );

    CREATE INDEX IF NOT EXISTS idx_filecache_parent ON filecache (parent);
    CREATE INDEX IF NOT EXISTS idx_filecache_storage_path ON filecache (storage, path);

    CREATE TABLE IF NOT EXISTS mounts (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        storage_id  INTEGER NOT NULL,
        root_id     INTEGER NOT NULL,
        user_id     TEXT    NOT NULL,
        mount_point TEXT    NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_mounts_key ON mounts (root_id, user_id, mount_point);

    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) WITHOUT ROWID;
";

const ENTRY_COLUMNS: &str = "fileid, storage, path, parent, name, is_directory, size, mtime, mimetype, etag";

/// Apply WAL-mode pragmas. In-memory databases silently keep their own journal mode.
fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = OFF;",
    )?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLES_SQL)?;
    Ok(())
}

/// Drop all cache tables and recreate them from scratch.
fn reset_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DROP TABLE IF EXISTS filecache;
         DROP TABLE IF EXISTS mounts;
         DROP TABLE IF EXISTS meta;",
    )?;
    create_tables(conn)?;
    stamp_schema_version(conn)
}

fn stamp_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION],
    )?;
    Ok(())
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        storage_id: row.get(1)?,
        path: row.get(2)?,
        parent_id: row.get(3)?,
        name: row.get(4)?,
        kind: if row.get::<_, i32>(5)? != 0 {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        size: row.get(6)?,
        mtime: row.get(7)?,
        mimetype: row.get(8)?,
        etag: row.get(9)?,
    })
}

fn mount_from_row(row: &Row<'_>) -> rusqlite::Result<MountRecord> {
    Ok(MountRecord {
        id: row.get(0)?,
        storage_id: row.get(1)?,
        root_id: row.get(2)?,
        user_id: row.get(3)?,
        mount_point: row.get(4)?,
    })
}

// ── Savepoints ───────────────────────────────────────────────────────

const UNIT_SAVEPOINT: &str = "cache_unit";

/// Savepoint nested inside an open transaction.
///
/// Rolls back to where it began when dropped without `release()`. Nested
/// savepoints may share a name: SQLite resolves it to the innermost one.
struct UnitSavepoint<'a> {
    conn: &'a Connection,
    released: bool,
}

impl<'a> UnitSavepoint<'a> {
    fn begin(conn: &'a Connection) -> Result<Self> {
        conn.execute_batch(&format!("SAVEPOINT {UNIT_SAVEPOINT}"))?;
        Ok(Self { conn, released: false })
    }

    fn release(mut self) -> Result<()> {
        self.conn.execute_batch(&format!("RELEASE {UNIT_SAVEPOINT}"))?;
        self.released = true;
        Ok(())
    }
}

impl Drop for UnitSavepoint<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self
            .conn
            .execute_batch(&format!("ROLLBACK TO {UNIT_SAVEPOINT}; RELEASE {UNIT_SAVEPOINT}"))
        {
            log::warn!("File cache: savepoint rollback failed: {e}");
        }
    }
}

// ── FileCache ────────────────────────────────────────────────────────

/// Handle to the cache database.
///
/// Owns a single connection. Components borrow the handle and wrap each atomic
/// unit of work in [`FileCache::atomically`]; the underlying transaction guard
/// rolls back on every exit path that does not reach the commit.
pub struct FileCache {
    db_path: Option<PathBuf>,
    conn: Connection,
}

impl FileCache {
    /// Open (or create) the cache database at `db_path`.
    ///
    /// On schema version mismatch the tables are reset. If the file cannot be
    /// opened as a cache at all, it is deleted and recreated.
    pub fn open(db_path: &Path) -> Result<Self> {
        match Self::try_open(db_path) {
            Ok(cache) => Ok(cache),
            Err(e) => {
                log::warn!("File cache open failed ({e}), deleting and recreating");
                Self::delete_and_recreate(db_path)
            }
        }
    }

    /// Open a throwaway cache that lives in memory only.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        stamp_schema_version(&conn)?;
        Ok(Self { db_path: None, conn })
    }

    fn try_open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        create_tables(&conn)?;

        match Self::read_meta_value(&conn, "schema_version")? {
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                log::warn!("Schema version mismatch (expected {SCHEMA_VERSION}, found {v}), resetting");
                reset_schema(&conn)?;
            }
            None => stamp_schema_version(&conn)?,
        }

        Ok(Self {
            db_path: Some(db_path.to_path_buf()),
            conn,
        })
    }

    fn delete_and_recreate(db_path: &Path) -> Result<Self> {
        if db_path.exists() {
            std::fs::remove_file(db_path)?;
        }
        // Sidecars can be stale even when the base file is already gone
        for sidecar in [db_path.with_extension("db-wal"), db_path.with_extension("db-shm")] {
            if sidecar.exists() {
                let _ = std::fs::remove_file(&sidecar);
            }
        }

        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        create_tables(&conn)?;
        stamp_schema_version(&conn)?;
        Ok(Self {
            db_path: Some(db_path.to_path_buf()),
            conn,
        })
    }

    /// Path to the DB file, `None` for in-memory caches.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Begin a transaction on the cache connection.
    ///
    /// The guard rolls back when dropped without `commit()`.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    /// Run `f` as one atomic unit.
    ///
    /// Opens a transaction, or a savepoint when a transaction is already active
    /// on this connection. Either way an error from `f` undoes exactly the
    /// writes `f` made; the outer owner still decides on the final commit.
    pub fn atomically<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if !self.conn.is_autocommit() {
            let savepoint = UnitSavepoint::begin(&self.conn)?;
            let out = f()?;
            savepoint.release()?;
            return Ok(out);
        }
        let tx = self.transaction()?;
        let out = f()?;
        tx.commit()?;
        Ok(out)
    }

    // ── Entry reads ──────────────────────────────────────────────────

    pub fn get_by_id(&self, id: i64) -> Result<Option<Entry>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {ENTRY_COLUMNS} FROM filecache WHERE fileid = ?1"))?;
        Ok(stmt.query_row(params![id], entry_from_row).optional()?)
    }

    /// Look up an entry by storage and path. The path is normalized first.
    pub fn get_by_path(&self, storage_id: i64, path: &str) -> Result<Option<Entry>> {
        let path = path_key::normalize(path);
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM filecache WHERE storage = ?1 AND path_hash = ?2"
        ))?;
        Ok(stmt
            .query_row(params![storage_id, path_key::path_hash(&path)], entry_from_row)
            .optional()?)
    }

    /// File id for a path, `None` when the path is not cached.
    pub fn get_id(&self, storage_id: i64, path: &str) -> Result<Option<i64>> {
        let path = path_key::normalize(path);
        let mut stmt = self
            .conn
            .prepare_cached("SELECT fileid FROM filecache WHERE storage = ?1 AND path_hash = ?2")?;
        Ok(stmt
            .query_row(params![storage_id, path_key::path_hash(&path)], |row| row.get(0))
            .optional()?)
    }

    pub fn get_path_by_id(&self, id: i64) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare_cached("SELECT path FROM filecache WHERE fileid = ?1")?;
        Ok(stmt.query_row(params![id], |row| row.get(0)).optional()?)
    }

    pub fn in_cache(&self, storage_id: i64, path: &str) -> Result<bool> {
        Ok(self.get_id(storage_id, path)?.is_some())
    }

    /// Direct children of `id`, in id order.
    pub fn children_of(&self, id: i64) -> Result<Vec<Entry>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM filecache WHERE parent = ?1 ORDER BY fileid"
        ))?;
        let rows = stmt.query_map(params![id], entry_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Entries at `prefix` or anywhere below it, in id order.
    ///
    /// Matching is case-sensitive and respects segment boundaries: `foo` does
    /// not match `foobar`. The root prefix matches the whole storage.
    pub fn descendants_with_path_prefix(&self, storage_id: i64, prefix: &str) -> Result<Vec<Entry>> {
        let prefix = path_key::normalize(prefix);
        if prefix.is_empty() {
            return self.entries_for_storage(storage_id);
        }
        let below = format!("{prefix}/");
        let below_len = below.chars().count() as i64;
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM filecache
             WHERE storage = ?1 AND (path = ?2 OR substr(path, 1, ?3) = ?4)
             ORDER BY fileid"
        ))?;
        let rows = stmt.query_map(params![storage_id, prefix, below_len, below], entry_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Every entry of a storage, in id order.
    pub fn entries_for_storage(&self, storage_id: i64) -> Result<Vec<Entry>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM filecache WHERE storage = ?1 ORDER BY fileid"
        ))?;
        let rows = stmt.query_map(params![storage_id], entry_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Every entry in the cache, in id order.
    pub fn all_entries(&self) -> Result<Vec<Entry>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {ENTRY_COLUMNS} FROM filecache ORDER BY fileid"))?;
        let rows = stmt.query_map([], entry_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Distinct storage ids that have at least one entry, ascending.
    pub fn storage_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT DISTINCT storage FROM filecache ORDER BY storage")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn entry_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM filecache", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn get_status(&self, storage_id: i64, path: &str) -> Result<CacheStatus> {
        Ok(match self.get_by_path(storage_id, path)? {
            None => CacheStatus::NotFound,
            Some(entry) if entry.size == -1 => CacheStatus::Shallow,
            Some(_) => CacheStatus::Complete,
        })
    }

    /// Path of a folder that has not been fully scanned.
    ///
    /// Picks the highest id, which is most likely where a background scan stopped.
    pub fn get_incomplete(&self, storage_id: i64) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT path FROM filecache
             WHERE storage = ?1 AND size < 0
             ORDER BY fileid DESC LIMIT 1",
        )?;
        Ok(stmt.query_row(params![storage_id], |row| row.get(0)).optional()?)
    }

    /// Entries whose name matches an SQL `LIKE` pattern (for example `%.txt`).
    pub fn search_by_name(&self, storage_id: i64, pattern: &str) -> Result<Vec<Entry>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM filecache WHERE storage = ?1 AND name LIKE ?2 ORDER BY fileid"
        ))?;
        let rows = stmt.query_map(params![storage_id, pattern], entry_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Entries of a mimetype. A bare group like `image` matches `image/*`.
    pub fn search_by_mime(&self, storage_id: i64, mimetype: &str) -> Result<Vec<Entry>> {
        let (sql, arg) = if mimetype.contains('/') {
            (
                format!("SELECT {ENTRY_COLUMNS} FROM filecache WHERE storage = ?1 AND mimetype = ?2 ORDER BY fileid"),
                mimetype.to_string(),
            )
        } else {
            (
                format!(
                    "SELECT {ENTRY_COLUMNS} FROM filecache
                     WHERE storage = ?1 AND substr(mimetype, 1, ?3) = ?2 ORDER BY fileid"
                ),
                format!("{mimetype}/"),
            )
        };
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = if mimetype.contains('/') {
            stmt.query_map(params![storage_id, arg], entry_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
        } else {
            let len = arg.chars().count() as i64;
            stmt.query_map(params![storage_id, arg, len], entry_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
        };
        rows.map_err(Into::into)
    }

    // ── Entry writes ─────────────────────────────────────────────────

    /// Insert a new entry and return its id.
    ///
    /// Fails with `DuplicatePath` if the storage already has a live entry at
    /// that path, and with `ParentNotFound` when no parent id was given and
    /// the parent path is not cached.
    pub fn insert(&self, entry: NewEntry) -> Result<i64> {
        let path = path_key::normalize(&entry.path);
        if self.get_id(entry.storage_id, &path)?.is_some() {
            return Err(CacheError::DuplicatePath {
                storage_id: entry.storage_id,
                path,
            });
        }

        let parent_id = match (entry.parent_id, path_key::parent_of(&path)) {
            (Some(id), _) => Some(id),
            (None, None) => None,
            (None, Some(parent_path)) => match self.get_id(entry.storage_id, parent_path)? {
                Some(id) => Some(id),
                None => {
                    return Err(CacheError::ParentNotFound {
                        storage_id: entry.storage_id,
                        path,
                    });
                }
            },
        };

        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO filecache
                 (storage, path, path_hash, parent, name, is_directory, size, mtime, mimetype, etag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        stmt.execute(params![
            entry.storage_id,
            path,
            path_key::path_hash(&path),
            parent_id,
            path_key::name_of(&path),
            (entry.kind == EntryKind::Directory) as i32,
            entry.size,
            entry.mtime,
            entry.mimetype,
            entry.etag,
        ])
        .map_err(|e| map_unique_violation(e, entry.storage_id, &path))?;

        let id = self.conn.last_insert_rowid();
        log::debug!("File cache: inserted {id} at '{path}' on storage {}", entry.storage_id);
        Ok(id)
    }

    /// Update the entry at `entry.path` if it exists, insert it otherwise.
    ///
    /// Existing rows keep their id and parent; only the payload fields change.
    pub fn put(&self, entry: NewEntry) -> Result<i64> {
        match self.get_id(entry.storage_id, &entry.path)? {
            Some(id) => {
                self.update(
                    id,
                    EntryUpdate {
                        kind: Some(entry.kind),
                        size: Some(entry.size),
                        mtime: Some(entry.mtime),
                        mimetype: Some(entry.mimetype),
                        etag: Some(entry.etag),
                        ..Default::default()
                    },
                )?;
                Ok(id)
            }
            None => self.insert(entry),
        }
    }

    /// Apply a partial update. A path change does not touch descendants.
    pub fn update(&self, id: i64, update: EntryUpdate) -> Result<()> {
        let current = self.get_by_id(id)?.ok_or(CacheError::NotFound(id))?;
        if update.is_empty() {
            return Ok(());
        }

        let storage_id = update.storage_id.unwrap_or(current.storage_id);
        let mut sets: Vec<(&str, Value)> = Vec::new();
        let mut new_path = None;

        if let Some(path) = &update.path {
            let path = path_key::normalize(path);
            sets.push(("path_hash", Value::Text(path_key::path_hash(&path))));
            sets.push(("name", Value::Text(path_key::name_of(&path).to_string())));
            sets.push(("path", Value::Text(path.clone())));
            new_path = Some(path);
        }
        if let Some(storage) = update.storage_id {
            sets.push(("storage", Value::Integer(storage)));
        }
        if let Some(parent) = update.parent_id {
            sets.push(("parent", parent.map_or(Value::Null, Value::Integer)));
        }
        if let Some(kind) = update.kind {
            sets.push(("is_directory", Value::Integer((kind == EntryKind::Directory) as i64)));
        }
        if let Some(size) = update.size {
            sets.push(("size", Value::Integer(size)));
        }
        if let Some(mtime) = update.mtime {
            sets.push(("mtime", Value::Integer(mtime)));
        }
        if let Some(mimetype) = update.mimetype {
            sets.push(("mimetype", Value::Text(mimetype)));
        }
        if let Some(etag) = update.etag {
            sets.push(("etag", Value::Text(etag)));
        }

        let assignments = sets
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{column} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE filecache SET {assignments} WHERE fileid = ?{}", sets.len() + 1);

        let mut values: Vec<Value> = sets.into_iter().map(|(_, v)| v).collect();
        values.push(Value::Integer(id));

        let target_path = new_path.unwrap_or(current.path);
        self.conn
            .execute(&sql, rusqlite::params_from_iter(values))
            .map_err(|e| map_unique_violation(e, storage_id, &target_path))?;
        Ok(())
    }

    /// Delete a single row. Children are not touched.
    pub fn delete(&self, id: i64) -> Result<()> {
        let affected = self.conn.execute("DELETE FROM filecache WHERE fileid = ?1", params![id])?;
        if affected == 0 {
            return Err(CacheError::NotFound(id));
        }
        Ok(())
    }

    /// Delete an entry and everything parented below it. Returns the number of rows removed.
    pub fn remove_subtree(&self, id: i64) -> Result<u64> {
        if self.get_by_id(id)?.is_none() {
            return Err(CacheError::NotFound(id));
        }

        // Walk by parent id with an explicit queue, guarding against parent cycles
        let mut ids = vec![id];
        let mut seen = HashSet::from([id]);
        let mut queue = vec![id];
        while let Some(current) = queue.pop() {
            for child in self.children_of(current)? {
                if seen.insert(child.id) {
                    ids.push(child.id);
                    if child.is_directory() {
                        queue.push(child.id);
                    }
                }
            }
        }

        self.atomically(|| {
            let mut stmt = self.conn.prepare_cached("DELETE FROM filecache WHERE fileid = ?1")?;
            for id in &ids {
                stmt.execute(params![id])?;
            }
            Ok(())
        })?;
        Ok(ids.len() as u64)
    }

    /// Remove a path and, for folders, its whole subtree. Returns 0 when the path isn't cached.
    pub fn remove(&self, storage_id: i64, path: &str) -> Result<u64> {
        match self.get_id(storage_id, path)? {
            Some(id) => self.remove_subtree(id),
            None => Ok(0),
        }
    }

    /// Copy an entry, and for folders its whole subtree, to `target_path` on `target_storage`.
    ///
    /// Rows already at a target path are overwritten through [`FileCache::put`].
    /// The target's parent folder must be cached. Returns the id of the copied top entry.
    pub fn copy_from(&self, source_id: i64, target_storage: i64, target_path: &str) -> Result<i64> {
        let source = self.get_by_id(source_id)?.ok_or(CacheError::NotFound(source_id))?;
        let target_path = path_key::normalize(target_path);
        if source.storage_id == target_storage && path_key::is_within(&target_path, &source.path) {
            return Err(CacheError::InvalidParent {
                parent_id: source_id,
                reason: "cannot copy an entry into its own subtree",
            });
        }

        self.atomically(|| {
            let mut top_id = None;
            let mut copied = 0u64;
            // Parents are always written before their children are popped
            let mut queue = vec![(source, target_path.clone())];
            while let Some((entry, path)) = queue.pop() {
                let id = self.put(NewEntry {
                    storage_id: target_storage,
                    path: path.clone(),
                    parent_id: None,
                    kind: entry.kind,
                    size: entry.size,
                    mtime: entry.mtime,
                    mimetype: entry.mimetype.clone(),
                    etag: entry.etag.clone(),
                })?;
                top_id.get_or_insert(id);
                copied += 1;

                if entry.is_directory() {
                    for child in self.children_of(entry.id)? {
                        let child_path = path_key::join(&path, &child.name);
                        queue.push((child, child_path));
                    }
                }
            }

            log::debug!("File cache: copied {copied} entries to '{target_path}' on storage {target_storage}");
            top_id.ok_or(CacheError::NotFound(source_id))
        })
    }

    /// Drop every entry of a storage.
    pub fn clear_storage(&self, storage_id: i64) -> Result<u64> {
        let affected = self
            .conn
            .execute("DELETE FROM filecache WHERE storage = ?1", params![storage_id])?;
        Ok(affected as u64)
    }

    // ── Mounts ───────────────────────────────────────────────────────

    pub fn insert_mount(&self, mount: NewMount) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO mounts (storage_id, root_id, user_id, mount_point) VALUES (?1, ?2, ?3, ?4)",
            params![mount.storage_id, mount.root_id, mount.user_id, mount.mount_point],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All mount records, in id order.
    pub fn list_mounts(&self) -> Result<Vec<MountRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, storage_id, root_id, user_id, mount_point FROM mounts ORDER BY id")?;
        let rows = stmt.query_map([], mount_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn delete_mount(&self, id: i64) -> Result<()> {
        let affected = self.conn.execute("DELETE FROM mounts WHERE id = ?1", params![id])?;
        if affected == 0 {
            return Err(CacheError::NotFound(id));
        }
        Ok(())
    }

    // ── Meta ─────────────────────────────────────────────────────────

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Self::read_meta_value(&self.conn, key)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn read_meta_value(conn: &Connection, key: &str) -> Result<Option<String>> {
        let mut stmt = conn.prepare_cached("SELECT value FROM meta WHERE key = ?1")?;
        Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
