use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

use crate::checksum::ChecksumCache;
use crate::error::{Result, SyncError};
use crate::types::{
    CheckpointEvent, CheckpointInfo, GroupInfo, GroupState, GroupStats, OpId,
};

/// Default soft deadline for admin clear operations.
const DEFAULT_CLEAR_DEADLINE: Duration = Duration::from_secs(30);

/// Rows deleted per clear iteration; each iteration is its own transaction so
/// retries after a busy timeout still make progress.
const CLEAR_CHUNK_ROWS: usize = 5_000;

/// Shared storage backend (SQLite connection plus per-group runtime state).
pub(crate) struct DbCore {
    pub(crate) conn: Mutex<Connection>,
    /// Groups with an open ingest batch. A batch holds the per-group writer
    /// lock for its whole lifetime; readers never touch this.
    pub(crate) active_batches: Mutex<HashSet<i64>>,
    /// Checkpoint advances are published here (flush with a commit LSN,
    /// keepalive). Sync APIs subscribe to wake long-poll clients.
    pub(crate) checkpoint_tx: broadcast::Sender<CheckpointEvent>,
    /// Per-group checksum caches, created on demand.
    checksum_caches: Mutex<HashMap<i64, Arc<ChecksumCache>>>,
}

/// Handle to a synclite database.
///
/// Cheap to clone; all clones share one connection and one set of per-group
/// caches.
///
/// # Example
/// ```
/// use synclite::Db;
///
/// let db = Db::open_memory().unwrap();
/// let group = db.create_group().unwrap();
///
/// // No checkpoint yet: readers see an empty stream.
/// let checkpoint = db.get_checkpoint(group).unwrap();
/// assert_eq!(checkpoint.checkpoint, 0);
/// assert_eq!(checkpoint.lsn, None);
/// ```
#[derive(Clone)]
pub struct Db {
    pub(crate) core: Arc<DbCore>,
}

impl Db {
    /// Open or create a database at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;",
        )?;

        let (checkpoint_tx, _) = broadcast::channel(256);
        let core = Arc::new(DbCore {
            conn: Mutex::new(conn),
            active_batches: Mutex::new(HashSet::new()),
            checkpoint_tx,
            checksum_caches: Mutex::new(HashMap::new()),
        });

        let db = Self { core };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Open a database with a specific page cache size in MB.
    pub fn open_with_cache(path: &str, cache_mb: i64) -> Result<Self> {
        let db = Self::open(path)?;
        {
            let conn = db.core.conn.lock().unwrap_or_else(|e| e.into_inner());
            let cache_kb = cache_mb * 1000;
            conn.execute_batch(&format!("PRAGMA cache_size = -{};", cache_kb))?;
        }
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(include_str!("schema.sql"))?;

        // Migration: add snapshot_done to source_tables if it predates the
        // column. Legacy rows read as done so existing tables keep syncing.
        let has_snapshot_done: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('source_tables') WHERE name = 'snapshot_done'",
                [],
                |row| row.get::<_, i32>(0).map(|c| c > 0),
            )
            .unwrap_or(false);

        if !has_snapshot_done {
            conn.execute(
                "ALTER TABLE source_tables ADD COLUMN snapshot_done INTEGER NOT NULL DEFAULT 1",
                [],
            )?;
        }

        Ok(())
    }

    pub(crate) fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    // ===== Sync rule groups =====

    /// Allocate a new sync rule group in PROCESSING state.
    pub fn create_group(&self) -> Result<i64> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = Self::now_ms();
        conn.execute(
            "INSERT INTO sync_groups (state, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![GroupState::Processing as i32, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The ACTIVE group id, if any. Sync APIs route reads here.
    pub fn active_group(&self) -> Result<Option<i64>> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let id = conn
            .query_row(
                "SELECT id FROM sync_groups WHERE state = ?1 ORDER BY id DESC LIMIT 1",
                params![GroupState::Active as i32],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// List all groups with their state and checkpoint positions.
    pub fn list_groups(&self) -> Result<Vec<GroupInfo>> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, state, last_checkpoint, last_checkpoint_lsn, last_fatal_error
             FROM sync_groups ORDER BY id",
        )?;
        let groups = stmt
            .query_map([], |row| {
                Ok(GroupInfo {
                    id: row.get(0)?,
                    state: GroupState::from_i32(row.get(1)?).unwrap_or(GroupState::Stop),
                    last_checkpoint: row.get::<_, i64>(2)? as OpId,
                    last_checkpoint_lsn: row.get(3)?,
                    last_fatal_error: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    /// Transactionally promote this group PROCESSING -> ACTIVE and demote any
    /// other ACTIVE group to STOP.
    pub fn auto_activate(&self, group_id: i64) -> Result<()> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<()> {
            let state: Option<i32> = conn
                .query_row(
                    "SELECT state FROM sync_groups WHERE id = ?1",
                    params![group_id],
                    |row| row.get(0),
                )
                .optional()?;
            let state = state.ok_or(SyncError::GroupNotFound(group_id))?;
            match GroupState::from_i32(state) {
                Some(GroupState::Processing) | Some(GroupState::Active) => {}
                _ => return Err(SyncError::GroupStopped(group_id)),
            }

            conn.execute(
                "UPDATE sync_groups SET state = ?1, updated_at = ?2 WHERE state = ?3 AND id != ?4",
                params![
                    GroupState::Stop as i32,
                    Self::now_ms(),
                    GroupState::Active as i32,
                    group_id
                ],
            )?;
            conn.execute(
                "UPDATE sync_groups SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![GroupState::Active as i32, Self::now_ms(), group_id],
            )?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Terminate a group. With `clear_storage` (the default for retiring a
    /// group), all op, parameter and current-data entries are dropped.
    pub fn terminate(&self, group_id: i64, clear_storage: bool) -> Result<()> {
        {
            let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
            let updated = conn.execute(
                "UPDATE sync_groups
                 SET state = ?1, last_checkpoint_lsn = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![GroupState::Terminated as i32, Self::now_ms(), group_id],
            )?;
            if updated == 0 {
                return Err(SyncError::GroupNotFound(group_id));
            }
        }
        if clear_storage {
            self.clear(group_id)?;
        }
        Ok(())
    }

    /// Drop all op, parameter and current-data entries for a group.
    ///
    /// Idempotent. Deletes run in bounded chunks, each its own transaction,
    /// so a busy storage engine loses at most one chunk of progress; on a
    /// busy timeout the iteration backs off and retries.
    pub fn clear(&self, group_id: i64) -> Result<()> {
        self.clear_with_deadline(group_id, DEFAULT_CLEAR_DEADLINE)
    }

    pub fn clear_with_deadline(&self, group_id: i64, deadline: Duration) -> Result<()> {
        for table in ["bucket_data", "bucket_parameters", "current_data"] {
            loop {
                let deleted = self.clear_chunk(group_id, table);
                match deleted {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.is_busy() => {
                        tracing::warn!(
                            group_id,
                            table,
                            "clear timed out on busy storage, retrying"
                        );
                        std::thread::sleep(deadline / 5);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.invalidate_checksum_cache(group_id);
        Ok(())
    }

    fn clear_chunk(&self, group_id: i64, table: &str) -> Result<usize> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {table} WHERE rowid IN
                 (SELECT rowid FROM {table} WHERE group_id = ?1 LIMIT ?2)"
            ),
            params![group_id, CLEAR_CHUNK_ROWS as i64],
        )?;
        Ok(deleted)
    }

    /// Persist a fatal error message for a group without failing.
    pub fn report_error(&self, group_id: i64, error: &str) {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let _ = conn.execute(
            "UPDATE sync_groups SET last_fatal_error = ?1, updated_at = ?2 WHERE id = ?3",
            params![error, Self::now_ms(), group_id],
        );
    }

    /// Record a fatal integrity failure: the error is persisted and the
    /// group moves to STOP so the writer aborts.
    pub(crate) fn fail_group(&self, group_id: i64, error: &str) {
        tracing::error!(group_id, error, "integrity violation, stopping group");
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let _ = conn.execute(
            "UPDATE sync_groups
             SET state = ?1, last_fatal_error = ?2, updated_at = ?3
             WHERE id = ?4",
            params![GroupState::Stop as i32, error, Self::now_ms(), group_id],
        );
    }

    // ===== Checkpoints =====

    /// The checkpoint visible to readers of this group.
    ///
    /// Returns `{0, None}` until a commit LSN at or past
    /// `no_checkpoint_before_lsn` has landed.
    pub fn get_checkpoint(&self, group_id: i64) -> Result<CheckpointInfo> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row: Option<(i32, i64, Option<String>, String)> = conn
            .query_row(
                "SELECT state, last_checkpoint, last_checkpoint_lsn, no_checkpoint_before_lsn
                 FROM sync_groups WHERE id = ?1",
                params![group_id],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                },
            )
            .optional()?;

        let (state, last_checkpoint, lsn, no_checkpoint_before) =
            row.ok_or(SyncError::GroupNotFound(group_id))?;
        if GroupState::from_i32(state) == Some(GroupState::Terminated) {
            return Err(SyncError::GroupNotFound(group_id));
        }

        match lsn {
            Some(lsn) if lsn.as_str() >= no_checkpoint_before.as_str() => Ok(CheckpointInfo {
                checkpoint: last_checkpoint as OpId,
                lsn: Some(lsn),
            }),
            _ => Ok(CheckpointInfo {
                checkpoint: 0,
                lsn: None,
            }),
        }
    }

    /// Storage counters for one group (admin CLI).
    pub fn group_stats(&self, group_id: i64) -> Result<GroupStats> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let last_checkpoint: Option<i64> = conn
            .query_row(
                "SELECT last_checkpoint FROM sync_groups WHERE id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()?;
        let last_checkpoint = last_checkpoint.ok_or(SyncError::GroupNotFound(group_id))?;

        let count = |sql: &str| -> Result<i64> {
            Ok(conn.query_row(sql, params![group_id], |row| row.get(0))?)
        };
        Ok(GroupStats {
            op_count: count("SELECT COUNT(*) FROM bucket_data WHERE group_id = ?1")?,
            parameter_count: count("SELECT COUNT(*) FROM bucket_parameters WHERE group_id = ?1")?,
            current_count: count("SELECT COUNT(*) FROM current_data WHERE group_id = ?1")?,
            last_checkpoint: last_checkpoint as OpId,
        })
    }

    /// Subscribe to checkpoint advances across all groups.
    pub fn watch_checkpoints(&self) -> broadcast::Receiver<CheckpointEvent> {
        self.core.checkpoint_tx.subscribe()
    }

    pub(crate) fn notify_checkpoint(&self, event: CheckpointEvent) {
        // No receivers is fine; embedded callers often do not subscribe.
        let _ = self.core.checkpoint_tx.send(event);
    }

    // ===== Shared caches =====

    pub(crate) fn checksum_cache(&self, group_id: i64) -> Arc<ChecksumCache> {
        let mut caches = self
            .core
            .checksum_caches
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        caches
            .entry(group_id)
            .or_insert_with(|| Arc::new(ChecksumCache::default()))
            .clone()
    }

    pub fn invalidate_checksum_cache(&self, group_id: i64) {
        let caches = self
            .core
            .checksum_caches
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(cache) = caches.get(&group_id) {
            cache.clear();
        }
    }
}
