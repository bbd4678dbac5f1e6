//! Ingest batch writer.
//!
//! A batch is a scoped session owned by the replicator while it applies a
//! run of source transactions. Row changes are buffered in memory keyed by
//! `(bucket, source key)` with latest-wins semantics; `flush` persists the
//! buffered ops, allocates op-ids from the group counter and advances the
//! checkpoint in one transaction. A batch holds the per-group writer lock
//! for its whole lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::db::Db;
use crate::error::{Result, SyncError};
use crate::evaluator::{EvaluationResult, ParameterResult, SyncRules};
use crate::lookup::{encode_replica_id, from_hex, to_hex};
use crate::types::{
    op_checksum, row_to_json, CheckpointEvent, GroupState, OpId, OpKind, RowChange, RowData,
    RowValue, SourceTable,
};

/// Buffered bytes that trigger an automatic flush.
const DEFAULT_FLUSH_THRESHOLD: usize = 50 * 1024 * 1024;

/// Rows read per page while truncating a table.
const TRUNCATE_PAGE_ROWS: usize = 500;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// LSN meaning "no position"; commit LSNs below this are rejected.
    pub zero_lsn: String,
    /// Maintain per-row current-data state. Disabled during initial table
    /// snapshots, where every row is new and diffing is wasted work.
    pub store_current_data: bool,
    pub flush_threshold_bytes: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            zero_lsn: String::new(),
            store_current_data: true,
            flush_threshold_bytes: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

/// One buffered bucket op. Latest wins per `(bucket, source key)`.
struct PendingOp {
    kind: OpKind,
    source_table: i64,
    subkey: String,
    object_type: String,
    object_id: String,
    data: Option<String>,
    checksum: u32,
}

impl PendingOp {
    fn estimate_bytes(&self, bucket: &str) -> usize {
        bucket.len()
            + self.subkey.len()
            + self.object_type.len()
            + self.object_id.len()
            + self.data.as_ref().map(|d| d.len()).unwrap_or(0)
            + 96
    }
}

/// One buffered parameter row. An empty `bucket_parameters` array is a
/// tombstone.
struct PendingParameter {
    source_table: i64,
    source_key: Vec<u8>,
    lookup: Vec<u8>,
    bucket_parameters: String,
}

impl PendingParameter {
    fn estimate_bytes(&self) -> usize {
        self.source_key.len() + self.lookup.len() + self.bucket_parameters.len() + 64
    }
}

/// Per-bucket output recorded in a row's current-data entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CurrentBucket {
    bucket: String,
    object_type: String,
    object_id: String,
    /// crc32 of the evaluated row data; lets updates skip unchanged buckets.
    hash: u32,
}

/// Latest ingested state of one source row.
#[derive(Debug, Clone)]
struct CurrentRowState {
    data: String,
    buckets: Vec<CurrentBucket>,
    lookups: Vec<Vec<u8>>,
}

struct FlushOutcome {
    new_op_id: OpId,
    new_checkpoint: OpId,
}

/// An open ingest batch for one sync rule group.
pub struct BucketBatch {
    db: Db,
    rules: Arc<dyn SyncRules>,
    group_id: i64,
    options: BatchOptions,
    /// bucket -> source key -> op, both in first-appearance order. This is
    /// the op-id tie-break: ids are allocated bucket by bucket, then by key
    /// first-appearance, so replays produce identical ranges. The source key
    /// is `(table id, replica id bytes)`; two tables may share replica
    /// bytes without colliding.
    ops: IndexMap<String, IndexMap<(i64, Vec<u8>), PendingOp>>,
    parameters: Vec<PendingParameter>,
    /// In-batch view of current-data rows not yet flushed. `None` marks a
    /// pending delete.
    overlay: HashMap<(i64, Vec<u8>), Option<CurrentRowState>>,
    dropped_tables: Vec<i64>,
    buffered_bytes: usize,
    pending_lsn: Option<String>,
    /// Group counter observed after our last flush; a mismatch on the next
    /// flush means another writer got past the advisory lock.
    expected_op_id: Option<OpId>,
    closed: bool,
}

impl Db {
    /// Open an ingest batch, taking the per-group writer lock.
    pub fn start_batch(
        &self,
        group_id: i64,
        rules: Arc<dyn SyncRules>,
        options: BatchOptions,
    ) -> Result<BucketBatch> {
        {
            let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
            let state: Option<i32> = conn
                .query_row(
                    "SELECT state FROM sync_groups WHERE id = ?1",
                    params![group_id],
                    |row| row.get(0),
                )
                .optional()?;
            match state.and_then(GroupState::from_i32) {
                Some(GroupState::Processing) | Some(GroupState::Active) => {}
                Some(_) => return Err(SyncError::GroupStopped(group_id)),
                None => return Err(SyncError::GroupNotFound(group_id)),
            }
        }

        let mut active = self
            .core
            .active_batches
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !active.insert(group_id) {
            return Err(SyncError::BatchOpen(group_id));
        }
        drop(active);

        Ok(BucketBatch {
            db: self.clone(),
            rules,
            group_id,
            options,
            ops: IndexMap::new(),
            parameters: Vec::new(),
            overlay: HashMap::new(),
            dropped_tables: Vec::new(),
            buffered_bytes: 0,
            pending_lsn: None,
            expected_op_id: None,
            closed: false,
        })
    }

    /// Run a closure with a batch. On success the batch is flushed; on error
    /// buffered state is abandoned and no checkpoint advance occurs.
    pub fn with_batch<T, F>(
        &self,
        group_id: i64,
        rules: Arc<dyn SyncRules>,
        options: BatchOptions,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut BucketBatch) -> Result<T>,
    {
        let mut batch = self.start_batch(group_id, rules, options)?;
        match f(&mut batch) {
            Ok(value) => {
                batch.flush()?;
                Ok(value)
            }
            Err(e) => {
                batch.abort();
                Err(e)
            }
        }
    }
}

impl BucketBatch {
    pub fn group_id(&self) -> i64 {
        self.group_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SyncError::Other("batch is closed".into()));
        }
        Ok(())
    }

    /// Enqueue one row-level change from the CDC feed.
    pub fn save(&mut self, table: &SourceTable, change: RowChange) -> Result<()> {
        self.ensure_open()?;
        if !table.syncs_data && !table.syncs_parameters {
            return Ok(());
        }

        match change {
            RowChange::Insert { after } => {
                let key = self.replica_key(table, &after);
                self.process_row(table, key, Some(&after))?;
            }
            RowChange::Update { before, after } => {
                let after_key = self.replica_key(table, &after);
                if let Some(before) = before {
                    let before_key = self.replica_key(table, &before);
                    // Replica identity changed: the old row disappears.
                    if before_key != after_key {
                        self.process_row(table, before_key, None)?;
                    }
                }
                self.process_row(table, after_key, Some(&after))?;
            }
            RowChange::Delete { before } => {
                let key = self.replica_key(table, &before);
                self.process_row(table, key, None)?;
            }
        }

        self.maybe_auto_flush()
    }

    fn replica_key(&self, table: &SourceTable, record: &RowData) -> Vec<u8> {
        let values: Vec<RowValue> = table
            .replica_columns
            .iter()
            .map(|c| record.get(&c.name).cloned().unwrap_or(RowValue::Null))
            .collect();
        encode_replica_id(&values)
    }

    fn process_row(
        &mut self,
        table: &SourceTable,
        key: Vec<u8>,
        record: Option<&RowData>,
    ) -> Result<()> {
        let old = self.current_state(table.id, &key)?;
        if old.is_none() && record.is_none() {
            return Ok(());
        }

        let serialized = record.map(row_to_json);
        if let (Some(old), Some(serialized)) = (&old, &serialized) {
            // Identical record: the evaluator is deterministic, so every
            // derived output is identical too. Replays become no-ops.
            if old.data == *serialized {
                return Ok(());
            }
        }

        let subkey = make_subkey(table.id, &key);
        let rules = self.rules.clone();

        let mut new_buckets: Vec<CurrentBucket> = Vec::new();
        if table.syncs_data {
            struct NewOutput {
                object_type: String,
                object_id: String,
                data: String,
                hash: u32,
            }
            let mut outputs: IndexMap<String, NewOutput> = IndexMap::new();
            if let Some(record) = record {
                for result in rules.evaluate_row(table, record) {
                    match result {
                        EvaluationResult::Row(row) => {
                            let data = row_to_json(&row.data);
                            let hash = crc32fast::hash(data.as_bytes());
                            outputs.insert(
                                row.bucket,
                                NewOutput {
                                    object_type: row.object_type,
                                    object_id: row.object_id,
                                    data,
                                    hash,
                                },
                            );
                        }
                        EvaluationResult::Error(e) => {
                            tracing::warn!(
                                group_id = self.group_id,
                                table = %table.qualified_name(),
                                error = %e.message,
                                "row evaluation failed, skipping output"
                            );
                        }
                    }
                }
            }

            let old_buckets: Vec<CurrentBucket> =
                old.as_ref().map(|o| o.buckets.clone()).unwrap_or_default();

            // Vanished buckets first: the inverse op precedes the
            // superseding PUTs in the allocated op-id order.
            for old_bucket in &old_buckets {
                if outputs.contains_key(&old_bucket.bucket) {
                    continue;
                }
                let checksum = op_checksum(
                    OpKind::Remove,
                    &old_bucket.bucket,
                    Some(&subkey),
                    Some(&old_bucket.object_type),
                    Some(&old_bucket.object_id),
                    None,
                );
                self.push_op(
                    old_bucket.bucket.clone(),
                    key.clone(),
                    PendingOp {
                        kind: OpKind::Remove,
                        source_table: table.id,
                        subkey: subkey.clone(),
                        object_type: old_bucket.object_type.clone(),
                        object_id: old_bucket.object_id.clone(),
                        data: None,
                        checksum,
                    },
                );
            }

            for (bucket, out) in &outputs {
                let unchanged = old_buckets
                    .iter()
                    .any(|b| b.bucket == *bucket && b.hash == out.hash);
                if unchanged {
                    continue;
                }
                let checksum = op_checksum(
                    OpKind::Put,
                    bucket,
                    Some(&subkey),
                    Some(&out.object_type),
                    Some(&out.object_id),
                    Some(&out.data),
                );
                self.push_op(
                    bucket.clone(),
                    key.clone(),
                    PendingOp {
                        kind: OpKind::Put,
                        source_table: table.id,
                        subkey: subkey.clone(),
                        object_type: out.object_type.clone(),
                        object_id: out.object_id.clone(),
                        data: Some(out.data.clone()),
                        checksum,
                    },
                );
            }

            new_buckets = outputs
                .into_iter()
                .map(|(bucket, out)| CurrentBucket {
                    bucket,
                    object_type: out.object_type,
                    object_id: out.object_id,
                    hash: out.hash,
                })
                .collect();
        }

        let mut new_lookups: Vec<Vec<u8>> = Vec::new();
        if table.syncs_parameters {
            let mut param_map: IndexMap<Vec<u8>, Vec<JsonValue>> = IndexMap::new();
            if let Some(record) = record {
                for result in rules.evaluate_parameter_row(table, record) {
                    match result {
                        ParameterResult::Parameters(p) => {
                            param_map
                                .entry(p.lookup.into_bytes())
                                .or_default()
                                .extend(p.bucket_parameters);
                        }
                        ParameterResult::Error(e) => {
                            tracing::warn!(
                                group_id = self.group_id,
                                table = %table.qualified_name(),
                                error = %e.message,
                                "parameter evaluation failed, skipping output"
                            );
                        }
                    }
                }
            }

            let old_lookups: Vec<Vec<u8>> =
                old.as_ref().map(|o| o.lookups.clone()).unwrap_or_default();

            for (lookup, rows) in &param_map {
                self.push_parameter(PendingParameter {
                    source_table: table.id,
                    source_key: key.clone(),
                    lookup: lookup.clone(),
                    bucket_parameters: JsonValue::Array(rows.clone()).to_string(),
                });
            }
            for old_lookup in &old_lookups {
                if !param_map.contains_key(old_lookup) {
                    self.push_parameter(PendingParameter {
                        source_table: table.id,
                        source_key: key.clone(),
                        lookup: old_lookup.clone(),
                        bucket_parameters: "[]".into(),
                    });
                }
            }

            new_lookups = param_map.into_keys().collect();
        }

        if self.options.store_current_data {
            let new_state = serialized.map(|data| CurrentRowState {
                data,
                buckets: new_buckets,
                lookups: new_lookups,
            });
            self.overlay.insert((table.id, key), new_state);
        }

        Ok(())
    }

    /// Emit REMOVE ops and parameter tombstones for every row previously
    /// seen in each table, then forget those rows.
    pub fn truncate(&mut self, tables: &[SourceTable]) -> Result<()> {
        self.ensure_open()?;
        for table in tables {
            self.truncate_table(table)?;
        }
        Ok(())
    }

    /// Truncate, then remove the tables from the registry.
    pub fn drop_tables(&mut self, tables: &[SourceTable]) -> Result<()> {
        self.truncate(tables)?;
        self.dropped_tables.extend(tables.iter().map(|t| t.id));
        Ok(())
    }

    fn truncate_table(&mut self, table: &SourceTable) -> Result<()> {
        // Unflushed rows first.
        let buffered: Vec<Vec<u8>> = self
            .overlay
            .iter()
            .filter(|((t, _), state)| *t == table.id && state.is_some())
            .map(|((_, k), _)| k.clone())
            .collect();
        for key in buffered {
            if let Some(Some(state)) = self.overlay.get(&(table.id, key.clone())).cloned() {
                self.remove_row(table.id, &key, &state);
            }
            self.overlay.insert((table.id, key), None);
        }

        // Persisted rows, one page at a time.
        let mut last_key: Vec<u8> = Vec::new();
        loop {
            let page = self.read_current_page(table.id, &last_key)?;
            if page.is_empty() {
                break;
            }
            for (key, state) in page {
                last_key = key.clone();
                if self.overlay.contains_key(&(table.id, key.clone())) {
                    continue;
                }
                self.remove_row(table.id, &key, &state);
                self.overlay.insert((table.id, key), None);
            }
            self.maybe_auto_flush()?;
        }
        Ok(())
    }

    fn remove_row(&mut self, table_id: i64, key: &[u8], state: &CurrentRowState) {
        let subkey = make_subkey(table_id, key);
        for b in &state.buckets {
            let checksum = op_checksum(
                OpKind::Remove,
                &b.bucket,
                Some(&subkey),
                Some(&b.object_type),
                Some(&b.object_id),
                None,
            );
            self.push_op(
                b.bucket.clone(),
                key.to_vec(),
                PendingOp {
                    kind: OpKind::Remove,
                    source_table: table_id,
                    subkey: subkey.clone(),
                    object_type: b.object_type.clone(),
                    object_id: b.object_id.clone(),
                    data: None,
                    checksum,
                },
            );
        }
        for lookup in &state.lookups {
            self.push_parameter(PendingParameter {
                source_table: table_id,
                source_key: key.to_vec(),
                lookup: lookup.clone(),
                bucket_parameters: "[]".into(),
            });
        }
    }

    /// Mark that all changes up to `lsn` are enqueued, and flush.
    pub fn commit(&mut self, lsn: &str) -> Result<()> {
        self.ensure_open()?;
        if lsn < self.options.zero_lsn.as_str() {
            return Err(SyncError::Integrity(format!(
                "commit lsn {lsn:?} below zero lsn {:?}",
                self.options.zero_lsn
            )));
        }
        self.pending_lsn = Some(lsn.to_string());
        self.flush()
    }

    /// Advance the checkpoint LSN without emitting ops. A no-op when `lsn`
    /// is not past the stored position.
    pub fn keepalive(&mut self, lsn: &str) -> Result<()> {
        self.ensure_open()?;
        if self.has_buffered() {
            return self.commit(lsn);
        }

        let event = {
            let conn = self.db.core.conn.lock().unwrap_or_else(|e| e.into_inner());
            let updated = conn.execute(
                "UPDATE sync_groups SET last_checkpoint_lsn = ?1, updated_at = ?2
                 WHERE id = ?3
                   AND (last_checkpoint_lsn IS NULL OR last_checkpoint_lsn < ?1)",
                params![lsn, Db::now_ms(), self.group_id],
            )?;
            if updated == 0 {
                None
            } else {
                let checkpoint: i64 = conn.query_row(
                    "SELECT last_checkpoint FROM sync_groups WHERE id = ?1",
                    params![self.group_id],
                    |row| row.get(0),
                )?;
                Some(CheckpointEvent {
                    group_id: self.group_id,
                    checkpoint: checkpoint as OpId,
                    lsn: Some(lsn.to_string()),
                })
            }
        };
        if let Some(event) = event {
            self.db.notify_checkpoint(event);
        }
        Ok(())
    }

    /// Set `snapshot_done` on the tables and raise the group's
    /// `no_checkpoint_before_lsn` floor to `lsn`.
    pub fn mark_snapshot_done(&mut self, tables: &[SourceTable], lsn: &str) -> Result<()> {
        self.ensure_open()?;
        let ids: Vec<i64> = tables.iter().map(|t| t.id).collect();

        let conn = self.db.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            self.db.set_snapshot_done(&conn, &ids)?;
            conn.execute(
                "UPDATE sync_groups
                 SET no_checkpoint_before_lsn = MAX(no_checkpoint_before_lsn, ?1),
                     updated_at = ?2
                 WHERE id = ?3",
                params![lsn, Db::now_ms(), self.group_id],
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

    /// Persist buffered ops and advance the checkpoint atomically.
    ///
    /// Either every buffered op becomes visible together with the new
    /// checkpoint, or nothing changes and the batch may be retried.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.has_buffered() && self.pending_lsn.is_none() {
            return Ok(());
        }

        let outcome = {
            let conn = self.db.core.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute("BEGIN IMMEDIATE", [])?;
            match self.flush_locked(&conn) {
                Ok(outcome) => {
                    conn.execute("COMMIT", [])?;
                    Ok(outcome)
                }
                Err(e) => {
                    let _ = conn.execute("ROLLBACK", []);
                    Err(e)
                }
            }
        };

        match outcome {
            Ok(outcome) => {
                self.ops.clear();
                self.parameters.clear();
                self.overlay.clear();
                self.dropped_tables.clear();
                self.buffered_bytes = 0;
                self.expected_op_id = Some(outcome.new_op_id);
                if let Some(lsn) = self.pending_lsn.take() {
                    self.db.notify_checkpoint(CheckpointEvent {
                        group_id: self.group_id,
                        checkpoint: outcome.new_checkpoint,
                        lsn: Some(lsn),
                    });
                }
                Ok(())
            }
            Err(SyncError::Integrity(msg)) => {
                self.db.fail_group(self.group_id, &msg);
                self.closed = true;
                Err(SyncError::Integrity(msg))
            }
            Err(e) => Err(e),
        }
    }

    fn flush_locked(&self, conn: &Connection) -> Result<FlushOutcome> {
        let row: Option<(i32, i64, i64, Option<String>)> = conn
            .query_row(
                "SELECT state, last_op_id, last_checkpoint, last_checkpoint_lsn
                 FROM sync_groups WHERE id = ?1",
                params![self.group_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let (state, last_op_id, last_checkpoint, stored_lsn) =
            row.ok_or(SyncError::GroupNotFound(self.group_id))?;

        match GroupState::from_i32(state) {
            Some(GroupState::Processing) | Some(GroupState::Active) => {}
            Some(GroupState::Terminated) | None => {
                return Err(SyncError::GroupNotFound(self.group_id))
            }
            Some(_) => return Err(SyncError::GroupStopped(self.group_id)),
        }

        if let Some(expected) = self.expected_op_id {
            if expected != last_op_id as OpId {
                return Err(SyncError::Integrity(format!(
                    "op id counter moved outside this batch: expected {expected}, found {last_op_id}"
                )));
            }
        }
        if let (Some(pending), Some(stored)) = (&self.pending_lsn, &stored_lsn) {
            if pending.as_str() < stored.as_str() {
                return Err(SyncError::Integrity(format!(
                    "commit lsn {pending:?} is behind checkpoint lsn {stored:?}"
                )));
            }
        }

        let mut op_id = last_op_id as OpId;
        let mut op_rows = 0usize;

        {
            let mut insert_op = conn.prepare(
                "INSERT INTO bucket_data
                 (group_id, bucket, op_id, op, source_table, source_key, subkey,
                  object_type, object_id, data, checksum, target_op)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)",
            )?;
            for (bucket, keyed) in &self.ops {
                for ((_, source_key), op) in keyed {
                    op_id += 1;
                    op_rows += 1;
                    insert_op.execute(params![
                        self.group_id,
                        bucket,
                        op_id as i64,
                        op.kind as i32,
                        op.source_table,
                        source_key,
                        op.subkey,
                        op.object_type,
                        op.object_id,
                        op.data,
                        op.checksum as i64,
                    ])?;
                }
            }
        }

        {
            let mut insert_parameter = conn.prepare(
                "INSERT INTO bucket_parameters
                 (group_id, op_id, source_table, source_key, lookup, bucket_parameters)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for p in &self.parameters {
                op_id += 1;
                insert_parameter.execute(params![
                    self.group_id,
                    op_id as i64,
                    p.source_table,
                    p.source_key,
                    p.lookup,
                    p.bucket_parameters,
                ])?;
            }
        }

        for ((table_id, key), state) in &self.overlay {
            match state {
                Some(s) => {
                    let buckets = serde_json::to_string(&s.buckets)
                        .map_err(|e| SyncError::InvalidData(e.to_string()))?;
                    let lookups: Vec<String> = s.lookups.iter().map(|l| to_hex(l)).collect();
                    let lookups = serde_json::to_string(&lookups)
                        .map_err(|e| SyncError::InvalidData(e.to_string()))?;
                    conn.execute(
                        "INSERT OR REPLACE INTO current_data
                         (group_id, source_table, source_key, data, buckets, lookups)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![self.group_id, table_id, key, s.data, buckets, lookups],
                    )?;
                }
                None => {
                    conn.execute(
                        "DELETE FROM current_data
                         WHERE group_id = ?1 AND source_table = ?2 AND source_key = ?3",
                        params![self.group_id, table_id, key],
                    )?;
                }
            }
        }

        for table_id in &self.dropped_tables {
            conn.execute(
                "DELETE FROM current_data WHERE group_id = ?1 AND source_table = ?2",
                params![self.group_id, table_id],
            )?;
            conn.execute(
                "DELETE FROM source_tables WHERE id = ?1",
                params![table_id],
            )?;
        }

        let new_checkpoint = if self.pending_lsn.is_some() {
            op_id
        } else {
            last_checkpoint as OpId
        };
        conn.execute(
            "UPDATE sync_groups
             SET last_op_id = ?1,
                 last_checkpoint = ?2,
                 last_checkpoint_lsn = COALESCE(?3, last_checkpoint_lsn),
                 updated_at = ?4
             WHERE id = ?5",
            params![
                op_id as i64,
                new_checkpoint as i64,
                self.pending_lsn,
                Db::now_ms(),
                self.group_id
            ],
        )?;

        tracing::debug!(
            group_id = self.group_id,
            ops = op_rows,
            parameters = self.parameters.len(),
            bytes = self.buffered_bytes,
            lsn = self.pending_lsn.as_deref().unwrap_or(""),
            "flushed batch"
        );

        Ok(FlushOutcome {
            new_op_id: op_id,
            new_checkpoint,
        })
    }

    /// Discard buffered state without advancing any checkpoint.
    pub fn abort(&mut self) {
        self.ops.clear();
        self.parameters.clear();
        self.overlay.clear();
        self.dropped_tables.clear();
        self.buffered_bytes = 0;
        self.pending_lsn = None;
        self.closed = true;
    }

    fn has_buffered(&self) -> bool {
        !self.ops.is_empty()
            || !self.parameters.is_empty()
            || !self.overlay.is_empty()
            || !self.dropped_tables.is_empty()
    }

    fn maybe_auto_flush(&mut self) -> Result<()> {
        if self.buffered_bytes >= self.options.flush_threshold_bytes {
            self.flush()?;
        }
        Ok(())
    }

    fn push_op(&mut self, bucket: String, source_key: Vec<u8>, op: PendingOp) {
        self.buffered_bytes += op.estimate_bytes(&bucket);
        let key = (op.source_table, source_key);
        if let Some(replaced) = self.ops.entry(bucket.clone()).or_default().insert(key, op) {
            self.buffered_bytes = self
                .buffered_bytes
                .saturating_sub(replaced.estimate_bytes(&bucket));
        }
    }

    fn push_parameter(&mut self, parameter: PendingParameter) {
        self.buffered_bytes += parameter.estimate_bytes();
        self.parameters.push(parameter);
    }

    fn current_state(&self, table_id: i64, key: &[u8]) -> Result<Option<CurrentRowState>> {
        if !self.options.store_current_data {
            return Ok(None);
        }
        if let Some(state) = self.overlay.get(&(table_id, key.to_vec())) {
            return Ok(state.clone());
        }

        let conn = self.db.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT data, buckets, lookups FROM current_data
                 WHERE group_id = ?1 AND source_table = ?2 AND source_key = ?3",
                params![self.group_id, table_id, key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((data, buckets, lookups)) => Ok(Some(parse_current_row(data, &buckets, &lookups)?)),
        }
    }

    fn read_current_page(
        &self,
        table_id: i64,
        after_key: &[u8],
    ) -> Result<Vec<(Vec<u8>, CurrentRowState)>> {
        let conn = self.db.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT source_key, data, buckets, lookups FROM current_data
             WHERE group_id = ?1 AND source_table = ?2 AND source_key > ?3
             ORDER BY source_key LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![self.group_id, table_id, after_key, TRUNCATE_PAGE_ROWS as i64],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )?;

        let mut page = Vec::new();
        for row in rows {
            let (key, data, buckets, lookups) = row?;
            page.push((key, parse_current_row(data, &buckets, &lookups)?));
        }
        Ok(page)
    }
}

impl Drop for BucketBatch {
    fn drop(&mut self) {
        let mut active = self
            .db
            .core
            .active_batches
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        active.remove(&self.group_id);
    }
}

fn parse_current_row(data: String, buckets: &str, lookups: &str) -> Result<CurrentRowState> {
    let buckets: Vec<CurrentBucket> = serde_json::from_str(buckets)
        .map_err(|e| SyncError::InvalidData(format!("bad current_data buckets: {e}")))?;
    let lookup_hex: Vec<String> = serde_json::from_str(lookups)
        .map_err(|e| SyncError::InvalidData(format!("bad current_data lookups: {e}")))?;
    let lookups = lookup_hex
        .iter()
        .map(|h| from_hex(h))
        .collect::<Result<Vec<_>>>()?;
    Ok(CurrentRowState {
        data,
        buckets,
        lookups,
    })
}

/// Stable per-source-key discriminator carried on PUT/REMOVE ops.
fn make_subkey(table_id: i64, source_key: &[u8]) -> String {
    format!("{}/{}", table_id, to_hex(source_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvaluatedRow;

    /// Routes every row of every table to one bucket named after the table.
    struct TableBuckets;

    impl SyncRules for TableBuckets {
        fn evaluate_row(&self, table: &SourceTable, record: &RowData) -> Vec<EvaluationResult> {
            let id = match record.get("id") {
                Some(RowValue::Integer(i)) => i.to_string(),
                Some(RowValue::Text(s)) => s.clone(),
                _ => "?".into(),
            };
            vec![EvaluationResult::Row(EvaluatedRow {
                bucket: format!("by_table[\"{}\"]", table.name),
                object_type: table.name.clone(),
                object_id: id,
                data: record.clone(),
            })]
        }

        fn evaluate_parameter_row(&self, _: &SourceTable, _: &RowData) -> Vec<ParameterResult> {
            Vec::new()
        }

        fn syncs_data(&self, _: &str, _: &str) -> bool {
            true
        }

        fn syncs_parameters(&self, _: &str, _: &str) -> bool {
            false
        }
    }

    fn test_table(db: &Db, group: i64) -> SourceTable {
        let descriptor = crate::types::SourceTableDescriptor {
            relation_id: Some(1),
            schema: "public".into(),
            name: "users".into(),
            replica_columns: vec![crate::types::ReplicaColumn {
                name: "id".into(),
                type_name: "int8".into(),
                type_oid: None,
            }],
        };
        db.resolve_table(group, "c1", "default", &descriptor, &TableBuckets)
            .unwrap()
            .table
    }

    fn row(id: i64) -> RowData {
        let mut r = RowData::new();
        r.insert("id".into(), RowValue::Integer(id));
        r
    }

    #[test]
    fn test_insert_commit_advances_checkpoint() {
        let db = Db::open_memory().unwrap();
        let group = db.create_group().unwrap();
        let table = test_table(&db, group);

        let mut batch = db
            .start_batch(group, Arc::new(TableBuckets), BatchOptions::default())
            .unwrap();
        batch
            .save(&table, RowChange::Insert { after: row(1) })
            .unwrap();
        batch.commit("0/10").unwrap();
        drop(batch);

        let checkpoint = db.get_checkpoint(group).unwrap();
        assert_eq!(checkpoint.checkpoint, 1);
        assert_eq!(checkpoint.lsn.as_deref(), Some("0/10"));
    }

    #[test]
    fn test_second_batch_rejected_while_open() {
        let db = Db::open_memory().unwrap();
        let group = db.create_group().unwrap();

        let _batch = db
            .start_batch(group, Arc::new(TableBuckets), BatchOptions::default())
            .unwrap();
        let second = db.start_batch(group, Arc::new(TableBuckets), BatchOptions::default());
        assert!(matches!(second, Err(SyncError::BatchOpen(_))));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let db = Db::open_memory().unwrap();
        let group = db.create_group().unwrap();

        {
            let _batch = db
                .start_batch(group, Arc::new(TableBuckets), BatchOptions::default())
                .unwrap();
        }
        db.start_batch(group, Arc::new(TableBuckets), BatchOptions::default())
            .unwrap();
    }

    #[test]
    fn test_latest_wins_within_batch() {
        let db = Db::open_memory().unwrap();
        let group = db.create_group().unwrap();
        let table = test_table(&db, group);

        let mut batch = db
            .start_batch(group, Arc::new(TableBuckets), BatchOptions::default())
            .unwrap();
        let mut updated = row(1);
        updated.insert("name".into(), RowValue::Text("alice".into()));
        batch
            .save(&table, RowChange::Insert { after: row(1) })
            .unwrap();
        batch
            .save(
                &table,
                RowChange::Update {
                    before: Some(row(1)),
                    after: updated,
                },
            )
            .unwrap();
        batch.commit("0/10").unwrap();

        // One source key, one bucket: a single op survives.
        let stats = db.group_stats(group).unwrap();
        assert_eq!(stats.op_count, 1);
        assert_eq!(stats.last_checkpoint, 1);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let db = Db::open_memory().unwrap();
        let group = db.create_group().unwrap();
        let table = test_table(&db, group);

        for _ in 0..2 {
            let mut batch = db
                .start_batch(group, Arc::new(TableBuckets), BatchOptions::default())
                .unwrap();
            batch
                .save(&table, RowChange::Insert { after: row(1) })
                .unwrap();
            batch.commit("0/10").unwrap();
        }

        let stats = db.group_stats(group).unwrap();
        assert_eq!(stats.op_count, 1);
        assert_eq!(stats.current_count, 1);
    }

    #[test]
    fn test_abort_leaves_no_trace() {
        let db = Db::open_memory().unwrap();
        let group = db.create_group().unwrap();
        let table = test_table(&db, group);

        let mut batch = db
            .start_batch(group, Arc::new(TableBuckets), BatchOptions::default())
            .unwrap();
        batch
            .save(&table, RowChange::Insert { after: row(1) })
            .unwrap();
        batch.abort();
        drop(batch);

        let stats = db.group_stats(group).unwrap();
        assert_eq!(stats.op_count, 0);
        assert_eq!(db.get_checkpoint(group).unwrap().checkpoint, 0);
    }

    #[test]
    fn test_keepalive_floor() {
        let db = Db::open_memory().unwrap();
        let group = db.create_group().unwrap();

        let mut batch = db
            .start_batch(group, Arc::new(TableBuckets), BatchOptions::default())
            .unwrap();
        batch.keepalive("0/20").unwrap();
        batch.keepalive("0/10").unwrap();
        drop(batch);

        let checkpoint = db.get_checkpoint(group).unwrap();
        assert_eq!(checkpoint.lsn.as_deref(), Some("0/20"));
    }

    #[test]
    fn test_commit_behind_checkpoint_stops_group() {
        let db = Db::open_memory().unwrap();
        let group = db.create_group().unwrap();
        let table = test_table(&db, group);

        let mut batch = db
            .start_batch(group, Arc::new(TableBuckets), BatchOptions::default())
            .unwrap();
        batch
            .save(&table, RowChange::Insert { after: row(1) })
            .unwrap();
        batch.commit("0/20").unwrap();
        batch
            .save(&table, RowChange::Delete { before: row(1) })
            .unwrap();
        let result = batch.commit("0/10");
        assert!(matches!(result, Err(SyncError::Integrity(_))));
        drop(batch);

        let groups = db.list_groups().unwrap();
        assert_eq!(groups[0].state, GroupState::Stop);
        assert!(groups[0].last_fatal_error.is_some());
    }
}
