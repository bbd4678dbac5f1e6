//! Compactor.
//!
//! Rewrites historical bucket ranges into smaller equivalent forms without
//! changing any client-observable checksum. Superseded PUT/REMOVE ops become
//! MOVEs carrying the original checksum; an all-MOVE/REMOVE bucket prefix
//! collapses into a single CLEAR whose checksum is the modular sum of the
//! collapsed ops. Rewrites run in bounded atomic batches.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};

use crate::db::Db;
use crate::error::{Result, SyncError};
use crate::types::{OpId, OpKind};

/// Ops scanned per page during the rewrite passes.
const SCAN_PAGE_ROWS: usize = 2000;

#[derive(Debug, Clone)]
pub struct CompactOptions {
    /// Budget for the per-bucket source-key tracking map. Keys beyond the
    /// budget are left for a later run.
    pub memory_limit_mb: usize,
    /// Ops within this distance of the checkpoint are never rewritten.
    pub max_op_id_lag: u64,
    /// MOVE rewrites applied per transaction.
    pub move_batch_limit: usize,
    /// Prefix ops collapsed into a CLEAR per transaction. Zero disables the
    /// CLEAR phase.
    pub clear_batch_limit: usize,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self {
            memory_limit_mb: 64,
            max_op_id_lag: 1000,
            move_batch_limit: 2000,
            clear_batch_limit: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompactStats {
    pub buckets: usize,
    pub moved_ops: u64,
    pub cleared_ops: u64,
}

impl Db {
    /// Compact all buckets of a group. The working window is fixed once at
    /// start: ops above `checkpoint - max_op_id_lag` are never touched, so a
    /// tip advancing mid-run is unaffected.
    pub fn compact(&self, group_id: i64, options: &CompactOptions) -> Result<CompactStats> {
        let checkpoint = {
            let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
            let checkpoint: Option<i64> = conn
                .query_row(
                    "SELECT last_checkpoint FROM sync_groups WHERE id = ?1",
                    params![group_id],
                    |row| row.get(0),
                )
                .optional()?;
            checkpoint.ok_or(SyncError::GroupNotFound(group_id))? as OpId
        };

        let upper = checkpoint.saturating_sub(options.max_op_id_lag);
        let mut stats = CompactStats::default();
        if upper == 0 {
            return Ok(stats);
        }

        let buckets = self.list_buckets(group_id)?;
        stats.buckets = buckets.len();
        let memory_limit = options.memory_limit_mb * 1024 * 1024;

        for bucket in &buckets {
            stats.moved_ops +=
                self.compact_bucket_moves(group_id, bucket, upper, memory_limit, options)?;
        }
        if options.clear_batch_limit > 0 {
            for bucket in &buckets {
                stats.cleared_ops += self.compact_bucket_clear(group_id, bucket, upper, options)?;
            }
            if stats.cleared_ops > 0 {
                // Collapses change op counts over rewritten prefixes; cached
                // folds must not mix pre- and post-collapse values.
                self.invalidate_checksum_cache(group_id);
            }
        }

        tracing::info!(
            group_id,
            buckets = stats.buckets,
            moved = stats.moved_ops,
            cleared = stats.cleared_ops,
            "compaction finished"
        );
        Ok(stats)
    }

    fn list_buckets(&self, group_id: i64) -> Result<Vec<String>> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT DISTINCT bucket FROM bucket_data WHERE group_id = ?1 ORDER BY bucket")?;
        let buckets = stmt
            .query_map(params![group_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(buckets)
    }

    /// Newest-to-oldest pass: every PUT/REMOVE superseded by a newer op on
    /// the same source key and at or below `upper` is rewritten to a MOVE
    /// with the original checksum. The scan itself covers the whole bucket
    /// so supersession by ops above the window is still seen.
    fn compact_bucket_moves(
        &self,
        group_id: i64,
        bucket: &str,
        upper: OpId,
        memory_limit: usize,
        options: &CompactOptions,
    ) -> Result<u64> {
        let mut latest: HashMap<(i64, Vec<u8>), OpId> = HashMap::new();
        let mut tracked_bytes = 0usize;
        let mut moves: Vec<(OpId, OpId)> = Vec::new();
        let mut moved = 0u64;
        let mut before = OpId::MAX;
        let mut stop = false;

        while !stop {
            let page = self.read_ops_desc(group_id, bucket, before)?;
            if page.is_empty() {
                break;
            }
            for (op_id, kind, source_table, source_key, _) in &page {
                before = *op_id;
                match kind {
                    // A CLEAR is the floor of the bucket; nothing older exists.
                    OpKind::Clear => {
                        stop = true;
                        break;
                    }
                    OpKind::Move => {}
                    OpKind::Put | OpKind::Remove => {
                        let (Some(table), Some(key)) = (source_table, source_key) else {
                            continue;
                        };
                        let full_key = (*table, key.clone());
                        if let Some(&target) = latest.get(&full_key) {
                            if *op_id <= upper {
                                moves.push((*op_id, target));
                            }
                        } else if tracked_bytes + key.len() + 32 <= memory_limit {
                            tracked_bytes += key.len() + 32;
                            latest.insert(full_key, *op_id);
                        }
                    }
                }
            }
            while options.move_batch_limit > 0 && moves.len() >= options.move_batch_limit {
                let chunk: Vec<(OpId, OpId)> =
                    moves.drain(..options.move_batch_limit).collect();
                moved += self.apply_moves(group_id, bucket, &chunk)?;
            }
        }
        if !moves.is_empty() {
            moved += self.apply_moves(group_id, bucket, &moves)?;
        }
        Ok(moved)
    }

    fn read_ops_desc(
        &self,
        group_id: i64,
        bucket: &str,
        before: OpId,
    ) -> Result<Vec<(OpId, OpKind, Option<i64>, Option<Vec<u8>>, u32)>> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT op_id, op, source_table, source_key, checksum FROM bucket_data
             WHERE group_id = ?1 AND bucket = ?2 AND op_id < ?3
             ORDER BY op_id DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![group_id, bucket, before as i64, SCAN_PAGE_ROWS as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i32>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<Vec<u8>>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )?;

        let mut out = Vec::new();
        for row in rows {
            let (op_id, op, source_table, source_key, checksum) = row?;
            let kind = OpKind::from_i32(op)
                .ok_or_else(|| SyncError::InvalidData(format!("unknown op kind {op}")))?;
            out.push((op_id as OpId, kind, source_table, source_key, checksum as u32));
        }
        Ok(out)
    }

    fn apply_moves(&self, group_id: i64, bucket: &str, moves: &[(OpId, OpId)]) -> Result<u64> {
        if moves.is_empty() {
            return Ok(0);
        }
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<u64> {
            let mut stmt = conn.prepare(
                "UPDATE bucket_data
                 SET op = ?1, source_table = NULL, source_key = NULL, subkey = NULL,
                     object_type = NULL, object_id = NULL, data = NULL, target_op = ?2
                 WHERE group_id = ?3 AND bucket = ?4 AND op_id = ?5",
            )?;
            let mut applied = 0u64;
            for (op_id, target) in moves {
                applied += stmt.execute(params![
                    OpKind::Move as i32,
                    *target as i64,
                    group_id,
                    bucket,
                    *op_id as i64
                ])? as u64;
            }
            Ok(applied)
        })();
        match result {
            Ok(applied) => {
                conn.execute("COMMIT", [])?;
                Ok(applied)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Collapse the bucket's leading run of MOVE/REMOVE/CLEAR ops into one
    /// CLEAR. Runs chunk by chunk: an existing CLEAR merges with the ops
    /// that follow it, so interim states stay valid.
    fn compact_bucket_clear(
        &self,
        group_id: i64,
        bucket: &str,
        upper: OpId,
        options: &CompactOptions,
    ) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let prefix = self.read_clear_prefix(group_id, bucket, upper, options.clear_batch_limit)?;
            let Some(prefix) = prefix else { break };
            if prefix.count < 2 {
                break;
            }

            let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute("BEGIN IMMEDIATE", [])?;
            let result = (|| -> Result<()> {
                conn.execute(
                    "DELETE FROM bucket_data
                     WHERE group_id = ?1 AND bucket = ?2 AND op_id <= ?3",
                    params![group_id, bucket, prefix.last_op as i64],
                )?;
                conn.execute(
                    "INSERT INTO bucket_data
                     (group_id, bucket, op_id, op, checksum, target_op)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?3)",
                    params![
                        group_id,
                        bucket,
                        prefix.last_op as i64,
                        OpKind::Clear as i32,
                        prefix.checksum as i64
                    ],
                )?;
                Ok(())
            })();
            match result {
                Ok(()) => conn.execute("COMMIT", []).map(|_| ())?,
                Err(e) => {
                    let _ = conn.execute("ROLLBACK", []);
                    return Err(e);
                }
            }
            drop(conn);

            total += prefix.count - 1;
            if !prefix.chunk_full {
                break;
            }
        }
        Ok(total)
    }

    fn read_clear_prefix(
        &self,
        group_id: i64,
        bucket: &str,
        upper: OpId,
        limit: usize,
    ) -> Result<Option<ClearPrefix>> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT op_id, op, checksum FROM bucket_data
             WHERE group_id = ?1 AND bucket = ?2 AND op_id <= ?3
             ORDER BY op_id ASC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![group_id, bucket, upper as i64, limit as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i32>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;

        let mut prefix = ClearPrefix::default();
        let mut fetched = 0usize;
        for row in rows {
            let (op_id, op, checksum) = row?;
            fetched += 1;
            let kind = OpKind::from_i32(op)
                .ok_or_else(|| SyncError::InvalidData(format!("unknown op kind {op}")))?;
            match kind {
                OpKind::Move | OpKind::Remove | OpKind::Clear => {
                    prefix.count += 1;
                    prefix.last_op = op_id as OpId;
                    prefix.checksum = prefix.checksum.wrapping_add(checksum as u32);
                }
                OpKind::Put => {
                    return Ok(Some(ClearPrefix {
                        chunk_full: false,
                        ..prefix
                    }))
                }
            }
        }
        if fetched == 0 {
            return Ok(None);
        }
        prefix.chunk_full = fetched == limit;
        Ok(Some(prefix))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ClearPrefix {
    count: u64,
    last_op: OpId,
    checksum: u32,
    /// The scan filled its chunk: more prefix may follow.
    chunk_full: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchOptions;
    use crate::evaluator::{EvaluatedRow, EvaluationResult, ParameterResult, SyncRules};
    use crate::types::{
        BucketRequest, ReplicaColumn, RowChange, RowData, RowValue, SourceTable,
        SourceTableDescriptor,
    };
    use crate::reader::ReadOptions;
    use std::sync::Arc;

    struct OneBucket;

    impl SyncRules for OneBucket {
        fn evaluate_row(&self, table: &SourceTable, record: &RowData) -> Vec<EvaluationResult> {
            let id = match record.get("id") {
                Some(RowValue::Integer(i)) => i.to_string(),
                _ => "?".into(),
            };
            vec![EvaluationResult::Row(EvaluatedRow {
                bucket: "global[]".into(),
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

    fn setup() -> (Db, i64, SourceTable) {
        let db = Db::open_memory().unwrap();
        let group = db.create_group().unwrap();
        let descriptor = SourceTableDescriptor {
            relation_id: Some(1),
            schema: "public".into(),
            name: "items".into(),
            replica_columns: vec![ReplicaColumn {
                name: "id".into(),
                type_name: "int8".into(),
                type_oid: None,
            }],
        };
        let table = db
            .resolve_table(group, "c1", "default", &descriptor, &OneBucket)
            .unwrap()
            .table;
        (db, group, table)
    }

    fn row(id: i64, v: i64) -> RowData {
        let mut r = RowData::new();
        r.insert("id".into(), RowValue::Integer(id));
        r.insert("v".into(), RowValue::Integer(v));
        r
    }

    /// PUT / PUT / REMOVE on one key: superseded ops become MOVEs targeting
    /// the tip, checksums and counts preserved.
    #[test]
    fn test_superseded_ops_become_moves() {
        let (db, group, table) = setup();
        let mut batch = db
            .start_batch(group, Arc::new(OneBucket), BatchOptions::default())
            .unwrap();
        batch
            .save(&table, RowChange::Insert { after: row(1, 1) })
            .unwrap();
        batch.commit("0/10").unwrap();
        batch
            .save(
                &table,
                RowChange::Update {
                    before: Some(row(1, 1)),
                    after: row(1, 2),
                },
            )
            .unwrap();
        batch.commit("0/20").unwrap();
        batch
            .save(&table, RowChange::Delete { before: row(1, 2) })
            .unwrap();
        batch.commit("0/30").unwrap();
        drop(batch);

        let bucket = "global[]".to_string();
        let tip = db.get_checkpoint(group).unwrap().checkpoint;
        assert_eq!(tip, 3);
        let before = db.get_checksums(group, tip, &[bucket.clone()]).unwrap()[&bucket];

        let stats = db
            .compact(
                group,
                &CompactOptions {
                    max_op_id_lag: 0,
                    clear_batch_limit: 0,
                    ..CompactOptions::default()
                },
            )
            .unwrap();
        assert_eq!(stats.moved_ops, 2);

        db.invalidate_checksum_cache(group);
        let after = db.get_checksums(group, tip, &[bucket.clone()]).unwrap()[&bucket];
        assert_eq!(before, after);

        let mut cursor = db.get_bucket_data_batch(
            group,
            tip,
            vec![BucketRequest {
                bucket: bucket.clone(),
                after: 0,
            }],
            ReadOptions::default(),
        );
        let data = cursor.next_batch().unwrap().unwrap();
        let kinds: Vec<&str> = data.data.iter().map(|e| e.op).collect();
        assert_eq!(kinds, vec!["MOVE", "MOVE", "REMOVE"]);
        assert_eq!(data.data[0].data, None);
        assert_eq!(data.target_op.as_deref(), Some("3"));
    }

    /// A fully dead prefix collapses to a CLEAR with the summed checksum.
    #[test]
    fn test_dead_prefix_collapses_to_clear() {
        let (db, group, table) = setup();
        let mut batch = db
            .start_batch(group, Arc::new(OneBucket), BatchOptions::default())
            .unwrap();
        batch
            .save(&table, RowChange::Insert { after: row(1, 1) })
            .unwrap();
        batch.commit("0/10").unwrap();
        batch
            .save(&table, RowChange::Delete { before: row(1, 1) })
            .unwrap();
        batch.commit("0/20").unwrap();
        batch
            .save(&table, RowChange::Insert { after: row(2, 1) })
            .unwrap();
        batch.commit("0/30").unwrap();
        drop(batch);

        let bucket = "global[]".to_string();
        let tip = db.get_checkpoint(group).unwrap().checkpoint;
        let before = db.get_checksums(group, tip, &[bucket.clone()]).unwrap()[&bucket];

        db.compact(
            group,
            &CompactOptions {
                max_op_id_lag: 0,
                ..CompactOptions::default()
            },
        )
        .unwrap();

        db.invalidate_checksum_cache(group);
        let after = db.get_checksums(group, tip, &[bucket.clone()]).unwrap()[&bucket];
        assert_eq!(after.checksum, before.checksum);
        assert!(after.is_full);
        // MOVE(1) + REMOVE(2) collapsed into CLEAR(2); PUT(3) survives.
        assert_eq!(after.count, 2);

        let mut cursor = db.get_bucket_data_batch(
            group,
            tip,
            vec![BucketRequest {
                bucket: bucket.clone(),
                after: 0,
            }],
            ReadOptions::default(),
        );
        let data = cursor.next_batch().unwrap().unwrap();
        let kinds: Vec<&str> = data.data.iter().map(|e| e.op).collect();
        assert_eq!(kinds, vec!["CLEAR", "PUT"]);
    }

    /// Ops within `max_op_id_lag` of the tip are untouched.
    #[test]
    fn test_window_respects_lag() {
        let (db, group, table) = setup();
        let mut batch = db
            .start_batch(group, Arc::new(OneBucket), BatchOptions::default())
            .unwrap();
        batch
            .save(&table, RowChange::Insert { after: row(1, 1) })
            .unwrap();
        batch.commit("0/10").unwrap();
        batch
            .save(
                &table,
                RowChange::Update {
                    before: Some(row(1, 1)),
                    after: row(1, 2),
                },
            )
            .unwrap();
        batch.commit("0/20").unwrap();
        drop(batch);

        let stats = db
            .compact(
                group,
                &CompactOptions {
                    max_op_id_lag: 10,
                    ..CompactOptions::default()
                },
            )
            .unwrap();
        assert_eq!(stats.moved_ops, 0);
        assert_eq!(stats.cleared_ops, 0);
    }
}
