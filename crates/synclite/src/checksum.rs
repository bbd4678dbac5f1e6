//! Checksum cache.
//!
//! Bucket checksums are a range-additive fold over the op log: the checksum
//! of `(0, C]` equals the cached value at some earlier checkpoint `C'` plus
//! the partial `(C', C]` read from storage (modular u32 sum, count sum,
//! `is_full` disjunction). The cache is bounded and shared by all readers of
//! one group.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;

use crate::db::Db;
use crate::error::Result;
use crate::types::{BucketChecksum, OpId, OpKind};

const DEFAULT_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct CachedChecksum {
    checkpoint: OpId,
    count: i64,
    checksum: u32,
    is_full: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct PartialChecksum {
    count: i64,
    checksum: u32,
    has_clear: bool,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, (CachedChecksum, u64)>,
    tick: u64,
}

impl CacheInner {
    fn touch(&mut self, bucket: &str, value: CachedChecksum, capacity: usize) {
        self.tick += 1;
        let tick = self.tick;
        self.entries.insert(bucket.to_string(), (value, tick));
        if self.entries.len() > capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Per-group memoized checksum fold, bounded by entry count.
pub struct ChecksumCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl Default for ChecksumCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl ChecksumCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Drop every cached entry. Called after compaction rewrites history.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.clear();
    }

    fn get_checksums(
        &self,
        db: &Db,
        group_id: i64,
        checkpoint: OpId,
        buckets: &[String],
    ) -> Result<BTreeMap<String, BucketChecksum>> {
        // Plan which range each bucket still needs from storage.
        let mut plan: Vec<(String, OpId, Option<CachedChecksum>)> = Vec::with_capacity(buckets.len());
        {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            for bucket in buckets {
                match inner.entries.get(bucket) {
                    Some((cached, _)) if cached.checkpoint <= checkpoint => {
                        plan.push((bucket.clone(), cached.checkpoint, Some(*cached)));
                    }
                    // Cached past the requested checkpoint: unusable, full scan.
                    _ => plan.push((bucket.clone(), 0, None)),
                }
            }
        }

        // One aggregation query per distinct lower bound.
        let mut by_after: BTreeMap<OpId, Vec<&str>> = BTreeMap::new();
        for (bucket, after, _) in &plan {
            if *after < checkpoint {
                by_after.entry(*after).or_default().push(bucket.as_str());
            }
        }
        let mut partials: HashMap<String, PartialChecksum> = HashMap::new();
        for (after, group_buckets) in by_after {
            partials.extend(db.checksum_partials(group_id, after, checkpoint, &group_buckets)?);
        }

        let mut result = BTreeMap::new();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for (bucket, _, seed) in plan {
            let partial = partials.get(&bucket).copied().unwrap_or_default();
            let folded = match seed {
                Some(seed) => BucketChecksum {
                    count: seed.count + partial.count,
                    checksum: seed.checksum.wrapping_add(partial.checksum),
                    is_full: seed.is_full || partial.has_clear,
                },
                None => BucketChecksum {
                    count: partial.count,
                    checksum: partial.checksum,
                    is_full: partial.has_clear,
                },
            };
            inner.touch(
                &bucket,
                CachedChecksum {
                    checkpoint,
                    count: folded.count,
                    checksum: folded.checksum,
                    is_full: folded.is_full,
                },
                self.capacity,
            );
            result.insert(bucket, folded);
        }
        Ok(result)
    }
}

impl Db {
    /// Checksums over `(0, checkpoint]` for each bucket. Buckets with no
    /// ops are returned as `{count: 0, checksum: 0, is_full: false}` so
    /// callers can tell "empty" from "not requested".
    pub fn get_checksums(
        &self,
        group_id: i64,
        checkpoint: OpId,
        buckets: &[String],
    ) -> Result<BTreeMap<String, BucketChecksum>> {
        let cache = self.checksum_cache(group_id);
        cache.get_checksums(self, group_id, checkpoint, buckets)
    }

    /// Aggregate `(after, checkpoint]` per bucket straight from storage.
    fn checksum_partials(
        &self,
        group_id: i64,
        after: OpId,
        checkpoint: OpId,
        buckets: &[&str],
    ) -> Result<HashMap<String, PartialChecksum>> {
        if buckets.is_empty() || after >= checkpoint {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; buckets.len()].join(",");
        let sql = format!(
            "SELECT bucket, COUNT(*), COALESCE(SUM(checksum), 0),
                    MAX(CASE WHEN op = {} THEN 1 ELSE 0 END)
             FROM bucket_data
             WHERE group_id = ? AND op_id > ? AND op_id <= ? AND bucket IN ({placeholders})
             GROUP BY bucket",
            OpKind::Clear as i32
        );

        let mut values: Vec<SqlValue> = vec![
            SqlValue::Integer(group_id),
            SqlValue::Integer(after as i64),
            SqlValue::Integer(checkpoint as i64),
        ];
        values.extend(buckets.iter().map(|b| SqlValue::Text((*b).to_string())));

        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut out = HashMap::new();
        for row in rows {
            let (bucket, count, checksum_total, has_clear) = row?;
            out.insert(
                bucket,
                PartialChecksum {
                    count,
                    checksum: (checksum_total as u64) as u32,
                    has_clear: has_clear != 0,
                },
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchOptions;
    use crate::evaluator::{EvaluatedRow, EvaluationResult, ParameterResult, SyncRules};
    use crate::types::{
        ReplicaColumn, RowChange, RowData, RowValue, SourceTable, SourceTableDescriptor,
    };
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

    fn insert_rows(db: &Db, group: i64, table: &SourceTable, ids: std::ops::Range<i64>, lsn: &str) {
        let mut batch = db
            .start_batch(group, Arc::new(OneBucket), BatchOptions::default())
            .unwrap();
        for i in ids {
            let mut row = RowData::new();
            row.insert("id".into(), RowValue::Integer(i));
            batch.save(table, RowChange::Insert { after: row }).unwrap();
        }
        batch.commit(lsn).unwrap();
    }

    #[test]
    fn test_empty_bucket_is_reported() {
        let (db, group, _) = setup();
        let checksums = db.get_checksums(group, 10, &["nope[]".into()]).unwrap();
        assert_eq!(checksums["nope[]"], BucketChecksum::EMPTY);
    }

    #[test]
    fn test_fold_matches_direct_scan() {
        let (db, group, table) = setup();
        insert_rows(&db, group, &table, 1..3, "0/10");
        let mid = db.get_checkpoint(group).unwrap().checkpoint;
        insert_rows(&db, group, &table, 3..6, "0/20");
        let tip = db.get_checkpoint(group).unwrap().checkpoint;

        let bucket = "global[]".to_string();

        // Warm cache at the intermediate checkpoint, then fold to tip.
        let at_mid = db.get_checksums(group, mid, &[bucket.clone()]).unwrap()[&bucket];
        assert_eq!(at_mid.count, 2);
        let folded = db.get_checksums(group, tip, &[bucket.clone()]).unwrap()[&bucket];

        // Direct scan from a cold cache.
        db.invalidate_checksum_cache(group);
        let direct = db.get_checksums(group, tip, &[bucket.clone()]).unwrap()[&bucket];

        assert_eq!(folded, direct);
        assert_eq!(folded.count, 5);
        assert!(!folded.is_full);
    }

    #[test]
    fn test_stale_high_cache_entry_is_bypassed() {
        let (db, group, table) = setup();
        insert_rows(&db, group, &table, 1..4, "0/10");
        let tip = db.get_checkpoint(group).unwrap().checkpoint;

        let bucket = "global[]".to_string();
        // Cache at tip, then ask for an older checkpoint.
        let at_tip = db.get_checksums(group, tip, &[bucket.clone()]).unwrap()[&bucket];
        assert_eq!(at_tip.count, 3);
        let at_two = db.get_checksums(group, 2, &[bucket.clone()]).unwrap()[&bucket];
        assert_eq!(at_two.count, 2);
    }

    #[test]
    fn test_cache_capacity_bound() {
        let cache = ChecksumCache::with_capacity(2);
        let mut inner = cache.inner.lock().unwrap();
        for i in 0..5 {
            inner.touch(
                &format!("b{i}"),
                CachedChecksum {
                    checkpoint: 1,
                    count: 0,
                    checksum: 0,
                    is_full: false,
                },
                2,
            );
        }
        assert!(inner.entries.len() <= 2);
    }
}
