use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Operation identifier: strictly increasing within a sync rule group.
/// Rendered as a decimal string on the wire.
pub type OpId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpKind {
    Put = 1,
    Remove = 2,
    Move = 3,
    Clear = 4,
}

impl OpKind {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(OpKind::Put),
            2 => Some(OpKind::Remove),
            3 => Some(OpKind::Move),
            4 => Some(OpKind::Clear),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Put => "PUT",
            OpKind::Remove => "REMOVE",
            OpKind::Move => "MOVE",
            OpKind::Clear => "CLEAR",
        }
    }
}

/// Lifecycle state of a sync rule group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum GroupState {
    Processing = 0,
    Active = 1,
    Stop = 2,
    Terminated = 3,
}

impl GroupState {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(GroupState::Processing),
            1 => Some(GroupState::Active),
            2 => Some(GroupState::Stop),
            3 => Some(GroupState::Terminated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupState::Processing => "processing",
            GroupState::Active => "active",
            GroupState::Stop => "stop",
            GroupState::Terminated => "terminated",
        }
    }
}

/// A single column value from a source database row.
///
/// SQLite-compatible tagged sum; the JSON-compatible subset excludes Blob
/// (blobs render as lowercase hex when forced into JSON).
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl RowValue {
    pub fn to_json(&self) -> JsonValue {
        match self {
            RowValue::Null => JsonValue::Null,
            RowValue::Integer(i) => JsonValue::from(*i),
            RowValue::Real(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            RowValue::Text(s) => JsonValue::String(s.clone()),
            RowValue::Blob(b) => JsonValue::String(crate::lookup::to_hex(b)),
        }
    }

    pub fn from_json(v: &JsonValue) -> RowValue {
        match v {
            JsonValue::Null => RowValue::Null,
            JsonValue::Bool(b) => RowValue::Integer(*b as i64),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    RowValue::Integer(i)
                } else {
                    RowValue::Real(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => RowValue::Text(s.clone()),
            other => RowValue::Text(other.to_string()),
        }
    }
}

/// A source or evaluated row: column name to value.
///
/// BTreeMap keeps serialization order canonical, which keeps op checksums
/// stable across replays.
pub type RowData = BTreeMap<String, RowValue>;

/// Serialize a row as canonical JSON (sorted keys).
pub fn row_to_json(row: &RowData) -> String {
    let mut map = serde_json::Map::new();
    for (k, v) in row {
        map.insert(k.clone(), v.to_json());
    }
    JsonValue::Object(map).to_string()
}

/// Parse a row from its JSON form.
pub fn row_from_json(s: &str) -> crate::error::Result<RowData> {
    let value: JsonValue = serde_json::from_str(s)
        .map_err(|e| crate::error::SyncError::InvalidData(format!("bad row json: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| crate::error::SyncError::InvalidData("row json is not an object".into()))?;
    Ok(obj
        .iter()
        .map(|(k, v)| (k.clone(), RowValue::from_json(v)))
        .collect())
}

/// One replica-identity column of a source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaColumn {
    pub name: String,
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_oid: Option<i64>,
}

/// Upstream relation description handed to the registry by a replicator.
#[derive(Debug, Clone)]
pub struct SourceTableDescriptor {
    pub relation_id: Option<i64>,
    pub schema: String,
    pub name: String,
    pub replica_columns: Vec<ReplicaColumn>,
}

/// A resolved source table identity.
#[derive(Debug, Clone)]
pub struct SourceTable {
    /// Stable internal id, unique per (group, connection, relation, columns).
    pub id: i64,
    pub group_id: i64,
    pub connection_id: String,
    pub connection_tag: String,
    pub relation_id: Option<i64>,
    pub schema: String,
    pub name: String,
    pub replica_columns: Vec<ReplicaColumn>,
    pub snapshot_done: bool,
    pub syncs_data: bool,
    pub syncs_parameters: bool,
    pub triggers_event: bool,
}

impl SourceTable {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// A row-level change from the CDC feed.
#[derive(Debug, Clone)]
pub enum RowChange {
    Insert {
        after: RowData,
    },
    Update {
        before: Option<RowData>,
        after: RowData,
    },
    Delete {
        before: RowData,
    },
}

/// Checkpoint visible to readers of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub checkpoint: OpId,
    pub lsn: Option<String>,
}

impl CheckpointInfo {
    /// Wire form of the checkpoint op-id.
    pub fn checkpoint_str(&self) -> String {
        self.checkpoint.to_string()
    }
}

/// Published on every checkpoint advance (flush with a commit LSN, keepalive).
#[derive(Debug, Clone)]
pub struct CheckpointEvent {
    pub group_id: i64,
    pub checkpoint: OpId,
    pub lsn: Option<String>,
}

/// Summary row for one sync rule group (admin CLI).
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub id: i64,
    pub state: GroupState,
    pub last_checkpoint: OpId,
    pub last_checkpoint_lsn: Option<String>,
    pub last_fatal_error: Option<String>,
}

/// Storage counters for one group.
#[derive(Debug, Clone, Default)]
pub struct GroupStats {
    pub op_count: i64,
    pub parameter_count: i64,
    pub current_count: i64,
    pub last_checkpoint: OpId,
}

/// Aggregated checksum for one bucket over a `(0, checkpoint]` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketChecksum {
    pub count: i64,
    pub checksum: u32,
    /// True when the range contains a CLEAR op: the value then describes the
    /// full bucket state, not an increment.
    pub is_full: bool,
}

impl BucketChecksum {
    pub const EMPTY: BucketChecksum = BucketChecksum {
        count: 0,
        checksum: 0,
        is_full: false,
    };

    /// Two's-complement i32 reinterpretation used on the wire.
    pub fn wire_checksum(&self) -> i32 {
        self.checksum as i32
    }
}

/// One oplog entry as served to clients. Op-ids are decimal strings.
#[derive(Debug, Clone, Serialize)]
pub struct OplogEntry {
    pub op_id: String,
    pub op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub checksum: i32,
}

/// One output batch of the bucket data reader.
#[derive(Debug, Clone, Serialize)]
pub struct SyncBucketData {
    pub bucket: String,
    /// Start of the window this batch was read from (exclusive).
    pub after: String,
    /// Pass as the new `after` to resume this bucket.
    pub next_after: String,
    /// More ops exist for this bucket beyond this batch.
    pub has_more: bool,
    /// Max MOVE/CLEAR target in this batch; clients may skip forward to it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_op: Option<String>,
    pub data: Vec<OplogEntry>,
}

/// Per-bucket read position for a data batch request.
#[derive(Debug, Clone)]
pub struct BucketRequest {
    pub bucket: String,
    pub after: OpId,
}

/// Checksum of an op's canonical description. The op_id is excluded so that
/// replays and MOVE rewrites preserve the value.
pub fn op_checksum(
    kind: OpKind,
    bucket: &str,
    subkey: Option<&str>,
    object_type: Option<&str>,
    object_id: Option<&str>,
    data: Option<&str>,
) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(kind.as_str().as_bytes());
    for part in [
        Some(bucket),
        subkey,
        object_type,
        object_id,
        data,
    ] {
        hasher.update(b"\x00");
        if let Some(part) = part {
            hasher.update(part.as_bytes());
        }
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_kind_roundtrip() {
        for kind in [OpKind::Put, OpKind::Remove, OpKind::Move, OpKind::Clear] {
            assert_eq!(OpKind::from_i32(kind as i32), Some(kind));
        }
        assert_eq!(OpKind::from_i32(0), None);
    }

    #[test]
    fn test_row_json_roundtrip() {
        let mut row = RowData::new();
        row.insert("id".into(), RowValue::Integer(1));
        row.insert("name".into(), RowValue::Text("alice".into()));
        row.insert("score".into(), RowValue::Real(1.5));
        row.insert("note".into(), RowValue::Null);

        let json = row_to_json(&row);
        let parsed = row_from_json(&json).unwrap();
        assert_eq!(parsed, row);
    }

    #[test]
    fn test_row_json_is_canonical() {
        let mut a = RowData::new();
        a.insert("b".into(), RowValue::Integer(2));
        a.insert("a".into(), RowValue::Integer(1));

        let mut b = RowData::new();
        b.insert("a".into(), RowValue::Integer(1));
        b.insert("b".into(), RowValue::Integer(2));

        assert_eq!(row_to_json(&a), row_to_json(&b));
    }

    #[test]
    fn test_op_checksum_ignores_nothing_but_op_id() {
        let a = op_checksum(OpKind::Put, "b1", Some("s"), Some("t"), Some("1"), Some("{}"));
        let b = op_checksum(OpKind::Put, "b1", Some("s"), Some("t"), Some("1"), Some("{}"));
        assert_eq!(a, b);

        let c = op_checksum(OpKind::Remove, "b1", Some("s"), Some("t"), Some("1"), Some("{}"));
        assert_ne!(a, c);
    }

    #[test]
    fn test_op_checksum_field_boundaries() {
        // "ab" + "c" must not collide with "a" + "bc".
        let a = op_checksum(OpKind::Put, "ab", Some("c"), None, None, None);
        let b = op_checksum(OpKind::Put, "a", Some("bc"), None, None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wire_checksum_reinterpret() {
        let c = BucketChecksum {
            count: 1,
            checksum: 0xFFFF_FFFF,
            is_full: false,
        };
        assert_eq!(c.wire_checksum(), -1);
    }
}
