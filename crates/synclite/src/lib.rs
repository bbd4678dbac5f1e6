//! Synclite - SQLite-backed bucket storage for a data sync service
//!
//! Transforms an upstream change-data-capture feed into per-bucket
//! append-only operation logs, serves incremental reads of those logs at
//! checkpoints, memoizes per-bucket checksums, and compacts historical log
//! ranges.
//!
//! # Example
//!
//! ```
//! use synclite::Db;
//!
//! let db = Db::open_memory().unwrap();
//! let group = db.create_group().unwrap();
//!
//! // Nothing replicated yet: readers see checkpoint zero.
//! let checkpoint = db.get_checkpoint(group).unwrap();
//! assert_eq!(checkpoint.checkpoint, 0);
//! ```

pub mod batch;
pub mod checksum;
pub mod compact;
pub mod db;
pub mod error;
pub mod evaluator;
pub mod lookup;
pub mod reader;
pub mod registry;
pub mod types;

pub use batch::{BatchOptions, BucketBatch};
pub use checksum::ChecksumCache;
pub use compact::{CompactOptions, CompactStats};
pub use db::Db;
pub use error::{Result, SyncError};
pub use evaluator::{
    EvaluatedParameters, EvaluatedRow, EvaluationError, EvaluationResult, ParameterResult,
    SyncRules,
};
pub use lookup::{Lookup, LookupValue};
pub use reader::{DataBatchCursor, ReadOptions};
pub use registry::TableResolveResult;
pub use types::{
    BucketChecksum, BucketRequest, CheckpointEvent, CheckpointInfo, GroupInfo, GroupState,
    GroupStats, OpId, OpKind, OplogEntry, ReplicaColumn, RowChange, RowData, RowValue,
    SourceTable, SourceTableDescriptor, SyncBucketData,
};
