//! Boundary to the external sync-rules evaluator.
//!
//! The core never parses sync rules itself: it consumes a [`SyncRules`]
//! implementation that maps source rows to bucket outputs and parameter
//! lookup rows. Evaluation failures are values, not errors - a bad row is
//! logged and skipped, never aborting a batch.

use serde_json::Value as JsonValue;

use crate::lookup::Lookup;
use crate::types::{RowData, SourceTable};

/// One bucket output produced by evaluating a source row.
#[derive(Debug, Clone)]
pub struct EvaluatedRow {
    pub bucket: String,
    /// Client-side table the row lands in.
    pub object_type: String,
    pub object_id: String,
    pub data: RowData,
}

/// One parameter lookup row produced by evaluating a source row.
#[derive(Debug, Clone)]
pub struct EvaluatedParameters {
    pub lookup: Lookup,
    /// Flat JSON rows handed back to clients resolving this lookup.
    pub bucket_parameters: Vec<JsonValue>,
}

/// A per-row evaluation failure. Carried as a value so one bad row cannot
/// abort ingest of the surrounding batch.
#[derive(Debug, Clone)]
pub struct EvaluationError {
    pub message: String,
}

impl EvaluationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum EvaluationResult {
    Row(EvaluatedRow),
    Error(EvaluationError),
}

#[derive(Debug, Clone)]
pub enum ParameterResult {
    Parameters(EvaluatedParameters),
    Error(EvaluationError),
}

/// Compiled sync rules, as seen by the storage core.
///
/// Implementations must be deterministic for a given rule parse: the batch
/// writer relies on identical records producing identical outputs when it
/// skips unchanged rows.
pub trait SyncRules: Send + Sync {
    fn evaluate_row(&self, table: &SourceTable, record: &RowData) -> Vec<EvaluationResult>;

    fn evaluate_parameter_row(
        &self,
        table: &SourceTable,
        record: &RowData,
    ) -> Vec<ParameterResult>;

    /// Whether rows of this relation contribute bucket data.
    fn syncs_data(&self, schema: &str, name: &str) -> bool;

    /// Whether rows of this relation contribute parameter lookups.
    fn syncs_parameters(&self, schema: &str, name: &str) -> bool;

    /// Whether changes to this relation fire replication events.
    fn triggers_event(&self, _schema: &str, _name: &str) -> bool {
        false
    }
}
