//! Source table registry.
//!
//! Maps an upstream relation (connection, relation id, schema, name, replica
//! identity columns) to a stable internal table id. Changing the replica
//! identity creates a fresh identity; superseded identities are handed back
//! as drop-tables so the replicator can truncate them before using the new
//! one.

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::Db;
use crate::error::{Result, SyncError};
use crate::evaluator::SyncRules;
use crate::types::{ReplicaColumn, SourceTable, SourceTableDescriptor};

/// Outcome of resolving a relation descriptor.
#[derive(Debug)]
pub struct TableResolveResult {
    pub table: SourceTable,
    /// Obsolete identities for the same relation; the caller must emit
    /// bucket truncations for each before ingesting into `table`.
    pub drop_tables: Vec<SourceTable>,
}

fn encode_columns(columns: &[ReplicaColumn]) -> Result<String> {
    serde_json::to_string(columns)
        .map_err(|e| SyncError::InvalidData(format!("bad replica columns: {e}")))
}

fn decode_columns(raw: &str) -> Result<Vec<ReplicaColumn>> {
    serde_json::from_str(raw)
        .map_err(|e| SyncError::InvalidData(format!("bad replica columns: {e}")))
}

impl Db {
    /// Resolve an upstream relation to its internal identity, creating one
    /// when the `(connection, relation, schema, name, replica columns)`
    /// tuple has not been seen before.
    pub fn resolve_table(
        &self,
        group_id: i64,
        connection_id: &str,
        connection_tag: &str,
        descriptor: &SourceTableDescriptor,
        rules: &dyn SyncRules,
    ) -> Result<TableResolveResult> {
        let columns_json = encode_columns(&descriptor.replica_columns)?;

        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<TableResolveResult> {
            let existing: Option<(i64, bool)> = conn
                .query_row(
                    "SELECT id, snapshot_done FROM source_tables
                     WHERE group_id = ?1 AND connection_id = ?2
                       AND schema_name = ?3 AND table_name = ?4
                       AND replica_columns = ?5 AND relation_id IS ?6",
                    params![
                        group_id,
                        connection_id,
                        descriptor.schema,
                        descriptor.name,
                        columns_json,
                        descriptor.relation_id
                    ],
                    |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
                )
                .optional()?;

            let (table_id, snapshot_done) = match existing {
                Some(found) => found,
                None => {
                    conn.execute(
                        "INSERT INTO source_tables
                         (group_id, connection_id, connection_tag, relation_id,
                          schema_name, table_name, replica_columns, snapshot_done)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                        params![
                            group_id,
                            connection_id,
                            connection_tag,
                            descriptor.relation_id,
                            descriptor.schema,
                            descriptor.name,
                            columns_json
                        ],
                    )?;
                    (conn.last_insert_rowid(), false)
                }
            };

            let drop_tables =
                self.find_obsolete(&conn, group_id, connection_id, descriptor, table_id, rules)?;

            let table = SourceTable {
                id: table_id,
                group_id,
                connection_id: connection_id.to_string(),
                connection_tag: connection_tag.to_string(),
                relation_id: descriptor.relation_id,
                schema: descriptor.schema.clone(),
                name: descriptor.name.clone(),
                replica_columns: descriptor.replica_columns.clone(),
                snapshot_done,
                syncs_data: rules.syncs_data(&descriptor.schema, &descriptor.name),
                syncs_parameters: rules.syncs_parameters(&descriptor.schema, &descriptor.name),
                triggers_event: rules.triggers_event(&descriptor.schema, &descriptor.name),
            };

            Ok(TableResolveResult { table, drop_tables })
        })();

        match result {
            Ok(resolved) => {
                conn.execute("COMMIT", [])?;
                Ok(resolved)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Other identities in the same group and connection that match this
    /// relation by relation_id or by qualified name.
    fn find_obsolete(
        &self,
        conn: &Connection,
        group_id: i64,
        connection_id: &str,
        descriptor: &SourceTableDescriptor,
        keep_id: i64,
        rules: &dyn SyncRules,
    ) -> Result<Vec<SourceTable>> {
        let mut stmt = conn.prepare(
            "SELECT id, connection_tag, relation_id, schema_name, table_name,
                    replica_columns, COALESCE(snapshot_done, 1)
             FROM source_tables
             WHERE group_id = ?1 AND connection_id = ?2 AND id != ?3
               AND ((?4 IS NOT NULL AND relation_id IS ?4)
                    OR (schema_name = ?5 AND table_name = ?6))",
        )?;

        let rows = stmt.query_map(
            params![
                group_id,
                connection_id,
                keep_id,
                descriptor.relation_id,
                descriptor.schema,
                descriptor.name
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)? != 0,
                ))
            },
        )?;

        let mut tables = Vec::new();
        for row in rows {
            let (id, tag, relation_id, schema, name, columns_raw, snapshot_done) = row?;
            tables.push(SourceTable {
                id,
                group_id,
                connection_id: connection_id.to_string(),
                connection_tag: tag,
                relation_id,
                schema: schema.clone(),
                name: name.clone(),
                replica_columns: decode_columns(&columns_raw)?,
                snapshot_done,
                syncs_data: rules.syncs_data(&schema, &name),
                syncs_parameters: rules.syncs_parameters(&schema, &name),
                triggers_event: rules.triggers_event(&schema, &name),
            });
        }
        Ok(tables)
    }

    /// Mark tables as snapshot-complete.
    pub(crate) fn set_snapshot_done(&self, conn: &Connection, table_ids: &[i64]) -> Result<()> {
        for id in table_ids {
            conn.execute(
                "UPDATE source_tables SET snapshot_done = 1 WHERE id = ?1",
                params![id],
            )?;
        }
        Ok(())
    }
}
