//! Metadata catalog for dynamically provisioned tables.
//!
//! Physical columns carry sanitized identifiers only. The catalog keeps the
//! original header text (and the semantic type hint of each column) in a
//! separate bookkeeping table, one record per provisioned table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::naming::quote_ident;
use crate::schema::ColumnKind;
use crate::store::{in_transaction, SqlValue, Store};
use crate::{Result, SheetbaseError};

/// Name of the bookkeeping table
pub const CATALOG_TABLE: &str = "table_metadata";

/// Sanitized field -> original header label
pub type HeaderMapping = BTreeMap<String, String>;

/// Document stored in the `metadata` column
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    #[serde(default)]
    pub column_headers: HeaderMapping,
    #[serde(default)]
    pub column_kinds: BTreeMap<String, ColumnKind>,
}

/// A catalog row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    pub table_name: String,
    pub metadata: TableMetadata,
    pub locked: bool,
    pub system_table: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Access to the `table_metadata` bookkeeping table.
///
/// The backing table is created lazily on first use.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataCatalog;

impl MetadataCatalog {
    pub fn new() -> Self {
        Self
    }

    fn ensure(&self, store: &dyn Store) -> Result<()> {
        // table_name is kept unique by `upsert`; DuckDB rejects re-inserting a
        // unique key deleted earlier in the same transaction.
        store.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                table_name VARCHAR NOT NULL,
                metadata JSON NOT NULL,
                locked BOOLEAN NOT NULL DEFAULT false,
                system_table BOOLEAN NOT NULL DEFAULT false,
                created_at TIMESTAMP DEFAULT current_timestamp,
                updated_at TIMESTAMP DEFAULT current_timestamp
            )",
            quote_ident(CATALOG_TABLE)
        ))
    }

    /// Replace the header mapping recorded for `table_name`.
    pub fn upsert_headers(&self, store: &dyn Store, table_name: &str, mapping: &HeaderMapping) -> Result<()> {
        let mut metadata = self
            .get(store, table_name)?
            .map(|record| record.metadata)
            .unwrap_or_default();
        metadata.column_headers = mapping.clone();
        metadata.column_kinds.retain(|field, _| mapping.contains_key(field));
        self.upsert(store, table_name, &metadata)
    }

    /// Replace the whole metadata document for `table_name`.
    ///
    /// The previous record is deleted and a new one inserted in a single
    /// transaction. The `locked` and `system_table` flags and the creation
    /// time carry over.
    pub fn upsert(&self, store: &dyn Store, table_name: &str, metadata: &TableMetadata) -> Result<()> {
        self.ensure(store)?;
        let (locked, system_table, created_at) = self
            .get(store, table_name)?
            .map(|r| (r.locked, r.system_table, r.created_at))
            .unwrap_or((false, false, None));
        let document = serde_json::to_string(metadata)
            .map_err(|e| SheetbaseError::QueryFailed(format!("Failed to encode metadata: {}", e)))?;

        in_transaction(store, || {
            store.execute(
                &format!("DELETE FROM {} WHERE table_name = ?", quote_ident(CATALOG_TABLE)),
                &[SqlValue::from(table_name)],
            )?;
            store.execute(
                &format!(
                    "INSERT INTO {} (table_name, metadata, locked, system_table, created_at)
                     VALUES (?, ?, ?, ?, COALESCE(CAST(? AS TIMESTAMP), current_timestamp))",
                    quote_ident(CATALOG_TABLE)
                ),
                &[
                    SqlValue::from(table_name),
                    SqlValue::Text(document),
                    SqlValue::Bool(locked),
                    SqlValue::Bool(system_table),
                    created_at.map(SqlValue::Text).unwrap_or(SqlValue::Null),
                ],
            )?;
            Ok(())
        })?;

        info!("Stored header mapping for table '{}'", table_name);
        Ok(())
    }

    /// Header mapping for `table_name`, or an empty mapping when none exists.
    pub fn get_headers(&self, store: &dyn Store, table_name: &str) -> Result<HeaderMapping> {
        Ok(self
            .get(store, table_name)?
            .map(|record| record.metadata.column_headers)
            .unwrap_or_default())
    }

    /// Full catalog record for `table_name`
    pub fn get(&self, store: &dyn Store, table_name: &str) -> Result<Option<MetadataRecord>> {
        self.ensure(store)?;
        let columns: Vec<String> = ["table_name", "metadata", "locked", "system_table", "created_at", "updated_at"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rows = store.query_rows(
            &format!(
                "SELECT table_name, CAST(metadata AS VARCHAR), locked, system_table,
                        CAST(created_at AS VARCHAR), CAST(updated_at AS VARCHAR)
                 FROM {} WHERE table_name = ? LIMIT 1",
                quote_ident(CATALOG_TABLE)
            ),
            &[SqlValue::from(table_name)],
            &columns,
        )?;

        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };

        // Unreadable documents degrade to an empty mapping so headers fall back to field names
        let metadata = row
            .get("metadata")
            .and_then(|v| v.as_str())
            .and_then(|s| match serde_json::from_str::<TableMetadata>(s) {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable metadata for '{}': {}", table_name, e);
                    None
                }
            })
            .unwrap_or_default();

        Ok(Some(MetadataRecord {
            table_name: table_name.to_string(),
            metadata,
            locked: row.get("locked").and_then(|v| v.as_bool()).unwrap_or(false),
            system_table: row.get("system_table").and_then(|v| v.as_bool()).unwrap_or(false),
            created_at: row.get("created_at").and_then(|v| v.as_str()).map(str::to_string),
            updated_at: row.get("updated_at").and_then(|v| v.as_str()).map(str::to_string),
        }))
    }

    /// Set the `locked` flag. Fails with `NotFound` when no record exists.
    pub fn set_locked(&self, store: &dyn Store, table_name: &str, locked: bool) -> Result<()> {
        self.ensure(store)?;
        let changed = store.execute(
            &format!(
                "UPDATE {} SET locked = ?, updated_at = current_timestamp WHERE table_name = ?",
                quote_ident(CATALOG_TABLE)
            ),
            &[SqlValue::Bool(locked), SqlValue::from(table_name)],
        )?;
        if changed == 0 {
            return Err(SheetbaseError::NotFound(format!(
                "no metadata recorded for table '{}'",
                table_name
            )));
        }
        Ok(())
    }

    /// Mark a table as a system table, which also prevents deletion.
    /// Fails with `NotFound` when no record exists.
    pub fn set_system_table(&self, store: &dyn Store, table_name: &str, system_table: bool) -> Result<()> {
        self.ensure(store)?;
        let changed = store.execute(
            &format!(
                "UPDATE {} SET system_table = ?, updated_at = current_timestamp WHERE table_name = ?",
                quote_ident(CATALOG_TABLE)
            ),
            &[SqlValue::Bool(system_table), SqlValue::from(table_name)],
        )?;
        if changed == 0 {
            return Err(SheetbaseError::NotFound(format!(
                "no metadata recorded for table '{}'",
                table_name
            )));
        }
        Ok(())
    }

    /// Whether the table is protected from deletion
    pub fn is_protected(&self, store: &dyn Store, table_name: &str) -> Result<bool> {
        Ok(self
            .get(store, table_name)?
            .map(|r| r.locked || r.system_table)
            .unwrap_or(false))
    }

    pub fn remove(&self, store: &dyn Store, table_name: &str) -> Result<()> {
        self.ensure(store)?;
        store.execute(
            &format!("DELETE FROM {} WHERE table_name = ?", quote_ident(CATALOG_TABLE)),
            &[SqlValue::from(table_name)],
        )?;
        Ok(())
    }
}
