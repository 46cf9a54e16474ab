//! Fallback storage for uploads without a dynamic table.
//!
//! Every row of such an upload is kept as a JSON document in one shared table,
//! keyed by the file it came from. Re-uploading a file replaces its rows.

use serde::Serialize;

use crate::naming::quote_ident;
use crate::query::{FieldSource, PageRequest, PageResult, QueryBuilder};
use crate::store::{SqlValue, Store};
use crate::{Record, Result, SheetbaseError};

/// Name of the shared document table
pub const ROWS_TABLE: &str = "upload_rows";

const ROWS_SEQUENCE: &str = "upload_rows_id_seq";

/// Document column holding the row values
pub const DATA_COLUMN: &str = "data";

/// Row-order column, exposed to callers as the `rowIndex` sort key
pub const ROW_INDEX_COLUMN: &str = "row_index";

const SORT_COLUMNS: &[(&str, &str)] = &[("rowIndex", ROW_INDEX_COLUMN)];

/// Where an upload came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSource {
    pub file_name: String,
    pub original_name: String,
    pub sheet_name: Option<String>,
}

/// One uploaded file in the generic store
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub file_name: String,
    pub original_name: String,
    pub sheet_name: Option<String>,
    pub row_count: u64,
    pub uploaded_at: Option<String>,
}

/// Selected columns of a generic row, as (SQL expression, output key)
const ROW_SELECT: &[(&str, &str)] = &[
    ("id", "id"),
    ("file_name", "fileName"),
    ("original_name", "originalName"),
    ("CAST(data AS VARCHAR)", "data"),
    ("row_index", "rowIndex"),
    ("sheet_name", "sheetName"),
    ("created_at", "createdAt"),
    ("updated_at", "updatedAt"),
];

/// Access to the `upload_rows` table
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericRowStore;

impl GenericRowStore {
    pub fn new() -> Self {
        Self
    }

    /// Create the backing table if it does not exist yet
    pub fn ensure(&self, store: &dyn Store) -> Result<()> {
        store.execute_batch(&format!(
            "CREATE SEQUENCE IF NOT EXISTS {seq};
             CREATE TABLE IF NOT EXISTS {table} (
                id BIGINT PRIMARY KEY DEFAULT nextval('{seq}'),
                file_name VARCHAR NOT NULL,
                original_name VARCHAR NOT NULL,
                data JSON NOT NULL,
                row_index BIGINT NOT NULL,
                sheet_name VARCHAR,
                created_at TIMESTAMP DEFAULT current_timestamp,
                updated_at TIMESTAMP DEFAULT current_timestamp
             )",
            seq = ROWS_SEQUENCE,
            table = quote_ident(ROWS_TABLE),
        ))
    }

    /// Delete every row of `file_name`, returning how many were removed
    pub fn delete_file(&self, store: &dyn Store, file_name: &str) -> Result<usize> {
        store.execute(
            &format!("DELETE FROM {} WHERE file_name = ?", quote_ident(ROWS_TABLE)),
            &[SqlValue::from(file_name)],
        )
    }

    /// Number of rows stored for `file_name`
    pub fn count_file(&self, store: &dyn Store, file_name: &str) -> Result<u64> {
        store.query_count(
            &format!("SELECT COUNT(*) FROM {} WHERE file_name = ?", quote_ident(ROWS_TABLE)),
            &[SqlValue::from(file_name)],
        )
    }

    /// Uploaded files, most recent first
    pub fn list_files(&self, store: &dyn Store) -> Result<Vec<FileSummary>> {
        let columns: Vec<String> = ["file_name", "original_name", "sheet_name", "row_count", "uploaded_at"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rows = store.query_rows(
            &format!(
                "SELECT file_name, any_value(original_name), any_value(sheet_name),
                        COUNT(*), MAX(created_at)
                 FROM {}
                 GROUP BY file_name
                 ORDER BY MAX(created_at) DESC, MAX(id) DESC",
                quote_ident(ROWS_TABLE)
            ),
            &[],
            &columns,
        )?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let text = |key: &str| row.get(key).and_then(|v| v.as_str()).map(str::to_string);
                Some(FileSummary {
                    file_name: text("file_name")?,
                    original_name: text("original_name").unwrap_or_default(),
                    sheet_name: text("sheet_name"),
                    row_count: row.get("row_count").and_then(|v| v.as_u64()).unwrap_or(0),
                    uploaded_at: text("uploaded_at"),
                })
            })
            .collect())
    }

    /// The most recently uploaded file, if any
    pub fn latest_file(&self, store: &dyn Store) -> Result<Option<FileSummary>> {
        Ok(self.list_files(store)?.into_iter().next())
    }

    /// One page of the rows of `file_name`.
    ///
    /// Filter, search and sort keys address keys of the row documents.
    pub fn query_file(&self, store: &dyn Store, file_name: &str, request: &PageRequest) -> Result<PageResult> {
        let builder = QueryBuilder::new(
            ROWS_TABLE,
            FieldSource::Document {
                column: DATA_COLUMN,
                sort_columns: SORT_COLUMNS,
            },
            ROW_INDEX_COLUMN,
        )
        .with_condition("file_name = ?", vec![SqlValue::from(file_name)]);

        let select = ROW_SELECT
            .iter()
            .map(|(expr, _)| *expr)
            .collect::<Vec<_>>()
            .join(", ");
        let columns: Vec<String> = ROW_SELECT.iter().map(|(_, key)| key.to_string()).collect();

        let mut page = builder.build(&select, request).fetch(store, &columns, request)?;
        for row in &mut page.rows {
            expand_document(row)?;
        }
        Ok(page)
    }
}

/// Replace the textual `data` value of a row with the parsed document
fn expand_document(row: &mut Record) -> Result<()> {
    if let Some(serde_json::Value::String(raw)) = row.get(DATA_COLUMN) {
        let parsed = serde_json::from_str(raw)
            .map_err(|e| SheetbaseError::QueryFailed(format!("Corrupt row document: {}", e)))?;
        row.insert(DATA_COLUMN.to_string(), parsed);
    }
    Ok(())
}
