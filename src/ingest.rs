//! Batched row loading.
//!
//! Rows go either into a provisioned table, column by column through the
//! bindings produced at provisioning time, or into the generic document store.
//! Each batch is one multi-row INSERT. Batches are independent: when one fails,
//! the rows of earlier batches stay committed and the error reports how many
//! made it.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::generic::{GenericRowStore, UploadSource, ROWS_TABLE};
use crate::naming::quote_ident;
use crate::schema::ColumnBinding;
use crate::store::{SqlValue, Store};
use crate::{Record, Result, SheetbaseError};

/// Rows per INSERT statement
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// A parsed source row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRow {
    #[serde(default)]
    pub row_index: i64,
    #[serde(default)]
    pub row_data: Record,
}

impl SourceRow {
    pub fn new(row_index: i64, row_data: Record) -> Self {
        Self { row_index, row_data }
    }
}

/// Destination of an ingestion
#[derive(Debug, Clone, Copy)]
pub enum IngestTarget<'a> {
    /// A provisioned table; only bound columns are written
    Table {
        table_name: &'a str,
        bindings: &'a [ColumnBinding],
    },
    /// The generic document store; existing rows of the same file are replaced
    Generic(&'a UploadSource),
}

impl IngestTarget<'_> {
    fn name(&self) -> String {
        match self {
            IngestTarget::Table { table_name, .. } => table_name.to_string(),
            IngestTarget::Generic(source) => format!("{} ({})", ROWS_TABLE, source.file_name),
        }
    }
}

/// Loads rows in fixed-size batches
#[derive(Debug, Clone, Copy)]
pub struct BulkIngestor {
    batch_size: usize,
}

impl Default for BulkIngestor {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl BulkIngestor {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Insert `rows` into `target` and return how many were written.
    pub fn ingest(&self, store: &dyn Store, target: IngestTarget<'_>, rows: &[SourceRow]) -> Result<usize> {
        let inserted = match target {
            IngestTarget::Table { table_name, bindings } => {
                self.ingest_table(store, table_name, bindings, rows, &target)?
            }
            IngestTarget::Generic(source) => self.ingest_generic(store, source, rows, &target)?,
        };
        info!("Ingested {} rows into {}", inserted, target.name());
        Ok(inserted)
    }

    fn ingest_table(
        &self,
        store: &dyn Store,
        table_name: &str,
        bindings: &[ColumnBinding],
        rows: &[SourceRow],
        target: &IngestTarget<'_>,
    ) -> Result<usize> {
        let table = quote_ident(table_name);

        if bindings.is_empty() {
            // Nothing to map, but each row still gets its id and timestamps
            let sql = format!("INSERT INTO {} DEFAULT VALUES", table);
            for (inserted, _) in rows.iter().enumerate() {
                store
                    .execute(&sql, &[])
                    .map_err(|e| ingest_failed(target, inserted, e))?;
            }
            return Ok(rows.len());
        }

        let columns = bindings
            .iter()
            .map(|b| quote_ident(&b.field))
            .collect::<Vec<_>>()
            .join(", ");
        let tuple = format!("({})", vec!["?"; bindings.len()].join(", "));

        self.run_batches(store, rows, target, |chunk| {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                table,
                columns,
                vec![tuple.as_str(); chunk.len()].join(", ")
            );
            let params = chunk
                .iter()
                .flat_map(|row| bindings.iter().map(|b| cell_value(row.row_data.get(&b.source_key))))
                .collect();
            (sql, params)
        })
    }

    fn ingest_generic(
        &self,
        store: &dyn Store,
        source: &UploadSource,
        rows: &[SourceRow],
        target: &IngestTarget<'_>,
    ) -> Result<usize> {
        let generic = GenericRowStore::new();
        generic.ensure(store)?;
        let removed = generic
            .delete_file(store, &source.file_name)
            .map_err(|e| ingest_failed(target, 0, e))?;
        if removed > 0 {
            info!("Replacing {} existing rows of '{}'", removed, source.file_name);
        }

        let mut encoded = Vec::with_capacity(rows.len());
        for row in rows {
            let document = serde_json::to_string(&row.row_data)
                .map_err(|e| ingest_failed(target, 0, e))?;
            encoded.push((row.row_index, document));
        }

        self.run_batches(store, &encoded, target, |chunk| {
            let sql = format!(
                "INSERT INTO {} (file_name, original_name, data, row_index, sheet_name) VALUES {}",
                quote_ident(ROWS_TABLE),
                vec!["(?, ?, ?, ?, ?)"; chunk.len()].join(", ")
            );
            let params = chunk
                .iter()
                .flat_map(|(row_index, document)| {
                    [
                        SqlValue::from(source.file_name.as_str()),
                        SqlValue::from(source.original_name.as_str()),
                        SqlValue::from(document.as_str()),
                        SqlValue::Int(*row_index),
                        SqlValue::from(source.sheet_name.clone()),
                    ]
                })
                .collect();
            (sql, params)
        })
    }

    fn run_batches<T>(
        &self,
        store: &dyn Store,
        items: &[T],
        target: &IngestTarget<'_>,
        statement: impl Fn(&[T]) -> (String, Vec<SqlValue>),
    ) -> Result<usize> {
        let mut inserted = 0;
        for chunk in items.chunks(self.batch_size) {
            let (sql, params) = statement(chunk);
            store
                .execute(&sql, &params)
                .map_err(|e| ingest_failed(target, inserted, e))?;
            inserted += chunk.len();
        }
        Ok(inserted)
    }
}

fn ingest_failed(target: &IngestTarget<'_>, inserted: usize, cause: impl std::fmt::Display) -> SheetbaseError {
    SheetbaseError::IngestFailed {
        target: target.name(),
        inserted,
        cause: cause.to_string(),
    }
}

/// Text form of a source cell; missing and null cells become NULL
pub(crate) fn cell_value(value: Option<&serde_json::Value>) -> SqlValue {
    match value {
        None | Some(serde_json::Value::Null) => SqlValue::Null,
        Some(serde_json::Value::String(s)) => SqlValue::Text(s.clone()),
        Some(other) => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSpec, SchemaProvisioner};
    use crate::store::DuckDBStore;
    use serde_json::json;

    fn store() -> DuckDBStore {
        DuckDBStore::from_connection_string("duckdb://memory").unwrap()
    }

    fn row(index: i64, value: serde_json::Value) -> SourceRow {
        match value {
            serde_json::Value::Object(map) => SourceRow::new(index, map),
            _ => unreachable!(),
        }
    }

    fn provision(store: &DuckDBStore, specs: &[ColumnSpec]) -> Vec<ColumnBinding> {
        SchemaProvisioner::default()
            .provision(store, "sales", specs, false)
            .unwrap()
            .bindings
    }

    #[test]
    fn test_cell_value() {
        assert_eq!(cell_value(None), SqlValue::Null);
        assert_eq!(cell_value(Some(&json!(null))), SqlValue::Null);
        assert_eq!(cell_value(Some(&json!(""))), SqlValue::from(""));
        assert_eq!(cell_value(Some(&json!(12.5))), SqlValue::from("12.5"));
        assert_eq!(cell_value(Some(&json!(true))), SqlValue::from("true"));
    }

    #[test]
    fn test_ingest_table_in_batches() {
        let store = store();
        let bindings = provision(&store, &[ColumnSpec::new("Net Sales"), ColumnSpec::new("Region")]);
        let rows: Vec<SourceRow> = (0..25)
            .map(|i| row(i, json!({"Net Sales": format!("{}", i * 100), "Region": "EU"})))
            .collect();

        let ingestor = BulkIngestor::new(10);
        let inserted = ingestor
            .ingest(&store, IngestTarget::Table { table_name: "sales", bindings: &bindings }, &rows)
            .unwrap();

        assert_eq!(inserted, 25);
        assert_eq!(store.query_count("SELECT COUNT(*) FROM sales", &[]).unwrap(), 25);
        assert_eq!(
            store
                .query_count("SELECT COUNT(*) FROM sales WHERE net_sales = '1200'", &[])
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_missing_values_become_null() {
        let store = store();
        let bindings = provision(&store, &[ColumnSpec::new("Region"), ColumnSpec::new("Owner")]);
        let rows = vec![row(0, json!({"Region": ""})), row(1, json!({"Owner": null}))];

        BulkIngestor::default()
            .ingest(&store, IngestTarget::Table { table_name: "sales", bindings: &bindings }, &rows)
            .unwrap();

        let nulls = store
            .query_count("SELECT COUNT(*) FROM sales WHERE owner IS NULL", &[])
            .unwrap();
        assert_eq!(nulls, 2);
        let empty = store
            .query_count("SELECT COUNT(*) FROM sales WHERE region = ''", &[])
            .unwrap();
        assert_eq!(empty, 1);
    }

    #[test]
    fn test_rows_without_bound_columns_still_insert() {
        let store = store();
        let bindings = provision(&store, &[]);
        let rows = vec![row(0, json!({"x": "1"})), row(1, json!({}))];

        let inserted = BulkIngestor::default()
            .ingest(&store, IngestTarget::Table { table_name: "sales", bindings: &bindings }, &rows)
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(store.query_count("SELECT COUNT(*) FROM sales", &[]).unwrap(), 2);
    }

    #[test]
    fn test_failed_batch_keeps_earlier_batches() {
        let store = store();
        store
            .execute_batch("CREATE TABLE checked (v VARCHAR CHECK (v <> 'bad'))")
            .unwrap();
        let bindings = vec![ColumnBinding {
            source_key: "v".to_string(),
            field: "v".to_string(),
            header: "v".to_string(),
            kind: Default::default(),
        }];
        let rows: Vec<SourceRow> = ["a", "b", "c", "bad", "e"]
            .iter()
            .enumerate()
            .map(|(i, v)| row(i as i64, json!({ "v": v })))
            .collect();

        let err = BulkIngestor::new(2)
            .ingest(&store, IngestTarget::Table { table_name: "checked", bindings: &bindings }, &rows)
            .unwrap_err();

        match err {
            SheetbaseError::IngestFailed { target, inserted, .. } => {
                assert_eq!(target, "checked");
                assert_eq!(inserted, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.query_count("SELECT COUNT(*) FROM checked", &[]).unwrap(), 2);
    }

    #[test]
    fn test_generic_ingest_replaces_file_rows() {
        let store = store();
        let source = UploadSource {
            file_name: "1700000000-report.xlsx".to_string(),
            original_name: "report.xlsx".to_string(),
            sheet_name: Some("Sheet1".to_string()),
        };
        let ingestor = BulkIngestor::new(2);

        let first: Vec<SourceRow> = (0..3).map(|i| row(i, json!({"Name": format!("n{}", i)}))).collect();
        assert_eq!(ingestor.ingest(&store, IngestTarget::Generic(&source), &first).unwrap(), 3);

        let second = vec![row(0, json!({"Name": "only"}))];
        assert_eq!(ingestor.ingest(&store, IngestTarget::Generic(&source), &second).unwrap(), 1);

        let generic = GenericRowStore::new();
        assert_eq!(generic.count_file(&store, &source.file_name).unwrap(), 1);
        let page = generic
            .query_file(&store, &source.file_name, &crate::query::PageRequest::default())
            .unwrap();
        assert_eq!(page.rows[0]["data"]["Name"], "only");
        assert_eq!(page.rows[0]["sheetName"], "Sheet1");
    }
}
