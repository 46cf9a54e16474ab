//! High-level operations shared by the REST server and the CLI.
//!
//! [`DataService`] owns the store and routes every table-scoped call through
//! the registry first, so unknown tables come back as `NotFound` instead of a
//! store error.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::{HeaderMapping, MetadataCatalog};
use crate::config::ServiceConfig;
use crate::generic::{FileSummary, GenericRowStore, UploadSource};
use crate::ingest::{cell_value, BulkIngestor, IngestTarget, SourceRow};
use crate::naming::{quote_ident, validate_table_name};
use crate::query::{FieldSource, PageRequest, PageResult, QueryBuilder};
use crate::registry;
use crate::schema::{
    physical_columns, ColumnDescriptor, ColumnSpec, ProvisionAction, SchemaProvisioner, TableDescriptor,
    ID_COLUMN, UPDATED_COLUMN,
};
use crate::store::{SqlValue, Store};
use crate::{Record, Result, SheetbaseError};

/// Message returned with an empty page when nothing has been uploaded
pub const NO_DATA_MESSAGE: &str = "no data";

/// Rows of a dynamic table together with its column descriptors
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TablePage {
    pub columns: Vec<ColumnDescriptor>,
    #[serde(flatten)]
    pub page: PageResult,
}

/// Rows of a generic-store file
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub page: PageResult,
}

/// An upload of already-parsed rows
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub file_name: String,
    #[serde(default)]
    pub original_name: String,
    #[serde(default)]
    pub sheet_name: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub rows: Vec<SourceRow>,
    #[serde(default)]
    pub create_dynamic_table: bool,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub force_recreate: bool,
}

/// Result of an upload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub message: String,
    pub columns: Vec<ColumnSpec>,
    pub record_count: usize,
    /// Whether the rows landed in a dynamic table
    pub table_created: bool,
    pub table_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_action: Option<ProvisionAction>,
}

/// Entry point for all data operations
pub struct DataService {
    store: Box<dyn Store>,
    config: ServiceConfig,
    catalog: MetadataCatalog,
    provisioner: SchemaProvisioner,
    ingestor: BulkIngestor,
    rows: GenericRowStore,
}

impl DataService {
    /// Wrap `store`, creating the generic row table if needed.
    pub fn new(store: Box<dyn Store>, config: ServiceConfig) -> Result<Self> {
        let rows = GenericRowStore::new();
        rows.ensure(store.as_ref())?;
        let catalog = MetadataCatalog::new();

        info!(
            "Data service ready (backend: {}, batch size: {})",
            store.backend(),
            config.batch_size
        );

        Ok(Self {
            ingestor: BulkIngestor::new(config.batch_size),
            provisioner: SchemaProvisioner::new(catalog),
            catalog,
            rows,
            store,
            config,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        registry::list_tables(self.store())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool> {
        registry::exists(self.store(), table_name)
    }

    /// Stored name of `table_name`
    fn require_table(&self, table_name: &str) -> Result<String> {
        validate_table_name(table_name)?;
        registry::require(self.store(), table_name)
    }

    pub fn describe_table(&self, table_name: &str) -> Result<TableDescriptor> {
        let table_name = self.require_table(table_name)?;
        self.provisioner.describe(self.store(), &table_name)
    }

    pub fn get_headers(&self, table_name: &str) -> Result<HeaderMapping> {
        let table_name = registry::resolve(self.store(), table_name)?.unwrap_or_else(|| table_name.to_string());
        self.catalog.get_headers(self.store(), &table_name)
    }

    /// Replace the display headers of a table.
    ///
    /// Entries for fields the table does not have are dropped.
    pub fn set_headers(&self, table_name: &str, headers: HeaderMapping) -> Result<TableDescriptor> {
        let table = self.describe_table(table_name)?;
        let table_name = table.table_name.as_str();
        let fields = table.fields();
        let (known, unknown): (HeaderMapping, HeaderMapping) =
            headers.into_iter().partition(|(field, _)| fields.contains(field));
        if !unknown.is_empty() {
            warn!(
                "Ignoring headers for unknown fields of '{}': {:?}",
                table_name,
                unknown.keys().collect::<Vec<_>>()
            );
        }

        self.catalog.upsert_headers(self.store(), table_name, &known)?;
        self.provisioner.describe(self.store(), table_name)
    }

    /// Lock or unlock a table against deletion and recreation
    pub fn set_locked(&self, table_name: &str, locked: bool) -> Result<TableDescriptor> {
        let table_name = self.tracked_table(table_name)?;
        self.catalog.set_locked(self.store(), &table_name, locked)?;
        info!("Table '{}' {}", table_name, if locked { "locked" } else { "unlocked" });
        self.provisioner.describe(self.store(), &table_name)
    }

    /// Mark or unmark a table as a system table, which protects it like a lock
    pub fn set_system_table(&self, table_name: &str, system_table: bool) -> Result<TableDescriptor> {
        let table_name = self.tracked_table(table_name)?;
        self.catalog.set_system_table(self.store(), &table_name, system_table)?;
        info!("Table '{}' system flag set to {}", table_name, system_table);
        self.provisioner.describe(self.store(), &table_name)
    }

    /// Stored name of `table_name`, recording its current headers in the
    /// catalog when the table is not tracked yet.
    fn tracked_table(&self, table_name: &str) -> Result<String> {
        let table = self.describe_table(table_name)?;
        if self.catalog.get(self.store(), &table.table_name)?.is_none() {
            let headers = table
                .columns
                .iter()
                .map(|c| (c.field.clone(), c.header.clone()))
                .collect();
            self.catalog.upsert_headers(self.store(), &table.table_name, &headers)?;
        }
        Ok(table.table_name)
    }

    /// One page of a dynamic table.
    ///
    /// Filter, search and sort keys are checked against the table's data
    /// columns; unknown keys are ignored.
    pub fn query_table(&self, table_name: &str, request: &PageRequest) -> Result<TablePage> {
        let table = self.describe_table(table_name)?;
        let fields = table.fields();
        let columns = self.select_columns(&table.table_name)?;

        let page = QueryBuilder::new(&table.table_name, FieldSource::Columns(&fields), ID_COLUMN)
            .build(&select_list(&columns), request)
            .fetch(self.store(), &columns, request)?;

        Ok(TablePage {
            columns: table.columns,
            page,
        })
    }

    fn select_columns(&self, table_name: &str) -> Result<Vec<String>> {
        Ok(physical_columns(self.store(), table_name)?
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    pub fn drop_table(&self, table_name: &str) -> Result<()> {
        validate_table_name(table_name)?;
        self.provisioner.drop_table(self.store(), table_name)
    }

    /// Update the data columns of one row and return the updated row.
    ///
    /// Keys that are not data columns of the table are ignored.
    pub fn update_row(&self, table_name: &str, id: i64, data: &Record) -> Result<Record> {
        let table = self.describe_table(table_name)?;
        let table_name = table.table_name.as_str();
        let fields = table.fields();

        let writable: Vec<(&String, &serde_json::Value)> = fields
            .iter()
            .filter_map(|field| data.get(field).map(|value| (field, value)))
            .collect();
        if writable.is_empty() {
            return Err(SheetbaseError::InvalidRequest(format!(
                "no writable fields for table '{}'",
                table_name
            )));
        }

        let assignments = writable
            .iter()
            .map(|(field, _)| format!("{} = ?", quote_ident(field)))
            .chain(std::iter::once(format!(
                "{} = current_timestamp",
                quote_ident(UPDATED_COLUMN)
            )))
            .collect::<Vec<_>>()
            .join(", ");
        let mut params: Vec<SqlValue> = writable.iter().map(|(_, value)| cell_value(Some(*value))).collect();
        params.push(SqlValue::Int(id));

        let columns = self.select_columns(table_name)?;
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ? RETURNING {}",
            quote_ident(table_name),
            assignments,
            quote_ident(ID_COLUMN),
            select_list(&columns)
        );

        let rows = self
            .store()
            .query_rows(&sql, &params, &columns)
            .map_err(|e| SheetbaseError::QueryFailed(e.to_string()))?;
        rows.into_iter().next().ok_or_else(|| {
            SheetbaseError::NotFound(format!("row {} does not exist in '{}'", id, table_name))
        })
    }

    /// Store an upload, in a dynamic table when asked for, otherwise (or when
    /// the table cannot be provisioned) in the generic row store.
    ///
    /// Once the table is provisioned its rows are never diverted: an ingest
    /// failure is returned with the number of rows already committed.
    pub fn upload(&self, request: UploadRequest) -> Result<UploadOutcome> {
        if request.file_name.trim().is_empty() {
            return Err(SheetbaseError::InvalidRequest("missing file name".to_string()));
        }
        if request.rows.is_empty() {
            return Err(SheetbaseError::InvalidRequest(format!(
                "upload '{}' contains no rows",
                request.file_name
            )));
        }

        let record_count = request.rows.len();

        if request.create_dynamic_table {
            let table_name = request
                .table_name
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| self.config.default_table_name.clone());

            match self.provisioner.provision(
                self.store(),
                &table_name,
                &request.columns,
                request.force_recreate,
            ) {
                Ok(provisioned) => {
                    let table_name = provisioned.table.table_name;
                    self.ingestor.ingest(
                        self.store(),
                        IngestTarget::Table {
                            table_name: &table_name,
                            bindings: &provisioned.bindings,
                        },
                        &request.rows,
                    )?;
                    return Ok(UploadOutcome {
                        message: format!("Stored {} rows in table '{}'", record_count, table_name),
                        columns: request.columns,
                        record_count,
                        table_created: true,
                        table_name: Some(table_name),
                        table_action: Some(provisioned.action),
                    });
                }
                Err(e) => {
                    warn!(
                        "Could not provision table '{}' for '{}', using generic storage: {}",
                        table_name, request.file_name, e
                    );
                }
            }
        }

        let source = UploadSource {
            file_name: request.file_name.clone(),
            original_name: if request.original_name.is_empty() {
                request.file_name.clone()
            } else {
                request.original_name.clone()
            },
            sheet_name: request.sheet_name.clone(),
        };
        self.ingestor
            .ingest(self.store(), IngestTarget::Generic(&source), &request.rows)?;

        Ok(UploadOutcome {
            message: format!("Stored {} rows for '{}'", record_count, request.file_name),
            columns: request.columns,
            record_count,
            table_created: false,
            table_name: None,
            table_action: None,
        })
    }

    pub fn list_files(&self) -> Result<Vec<FileSummary>> {
        self.rows.list_files(self.store())
    }

    /// One page of the most recently uploaded file; an empty page with a
    /// message when nothing was uploaded yet.
    pub fn query_latest_file(&self, request: &PageRequest) -> Result<FilePage> {
        let Some(file) = self.rows.latest_file(self.store())? else {
            return Ok(FilePage {
                file: None,
                message: Some(NO_DATA_MESSAGE.to_string()),
                page: PageResult {
                    rows: Vec::new(),
                    total: 0,
                    page: request.page,
                    page_size: request.page_size,
                },
            });
        };

        let page = self.rows.query_file(self.store(), &file.file_name, request)?;
        Ok(FilePage {
            file: Some(file),
            message: None,
            page,
        })
    }

    /// One page of the rows uploaded as `file_name`
    pub fn query_file(&self, file_name: &str, request: &PageRequest) -> Result<PageResult> {
        if self.rows.count_file(self.store(), file_name)? == 0 {
            return Err(SheetbaseError::NotFound(format!(
                "no rows uploaded for file '{}'",
                file_name
            )));
        }
        self.rows.query_file(self.store(), file_name, request)
    }
}

fn select_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}
