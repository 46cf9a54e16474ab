//! Schema provisioning for dynamic tables.
//!
//! Turns a table name plus the column list of an upload into a physical table:
//! a synthetic auto-incrementing `id`, one tolerant text column per input
//! column, and `createdAt`/`updatedAt` timestamps. The physical schema is read
//! back from the store's information schema, which stays the authority on which
//! columns a table really has.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::{MetadataCatalog, MetadataRecord, TableMetadata};
use crate::naming::{quote_ident, sanitize, validate_table_name};
use crate::registry;
use crate::store::{SqlValue, Store};
use crate::{Result, SheetbaseError};

/// Synthetic primary key, also the default row order
pub const ID_COLUMN: &str = "id";
pub const CREATED_COLUMN: &str = "createdAt";
pub const UPDATED_COLUMN: &str = "updatedAt";

/// Columns every dynamic table has in addition to its data columns
pub const SYNTHETIC_COLUMNS: &[&str] = &[ID_COLUMN, CREATED_COLUMN, UPDATED_COLUMN];

/// Physical type of every data column. No type inference is attempted, so
/// source strings round-trip untouched.
pub const DATA_COLUMN_TYPE: &str = "VARCHAR";

/// Semantic type hint carried by an upload column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum ColumnKind {
    #[default]
    Text,
    Number,
    Date,
}

impl From<String> for ColumnKind {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "number" | "numeric" | "integer" | "float" | "decimal" => ColumnKind::Number,
            "date" | "datetime" | "time" | "timestamp" => ColumnKind::Date,
            _ => ColumnKind::Text,
        }
    }
}

/// A column as described by an upload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Key under which row values are found; defaults to `header`
    #[serde(default)]
    pub field: Option<String>,
    /// Original display label
    #[serde(default)]
    pub header: String,
    #[serde(default, rename = "type")]
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_kind(mut self, kind: ColumnKind) -> Self {
        self.kind = kind;
        self
    }

    /// Key used to look values up in a source row
    pub fn source_key(&self) -> &str {
        self.field.as_deref().unwrap_or(&self.header)
    }
}

/// Link between a source row key and the physical column it is stored in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBinding {
    pub source_key: String,
    pub field: String,
    pub header: String,
    pub kind: ColumnKind,
}

/// A data column of a provisioned table
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub field: String,
    pub header: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub max_length: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ColumnKind>,
}

/// A provisioned table with its data columns and catalog attributes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescriptor {
    pub table_name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub locked: bool,
    pub system_table: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl TableDescriptor {
    /// Data column names, the whitelist for generated SQL
    pub fn fields(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.field.clone()).collect()
    }
}

/// What provisioning did to the physical table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionAction {
    Created,
    Recreated,
    /// The table existed and `force_recreate` was off; its schema is untouched
    Kept,
}

/// Outcome of [`SchemaProvisioner::provision`]
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub table: TableDescriptor,
    /// Bindings usable for ingestion, restricted to columns the table really has
    pub bindings: Vec<ColumnBinding>,
    pub action: ProvisionAction,
}

/// A column as reported by the information schema
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalColumn {
    pub name: String,
    pub data_type: String,
    pub max_length: Option<i64>,
}

/// Derive physical field names for the columns of an upload.
///
/// Fields come from `sanitize(field)` or, when only a header is given, from
/// `sanitize(lowercase(header))`. Names already taken (compared
/// case-insensitively, including the synthetic columns) get `_2`, `_3`, ...
/// appended in input order.
pub fn resolve_columns(specs: &[ColumnSpec]) -> Vec<ColumnBinding> {
    let mut taken: HashSet<String> = SYNTHETIC_COLUMNS
        .iter()
        .map(|c| c.to_ascii_lowercase())
        .collect();

    specs
        .iter()
        .map(|spec| {
            let base = match &spec.field {
                Some(field) => sanitize(field),
                None => sanitize(&spec.header.trim().to_lowercase()),
            };

            let mut field = base.clone();
            let mut suffix = 2;
            while taken.contains(&field.to_ascii_lowercase()) {
                field = format!("{}_{}", base, suffix);
                suffix += 1;
            }
            taken.insert(field.to_ascii_lowercase());

            let header = if spec.header.is_empty() {
                field.clone()
            } else {
                spec.header.clone()
            };

            ColumnBinding {
                source_key: spec.source_key().to_string(),
                field,
                header,
                kind: spec.kind,
            }
        })
        .collect()
}

/// Columns of `table_name` in ordinal order, synthetic ones included
pub fn physical_columns(store: &dyn Store, table_name: &str) -> Result<Vec<PhysicalColumn>> {
    let columns: Vec<String> = ["column_name", "data_type", "character_maximum_length"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let rows = store.query_rows(
        "SELECT column_name, data_type, character_maximum_length
         FROM information_schema.columns
         WHERE table_catalog = current_database()
           AND table_schema = current_schema()
           AND table_name = ?
         ORDER BY ordinal_position",
        &[SqlValue::from(table_name)],
        &columns,
    )?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let name = row.get("column_name")?.as_str()?.to_string();
            Some(PhysicalColumn {
                name,
                data_type: row
                    .get("data_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                max_length: row.get("character_maximum_length").and_then(|v| v.as_i64()),
            })
        })
        .collect())
}

fn sequence_name(table_name: &str) -> String {
    format!("{}_id_seq", table_name)
}

fn provision_failed(table_name: &str, err: impl std::fmt::Display) -> SheetbaseError {
    SheetbaseError::ProvisionFailed {
        table: table_name.to_string(),
        cause: err.to_string(),
    }
}

/// Creates, describes and drops dynamic tables
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaProvisioner {
    catalog: MetadataCatalog,
}

impl SchemaProvisioner {
    pub fn new(catalog: MetadataCatalog) -> Self {
        Self { catalog }
    }

    /// Create (or, with `force_recreate`, replace) `table_name` for `specs`.
    ///
    /// An existing table is left untouched unless `force_recreate` is set. The
    /// header mapping is recorded in either case; a failure to record it is
    /// logged and does not undo the table.
    pub fn provision(
        &self,
        store: &dyn Store,
        table_name: &str,
        specs: &[ColumnSpec],
        force_recreate: bool,
    ) -> Result<Provisioned> {
        validate_table_name(table_name)?;
        let bindings = resolve_columns(specs);

        let existing = registry::resolve(store, table_name).map_err(|e| provision_failed(table_name, e))?;
        let existed = existing.is_some();
        let table_name = existing.as_deref().unwrap_or(table_name);
        let action = match (existed, force_recreate) {
            (true, false) => ProvisionAction::Kept,
            (true, true) => {
                let protected = self
                    .catalog
                    .is_protected(store, table_name)
                    .map_err(|e| provision_failed(table_name, e))?;
                if protected {
                    return Err(SheetbaseError::TableLocked(table_name.to_string()));
                }
                self.create_table(store, table_name, &bindings, true)
                    .map_err(|e| provision_failed(table_name, e))?;
                ProvisionAction::Recreated
            }
            (false, _) => {
                self.create_table(store, table_name, &bindings, false)
                    .map_err(|e| provision_failed(table_name, e))?;
                ProvisionAction::Created
            }
        };

        let metadata = TableMetadata {
            column_headers: bindings
                .iter()
                .map(|b| (b.field.clone(), b.header.clone()))
                .collect(),
            column_kinds: bindings.iter().map(|b| (b.field.clone(), b.kind)).collect(),
        };
        if let Err(e) = self.catalog.upsert(store, table_name, &metadata) {
            warn!("Failed to store header mapping for '{}': {}", table_name, e);
        }

        let table = self
            .describe(store, table_name)
            .map_err(|e| provision_failed(table_name, e))?;

        let physical: HashSet<String> = table.columns.iter().map(|c| c.field.to_ascii_lowercase()).collect();
        let (bindings, missing): (Vec<_>, Vec<_>) = bindings
            .into_iter()
            .partition(|b| physical.contains(&b.field.to_ascii_lowercase()));
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|b| b.field.as_str()).collect();
            warn!(
                "Table '{}' kept its schema; values for {:?} will not be stored",
                table_name, names
            );
        }

        info!(
            "Provisioned table '{}' ({:?}, {} data columns)",
            table_name,
            action,
            table.columns.len()
        );

        Ok(Provisioned {
            table,
            bindings,
            action,
        })
    }

    fn create_table(
        &self,
        store: &dyn Store,
        table_name: &str,
        bindings: &[ColumnBinding],
        replace: bool,
    ) -> Result<()> {
        let table = quote_ident(table_name);
        let sequence = sequence_name(table_name);

        let mut definitions = vec![format!(
            "{} BIGINT PRIMARY KEY DEFAULT nextval('{}')",
            quote_ident(ID_COLUMN),
            sequence
        )];
        definitions.extend(
            bindings
                .iter()
                .map(|b| format!("{} {}", quote_ident(&b.field), DATA_COLUMN_TYPE)),
        );
        definitions.push(format!(
            "{} TIMESTAMP DEFAULT current_timestamp",
            quote_ident(CREATED_COLUMN)
        ));
        definitions.push(format!(
            "{} TIMESTAMP DEFAULT current_timestamp",
            quote_ident(UPDATED_COLUMN)
        ));

        if replace {
            store.execute_batch(&format!("DROP TABLE IF EXISTS {}", table))?;
        }
        store.execute_batch(&format!("DROP SEQUENCE IF EXISTS {}", quote_ident(&sequence)))?;
        store.execute_batch(&format!("CREATE SEQUENCE {}", quote_ident(&sequence)))?;
        store.execute_batch(&format!(
            "CREATE TABLE {} ({})",
            table,
            definitions.join(", ")
        ))
    }

    /// Describe `table_name`: its data columns with their original headers.
    ///
    /// Headers missing from the catalog fall back to the field name, and
    /// catalog entries for columns the table does not have are ignored.
    pub fn describe(&self, store: &dyn Store, table_name: &str) -> Result<TableDescriptor> {
        let physical = physical_columns(store, table_name)?;
        if physical.is_empty() {
            return Err(SheetbaseError::NotFound(format!(
                "table '{}' does not exist",
                table_name
            )));
        }

        let record = self.catalog.get(store, table_name).unwrap_or_else(|e| {
            warn!("Could not read metadata for '{}': {}", table_name, e);
            None
        });
        let metadata = record.as_ref().map(|r| &r.metadata);

        let columns = physical
            .into_iter()
            .filter(|c| !SYNTHETIC_COLUMNS.contains(&c.name.as_str()))
            .map(|c| {
                let header = metadata
                    .and_then(|m| m.column_headers.get(&c.name))
                    .cloned()
                    .unwrap_or_else(|| c.name.clone());
                let kind = metadata.and_then(|m| m.column_kinds.get(&c.name)).copied();
                ColumnDescriptor {
                    field: c.name,
                    header,
                    data_type: c.data_type,
                    max_length: c.max_length,
                    kind,
                }
            })
            .collect();

        let (locked, system_table, created_at, updated_at) = match record {
            Some(MetadataRecord {
                locked,
                system_table,
                created_at,
                updated_at,
                ..
            }) => (locked, system_table, created_at, updated_at),
            None => (false, false, None, None),
        };

        Ok(TableDescriptor {
            table_name: table_name.to_string(),
            columns,
            locked,
            system_table,
            created_at,
            updated_at,
        })
    }

    /// Drop a user table, its id sequence and its catalog record.
    pub fn drop_table(&self, store: &dyn Store, table_name: &str) -> Result<()> {
        validate_table_name(table_name)?;
        let table_name = registry::require(store, table_name)?;
        let table_name = table_name.as_str();
        if self.catalog.is_protected(store, table_name)? {
            return Err(SheetbaseError::TableLocked(table_name.to_string()));
        }

        store.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table_name)))?;
        store.execute_batch(&format!(
            "DROP SEQUENCE IF EXISTS {}",
            quote_ident(&sequence_name(table_name))
        ))?;

        if let Err(e) = self.catalog.remove(store, table_name) {
            warn!("Failed to remove metadata for '{}': {}", table_name, e);
        }
        info!("Dropped table '{}'", table_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DuckDBStore;

    fn store() -> DuckDBStore {
        DuckDBStore::from_connection_string("duckdb://memory").unwrap()
    }

    fn fields(table: &TableDescriptor) -> Vec<String> {
        table.fields()
    }

    #[test]
    fn test_resolve_columns_from_headers() {
        let bindings = resolve_columns(&[ColumnSpec::new("Net Sales"), ColumnSpec::new("2024 Total")]);
        assert_eq!(bindings[0].field, "net_sales");
        assert_eq!(bindings[0].header, "Net Sales");
        assert_eq!(bindings[0].source_key, "Net Sales");
        assert_eq!(bindings[1].field, "col_2024_total");
    }

    #[test]
    fn test_resolve_columns_prefers_explicit_field() {
        let bindings = resolve_columns(&[ColumnSpec::new("Region").with_field("Region Code")]);
        assert_eq!(bindings[0].field, "Region_Code");
        assert_eq!(bindings[0].source_key, "Region Code");
        assert_eq!(bindings[0].header, "Region");
    }

    #[test]
    fn test_resolve_columns_disambiguates_collisions() {
        let bindings = resolve_columns(&[
            ColumnSpec::new("a b"),
            ColumnSpec::new("a-b"),
            ColumnSpec::new("A_B"),
            ColumnSpec::new("id"),
            ColumnSpec::new("createdAt"),
        ]);
        let fields: Vec<&str> = bindings.iter().map(|b| b.field.as_str()).collect();
        assert_eq!(fields, vec!["a_b", "a_b_2", "a_b_3", "id_2", "createdat_2"]);
    }

    #[test]
    fn test_column_kind_from_loose_names() {
        assert_eq!(ColumnKind::from("Numeric".to_string()), ColumnKind::Number);
        assert_eq!(ColumnKind::from("datetime".to_string()), ColumnKind::Date);
        assert_eq!(ColumnKind::from("whatever".to_string()), ColumnKind::Text);
    }

    #[test]
    fn test_provision_creates_table_with_synthetic_columns() {
        let store = store();
        let provisioner = SchemaProvisioner::default();
        let provisioned = provisioner
            .provision(&store, "sales", &[ColumnSpec::new("Net Sales"), ColumnSpec::new("Region")], false)
            .unwrap();

        assert_eq!(provisioned.action, ProvisionAction::Created);
        assert_eq!(fields(&provisioned.table), vec!["net_sales", "region"]);
        assert_eq!(provisioned.table.columns[0].header, "Net Sales");
        assert_eq!(provisioned.table.columns[0].data_type, "VARCHAR");

        let names: Vec<String> = physical_columns(&store, "sales")
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["id", "net_sales", "region", "createdAt", "updatedAt"]);

        let headers = MetadataCatalog::new().get_headers(&store, "sales").unwrap();
        assert_eq!(headers.get("net_sales").map(String::as_str), Some("Net Sales"));
    }

    #[test]
    fn test_provision_rejects_invalid_name() {
        let store = store();
        let result = SchemaProvisioner::default().provision(&store, "bad name", &[ColumnSpec::new("a")], false);
        assert!(matches!(result, Err(SheetbaseError::InvalidName(_))));
        assert!(registry::list_tables(&store).unwrap().is_empty());
    }

    #[test]
    fn test_provision_without_force_keeps_schema() {
        let store = store();
        let provisioner = SchemaProvisioner::default();
        provisioner
            .provision(&store, "sales", &[ColumnSpec::new("Region"), ColumnSpec::new("Amount")], false)
            .unwrap();

        let second = provisioner
            .provision(&store, "sales", &[ColumnSpec::new("Region"), ColumnSpec::new("Owner")], false)
            .unwrap();

        assert_eq!(second.action, ProvisionAction::Kept);
        assert_eq!(fields(&second.table), vec!["region", "amount"]);
        // Only bindings for columns the table has survive
        let bound: Vec<&str> = second.bindings.iter().map(|b| b.field.as_str()).collect();
        assert_eq!(bound, vec!["region"]);
    }

    #[test]
    fn test_kept_table_headers_follow_physical_columns() {
        let store = store();
        let provisioner = SchemaProvisioner::default();
        provisioner
            .provision(&store, "sales", &[ColumnSpec::new("Region"), ColumnSpec::new("Amount")], false)
            .unwrap();
        let second = provisioner
            .provision(&store, "sales", &[ColumnSpec::new("REGION").with_field("region"), ColumnSpec::new("Owner")], false)
            .unwrap();

        let headers: Vec<(&str, &str)> = second
            .table
            .columns
            .iter()
            .map(|c| (c.field.as_str(), c.header.as_str()))
            .collect();
        // The mapping was replaced by the latest upload; absent entries fall back to the field
        assert_eq!(headers, vec![("region", "REGION"), ("amount", "amount")]);
    }

    #[test]
    fn test_provision_with_force_replaces_schema() {
        let store = store();
        let provisioner = SchemaProvisioner::default();
        provisioner
            .provision(&store, "sales", &[ColumnSpec::new("Region"), ColumnSpec::new("Amount")], false)
            .unwrap();
        store
            .execute("INSERT INTO sales (region) VALUES (?)", &[SqlValue::from("EU")])
            .unwrap();

        let second = provisioner
            .provision(&store, "sales", &[ColumnSpec::new("Owner")], true)
            .unwrap();

        assert_eq!(second.action, ProvisionAction::Recreated);
        assert_eq!(fields(&second.table), vec!["owner"]);
        assert_eq!(store.query_count("SELECT COUNT(*) FROM sales", &[]).unwrap(), 0);
    }

    #[test]
    fn test_force_recreate_refused_for_locked_table() {
        let store = store();
        let provisioner = SchemaProvisioner::default();
        provisioner
            .provision(&store, "sales", &[ColumnSpec::new("Region")], false)
            .unwrap();
        MetadataCatalog::new().set_locked(&store, "sales", true).unwrap();

        let result = provisioner.provision(&store, "sales", &[ColumnSpec::new("Owner")], true);
        assert!(matches!(result, Err(SheetbaseError::TableLocked(_))));
    }

    #[test]
    fn test_catalog_failure_does_not_undo_table() {
        let store = store();
        store
            .execute_batch("CREATE TABLE table_metadata (unrelated INTEGER)")
            .unwrap();

        let provisioned = SchemaProvisioner::default()
            .provision(&store, "sales", &[ColumnSpec::new("Net Sales")], false)
            .unwrap();

        assert_eq!(provisioned.action, ProvisionAction::Created);
        // Without a mapping the header falls back to the field name
        assert_eq!(provisioned.table.columns[0].header, "net_sales");
    }

    #[test]
    fn test_drop_table() {
        let store = store();
        let provisioner = SchemaProvisioner::default();
        provisioner
            .provision(&store, "sales", &[ColumnSpec::new("Region")], false)
            .unwrap();

        provisioner.drop_table(&store, "sales").unwrap();
        assert!(!registry::exists(&store, "sales").unwrap());
        assert!(MetadataCatalog::new().get(&store, "sales").unwrap().is_none());
        assert!(matches!(
            provisioner.drop_table(&store, "sales"),
            Err(SheetbaseError::NotFound(_))
        ));

        // The name is free for a fresh table afterwards
        let again = provisioner
            .provision(&store, "sales", &[ColumnSpec::new("Region")], false)
            .unwrap();
        assert_eq!(again.action, ProvisionAction::Created);
    }

    #[test]
    fn test_drop_locked_table_refused() {
        let store = store();
        let provisioner = SchemaProvisioner::default();
        provisioner
            .provision(&store, "sales", &[ColumnSpec::new("Region")], false)
            .unwrap();
        MetadataCatalog::new().set_locked(&store, "sales", true).unwrap();

        assert!(matches!(
            provisioner.drop_table(&store, "sales"),
            Err(SheetbaseError::TableLocked(_))
        ));
        assert!(registry::exists(&store, "sales").unwrap());
    }

    #[test]
    fn test_provision_matches_existing_table_case_insensitively() {
        let store = store();
        let provisioner = SchemaProvisioner::default();
        provisioner
            .provision(&store, "Sales", &[ColumnSpec::new("Region")], false)
            .unwrap();

        let kept = provisioner
            .provision(&store, "sales", &[ColumnSpec::new("Region")], false)
            .unwrap();
        assert_eq!(kept.action, ProvisionAction::Kept);
        assert_eq!(kept.table.table_name, "Sales");

        let recreated = provisioner
            .provision(&store, "SALES", &[ColumnSpec::new("Owner")], true)
            .unwrap();
        assert_eq!(recreated.action, ProvisionAction::Recreated);
        assert_eq!(recreated.table.table_name, "Sales");
        assert_eq!(fields(&recreated.table), vec!["owner"]);
        assert_eq!(registry::list_tables(&store).unwrap(), vec!["Sales"]);

        provisioner.drop_table(&store, "sales").unwrap();
        assert!(registry::list_tables(&store).unwrap().is_empty());
    }
}
