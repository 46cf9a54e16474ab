//! Enumeration of user-created tables.
//!
//! The registry is the existence guard in front of every table-scoped
//! operation: callers get a typed `NotFound` instead of a raw store error.

use crate::catalog::CATALOG_TABLE;
use crate::generic::ROWS_TABLE;
use crate::store::{SqlValue, Store};
use crate::{Result, SheetbaseError};

/// Tables that belong to sheetbase itself and never show up as user tables
pub const RESERVED_TABLES: &[&str] = &[ROWS_TABLE, CATALOG_TABLE];

/// Sorted names of all user tables
pub fn list_tables(store: &dyn Store) -> Result<Vec<String>> {
    let placeholders = vec!["?"; RESERVED_TABLES.len()].join(", ");
    let sql = format!(
        "SELECT table_name FROM information_schema.tables
         WHERE table_catalog = current_database()
           AND table_schema = current_schema()
           AND table_type = 'BASE TABLE'
           AND table_name NOT IN ({})
         ORDER BY table_name",
        placeholders
    );
    let params: Vec<SqlValue> = RESERVED_TABLES.iter().map(|t| SqlValue::from(*t)).collect();

    let rows = store.query_rows(&sql, &params, &["table_name".to_string()])?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.get("table_name").and_then(|v| v.as_str()).map(str::to_string))
        .collect())
}

/// The stored name of the user table `table_name` refers to.
///
/// Identifiers are case-insensitive in the store, so `Sales` and `sales`
/// resolve to the same table.
pub fn resolve(store: &dyn Store, table_name: &str) -> Result<Option<String>> {
    Ok(list_tables(store)?
        .into_iter()
        .find(|t| t.eq_ignore_ascii_case(table_name)))
}

/// Whether `table_name` is a user table
pub fn exists(store: &dyn Store, table_name: &str) -> Result<bool> {
    Ok(resolve(store, table_name)?.is_some())
}

/// Stored name of `table_name`, or `NotFound` unless it is a user table
pub fn require(store: &dyn Store, table_name: &str) -> Result<String> {
    resolve(store, table_name)?.ok_or_else(|| {
        SheetbaseError::NotFound(format!("table '{}' does not exist", table_name))
    })
}
