//! Relational store abstraction
//!
//! Every component talks to the database through the [`Store`] trait, which
//! offers just enough surface for dynamic DDL, parameterized DML and paged
//! reads. Values only ever reach SQL as [`SqlValue`] parameters bound to `?`
//! placeholders.
//!
//! # Example
//!
//! ```rust,ignore
//! use sheetbase::store::{DuckDBStore, SqlValue, Store};
//!
//! let store = DuckDBStore::from_connection_string("duckdb://memory")?;
//! store.execute_batch("CREATE TABLE t (name VARCHAR)")?;
//! store.execute("INSERT INTO t VALUES (?)", &[SqlValue::from("Alice")])?;
//! let total = store.query_count("SELECT COUNT(*) FROM t", &[])?;
//! ```

use crate::{Record, Result};

pub mod duckdb;

pub use self::duckdb::DuckDBStore;

/// A value bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<Option<String>> for SqlValue {
    fn from(value: Option<String>) -> Self {
        value.map(SqlValue::Text).unwrap_or(SqlValue::Null)
    }
}

/// Trait for relational stores
///
/// Implementations must accept `?` placeholders and map store failures to
/// [`SheetbaseError::StoreError`](crate::SheetbaseError::StoreError).
pub trait Store: Send {
    /// Execute a single statement and return the number of affected rows
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    /// Execute one or more parameterless statements separated by `;`
    fn execute_batch(&self, sql: &str) -> Result<()>;

    /// Run a query and return one [`Record`] per row.
    ///
    /// `columns` names the selected columns in order; the SQL must select
    /// exactly that many columns.
    fn query_rows(&self, sql: &str, params: &[SqlValue], columns: &[String]) -> Result<Vec<Record>>;

    /// Run a query whose first column of the first row is an integer count
    fn query_count(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Short name of the backend, for logs and the version endpoint
    fn backend(&self) -> &'static str;
}

/// Run `work` inside a transaction, committing on success and rolling back
/// on error.
pub fn in_transaction<T>(store: &dyn Store, work: impl FnOnce() -> Result<T>) -> Result<T> {
    store.execute_batch("BEGIN TRANSACTION")?;
    match work() {
        Ok(value) => {
            store.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = store.execute_batch("ROLLBACK") {
                tracing::warn!("Rollback failed: {}", rollback);
            }
            Err(err)
        }
    }
}
