/*!
# sheetbase

Makes uploaded tabular data queryable through a uniform data API.

Rows parsed from a spreadsheet upload land either in a table provisioned at
runtime from the upload's own headers, or in a generic document store keyed by
file name. Reads go through a query builder that only ever emits identifiers
drawn from the table's physical column list and binds every caller value as a
parameter.

## Architecture

```text
upload rows + columns
   ├─ schema::provision   (validate name, resolve fields, CREATE TABLE, record headers)
   ├─ ingest::BulkIngestor (batched INSERTs into the table or the generic store)
   └─ registry / query     (existence guard, whitelisted paged SELECT + COUNT)
```

All SQL runs through the [`store::Store`] trait; [`store::DuckDBStore`] is the
bundled implementation.

## Example

```rust,ignore
use sheetbase::service::DataService;
use sheetbase::store::DuckDBStore;

let store = DuckDBStore::from_connection_string("duckdb://memory")?;
let service = DataService::new(Box::new(store), Default::default())?;
let tables = service.list_tables()?;
```
*/

pub mod catalog;
pub mod config;
pub mod generic;
pub mod ingest;
pub mod naming;
pub mod query;
pub mod registry;
pub mod schema;
pub mod service;
pub mod store;

pub use config::ServiceConfig;
pub use naming::{sanitize, validate_table_name};
pub use query::{PageRequest, PageResult, SortDirection};
pub use schema::{ColumnDescriptor, ColumnSpec, TableDescriptor};
pub use service::DataService;
pub use store::{SqlValue, Store};

/// Version of the crate, reported by the binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A single result row, keyed by column name.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Main error type for sheetbase
#[derive(thiserror::Error, Debug)]
pub enum SheetbaseError {
    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Table '{0}' is locked and cannot be modified")]
    TableLocked(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to provision table '{table}': {cause}")]
    ProvisionFailed { table: String, cause: String },

    #[error("Failed to ingest rows into '{target}' after {inserted} rows: {cause}")]
    IngestFailed {
        target: String,
        inserted: usize,
        cause: String,
    },

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Store error: {0}")]
    StoreError(String),
}

impl From<duckdb::Error> for SheetbaseError {
    fn from(err: duckdb::Error) -> Self {
        SheetbaseError::StoreError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SheetbaseError>;
