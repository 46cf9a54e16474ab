//! DuckDB store implementation
//!
//! Wraps a single DuckDB connection. DuckDB connections are not `Sync`, so the
//! server shares a store behind a mutex.

use ::duckdb::types::{TimeUnit, Value};
use ::duckdb::{params_from_iter, Connection};

use super::{SqlValue, Store};
use crate::{Record, Result, SheetbaseError};

/// DuckDB-backed [`Store`]
pub struct DuckDBStore {
    conn: Connection,
}

impl DuckDBStore {
    /// Open a store from a connection string.
    ///
    /// Supported forms:
    /// - `duckdb://memory` - in-memory database
    /// - `duckdb://<path>` - database file at `path`, created if missing
    pub fn from_connection_string(uri: &str) -> Result<Self> {
        let target = uri.strip_prefix("duckdb://").ok_or_else(|| {
            SheetbaseError::StoreError(format!("Unsupported connection string: {}", uri))
        })?;

        let conn = match target {
            "memory" | ":memory:" | "" => Connection::open_in_memory()?,
            path => Connection::open(path)?,
        };

        Ok(Self { conn })
    }
}

impl Store for DuckDBStore {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        tracing::debug!("execute: {}", sql);
        let changed = self.conn.execute(sql, params_from_iter(bind(params)))?;
        Ok(changed)
    }

    fn execute_batch(&self, sql: &str) -> Result<()> {
        tracing::debug!("execute_batch: {}", sql);
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn query_rows(&self, sql: &str, params: &[SqlValue], columns: &[String]) -> Result<Vec<Record>> {
        tracing::debug!("query: {}", sql);
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(bind(params)), |row| {
            let mut record = Record::new();
            for (idx, name) in columns.iter().enumerate() {
                let value: Value = row.get(idx)?;
                record.insert(name.clone(), value_to_json(value));
            }
            Ok(record)
        })?;

        let records = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn query_count(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        tracing::debug!("count: {}", sql);
        let count: i64 = self
            .conn
            .query_row(sql, params_from_iter(bind(params)), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn backend(&self) -> &'static str {
        "duckdb"
    }
}

fn bind(params: &[SqlValue]) -> Vec<Value> {
    params
        .iter()
        .map(|param| match param {
            SqlValue::Null => Value::Null,
            SqlValue::Bool(b) => Value::Boolean(*b),
            SqlValue::Int(i) => Value::BigInt(*i),
            SqlValue::Text(s) => Value::Text(s.clone()),
        })
        .collect()
}

/// Convert a DuckDB value to JSON
fn value_to_json(value: Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => Json::Bool(b),
        Value::TinyInt(v) => Json::Number(v.into()),
        Value::SmallInt(v) => Json::Number(v.into()),
        Value::Int(v) => Json::Number(v.into()),
        Value::BigInt(v) => Json::Number(v.into()),
        Value::UTinyInt(v) => Json::Number(v.into()),
        Value::USmallInt(v) => Json::Number(v.into()),
        Value::UInt(v) => Json::Number(v.into()),
        Value::UBigInt(v) => Json::Number(v.into()),
        Value::HugeInt(v) => Json::String(v.to_string()),
        Value::Float(v) => serde_json::Number::from_f64(v as f64)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Double(v) => serde_json::Number::from_f64(v)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Text(s) => Json::String(s),
        Value::Timestamp(unit, v) => {
            let micros = match unit {
                TimeUnit::Second => v.saturating_mul(1_000_000),
                TimeUnit::Millisecond => v.saturating_mul(1_000),
                TimeUnit::Microsecond => v,
                TimeUnit::Nanosecond => v / 1_000,
            };
            let dt = chrono::DateTime::from_timestamp_micros(micros).unwrap_or_default();
            Json::String(dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        }
        Value::Date32(days) => {
            let date = chrono::DateTime::from_timestamp(i64::from(days) * 86_400, 0)
                .unwrap_or_default()
                .date_naive();
            Json::String(date.format("%Y-%m-%d").to_string())
        }
        other => {
            tracing::debug!("Converting unsupported DuckDB type to string: {:?}", other);
            Json::String(format!("{:?}", other))
        }
    }
}
