//! Dynamic query builder.
//!
//! Translates a page request (filters, free-text search, sort, pagination)
//! into a parameterized data query and its count query. Caller-supplied field
//! names only reach SQL text after they matched the authoritative column list;
//! values only ever travel as bound parameters.
//!
//! Two field sources are supported:
//! - [`FieldSource::Columns`]: plain columns of a dynamic table, checked
//!   against a whitelist
//! - [`FieldSource::Document`]: keys inside a JSON document column, addressed
//!   through a bound JSON path

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::naming::quote_ident;
use crate::store::{SqlValue, Store};
use crate::{Record, Result, SheetbaseError};

pub const DEFAULT_PAGE_SIZE: u64 = 10;
pub const MAX_PAGE_SIZE: u64 = 1000;

/// Sort direction, rendered from this enumeration only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// Parse `ascend`/`descend`/`asc`/`desc`, ignoring case
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ascend" | "asc" => Some(SortDirection::Asc),
            "descend" | "desc" => Some(SortDirection::Desc),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// Raw paging parameters as they arrive in a query string
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageParams {
    pub page: Option<String>,
    pub page_size: Option<String>,
    pub sort_field: Option<String>,
    pub sort_order: Option<String>,
    /// JSON object of field -> accepted values
    pub filters: Option<String>,
    /// JSON object of field -> substring
    pub search_keywords: Option<String>,
}

/// A normalized page request
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub page: u64,
    pub page_size: u64,
    pub sort_field: Option<String>,
    pub sort_direction: Option<SortDirection>,
    pub filters: BTreeMap<String, Vec<String>>,
    pub search_keywords: BTreeMap<String, String>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

impl PageRequest {
    pub fn new(page: u64, page_size: u64) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
            sort_field: None,
            sort_direction: None,
            filters: BTreeMap::new(),
            search_keywords: BTreeMap::new(),
        }
    }

    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort_field = Some(field.into());
        self.sort_direction = Some(direction);
        self
    }

    pub fn with_filter<I, S>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters
            .insert(field.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_search(mut self, field: impl Into<String>, keyword: impl Into<String>) -> Self {
        self.search_keywords.insert(field.into(), keyword.into());
        self
    }

    /// Normalize raw parameters.
    ///
    /// `page`/`pageSize` that are absent, non-numeric or below one fall back
    /// to the defaults, and `pageSize` is clamped to the configured maximum.
    /// Malformed `filters`/`searchKeywords` JSON is logged and treated as empty.
    pub fn from_params(params: &PageParams, config: &ServiceConfig) -> Self {
        let page = positive(params.page.as_deref()).unwrap_or(1);
        let page_size = positive(params.page_size.as_deref())
            .unwrap_or(config.default_page_size)
            .min(config.max_page_size.max(1));

        Self {
            page,
            page_size,
            sort_field: params
                .sort_field
                .as_deref()
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string),
            sort_direction: params.sort_order.as_deref().and_then(SortDirection::parse),
            filters: params
                .filters
                .as_deref()
                .map(parse_filters)
                .unwrap_or_default(),
            search_keywords: params
                .search_keywords
                .as_deref()
                .map(parse_search_keywords)
                .unwrap_or_default(),
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

fn positive(value: Option<&str>) -> Option<u64> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v >= 1)
}

fn parse_object(raw: &str, what: &str) -> serde_json::Map<String, serde_json::Value> {
    if raw.trim().is_empty() {
        return serde_json::Map::new();
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(other) => {
            warn!("Ignoring {}: expected a JSON object, got {}", what, other);
            serde_json::Map::new()
        }
        Err(e) => {
            warn!("Ignoring malformed {}: {}", what, e);
            serde_json::Map::new()
        }
    }
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse a `filters` JSON object. Scalars count as single-value lists, nulls
/// and nested values are skipped, fields left without values are dropped.
pub fn parse_filters(raw: &str) -> BTreeMap<String, Vec<String>> {
    parse_object(raw, "filters")
        .into_iter()
        .filter_map(|(field, value)| {
            let values: Vec<String> = match &value {
                serde_json::Value::Array(items) => items.iter().filter_map(scalar_to_string).collect(),
                other => scalar_to_string(other).into_iter().collect(),
            };
            (!values.is_empty()).then_some((field, values))
        })
        .collect()
}

/// Parse a `searchKeywords` JSON object, skipping empty keywords.
pub fn parse_search_keywords(raw: &str) -> BTreeMap<String, String> {
    parse_object(raw, "searchKeywords")
        .into_iter()
        .filter_map(|(field, value)| {
            scalar_to_string(&value)
                .filter(|k| !k.is_empty())
                .map(|k| (field, k))
        })
        .collect()
}

/// Where the builder looks up caller-supplied field names
#[derive(Debug, Clone, Copy)]
pub enum FieldSource<'a> {
    /// Plain columns; only names in the list may appear in SQL
    Columns(&'a [String]),
    /// Keys of a JSON document stored in `column`.
    ///
    /// `sort_columns` maps extra sort keys to plain columns (e.g. a row-order
    /// column that lives outside the document).
    Document {
        column: &'a str,
        sort_columns: &'a [(&'a str, &'a str)],
    },
}

/// A SQL fragment with the parameters its placeholders take
#[derive(Debug, Clone, PartialEq)]
struct Fragment {
    sql: String,
    params: Vec<SqlValue>,
}

impl FieldSource<'_> {
    fn resolve(&self, key: &str) -> Option<Fragment> {
        match self {
            FieldSource::Columns(columns) => columns.iter().find(|c| c.as_str() == key).map(|c| Fragment {
                sql: quote_ident(c),
                params: Vec::new(),
            }),
            FieldSource::Document { column, .. } => is_document_key(key).then(|| Fragment {
                sql: format!("json_extract_string({}, ?)", quote_ident(column)),
                params: vec![SqlValue::Text(format!("$.\"{}\"", key))],
            }),
        }
    }

    fn resolve_sort(&self, key: &str) -> Option<Fragment> {
        if let FieldSource::Document { sort_columns, .. } = self {
            if let Some((_, column)) = sort_columns.iter().find(|(k, _)| *k == key) {
                return Some(Fragment {
                    sql: quote_ident(column),
                    params: Vec::new(),
                });
            }
        }
        self.resolve(key)
    }
}

/// Document keys are usable unless they could break out of a quoted JSON path
fn is_document_key(key: &str) -> bool {
    !key.is_empty() && !key.chars().any(|c| c == '"' || c == '\\' || c.is_control())
}

/// A data query and its count query, ready to run
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub count_sql: String,
    pub count_params: Vec<SqlValue>,
}

impl BuiltQuery {
    /// Run the count and data queries.
    ///
    /// `columns` names the selected expressions in order.
    pub fn fetch(&self, store: &dyn Store, columns: &[String], request: &PageRequest) -> Result<PageResult> {
        let total = store
            .query_count(&self.count_sql, &self.count_params)
            .map_err(|e| SheetbaseError::QueryFailed(e.to_string()))?;
        let rows = store
            .query_rows(&self.sql, &self.params, columns)
            .map_err(|e| SheetbaseError::QueryFailed(e.to_string()))?;

        Ok(PageResult {
            rows,
            total,
            page: request.page,
            page_size: request.page_size,
        })
    }
}

/// One page of rows plus the total matching the predicates
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    pub rows: Vec<Record>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}

/// Builds the statement pair for one table
#[derive(Debug, Clone)]
pub struct QueryBuilder<'a> {
    table: &'a str,
    source: FieldSource<'a>,
    default_order: &'a str,
    conditions: Vec<Fragment>,
}

impl<'a> QueryBuilder<'a> {
    /// `default_order` is the row-order column used when no valid sort field
    /// is requested.
    pub fn new(table: &'a str, source: FieldSource<'a>, default_order: &'a str) -> Self {
        Self {
            table,
            source,
            default_order,
            conditions: Vec::new(),
        }
    }

    /// Add a fixed predicate, ANDed with everything else. `sql` must be a
    /// trusted fragment whose values are all in `params`.
    pub fn with_condition(mut self, sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        self.conditions.push(Fragment {
            sql: sql.into(),
            params,
        });
        self
    }

    /// Build the data query selecting `select` and the matching count query.
    pub fn build(&self, select: &str, request: &PageRequest) -> BuiltQuery {
        let mut predicates: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        for condition in &self.conditions {
            predicates.push(condition.sql.clone());
            params.extend(condition.params.iter().cloned());
        }

        for (field, values) in &request.filters {
            if values.is_empty() {
                continue;
            }
            let Some(target) = self.source.resolve(field) else {
                debug!("Dropping filter on unknown field '{}'", field);
                continue;
            };
            let placeholders = vec!["?"; values.len()].join(", ");
            predicates.push(format!("{} IN ({})", target.sql, placeholders));
            params.extend(target.params);
            params.extend(values.iter().map(|v| SqlValue::Text(v.clone())));
        }

        let mut searches: Vec<String> = Vec::new();
        for (field, keyword) in &request.search_keywords {
            if keyword.is_empty() {
                continue;
            }
            let Some(target) = self.source.resolve(field) else {
                debug!("Dropping search on unknown field '{}'", field);
                continue;
            };
            searches.push(format!("{} ILIKE ?", target.sql));
            params.extend(target.params);
            params.push(SqlValue::Text(format!("%{}%", keyword)));
        }
        if !searches.is_empty() {
            predicates.push(format!("({})", searches.join(" OR ")));
        }

        let where_clause = if predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", predicates.join(" AND "))
        };

        let table = quote_ident(self.table);
        let count_sql = format!("SELECT COUNT(*) FROM {}{}", table, where_clause);
        let count_params = params.clone();

        let sort = request
            .sort_field
            .as_deref()
            .and_then(|field| self.source.resolve_sort(field));
        let order_clause = match sort {
            Some(target) => {
                params.extend(target.params);
                format!(
                    "ORDER BY {} {}",
                    target.sql,
                    request.sort_direction.unwrap_or_default().as_sql()
                )
            }
            None => format!("ORDER BY {} ASC", quote_ident(self.default_order)),
        };

        params.push(SqlValue::Int(clamp_i64(request.page_size)));
        params.push(SqlValue::Int(clamp_i64(request.offset())));

        let sql = format!(
            "SELECT {} FROM {}{} {} LIMIT ? OFFSET ?",
            select, table, where_clause, order_clause
        );

        BuiltQuery {
            sql,
            params,
            count_sql,
            count_params,
        }
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DuckDBStore;
    use proptest::prelude::*;

    fn whitelist() -> Vec<String> {
        vec!["status".to_string(), "name".to_string()]
    }

    fn params(pairs: &[(&str, &str)]) -> PageParams {
        let mut params = PageParams::default();
        for (key, value) in pairs {
            let value = Some(value.to_string());
            match *key {
                "page" => params.page = value,
                "pageSize" => params.page_size = value,
                "sortField" => params.sort_field = value,
                "sortOrder" => params.sort_order = value,
                "filters" => params.filters = value,
                "searchKeywords" => params.search_keywords = value,
                _ => unreachable!(),
            }
        }
        params
    }

    fn placeholder_count(sql: &str) -> usize {
        sql.matches('?').count()
    }

    #[test]
    fn test_sort_direction_parse() {
        assert_eq!(SortDirection::parse("ascend"), Some(SortDirection::Asc));
        assert_eq!(SortDirection::parse("DESCEND"), Some(SortDirection::Desc));
        assert_eq!(SortDirection::parse("desc"), Some(SortDirection::Desc));
        assert_eq!(SortDirection::parse("DESC; DROP TABLE x"), None);
    }

    #[test]
    fn test_page_coercion() {
        let config = ServiceConfig::default();
        let request = PageRequest::from_params(&params(&[("page", "abc"), ("pageSize", "-3")]), &config);
        assert_eq!((request.page, request.page_size), (1, 10));

        let request = PageRequest::from_params(&params(&[("page", "3"), ("pageSize", "25")]), &config);
        assert_eq!((request.page, request.page_size), (3, 25));
        assert_eq!(request.offset(), 50);

        let request = PageRequest::from_params(&params(&[("pageSize", "100000")]), &config);
        assert_eq!(request.page_size, MAX_PAGE_SIZE);

        let request = PageRequest::from_params(&params(&[("page", "0")]), &config);
        assert_eq!(request.page, 1);
    }

    #[test]
    fn test_malformed_json_is_ignored() {
        let request = PageRequest::from_params(
            &params(&[("filters", "{not json"), ("searchKeywords", "[1, 2]")]),
            &ServiceConfig::default(),
        );
        assert!(request.filters.is_empty());
        assert!(request.search_keywords.is_empty());
    }

    #[test]
    fn test_parse_filters_normalizes_values() {
        let filters = parse_filters(r#"{"status": ["A", 2, null, true], "name": "x", "empty": [], "nested": {"a": 1}}"#);
        assert_eq!(filters.get("status").unwrap(), &vec!["A", "2", "true"]);
        assert_eq!(filters.get("name").unwrap(), &vec!["x"]);
        assert!(!filters.contains_key("empty"));
        assert!(!filters.contains_key("nested"));
    }

    #[test]
    fn test_parse_search_keywords_skips_empty() {
        let keywords = parse_search_keywords(r#"{"name": "oo", "status": "", "n": 5}"#);
        assert_eq!(keywords.get("name").map(String::as_str), Some("oo"));
        assert_eq!(keywords.get("n").map(String::as_str), Some("5"));
        assert!(!keywords.contains_key("status"));
    }

    #[test]
    fn test_build_default_query() {
        let columns = whitelist();
        let builder = QueryBuilder::new("people", FieldSource::Columns(&columns), "id");
        let built = builder.build("*", &PageRequest::default());

        assert_eq!(
            built.sql,
            r#"SELECT * FROM "people" ORDER BY "id" ASC LIMIT ? OFFSET ?"#
        );
        assert_eq!(built.params, vec![SqlValue::Int(10), SqlValue::Int(0)]);
        assert_eq!(built.count_sql, r#"SELECT COUNT(*) FROM "people""#);
        assert!(built.count_params.is_empty());
    }

    #[test]
    fn test_build_filters_and_search() {
        let columns = whitelist();
        let builder = QueryBuilder::new("people", FieldSource::Columns(&columns), "id");
        let request = PageRequest::new(2, 5)
            .with_filter("status", ["A", "B"])
            .with_search("name", "oo")
            .with_search("status", "x")
            .with_sort("name", SortDirection::Desc);
        let built = builder.build("*", &request);

        assert_eq!(
            built.sql,
            r#"SELECT * FROM "people" WHERE "status" IN (?, ?) AND ("name" ILIKE ? OR "status" ILIKE ?) ORDER BY "name" DESC LIMIT ? OFFSET ?"#
        );
        assert_eq!(
            built.params,
            vec![
                SqlValue::from("A"),
                SqlValue::from("B"),
                SqlValue::from("%oo%"),
                SqlValue::from("%x%"),
                SqlValue::Int(5),
                SqlValue::Int(5),
            ]
        );
        assert_eq!(built.count_params.len(), 4);
    }

    #[test]
    fn test_unknown_fields_are_dropped() {
        let columns = whitelist();
        let builder = QueryBuilder::new("people", FieldSource::Columns(&columns), "id");
        let request = PageRequest::default()
            .with_filter("\"; DROP TABLE people; --", ["x"])
            .with_search("password", "x")
            .with_sort("secret", SortDirection::Desc);
        let built = builder.build("*", &request);

        assert!(!built.sql.contains("DROP"));
        assert!(!built.sql.contains("password"));
        assert!(!built.sql.contains("secret"));
        assert!(built.sql.contains(r#"ORDER BY "id" ASC"#));
    }

    #[test]
    fn test_sort_without_direction_is_ascending() {
        let columns = whitelist();
        let builder = QueryBuilder::new("people", FieldSource::Columns(&columns), "id");
        let request = PageRequest::from_params(
            &params(&[("sortField", "name"), ("sortOrder", "sideways")]),
            &ServiceConfig::default(),
        );
        let built = builder.build("*", &request);
        assert!(built.sql.contains(r#"ORDER BY "name" ASC"#));
    }

    #[test]
    fn test_document_source_binds_paths() {
        let sort_columns = [("rowIndex", "row_index")];
        let builder = QueryBuilder::new(
            "upload_rows",
            FieldSource::Document {
                column: "data",
                sort_columns: &sort_columns,
            },
            "row_index",
        )
        .with_condition("file_name = ?", vec![SqlValue::from("a.xlsx")]);

        let request = PageRequest::default()
            .with_filter("Net Sales", ["1200"])
            .with_filter("bad\"key", ["x"])
            .with_search("Region", "eu")
            .with_sort("rowIndex", SortDirection::Desc);
        let built = builder.build("*", &request);

        assert_eq!(
            built.sql,
            r#"SELECT * FROM "upload_rows" WHERE file_name = ? AND json_extract_string("data", ?) IN (?) AND (json_extract_string("data", ?) ILIKE ?) ORDER BY "row_index" DESC LIMIT ? OFFSET ?"#
        );
        assert_eq!(built.params[1], SqlValue::from("$.\"Net Sales\""));
        assert_eq!(built.params[3], SqlValue::from("$.\"Region\""));
        assert_eq!(placeholder_count(&built.sql), built.params.len());
        assert_eq!(placeholder_count(&built.count_sql), built.count_params.len());
    }

    #[test]
    fn test_fetch_filter_and_search_semantics() {
        let store = DuckDBStore::from_connection_string("duckdb://memory").unwrap();
        store
            .execute_batch(
                "CREATE TABLE people (id BIGINT, status VARCHAR, name VARCHAR);
                 INSERT INTO people VALUES (1, 'A', 'foo'), (2, 'C', 'foo'), (3, 'B', 'bar');",
            )
            .unwrap();
        let columns = whitelist();
        let builder = QueryBuilder::new("people", FieldSource::Columns(&columns), "id");
        let select_columns = vec!["id".to_string()];

        let ids = |request: &PageRequest| -> Vec<i64> {
            builder
                .build("id", request)
                .fetch(&store, &select_columns, request)
                .unwrap()
                .rows
                .iter()
                .map(|r| r["id"].as_i64().unwrap())
                .collect()
        };

        // OR within a field
        assert_eq!(ids(&PageRequest::default().with_filter("status", ["A", "B"])), vec![1, 3]);
        // Filters and search groups are ANDed
        let combined = PageRequest::default()
            .with_filter("status", ["A", "B"])
            .with_search("name", "OO");
        assert_eq!(ids(&combined), vec![1]);
        // Search terms are ORed across fields
        let either = PageRequest::default()
            .with_search("name", "ar")
            .with_search("status", "c");
        assert_eq!(ids(&either), vec![2, 3]);
    }

    #[test]
    fn test_fetch_reports_query_failed() {
        let store = DuckDBStore::from_connection_string("duckdb://memory").unwrap();
        let columns = whitelist();
        let builder = QueryBuilder::new("missing", FieldSource::Columns(&columns), "id");
        let request = PageRequest::default();
        let result = builder.build("*", &request).fetch(&store, &columns, &request);
        assert!(matches!(result, Err(SheetbaseError::QueryFailed(_))));
    }

    proptest! {
        #[test]
        fn prop_unlisted_keys_never_reach_sql(
            keys in proptest::collection::vec("zz[a-z\"; ()-]{1,12}", 1..6),
            values in proptest::collection::vec("v[0-9]{4}q", 1..4),
        ) {
            let columns = whitelist();
            let builder = QueryBuilder::new("people", FieldSource::Columns(&columns), "id");
            let mut request = PageRequest::default().with_sort(keys[0].clone(), SortDirection::Desc);
            for key in &keys {
                request = request
                    .with_filter(key.clone(), values.clone())
                    .with_search(key.clone(), values[0].clone());
            }
            request = request.with_filter("status", values.clone());

            let built = builder.build("*", &request);
            for key in &keys {
                prop_assert!(!built.sql.contains(key.as_str()));
                prop_assert!(!built.count_sql.contains(key.as_str()));
            }
            for value in &values {
                prop_assert!(!built.sql.contains(value.as_str()));
            }
            prop_assert_eq!(placeholder_count(&built.sql), built.params.len());
            prop_assert_eq!(placeholder_count(&built.count_sql), built.count_params.len());
        }
    }
}
