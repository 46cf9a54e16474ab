//! Identifier rules for dynamically created tables and columns.
//!
//! Column names come from arbitrary header text and are coerced into safe
//! identifiers. Table names are chosen by the caller and are validated, never
//! rewritten.

use std::sync::LazyLock;

use regex::Regex;

use crate::{Result, SheetbaseError};

/// Prefix added to sanitized names that would otherwise start with a digit.
pub const COLUMN_PREFIX: &str = "col_";

static TABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid table name pattern"));

/// Turn arbitrary header text into an identifier matching
/// `^[A-Za-z_][A-Za-z0-9_]*$`.
///
/// Every character outside `[A-Za-z0-9_]` becomes `_`. Distinct inputs may map
/// to the same output; see [`crate::schema::resolve_columns`] for how clashes
/// are broken.
pub fn sanitize(raw: &str) -> String {
    let mut field: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if !field.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        field.insert_str(0, COLUMN_PREFIX);
    }
    field
}

/// Check a caller-supplied table name against `^[A-Za-z][A-Za-z0-9_]*$`.
pub fn validate_table_name(name: &str) -> Result<()> {
    if TABLE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(SheetbaseError::InvalidName(format!(
            "table name '{}' must start with a letter and contain only letters, digits and underscores",
            name
        )))
    }
}

/// Quote an identifier for inclusion in SQL text.
///
/// Only ever applied to names that already passed [`sanitize`] or
/// [`validate_table_name`], or that were read back from the store's catalog.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
