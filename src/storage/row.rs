// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row representation and typed accessors shared by every table.
//!
//! Rows cross the store boundary as JSON maps so generic callers (the cache
//! tables, the reconciler) can read any table without per-table structs.

use serde_json::{Map, Value};
use thiserror::Error;

/// One row as column name → value.
pub type Row = Map<String, Value>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("Row for table '{table}' is missing unique key '{key}'")]
    MissingKey { table: String, key: String },
    #[error("Failed to decode column '{column}': {reason}")]
    Decode { column: String, reason: String },
}

/// Accept only plain SQL identifiers for table and column names.
///
/// Table and column names are spliced into SQL text, so everything that is
/// not `[A-Za-z_][A-Za-z0-9_]*` is refused.
pub fn check_identifier(name: &str) -> Result<&str, StorageError> {
    let mut chars = name.chars();
    let valid_head = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if valid_head && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

/// Typed column access on a [`Row`].
pub trait RowExt {
    fn i64_col(&self, column: &str) -> Result<i64, StorageError>;
    fn opt_i64_col(&self, column: &str) -> Result<Option<i64>, StorageError>;
    fn f64_col(&self, column: &str) -> Result<f64, StorageError>;
    fn str_col(&self, column: &str) -> Result<String, StorageError>;
    fn opt_str_col(&self, column: &str) -> Result<Option<String>, StorageError>;
    fn bool_col(&self, column: &str) -> Result<bool, StorageError>;
}

fn decode_err(column: &str, reason: &str) -> StorageError {
    StorageError::Decode {
        column: column.to_string(),
        reason: reason.to_string(),
    }
}

impl RowExt for Row {
    fn i64_col(&self, column: &str) -> Result<i64, StorageError> {
        self.opt_i64_col(column)?
            .ok_or_else(|| decode_err(column, "unexpected NULL"))
    }

    fn opt_i64_col(&self, column: &str) -> Result<Option<i64>, StorageError> {
        match self.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| decode_err(column, "not an integer")),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| decode_err(column, "not an integer")),
            Some(_) => Err(decode_err(column, "not an integer")),
        }
    }

    fn f64_col(&self, column: &str) -> Result<f64, StorageError> {
        match self.get(column) {
            Some(Value::Number(n)) => n.as_f64().ok_or_else(|| decode_err(column, "not a number")),
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| decode_err(column, "not a number")),
            _ => Err(decode_err(column, "not a number")),
        }
    }

    fn str_col(&self, column: &str) -> Result<String, StorageError> {
        self.opt_str_col(column)?
            .ok_or_else(|| decode_err(column, "unexpected NULL"))
    }

    fn opt_str_col(&self, column: &str) -> Result<Option<String>, StorageError> {
        match self.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Ok(Some(other.to_string())),
        }
    }

    fn bool_col(&self, column: &str) -> Result<bool, StorageError> {
        match self.get(column) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::Number(n)) => Ok(n.as_i64().unwrap_or(0) != 0),
            _ => Err(decode_err(column, "not a boolean")),
        }
    }
}

/// Read an integer id from a remote JSON object.
///
/// The commerce backend renders numeric ids as strings (`"12"`), cached
/// copies may carry them as numbers; both are accepted.
pub fn json_id(value: &Value, field: &str) -> Option<i64> {
    match value.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_identifier_validation() {
        assert!(check_identifier("cart_items").is_ok());
        assert!(check_identifier("_x1").is_ok());
        assert!(check_identifier("1carts").is_err());
        assert!(check_identifier("carts; DROP TABLE carts").is_err());
        assert!(check_identifier("").is_err());
    }

    #[test]
    fn test_typed_accessors() {
        let r = row(json!({
            "id": 7, "price": 1.5, "name": "x", "dirty": 1, "gone": null, "numeric_text": "42"
        }));
        assert_eq!(r.i64_col("id").unwrap(), 7);
        assert_eq!(r.i64_col("numeric_text").unwrap(), 42);
        assert_eq!(r.f64_col("price").unwrap(), 1.5);
        assert_eq!(r.str_col("name").unwrap(), "x");
        assert!(r.bool_col("dirty").unwrap());
        assert_eq!(r.opt_i64_col("gone").unwrap(), None);
        assert!(r.i64_col("gone").is_err());
        assert!(r.i64_col("name").is_err());
    }

    #[test]
    fn test_json_id_accepts_string_and_number() {
        assert_eq!(json_id(&json!({"id": "12"}), "id"), Some(12));
        assert_eq!(json_id(&json!({"id": 12}), "id"), Some(12));
        assert_eq!(json_id(&json!({"id": "abc"}), "id"), None);
        assert_eq!(json_id(&json!({}), "id"), None);
    }
}
