//! Shared types for the Krapi data-access core.
//!
//! This crate provides the value, row and result types that flow between the
//! router, the operation queue and the database pool, plus the coarse error
//! classification the API layer uses to pick a response. No crate in the
//! workspace depends on anything *except* `krapi-types` for cross-cutting
//! type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A single result row: column name to decoded value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A positional parameter value as supplied by callers of the core.
///
/// The embedded engine binds only scalars, blobs and null. Structured values
/// are carried as [`SqlValue::Json`] and encoded to text before binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// Boolean, stored as `0`/`1`.
    Bool(bool),
    /// 64-bit signed integer.
    Integer(i64),
    /// Double precision float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
    /// A point in time, stored as an ISO-8601 string.
    Timestamp(DateTime<Utc>),
    /// A list or map, stored as canonical JSON text.
    Json(serde_json::Value),
}

impl SqlValue {
    /// Returns the text payload if this value is [`SqlValue::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns `true` for lists and maps.
    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            Self::Json(serde_json::Value::Array(_)) | Self::Json(serde_json::Value::Object(_))
        )
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Real(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Self::Text(s),
            other => Self::Json(other),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// The outcome of a single statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Result rows. Empty for statements that do not return rows.
    pub rows: Vec<Row>,
    /// Number of rows returned (reads) or affected (writes).
    pub row_count: usize,
    /// Row id of the last inserted row, for inserts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
}

impl QueryResult {
    /// Builds a result for a statement that returned rows.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let row_count = rows.len();
        Self {
            rows,
            row_count,
            last_insert_id: None,
        }
    }

    /// Builds a result for a statement that modified rows.
    pub fn affected(row_count: usize, last_insert_id: Option<i64>) -> Self {
        Self {
            rows: Vec::new(),
            row_count,
            last_insert_id,
        }
    }
}

/// Which physical database a statement targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// The platform-wide main database.
    Main,
    /// A per-tenant database.
    Tenant,
}

impl Target {
    /// Returns the string label for this target.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Tenant => "tenant",
        }
    }
}

/// How the API layer should surface an error to its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The system is overloaded; the caller may retry later.
    RetryLater,
    /// The request itself is wrong; retrying will not help.
    ClientFault,
    /// Something failed on our side.
    ServerFault,
}
