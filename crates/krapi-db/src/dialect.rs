//! Positional-to-ordinal placeholder translation and value coding.
//!
//! Callers write statements with numbered placeholders (`$1`, `$2`, ...).
//! SQLite binds `?` placeholders strictly by position, so every `$n`
//! occurrence becomes a `?` and the parameter list is rebuilt in occurrence
//! order. A clause such as `ON CONFLICT DO UPDATE SET data = $2` that repeats
//! an index gets the value bound once per occurrence.
//!
//! Values are encoded into the engine's scalar types on the way in, and the
//! structured-column allow-list is decoded back to JSON on the way out.

use base64::Engine as _;
use krapi_types::SqlValue;
use rusqlite::types::{Value, ValueRef};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::sql::{Lexer, TokenKind};

/// Columns whose text content is speculatively decoded as JSON on read.
pub const STRUCTURED_COLUMNS: &[&str] = &[
    "permissions",
    "metadata",
    "settings",
    "payload",
    "schema",
    "config",
    "options",
    "scopes",
    "allowed_scopes",
];

/// Placeholder/parameter disagreement detected before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialectError {
    /// A placeholder references an index beyond the supplied parameters.
    #[error("placeholder ${index} references a parameter that was not supplied ({supplied} given)")]
    IndexOutOfRange {
        /// The offending placeholder index.
        index: usize,
        /// Number of parameters supplied.
        supplied: usize,
    },

    /// `$0`, or an index too large to represent.
    #[error("invalid placeholder index: ${0}")]
    InvalidIndex(String),

    /// The parameter count differs from the number of distinct placeholders.
    #[error("statement references {referenced} distinct parameters but {supplied} were supplied")]
    CountMismatch {
        /// Distinct placeholder indices referenced.
        referenced: usize,
        /// Number of parameters supplied.
        supplied: usize,
    },
}

/// A statement rewritten for SQLite, with parameters ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub struct Translated {
    /// Statement text with `?` placeholders.
    pub sql: String,
    /// One bound value per `?`, in text order.
    pub params: Vec<Value>,
}

/// Rewrites `$n` placeholders to `?` and expands the parameter list to one
/// value per occurrence.
///
/// # Errors
///
/// Returns `DialectError` when a placeholder references a missing parameter,
/// when `$0` is used, or when a statement without repeated placeholders is
/// given a different number of parameters than it references.
pub fn translate(sql: &str, params: &[SqlValue]) -> Result<Translated, DialectError> {
    let mut out = String::with_capacity(sql.len());
    let mut occurrences = Vec::new();
    let mut last = 0;

    for token in Lexer::new(sql) {
        let TokenKind::Placeholder(index) = token.kind else {
            continue;
        };
        let index = match index {
            Some(i) if i > 0 => i,
            _ => {
                return Err(DialectError::InvalidIndex(
                    sql[token.span.start + 1..token.span.end].to_string(),
                ))
            }
        };
        if index > params.len() {
            return Err(DialectError::IndexOutOfRange {
                index,
                supplied: params.len(),
            });
        }
        out.push_str(&sql[last..token.span.start]);
        out.push('?');
        last = token.span.end;
        occurrences.push(index);
    }
    out.push_str(&sql[last..]);

    let distinct: BTreeSet<usize> = occurrences.iter().copied().collect();
    let has_repeats = distinct.len() != occurrences.len();
    if !has_repeats && distinct.len() != params.len() {
        return Err(DialectError::CountMismatch {
            referenced: distinct.len(),
            supplied: params.len(),
        });
    }

    let params = occurrences
        .iter()
        .map(|&index| encode_value(&params[index - 1]))
        .collect();

    Ok(Translated { sql: out, params })
}

/// Encodes a caller value into a type SQLite can bind.
pub fn encode_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(f) => Value::Real(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Blob(b) => Value::Blob(b.clone()),
        SqlValue::Timestamp(ts) => Value::Text(ts.to_rfc3339()),
        SqlValue::Json(json) => match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Integer(i64::from(*b)),
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        },
    }
}

/// Returns `true` if `column` is on the structured allow-list.
pub fn is_structured_column(column: &str) -> bool {
    STRUCTURED_COLUMNS
        .iter()
        .any(|c| c.eq_ignore_ascii_case(column))
}

/// Decodes a column value read from SQLite into JSON.
///
/// Text in a structured column is parsed as JSON when it holds an array or
/// object; anything else is returned as the raw string. Blobs are rendered as
/// base64 text.
pub fn decode_column(column: &str, value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            if is_structured_column(column) {
                if let Ok(parsed @ (serde_json::Value::Array(_) | serde_json::Value::Object(_))) =
                    serde_json::from_str::<serde_json::Value>(&text)
                {
                    return parsed;
                }
            }
            serde_json::Value::String(text.into_owned())
        }
        ValueRef::Blob(bytes) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn text(s: &str) -> SqlValue {
        SqlValue::Text(s.to_string())
    }

    #[test]
    fn rewrites_placeholders_in_order() {
        let t = translate(
            "UPDATE documents SET data = $2 WHERE id = $1",
            &[text("doc-1"), text("{}")],
        )
        .expect("should translate");
        assert_eq!(t.sql, "UPDATE documents SET data = ? WHERE id = ?");
        assert_eq!(
            t.params,
            vec![Value::Text("{}".into()), Value::Text("doc-1".into())]
        );
    }

    #[test]
    fn repeated_placeholder_binds_once_per_occurrence() {
        let sql = "INSERT INTO documents (id, data) VALUES ($1, $2) \
                   ON CONFLICT(id) DO UPDATE SET data = $2, updated_at = $3";
        let t = translate(sql, &[text("a"), text("b"), text("c")]).expect("should translate");

        assert_eq!(t.sql.matches('?').count(), 4);
        assert_eq!(t.params.len(), 4, "one value per occurrence");
        assert_eq!(
            t.params,
            vec![
                Value::Text("a".into()),
                Value::Text("b".into()),
                Value::Text("b".into()),
                Value::Text("c".into()),
            ]
        );
    }

    #[test]
    fn index_beyond_supplied_params_is_rejected() {
        let err = translate("SELECT * FROM t WHERE a = $1 AND b = $3", &[text("x"), text("y")])
            .expect_err("should reject");
        assert_eq!(
            err,
            DialectError::IndexOutOfRange {
                index: 3,
                supplied: 2
            }
        );
    }

    #[test]
    fn extra_params_without_repeats_are_rejected() {
        let err =
            translate("SELECT * FROM t WHERE a = $1", &[text("x"), text("y")]).expect_err("reject");
        assert_eq!(
            err,
            DialectError::CountMismatch {
                referenced: 1,
                supplied: 2
            }
        );

        let err = translate("SELECT 1", &[text("x")]).expect_err("reject");
        assert!(matches!(err, DialectError::CountMismatch { referenced: 0, .. }));
    }

    #[test]
    fn zero_index_is_invalid() {
        let err = translate("SELECT $0", &[text("x")]).expect_err("reject");
        assert_eq!(err, DialectError::InvalidIndex("0".into()));
    }

    #[test]
    fn placeholders_in_literals_are_left_alone() {
        let t = translate("SELECT '$1' AS lit, $1 AS val", &[SqlValue::Integer(5)])
            .expect("should translate");
        assert_eq!(t.sql, "SELECT '$1' AS lit, ? AS val");
        assert_eq!(t.params, vec![Value::Integer(5)]);
    }

    #[test]
    fn encodes_structured_bool_and_timestamp_values() {
        assert_eq!(
            encode_value(&SqlValue::Json(json!({"read": true}))),
            Value::Text(r#"{"read":true}"#.into())
        );
        assert_eq!(
            encode_value(&SqlValue::Json(json!([1, 2]))),
            Value::Text("[1,2]".into())
        );
        assert_eq!(encode_value(&SqlValue::Bool(true)), Value::Integer(1));
        assert_eq!(encode_value(&SqlValue::Bool(false)), Value::Integer(0));

        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("valid date");
        assert_eq!(
            encode_value(&SqlValue::Timestamp(ts)),
            Value::Text("2024-03-01T12:00:00+00:00".into())
        );
    }

    #[test]
    fn structured_columns_decode_json_and_fall_back_to_text() {
        let decoded = decode_column("metadata", ValueRef::Text(br#"{"a":[1,2]}"#));
        assert_eq!(decoded, json!({"a": [1, 2]}));

        let decoded = decode_column("settings", ValueRef::Text(b"not json"));
        assert_eq!(decoded, json!("not json"));

        // A bare scalar stays a string even in a structured column.
        let decoded = decode_column("config", ValueRef::Text(b"42"));
        assert_eq!(decoded, json!("42"));

        // Columns off the allow-list are never parsed.
        let decoded = decode_column("title", ValueRef::Text(br#"{"a":1}"#));
        assert_eq!(decoded, json!(r#"{"a":1}"#));
    }

    #[test]
    fn blobs_decode_as_base64() {
        let decoded = decode_column("content", ValueRef::Blob(&[0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(decoded, json!("3q2+7w=="));
    }
}
