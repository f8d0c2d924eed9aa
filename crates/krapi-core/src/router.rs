//! Statement routing between the main database and tenant databases.
//!
//! Routing is table-name based pattern matching over the lexed statement,
//! not a parser. Callers that know the tenant should use
//! [`DataCore::query_tenant`](crate::DataCore::query_tenant) instead of
//! relying on inference.

use krapi_db::sql::{Lexer, Token, TokenKind};
use krapi_types::{SqlValue, Target};
use thiserror::Error;

/// Tables that live in tenant databases.
pub const TENANT_TABLES: &[&str] = &[
    "collections",
    "documents",
    "files",
    "project_users",
    "changelog",
    "folders",
    "file_permissions",
    "file_versions",
];

/// A tenant id taken from a `tenant_id = $n` predicate must be longer than
/// this many characters.
pub const MIN_PREDICATE_TENANT_LEN: usize = 10;

/// Keywords whose next identifier names a table.
const TABLE_CLAUSES: &[&str] = &["FROM", "INTO", "UPDATE", "JOIN"];

/// Errors raised while routing a statement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// The statement targets tenant tables but no tenant could be inferred.
    #[error("cannot infer the tenant for a tenant-scoped statement; use query_tenant")]
    Ambiguous {
        /// The tenant tables the statement references.
        tables: Vec<String>,
    },
}

/// Returns `true` if `table` is a tenant-owned table (case-insensitive).
pub fn is_tenant_table(table: &str) -> bool {
    TENANT_TABLES.iter().any(|t| t.eq_ignore_ascii_case(table))
}

/// Table names referenced after `FROM`, `INTO`, `UPDATE` or `JOIN`.
///
/// Schema-qualified names yield their final segment. `UPDATE OR <action>`
/// is skipped over. A `FROM` list is followed across commas, with or
/// without aliases, so `FROM a x, b y` yields both `a` and `b`.
pub fn referenced_tables(sql: &str) -> Vec<&str> {
    let tokens: Vec<Token<'_>> = Lexer::new(sql).collect();
    let mut tables = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        let is_clause = TABLE_CLAUSES.iter().any(|kw| tokens[i].is_keyword(kw));
        let is_from = tokens[i].is_keyword("FROM");
        i += 1;
        if !is_clause {
            continue;
        }

        if tokens[i - 1].is_keyword("UPDATE") && tokens.get(i).is_some_and(|t| t.is_keyword("OR")) {
            i += 2;
        }

        while let Some((name, next)) = table_name_at(&tokens, i) {
            tables.push(name);
            i = next;
            if !is_from {
                break;
            }
            match list_continuation(&tokens, i) {
                Some(after_comma) => i = after_comma,
                None => break,
            }
        }
    }
    tables
}

/// Reads a possibly schema-qualified table name starting at `i`. Returns
/// the last segment and the index just past the name.
fn table_name_at<'a>(tokens: &[Token<'a>], mut i: usize) -> Option<(&'a str, usize)> {
    let TokenKind::Word(mut name) = tokens.get(i)?.kind else {
        return None;
    };
    while let (Some(dot), Some(next)) = (tokens.get(i + 1), tokens.get(i + 2)) {
        match (dot.kind, next.kind) {
            (TokenKind::Symbol('.'), TokenKind::Word(segment)) => {
                name = segment;
                i += 2;
            }
            _ => break,
        }
    }
    Some((name, i + 1))
}

/// If a `FROM` list continues at `i` (`[AS] [alias] ,`), returns the index
/// of the next table name.
fn list_continuation(tokens: &[Token<'_>], mut i: usize) -> Option<usize> {
    if tokens.get(i).is_some_and(|t| t.is_keyword("AS")) {
        i += 1;
    }
    if matches!(tokens.get(i).map(|t| t.kind), Some(TokenKind::Word(_))) {
        i += 1;
    }
    (tokens.get(i)?.kind == TokenKind::Symbol(',')).then_some(i + 1)
}

/// Classifies a statement as targeting the main or a tenant database.
pub fn classify(sql: &str) -> Target {
    if referenced_tables(sql).into_iter().any(is_tenant_table) {
        Target::Tenant
    } else {
        Target::Main
    }
}

/// Infers the tenant a statement belongs to.
///
/// Tried in order: a `tenant_id = $n` predicate whose parameter is a string
/// longer than [`MIN_PREDICATE_TENANT_LEN`] characters, then the first
/// parameter in canonical hyphenated UUID form.
pub fn resolve_tenant(sql: &str, params: &[SqlValue]) -> Option<String> {
    predicate_tenant(sql, params)
        .or_else(|| params.iter().filter_map(SqlValue::as_text).find(|s| is_canonical_uuid(s)))
        .map(str::to_string)
}

fn predicate_tenant<'p>(sql: &str, params: &'p [SqlValue]) -> Option<&'p str> {
    let tokens: Vec<Token<'_>> = Lexer::new(sql).collect();
    tokens.windows(3).find_map(|window| {
        let [column, eq, placeholder] = window else {
            return None;
        };
        if !column.is_keyword("tenant_id") || eq.kind != TokenKind::Symbol('=') {
            return None;
        }
        let TokenKind::Placeholder(Some(index)) = placeholder.kind else {
            return None;
        };
        params
            .get(index.checked_sub(1)?)
            .and_then(SqlValue::as_text)
            .filter(|value| value.chars().count() > MIN_PREDICATE_TENANT_LEN)
    })
}

/// Returns `true` for the 8-4-4-4-12 hyphenated hex form.
pub fn is_canonical_uuid(value: &str) -> bool {
    value.len() == 36
        && value
            .char_indices()
            .all(|(i, c)| matches!(i, 8 | 13 | 18 | 23) == (c == '-'))
        && uuid::Uuid::parse_str(value).is_ok()
}
