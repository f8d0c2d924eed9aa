//! Error types for the database layer.

use std::path::PathBuf;
use thiserror::Error;

use crate::dialect::DialectError;
use crate::migrations::MigrationError;

/// Longest SQL excerpt carried in an execution error.
pub const SQL_EXCERPT_LEN: usize = 200;

/// Errors that can occur while resolving handles or running statements.
#[derive(Debug, Error)]
pub enum DbError {
    /// Placeholders and supplied parameters disagree.
    #[error("parameter mismatch: {0}")]
    ParameterMismatch(#[from] DialectError),

    /// SQLite rejected or failed the statement.
    #[error("statement failed: {message} (sql: {sql})")]
    Execution {
        /// The engine's error message.
        message: String,
        /// The statement, truncated to [`SQL_EXCERPT_LEN`] characters.
        sql: String,
    },

    /// The tenant's directory or database file could not be opened.
    #[error("tenant database '{tenant_id}' unavailable: {reason}")]
    TenantUnavailable {
        /// The tenant whose database failed to open.
        tenant_id: String,
        /// What went wrong.
        reason: String,
    },

    /// Running operations kept the tenant's handle past the busy timeout.
    #[error("tenant database '{0}' is still in use")]
    TenantBusy(String),

    /// The main database could not be opened.
    #[error("main database unavailable: {0}")]
    MainUnavailable(String),

    /// The tenant identifier cannot be used as a directory name.
    #[error("invalid tenant identifier: {0:?}")]
    InvalidTenantId(String),

    /// No pooled connection could be acquired.
    #[error("failed to acquire database connection: {0}")]
    Pool(#[from] r2d2::Error),

    /// The schema could not be applied to a new database.
    #[error("schema setup failed: {0}")]
    Schema(#[from] MigrationError),

    /// A filesystem operation on the tenant layout failed.
    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        /// The path being operated on.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl DbError {
    /// Wraps an engine error together with an excerpt of the statement.
    pub fn execution(err: &rusqlite::Error, sql: &str) -> Self {
        Self::Execution {
            message: err.to_string(),
            sql: truncate_sql(sql),
        }
    }
}

/// Truncates `sql` to at most [`SQL_EXCERPT_LEN`] characters.
pub fn truncate_sql(sql: &str) -> String {
    let sql = sql.trim();
    match sql.char_indices().nth(SQL_EXCERPT_LEN) {
        Some((cut, _)) => format!("{}...", &sql[..cut]),
        None => sql.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_sql_is_kept_whole() {
        assert_eq!(truncate_sql("  SELECT 1 "), "SELECT 1");
    }

    #[test]
    fn long_sql_is_truncated_on_a_char_boundary() {
        let sql = format!("SELECT '{}'", "é".repeat(300));
        let excerpt = truncate_sql(&sql);
        assert!(excerpt.ends_with("..."));
        assert_eq!(excerpt.chars().count(), SQL_EXCERPT_LEN + 3);
    }
}
