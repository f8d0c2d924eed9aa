//! Open database handles and statement execution.

use krapi_types::{QueryResult, Row, SqlValue};
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params_from_iter;
use std::path::{Path, PathBuf};

use crate::dialect::{decode_column, translate, Translated};
use crate::error::DbError;
use crate::migrations::{apply_additive_migrations, apply_schema, SchemaKind};
use crate::pool::{create_pool, DbPool, DbRuntimeSettings};
use crate::sql::{is_read_statement, leading_keyword};

/// Which database a handle points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// The platform-wide main database.
    Main,
    /// The database of the named tenant.
    Tenant(String),
}

impl HandleKind {
    fn schema(&self) -> SchemaKind {
        match self {
            Self::Main => SchemaKind::Main,
            Self::Tenant(_) => SchemaKind::Tenant,
        }
    }
}

/// An open database: a small connection pool over one SQLite file.
///
/// Dropping the last reference closes every pooled connection.
pub struct DatabaseHandle {
    kind: HandleKind,
    path: PathBuf,
    pool: DbPool,
    created: bool,
    migration_failures: Vec<String>,
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

impl DatabaseHandle {
    /// Opens the database at `path` and brings its schema up to date.
    ///
    /// A file that did not exist gets the full schema; an existing file gets
    /// additive migrations, whose failures are logged and kept on the handle
    /// rather than failing the open.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Pool` if the file cannot be opened and
    /// `DbError::Schema` if the full schema cannot be applied to a new file.
    pub fn open(
        kind: HandleKind,
        path: PathBuf,
        settings: DbRuntimeSettings,
    ) -> Result<Self, DbError> {
        let created = !path.exists();
        let pool = create_pool(&path, settings)?;

        let mut migration_failures = Vec::new();
        {
            let conn = pool.get()?;
            if created {
                apply_schema(&conn, kind.schema())?;
            } else {
                let report = apply_additive_migrations(&conn, kind.schema());
                if !report.added.is_empty() {
                    tracing::info!(
                        path = %path.display(),
                        columns = ?report.added,
                        "applied additive migrations"
                    );
                }
                if !report.is_clean() {
                    tracing::warn!(
                        path = %path.display(),
                        failed = report.failed.len(),
                        "some migrations failed, existing columns remain usable"
                    );
                }
                migration_failures = report.failed.iter().map(ToString::to_string).collect();
            }
        }

        Ok(Self {
            kind,
            path,
            pool,
            created,
            migration_failures,
        })
    }

    /// Which database this handle points at.
    pub fn kind(&self) -> &HandleKind {
        &self.kind
    }

    /// The tenant this handle belongs to, if any.
    pub fn tenant_id(&self) -> Option<&str> {
        match &self.kind {
            HandleKind::Tenant(id) => Some(id.as_str()),
            HandleKind::Main => None,
        }
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether opening this handle created the database file.
    pub fn was_created(&self) -> bool {
        self.created
    }

    /// Migration failures recorded when the handle was opened.
    pub fn migration_failures(&self) -> &[String] {
        &self.migration_failures
    }

    /// Checks out a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Pool` if no connection becomes available in time.
    pub fn connection(&self) -> Result<PooledConnection<SqliteConnectionManager>, DbError> {
        Ok(self.pool.get()?)
    }

    /// Translates and runs a statement with positional `$n` parameters.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ParameterMismatch` before touching the database when
    /// placeholders and parameters disagree, and `DbError::Execution` when
    /// SQLite fails the statement.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        let statement = translate(sql, params)?;
        self.execute_translated(&statement)
    }

    /// Runs an already translated statement.
    ///
    /// Statements that produce a result set return every row; all others
    /// return the number of affected rows and, for inserts, the last row id.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Execution` when SQLite fails the statement.
    pub fn execute_translated(&self, statement: &Translated) -> Result<QueryResult, DbError> {
        let sql = statement.sql.as_str();
        let fail = |e: rusqlite::Error| DbError::execution(&e, sql);

        let conn = self.connection()?;
        let mut prepared = conn.prepare(sql).map_err(fail)?;

        if is_read_statement(sql) || prepared.column_count() > 0 {
            let columns: Vec<String> = prepared
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();
            let mut rows = prepared
                .query(params_from_iter(statement.params.iter()))
                .map_err(fail)?;

            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(fail)? {
                let mut record = Row::new();
                for (i, name) in columns.iter().enumerate() {
                    let value = row.get_ref(i).map_err(fail)?;
                    record.insert(name.clone(), decode_column(name, value));
                }
                out.push(record);
            }
            return Ok(QueryResult::from_rows(out));
        }

        let changes = prepared
            .execute(params_from_iter(statement.params.iter()))
            .map_err(fail)?;
        let is_insert = leading_keyword(sql).is_some_and(|kw| {
            kw.eq_ignore_ascii_case("INSERT") || kw.eq_ignore_ascii_case("REPLACE")
        });
        let last_insert_id = is_insert.then(|| conn.last_insert_rowid());

        Ok(QueryResult::affected(changes, last_insert_id))
    }

    /// Flushes the write-ahead log into the main database file.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Execution` if the checkpoint fails.
    pub fn checkpoint(&self) -> Result<(), DbError> {
        const CHECKPOINT: &str = "PRAGMA wal_checkpoint(TRUNCATE);";
        let conn = self.connection()?;
        conn.query_row(CHECKPOINT, [], |_| Ok(()))
            .map_err(|e| DbError::execution(&e, CHECKPOINT))
    }
}
