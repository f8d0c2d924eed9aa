//! Embedded schema and additive column migrations.
//!
//! A freshly created database gets the full schema script for its kind. An
//! existing database is brought up to date additively: missing tables are
//! created and required columns that `PRAGMA table_info` does not report are
//! added with `ALTER TABLE ... ADD COLUMN`. Nothing is ever dropped or
//! renamed.

use rusqlite::Connection;
use std::collections::HashSet;
use thiserror::Error;

use crate::sql::split_statements;

/// Which schema a database carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// The platform-wide main database.
    Main,
    /// A per-tenant database.
    Tenant,
}

impl SchemaKind {
    fn script(self) -> &'static str {
        match self {
            Self::Main => include_str!("schema/main.sql"),
            Self::Tenant => include_str!("schema/tenant.sql"),
        }
    }

    fn required_columns(self) -> &'static [ColumnMigration] {
        match self {
            Self::Main => MAIN_COLUMNS,
            Self::Tenant => TENANT_COLUMNS,
        }
    }

    /// Returns the string label for this schema.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Tenant => "tenant",
        }
    }
}

/// A column that must exist on an existing table.
struct ColumnMigration {
    table: &'static str,
    column: &'static str,
    definition: &'static str,
}

/// Columns added after the first tenant schema shipped. New entries are
/// appended here; definitions must be nullable or carry a constant default.
const TENANT_COLUMNS: &[ColumnMigration] = &[
    ColumnMigration {
        table: "collections",
        column: "settings",
        definition: "TEXT",
    },
    ColumnMigration {
        table: "documents",
        column: "metadata",
        definition: "TEXT",
    },
    ColumnMigration {
        table: "documents",
        column: "version",
        definition: "INTEGER DEFAULT 1",
    },
    ColumnMigration {
        table: "documents",
        column: "is_deleted",
        definition: "INTEGER DEFAULT 0",
    },
    ColumnMigration {
        table: "project_users",
        column: "scopes",
        definition: "TEXT DEFAULT '[]'",
    },
    ColumnMigration {
        table: "project_users",
        column: "allowed_scopes",
        definition: "TEXT DEFAULT '[]'",
    },
    ColumnMigration {
        table: "files",
        column: "checksum",
        definition: "TEXT",
    },
    ColumnMigration {
        table: "files",
        column: "uploaded_by",
        definition: "TEXT DEFAULT 'system'",
    },
    ColumnMigration {
        table: "changelog",
        column: "payload",
        definition: "TEXT",
    },
];

const MAIN_COLUMNS: &[ColumnMigration] = &[
    ColumnMigration {
        table: "admin_users",
        column: "permissions",
        definition: "TEXT DEFAULT '[]'",
    },
    ColumnMigration {
        table: "projects",
        column: "settings",
        definition: "TEXT DEFAULT '{}'",
    },
    ColumnMigration {
        table: "sessions",
        column: "scopes",
        definition: "TEXT DEFAULT '[]'",
    },
    ColumnMigration {
        table: "sessions",
        column: "consumed",
        definition: "INTEGER DEFAULT 0",
    },
    ColumnMigration {
        table: "api_keys",
        column: "scopes",
        definition: "TEXT DEFAULT '[]'",
    },
];

/// Errors that can occur while applying a schema.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A schema statement failed for a reason other than "already exists".
    #[error("{schema} schema statement failed: {source}")]
    ExecutionFailed {
        /// Which schema was being applied.
        schema: &'static str,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// Failed to introspect existing columns.
    #[error("failed to read columns of '{table}': {source}")]
    Introspection {
        /// Table being introspected.
        table: String,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },
}

/// Outcome of an additive migration pass.
#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Columns added, as `table.column`.
    pub added: Vec<String>,
    /// Migrations that failed and were skipped.
    pub failed: Vec<MigrationError>,
}

impl MigrationReport {
    /// Returns `true` if every required column is present.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Returns `true` for errors that mean the object is already in place.
fn is_already_applied(err: &rusqlite::Error) -> bool {
    let message = err.to_string();
    message.contains("already exists") || message.contains("duplicate column name")
}

/// Applies the full schema script for `kind`.
///
/// Statements that fail because the object already exists are skipped.
///
/// # Errors
///
/// Returns `MigrationError::ExecutionFailed` for any other statement failure.
pub fn apply_schema(conn: &Connection, kind: SchemaKind) -> Result<(), MigrationError> {
    for statement in split_statements(kind.script()) {
        if let Err(e) = conn.execute_batch(statement) {
            if is_already_applied(&e) {
                tracing::debug!(schema = kind.as_str(), "schema object already exists, skipping");
                continue;
            }
            return Err(MigrationError::ExecutionFailed {
                schema: kind.as_str(),
                source: e,
            });
        }
    }
    Ok(())
}

/// Brings an existing database up to date without touching existing data.
///
/// Every statement of the schema script is run, so missing tables and
/// indexes are created, then each required column absent from
/// `PRAGMA table_info` is added. Failures are logged and collected in the
/// report; they never abort the pass, so a broken legacy table does not
/// keep later tables from being created.
pub fn apply_additive_migrations(conn: &Connection, kind: SchemaKind) -> MigrationReport {
    let mut report = MigrationReport::default();

    for statement in split_statements(kind.script()) {
        match conn.execute_batch(statement) {
            Ok(()) => {}
            Err(e) if is_already_applied(&e) => {}
            Err(e) => {
                tracing::error!(
                    schema = kind.as_str(),
                    statement = %first_line(statement),
                    error = %e,
                    "schema statement failed, continuing"
                );
                report.failed.push(MigrationError::ExecutionFailed {
                    schema: kind.as_str(),
                    source: e,
                });
            }
        }
    }

    for migration in kind.required_columns() {
        let columns = match table_columns(conn, migration.table) {
            Ok(columns) => columns,
            Err(e) => {
                tracing::error!(
                    schema = kind.as_str(),
                    table = migration.table,
                    error = %e,
                    "failed to introspect table"
                );
                report.failed.push(e);
                continue;
            }
        };

        if columns.contains(migration.column) {
            continue;
        }

        let ddl = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            migration.table, migration.column, migration.definition
        );
        match conn.execute_batch(&ddl) {
            Ok(()) => {
                tracing::info!(
                    schema = kind.as_str(),
                    table = migration.table,
                    column = migration.column,
                    "added column"
                );
                report
                    .added
                    .push(format!("{}.{}", migration.table, migration.column));
            }
            Err(e) if is_already_applied(&e) => {}
            Err(e) => {
                tracing::error!(
                    schema = kind.as_str(),
                    table = migration.table,
                    column = migration.column,
                    error = %e,
                    "column migration failed"
                );
                report.failed.push(MigrationError::ExecutionFailed {
                    schema: kind.as_str(),
                    source: e,
                });
            }
        }
    }

    report
}

fn first_line(statement: &str) -> &str {
    statement
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("--"))
        .unwrap_or_default()
}

/// Returns the column names of `table`.
fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>, MigrationError> {
    let introspection = |source| MigrationError::Introspection {
        table: table.to_string(),
        source,
    };
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(introspection)?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(introspection)?
        .collect::<Result<HashSet<_>, _>>()
        .map_err(introspection)?;
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .expect("should query sqlite_master")
    }

    #[test]
    fn tenant_schema_creates_all_tables() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        apply_schema(&conn, SchemaKind::Tenant).expect("schema should apply");

        for table in [
            "collections",
            "documents",
            "project_users",
            "files",
            "file_versions",
            "file_permissions",
            "folders",
            "changelog",
        ] {
            assert!(table_exists(&conn, table), "{table} should exist");
        }
    }

    #[test]
    fn main_schema_creates_all_tables() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        apply_schema(&conn, SchemaKind::Main).expect("schema should apply");

        for table in ["admin_users", "projects", "sessions", "api_keys", "system_settings"] {
            assert!(table_exists(&conn, table), "{table} should exist");
        }
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        apply_schema(&conn, SchemaKind::Tenant).expect("first apply");
        apply_schema(&conn, SchemaKind::Tenant).expect("second apply");
    }

    #[test]
    fn fresh_schema_needs_no_column_migrations() {
        for kind in [SchemaKind::Main, SchemaKind::Tenant] {
            let conn = Connection::open_in_memory().expect("should open in-memory db");
            apply_schema(&conn, kind).expect("schema should apply");
            let report = apply_additive_migrations(&conn, kind);
            assert!(report.is_clean(), "{:?}", report.failed);
            assert!(report.added.is_empty(), "unexpected: {:?}", report.added);
        }
    }

    #[test]
    fn missing_columns_are_added_without_touching_rows() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        conn.execute_batch(
            "CREATE TABLE documents (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                collection_id TEXT NOT NULL,
                collection_name TEXT NOT NULL,
                data TEXT NOT NULL DEFAULT '{}',
                created_by TEXT,
                updated_by TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            INSERT INTO documents (id, tenant_id, collection_id, collection_name)
                VALUES ('d1', 't', 'c', 'posts');",
        )
        .expect("legacy table");

        let report = apply_additive_migrations(&conn, SchemaKind::Tenant);
        assert!(report.is_clean(), "{:?}", report.failed);
        assert!(report.added.contains(&"documents.metadata".to_string()));
        assert!(report.added.contains(&"documents.version".to_string()));
        assert!(report.added.contains(&"documents.is_deleted".to_string()));
        assert!(table_exists(&conn, "changelog"), "missing tables are created");

        let (version, deleted): (i64, i64) = conn
            .query_row(
                "SELECT version, is_deleted FROM documents WHERE id = 'd1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("existing row should be readable");
        assert_eq!((version, deleted), (1, 0));

        let second = apply_additive_migrations(&conn, SchemaKind::Tenant);
        assert!(second.added.is_empty(), "second pass is a no-op");
    }

    #[test]
    fn failing_statement_does_not_stop_later_tables() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        // Predates `collection_name`, so the collection index cannot be built.
        conn.execute_batch(
            "CREATE TABLE documents (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                collection_id TEXT NOT NULL,
                data TEXT NOT NULL DEFAULT '{}'
            );
            INSERT INTO documents (id, tenant_id, collection_id) VALUES ('d1', 't', 'c');",
        )
        .expect("legacy table");

        let report = apply_additive_migrations(&conn, SchemaKind::Tenant);
        assert_eq!(report.failed.len(), 1, "{:?}", report.failed);
        assert!(
            report.failed[0].to_string().contains("collection_name"),
            "{}",
            report.failed[0]
        );
        for table in [
            "project_users",
            "folders",
            "files",
            "file_versions",
            "file_permissions",
            "changelog",
        ] {
            assert!(table_exists(&conn, table), "{table} should exist");
        }
        assert!(report.added.contains(&"documents.metadata".to_string()));
    }
}
