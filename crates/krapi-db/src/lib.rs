//! Database layer for the Krapi data-access core.
//!
//! Provides the main and per-tenant SQLite databases behind a single
//! [`TenantPool`], the `$n` to `?` dialect translator, and the embedded
//! schemas with their additive migrations.
//!
//! # Design decisions
//!
//! - **One SQLite file per tenant**: tenants are isolated physically, so a
//!   tenant can be closed, moved or deleted without touching anyone else.
//! - **SQLite with WAL mode**: concurrent readers with a single writer per
//!   file, which matches the per-tenant access pattern.
//! - **`r2d2` connection pool per handle**: bounded connection reuse without
//!   manual lifetime management; dropping the handle closes the file.
//! - **Embedded schemas**: SQL files are compiled into the binary via
//!   `include_str!`, so the schema ships with the code that depends on it.

mod dialect;
mod error;
mod handle;
mod migrations;
mod pool;
pub mod sql;
mod tenants;

pub use dialect::{
    decode_column, encode_value, is_structured_column, translate, DialectError, Translated,
    STRUCTURED_COLUMNS,
};
pub use error::{truncate_sql, DbError, SQL_EXCERPT_LEN};
pub use handle::{DatabaseHandle, HandleKind};
pub use migrations::{
    apply_additive_migrations, apply_schema, MigrationError, MigrationReport, SchemaKind,
};
pub use pool::{create_pool, DbPool, DbRuntimeSettings};
pub use tenants::{
    validate_tenant_id, PoolSettings, PoolStats, TenantPool, MAX_TENANT_ID_LEN, TENANT_DB_FILE,
    TENANT_FILES_DIR,
};
