//! Connection pool creation and configuration.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use std::path::Path;
use std::time::Duration;

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Page cache size per connection, in KiB.
    pub cache_size_kib: u32,

    /// Maximum number of pooled SQLite connections per database.
    pub pool_max_size: u32,

    /// How long to wait for a pooled connection, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            cache_size_kib: 8_192,
            pool_max_size: 4,
            connect_timeout_ms: 5_000,
        }
    }
}

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Creates a new SQLite connection pool with WAL mode and foreign keys enabled.
///
/// Every connection is initialized with `journal_mode = WAL`, the configured
/// busy timeout and page cache size, and `synchronous = NORMAL`.
///
/// # Errors
///
/// Returns `r2d2::Error` if no connection can be established within the
/// connect timeout.
pub fn create_pool(db_path: &Path, settings: DbRuntimeSettings) -> Result<DbPool, r2d2::Error> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            // The busy timeout goes first so concurrent first connections
            // wait on each other while switching the journal mode.
            conn.execute_batch(&format!(
                "PRAGMA busy_timeout = {};",
                settings.busy_timeout_ms
            ))?;
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA cache_size = -{};",
                settings.cache_size_kib
            ))
        });

    Pool::builder()
        .max_size(settings.pool_max_size.max(1))
        .min_idle(Some(1))
        .connection_timeout(Duration::from_millis(settings.connect_timeout_ms))
        .build(manager)
}
