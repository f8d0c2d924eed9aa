//! Service configuration loading from file and environment variables.

use krapi_db::{DbRuntimeSettings, PoolSettings};
use krapi_queue::QueueSettings;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Operation queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the main database file.
    pub main_db_path: String,

    /// Directory holding one subdirectory per tenant.
    pub tenant_root: String,

    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,

    /// Page cache size per connection, in KiB.
    pub cache_size_kib: u32,

    /// Maximum pooled connections per database file.
    pub pool_max_size: u32,

    /// Maximum tenant databases held open at once. `0` means unbounded.
    pub max_open_tenants: usize,
}

/// Operation queue configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum operations running at once.
    pub max_concurrency: usize,

    /// Admissions per second. `0` disables rate limiting.
    pub rate_limit: u32,

    /// Maximum pending operations before enqueue is refused.
    pub max_size: usize,

    /// Whether priorities are honored.
    pub priority_enabled: bool,

    /// Scheduler wake interval in milliseconds.
    pub tick_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "krapi_db=debug,info").
    pub level: String,

    /// Whether to output logs in JSON format.
    pub json: bool,

    /// Seconds between queue/pool stats reports. `0` disables reporting.
    pub stats_interval_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let runtime = DbRuntimeSettings::default();
        Self {
            main_db_path: "data/main.db".to_string(),
            tenant_root: "data/projects".to_string(),
            busy_timeout_ms: runtime.busy_timeout_ms,
            cache_size_kib: runtime.cache_size_kib,
            pool_max_size: runtime.pool_max_size,
            max_open_tenants: 256,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        let queue = QueueSettings::default();
        Self {
            max_concurrency: queue.max_concurrency,
            rate_limit: queue.rate_limit_per_sec,
            max_size: queue.max_size,
            priority_enabled: queue.priority_enabled,
            tick_ms: queue.tick.as_millis() as u64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            stats_interval_seconds: 60,
        }
    }
}

impl DatabaseConfig {
    /// Settings for the tenant pool.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            main_db_path: PathBuf::from(&self.main_db_path),
            tenant_root: PathBuf::from(&self.tenant_root),
            runtime: DbRuntimeSettings {
                busy_timeout_ms: self.busy_timeout_ms,
                cache_size_kib: self.cache_size_kib,
                pool_max_size: self.pool_max_size,
                ..DbRuntimeSettings::default()
            },
            max_open_tenants: self.max_open_tenants,
        }
    }
}

impl QueueConfig {
    /// Settings for the operation queue.
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_concurrency: self.max_concurrency.max(1),
            rate_limit_per_sec: self.rate_limit,
            max_size: self.max_size,
            priority_enabled: self.priority_enabled,
            tick: Duration::from_millis(self.tick_ms.max(1)),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides (see [`apply_env_overrides`]).
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies overrides looked up by `lookup`:
///
/// - `KRAPI_QUEUE_MAX_CONCURRENCY` overrides `queue.max_concurrency`
/// - `KRAPI_QUEUE_RATE_LIMIT` overrides `queue.rate_limit`
/// - `KRAPI_QUEUE_MAX_SIZE` overrides `queue.max_size`
/// - `KRAPI_QUEUE_PRIORITY_ENABLED` overrides `queue.priority_enabled`
/// - `KRAPI_MAIN_DB_PATH` overrides `database.main_db_path`
/// - `KRAPI_TENANT_DB_ROOT` overrides `database.tenant_root`
/// - `KRAPI_DB_BUSY_TIMEOUT_MS` overrides `database.busy_timeout_ms`
/// - `KRAPI_DB_CACHE_SIZE_KIB` overrides `database.cache_size_kib`
/// - `KRAPI_MAX_OPEN_TENANTS` overrides `database.max_open_tenants`
/// - `KRAPI_LOG_LEVEL` overrides `logging.level`
/// - `KRAPI_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// Values that fail to parse are ignored with a warning.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let lookup = &lookup;
    override_parsed(lookup, "KRAPI_QUEUE_MAX_CONCURRENCY", &mut config.queue.max_concurrency);
    override_parsed(lookup, "KRAPI_QUEUE_RATE_LIMIT", &mut config.queue.rate_limit);
    override_parsed(lookup, "KRAPI_QUEUE_MAX_SIZE", &mut config.queue.max_size);
    if let Some(enabled) = lookup("KRAPI_QUEUE_PRIORITY_ENABLED") {
        config.queue.priority_enabled = parse_flag(&enabled);
    }

    if let Some(path) = lookup("KRAPI_MAIN_DB_PATH") {
        config.database.main_db_path = path;
    }
    if let Some(root) = lookup("KRAPI_TENANT_DB_ROOT") {
        config.database.tenant_root = root;
    }
    override_parsed(lookup, "KRAPI_DB_BUSY_TIMEOUT_MS", &mut config.database.busy_timeout_ms);
    override_parsed(lookup, "KRAPI_DB_CACHE_SIZE_KIB", &mut config.database.cache_size_kib);
    override_parsed(lookup, "KRAPI_MAX_OPEN_TENANTS", &mut config.database.max_open_tenants);

    if let Some(level) = lookup("KRAPI_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("KRAPI_LOG_JSON") {
        config.logging.json = parse_flag(&json);
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "true" | "1")
}
