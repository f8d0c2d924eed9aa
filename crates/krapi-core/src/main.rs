//! Krapi data core binary.
//!
//! Hosts one [`DataCore`]: the main database, the lazily opened tenant
//! databases and the operation queue in front of them. Queue and pool
//! statistics are logged on an interval. On SIGINT or SIGTERM the queue
//! stops admitting work, active operations finish, pending ones are
//! cancelled and every database is checkpointed and closed.

use krapi_core::{background, config, DataCore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Config file from the first argument, then `KRAPI_CONFIG_PATH`.
fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("KRAPI_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration, the service cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let core = Arc::new(
        DataCore::from_config(&config)
            .expect("failed to open data core, check database.main_db_path in config"),
    );

    tracing::info!(
        tenant_root = %config.database.tenant_root,
        max_open_tenants = config.database.max_open_tenants,
        "krapi data core running"
    );

    let reporter = tokio::spawn(background::report_stats(
        Arc::clone(&core),
        config.logging.stats_interval_seconds,
    ));

    let signal = shutdown_signal().await;
    tracing::info!(
        signal,
        pending = core.stats().queue.pending,
        "stopping: refusing new operations, finishing active ones, closing databases"
    );

    core.shutdown().await;
    reporter.abort();

    tracing::info!("krapi data core stopped");
}

/// Resolves once the process is asked to stop, returning the signal name.
/// The data core keeps serving until then.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => "SIGINT",
        () = terminate => "SIGTERM",
    }
}
