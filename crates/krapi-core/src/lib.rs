//! Multi-tenant data-access core.
//!
//! [`DataCore`] ties the pieces together: statements are routed to the main
//! database or a tenant database, translated from `$n` placeholders, queued
//! on the bounded operation queue, and executed against a lazily opened
//! handle from the tenant pool.

pub mod background;
pub mod config;
pub mod error;
pub mod router;

pub use error::CoreError;
pub use router::RoutingError;

use config::Config;
use krapi_db::{
    translate, validate_tenant_id, DbError, HandleKind, PoolSettings, PoolStats, TenantPool,
    Translated,
};
use krapi_queue::{OperationQueue, QueueSettings, QueueStats};
use krapi_types::{QueryResult, SqlValue, Target};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Priority used by the entry points without an explicit priority.
pub const DEFAULT_PRIORITY: i32 = 0;

/// A snapshot of queue and pool health.
#[derive(Debug, Clone, Serialize)]
pub struct CoreStats {
    /// Operation queue state and counters.
    pub queue: QueueStats,
    /// Tenant pool counters.
    pub pool: PoolStats,
    /// Statements whose tenant was inferred rather than given.
    pub inferred_routes: u64,
}

/// The data-access context: one tenant pool and one operation queue.
///
/// Must be created inside a tokio runtime; the queue's scheduler runs on it.
pub struct DataCore {
    pool: Arc<TenantPool>,
    queue: OperationQueue<TenantPool>,
    inferred_routes: AtomicU64,
}

impl DataCore {
    /// Opens the core described by `config`.
    ///
    /// # Errors
    ///
    /// See [`DataCore::open`].
    pub fn from_config(config: &Config) -> Result<Self, CoreError> {
        Self::open(
            config.database.pool_settings(),
            config.queue.queue_settings(),
        )
    }

    /// Opens the main database and starts the operation queue.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Db` if the main database cannot be opened and
    /// `CoreError::Queue` if no tokio runtime is available.
    pub fn open(pool_settings: PoolSettings, queue_settings: QueueSettings) -> Result<Self, CoreError> {
        let pool = Arc::new(TenantPool::new(pool_settings));
        let main = pool.main_handle()?;
        tracing::info!(
            path = %main.path().display(),
            created = main.was_created(),
            "main database ready"
        );

        let queue = OperationQueue::new(queue_settings);
        queue.initialize(Arc::clone(&pool))?;

        Ok(Self {
            pool,
            queue,
            inferred_routes: AtomicU64::new(0),
        })
    }

    /// The tenant pool backing this core.
    pub fn pool(&self) -> &Arc<TenantPool> {
        &self.pool
    }

    /// The operation queue.
    pub fn queue(&self) -> &OperationQueue<TenantPool> {
        &self.queue
    }

    /// Runs a statement, inferring its target from the statement itself.
    ///
    /// Prefer [`query_main`](Self::query_main) and
    /// [`query_tenant`](Self::query_tenant) where the target is known.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Routing` when the statement is tenant-scoped but
    /// no tenant can be inferred, plus everything `query_tenant` returns.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, CoreError> {
        self.query_with_priority(sql, params, DEFAULT_PRIORITY).await
    }

    /// [`query`](Self::query) with an explicit queue priority.
    pub async fn query_with_priority(
        &self,
        sql: &str,
        params: &[SqlValue],
        priority: i32,
    ) -> Result<QueryResult, CoreError> {
        match router::classify(sql) {
            Target::Main => self.query_main_with_priority(sql, params, priority).await,
            Target::Tenant => {
                let Some(tenant_id) = router::resolve_tenant(sql, params) else {
                    let tables: Vec<String> = router::referenced_tables(sql)
                        .into_iter()
                        .filter(|t| router::is_tenant_table(t))
                        .map(str::to_ascii_lowercase)
                        .collect();
                    tracing::warn!(?tables, "cannot infer tenant for tenant-scoped statement");
                    return Err(RoutingError::Ambiguous { tables }.into());
                };
                self.inferred_routes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    tenant_id = %tenant_id,
                    "tenant inferred from statement, prefer query_tenant"
                );
                self.query_tenant_with_priority(&tenant_id, sql, params, priority)
                    .await
            }
        }
    }

    /// Runs a statement against the main database.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Db` for parameter mismatches and execution
    /// failures, and `CoreError::Queue` when the queue refuses the work.
    pub async fn query_main(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<QueryResult, CoreError> {
        self.query_main_with_priority(sql, params, DEFAULT_PRIORITY)
            .await
    }

    /// [`query_main`](Self::query_main) with an explicit queue priority.
    pub async fn query_main_with_priority(
        &self,
        sql: &str,
        params: &[SqlValue],
        priority: i32,
    ) -> Result<QueryResult, CoreError> {
        let statement = translate(sql, params).map_err(DbError::from)?;
        self.execute(HandleKind::Main, statement, priority).await
    }

    /// Runs a statement against the database of `tenant_id`, opening it on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Db` for invalid tenant ids, parameter mismatches,
    /// unavailable tenant databases and execution failures, and
    /// `CoreError::Queue` when the queue refuses the work.
    pub async fn query_tenant(
        &self,
        tenant_id: &str,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<QueryResult, CoreError> {
        self.query_tenant_with_priority(tenant_id, sql, params, DEFAULT_PRIORITY)
            .await
    }

    /// [`query_tenant`](Self::query_tenant) with an explicit queue priority.
    pub async fn query_tenant_with_priority(
        &self,
        tenant_id: &str,
        sql: &str,
        params: &[SqlValue],
        priority: i32,
    ) -> Result<QueryResult, CoreError> {
        validate_tenant_id(tenant_id)?;
        let statement = translate(sql, params).map_err(DbError::from)?;
        self.execute(HandleKind::Tenant(tenant_id.to_string()), statement, priority)
            .await
    }

    async fn execute(
        &self,
        target: HandleKind,
        statement: Translated,
        priority: i32,
    ) -> Result<QueryResult, CoreError> {
        let completion = self.queue.enqueue(
            move |pool: &TenantPool| -> Result<QueryResult, CoreError> {
                let handle = match &target {
                    HandleKind::Main => pool.main_handle()?,
                    HandleKind::Tenant(tenant_id) => pool.tenant_handle(tenant_id)?,
                };
                Ok(handle.execute_translated(&statement)?)
            },
            priority,
        )?;
        completion.await
    }

    /// Closes a tenant's database and removes its directory.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Db` if the id is invalid or the directory cannot
    /// be removed.
    pub async fn delete_tenant(&self, tenant_id: &str) -> Result<(), CoreError> {
        validate_tenant_id(tenant_id)?;
        let tenant_id = tenant_id.to_string();
        let completion = self.queue.enqueue(
            move |pool: &TenantPool| -> Result<(), CoreError> {
                pool.delete_tenant(&tenant_id)?;
                tracing::info!(tenant_id = %tenant_id, "tenant deleted");
                Ok(())
            },
            DEFAULT_PRIORITY,
        )?;
        completion.await
    }

    /// A snapshot of queue and pool health.
    pub fn stats(&self) -> CoreStats {
        CoreStats {
            queue: self.queue.stats(),
            pool: self.pool.stats(),
            inferred_routes: self.inferred_routes.load(Ordering::Relaxed),
        }
    }

    /// Drains the queue, then closes every database handle.
    pub async fn shutdown(&self) {
        self.queue.drain().await;

        let pool = Arc::clone(&self.pool);
        if let Err(e) = tokio::task::spawn_blocking(move || pool.close_all()).await {
            tracing::error!("closing database handles failed: {}", e);
        }
        tracing::info!("data core shut down");
    }
}
