//! The tenant database pool.
//!
//! Owns the main database handle and one handle per tenant. Tenant handles
//! are opened lazily on first reference and cached; opening is serialized
//! per tenant id so that concurrent first requests share a single handle.
//! The cache is bounded: once more than `max_open_tenants` tenants are open,
//! the least recently used idle one is checkpointed and released. A tenant
//! never has more than one live handle; handles in use are neither evicted
//! nor closed until their users release them.
//!
//! Layout under the tenant root:
//!
//! ```text
//! <tenant_root>/<tenant_id>/tenant.db      (+ tenant.db-wal, tenant.db-shm)
//! <tenant_root>/<tenant_id>/files/
//! ```

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::DbError;
use crate::handle::{DatabaseHandle, HandleKind};
use crate::pool::DbRuntimeSettings;

/// File name of a tenant's database inside its directory.
pub const TENANT_DB_FILE: &str = "tenant.db";

/// Subdirectory holding a tenant's binary objects.
pub const TENANT_FILES_DIR: &str = "files";

/// How often a close re-checks whether a busy handle was released.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Longest accepted tenant identifier.
pub const MAX_TENANT_ID_LEN: usize = 128;

/// Settings for the tenant pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Path of the main database file.
    pub main_db_path: PathBuf,
    /// Directory holding one subdirectory per tenant.
    pub tenant_root: PathBuf,
    /// Connection tuning applied to every database.
    pub runtime: DbRuntimeSettings,
    /// Most tenant handles kept open at once. `0` means unbounded.
    pub max_open_tenants: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            main_db_path: PathBuf::from("data/main.db"),
            tenant_root: PathBuf::from("data/projects"),
            runtime: DbRuntimeSettings::default(),
            max_open_tenants: 256,
        }
    }
}

/// Counters describing the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Tenant handles currently cached.
    pub open_tenants: usize,
    /// Tenant handles opened since startup.
    pub tenants_opened: u64,
    /// Tenant handles released to stay under the cache bound.
    pub tenants_evicted: u64,
    /// Whether the main handle is open.
    pub main_open: bool,
}

enum SlotState {
    Empty,
    Open(Arc<DatabaseHandle>),
    /// Removed from the map; callers holding this slot must look up again.
    Retired,
}

struct TenantSlot {
    state: Mutex<SlotState>,
    last_used: AtomicU64,
}

impl TenantSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
            last_used: AtomicU64::new(0),
        }
    }
}

/// Owner of the main handle and all tenant handles.
///
/// Lock order is always slot state before the tenant map; the map lock is
/// never held while waiting on a slot.
pub struct TenantPool {
    settings: PoolSettings,
    main: Mutex<Option<Arc<DatabaseHandle>>>,
    tenants: Mutex<HashMap<String, Arc<TenantSlot>>>,
    clock: AtomicU64,
    opened: AtomicU64,
    evicted: AtomicU64,
}

/// Acquires a mutex, recovering the guard if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("tenant pool lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Checks that `tenant_id` is safe to use as a directory name.
///
/// # Errors
///
/// Returns `DbError::InvalidTenantId` unless the id is 1 to
/// [`MAX_TENANT_ID_LEN`] characters of ASCII letters, digits, `-` or `_`.
pub fn validate_tenant_id(tenant_id: &str) -> Result<(), DbError> {
    let valid = !tenant_id.is_empty()
        && tenant_id.len() <= MAX_TENANT_ID_LEN
        && tenant_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(DbError::InvalidTenantId(tenant_id.to_string()))
    }
}

/// Removes the `-wal` and `-shm` files next to `db_path`.
fn remove_sidecars(db_path: &Path) {
    for suffix in ["-wal", "-shm"] {
        let mut name = OsString::from(db_path.as_os_str());
        name.push(suffix);
        let sidecar = PathBuf::from(name);
        match std::fs::remove_file(&sidecar) {
            Ok(()) => tracing::debug!(path = %sidecar.display(), "removed sidecar"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %sidecar.display(), error = %e, "failed to remove sidecar"),
        }
    }
}

/// Checkpoints and releases a handle. Sidecars are removed only when this
/// was the last reference, since a live connection still owns them.
fn close_handle(handle: Arc<DatabaseHandle>) {
    let label = handle.tenant_id().unwrap_or("main").to_string();
    if let Err(e) = handle.checkpoint() {
        tracing::warn!(database = %label, error = %e, "checkpoint before close failed");
    }
    let path = handle.path().to_path_buf();
    match Arc::try_unwrap(handle) {
        Ok(handle) => {
            drop(handle);
            remove_sidecars(&path);
            tracing::info!(database = %label, "closed database");
        }
        Err(shared) => {
            tracing::warn!(
                database = %label,
                refs = Arc::strong_count(&shared),
                "database still in use, it closes when the last user finishes"
            );
        }
    }
}

impl TenantPool {
    /// Creates a pool. Nothing is opened until first use.
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            main: Mutex::new(None),
            tenants: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            opened: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// The settings this pool was created with.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Directory of `tenant_id` under the tenant root.
    pub fn tenant_dir(&self, tenant_id: &str) -> PathBuf {
        self.settings.tenant_root.join(tenant_id)
    }

    /// Returns the main handle, opening it on first call.
    ///
    /// # Errors
    ///
    /// Returns `DbError::MainUnavailable` if the file or its parent directory
    /// cannot be created or opened.
    pub fn main_handle(&self) -> Result<Arc<DatabaseHandle>, DbError> {
        let mut main = lock(&self.main);
        if let Some(handle) = main.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let path = self.settings.main_db_path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbError::MainUnavailable(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let handle = DatabaseHandle::open(HandleKind::Main, path, self.settings.runtime)
            .map_err(|e| DbError::MainUnavailable(e.to_string()))?;
        tracing::info!(
            path = %handle.path().display(),
            created = handle.was_created(),
            "opened main database"
        );

        let handle = Arc::new(handle);
        *main = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Returns the handle for `tenant_id`, opening it on first reference.
    ///
    /// Concurrent callers for a tenant that is not open yet wait on the
    /// same slot: exactly one of them opens the file and all receive the
    /// same handle.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidTenantId` for ids that are not safe directory
    /// names and `DbError::TenantUnavailable` if the directory or file cannot
    /// be created or opened.
    pub fn tenant_handle(&self, tenant_id: &str) -> Result<Arc<DatabaseHandle>, DbError> {
        validate_tenant_id(tenant_id)?;

        loop {
            let slot = {
                let mut tenants = lock(&self.tenants);
                Arc::clone(
                    tenants
                        .entry(tenant_id.to_string())
                        .or_insert_with(|| Arc::new(TenantSlot::new())),
                )
            };
            slot.last_used
                .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);

            let mut state = lock(&slot.state);
            match &*state {
                SlotState::Open(handle) => return Ok(Arc::clone(handle)),
                SlotState::Retired => continue,
                SlotState::Empty => {}
            }

            match self.open_tenant(tenant_id) {
                Ok(handle) => {
                    let handle = Arc::new(handle);
                    *state = SlotState::Open(Arc::clone(&handle));
                    drop(state);
                    self.opened.fetch_add(1, Ordering::Relaxed);
                    self.evict_over_capacity(tenant_id);
                    return Ok(handle);
                }
                Err(e) => {
                    self.forget_slot(tenant_id, &slot);
                    *state = SlotState::Retired;
                    tracing::error!(tenant_id, error = %e, "failed to open tenant database");
                    return Err(e);
                }
            }
        }
    }

    fn open_tenant(&self, tenant_id: &str) -> Result<DatabaseHandle, DbError> {
        let unavailable = |reason: String| DbError::TenantUnavailable {
            tenant_id: tenant_id.to_string(),
            reason,
        };

        let dir = self.tenant_dir(tenant_id);
        let files_dir = dir.join(TENANT_FILES_DIR);
        std::fs::create_dir_all(&files_dir)
            .map_err(|e| unavailable(format!("failed to create {}: {e}", files_dir.display())))?;

        let handle = DatabaseHandle::open(
            HandleKind::Tenant(tenant_id.to_string()),
            dir.join(TENANT_DB_FILE),
            self.settings.runtime,
        )
        .map_err(|e| match e {
            DbError::Pool(e) => unavailable(e.to_string()),
            other => other,
        })?;

        tracing::info!(
            tenant_id,
            created = handle.was_created(),
            "opened tenant database"
        );
        Ok(handle)
    }

    /// Removes `slot` from the map if it is still the entry for `tenant_id`.
    fn forget_slot(&self, tenant_id: &str, slot: &Arc<TenantSlot>) {
        let mut tenants = lock(&self.tenants);
        if tenants
            .get(tenant_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            tenants.remove(tenant_id);
        }
    }

    /// Releases least recently used tenants until the cache is within bounds.
    ///
    /// A tenant whose handle is still held by a running operation is
    /// skipped, so the cache may stay above the bound until it is released.
    fn evict_over_capacity(&self, keep: &str) {
        let cap = self.settings.max_open_tenants;
        if cap == 0 {
            return;
        }

        let mut candidates: Vec<(String, Arc<TenantSlot>)> = {
            let tenants = lock(&self.tenants);
            if tenants.len() <= cap {
                return;
            }
            tenants
                .iter()
                .filter(|(id, _)| id.as_str() != keep)
                .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
                .collect()
        };
        candidates.sort_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed));

        for (id, slot) in candidates {
            let mut state = lock(&slot.state);
            let idle = matches!(&*state, SlotState::Open(handle) if Arc::strong_count(handle) == 1);
            if !idle {
                tracing::debug!(tenant_id = %id, "tenant database in use, not evicting");
                continue;
            }
            {
                let mut tenants = lock(&self.tenants);
                if tenants.len() <= cap {
                    return;
                }
                if !tenants.get(&id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                    continue;
                }
                tenants.remove(&id);
            }
            let SlotState::Open(handle) = std::mem::replace(&mut *state, SlotState::Retired) else {
                continue;
            };
            drop(state);

            tracing::info!(tenant_id = %id, "evicting least recently used tenant database");
            self.evicted.fetch_add(1, Ordering::Relaxed);
            close_handle(handle);
        }

        let open = self.open_tenant_count();
        if open > cap {
            tracing::debug!(open, cap, "tenant cache over bound while databases are in use");
        }
    }

    /// Marks a slot retired and closes its handle, if any.
    fn retire(slot: Arc<TenantSlot>) {
        let handle = {
            let mut state = lock(&slot.state);
            match std::mem::replace(&mut *state, SlotState::Retired) {
                SlotState::Open(handle) => Some(handle),
                SlotState::Empty | SlotState::Retired => None,
            }
        };
        if let Some(handle) = handle {
            close_handle(handle);
        }
    }

    /// Closes the tenant's handle once no operation holds it, then runs
    /// `then`, all under the slot lock so the tenant cannot be reopened in
    /// between.
    fn close_when_idle(
        &self,
        tenant_id: &str,
        then: impl FnOnce() -> Result<(), DbError>,
    ) -> Result<(), DbError> {
        let Some(slot) = lock(&self.tenants).get(tenant_id).cloned() else {
            return then();
        };

        let wait = Duration::from_millis(self.settings.runtime.busy_timeout_ms);
        let deadline = Instant::now() + wait;
        let mut state = lock(&slot.state);
        while matches!(&*state, SlotState::Open(handle) if Arc::strong_count(handle) > 1) {
            if Instant::now() >= deadline {
                return Err(DbError::TenantBusy(tenant_id.to_string()));
            }
            // Holding the slot keeps new users out while current ones finish.
            std::thread::sleep(CLOSE_POLL_INTERVAL);
        }

        if let SlotState::Open(handle) = std::mem::replace(&mut *state, SlotState::Empty) {
            close_handle(handle);
        }
        let outcome = then();
        self.forget_slot(tenant_id, &slot);
        *state = SlotState::Retired;
        outcome
    }

    /// Closes the tenant's handle. A tenant that was never opened is a no-op.
    ///
    /// Waits up to the busy timeout for running operations to release the
    /// handle. The write-ahead log is checkpointed first and its sidecar
    /// files are removed.
    ///
    /// # Errors
    ///
    /// Returns `DbError::TenantBusy` if the handle is still in use when the
    /// busy timeout expires.
    pub fn close_tenant(&self, tenant_id: &str) -> Result<(), DbError> {
        self.close_when_idle(tenant_id, || Ok(()))
    }

    /// Closes the tenant's handle and removes its directory.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidTenantId` for unsafe ids,
    /// `DbError::TenantBusy` if running operations keep the handle past the
    /// busy timeout and `DbError::Filesystem` if the directory cannot be
    /// removed.
    pub fn delete_tenant(&self, tenant_id: &str) -> Result<(), DbError> {
        validate_tenant_id(tenant_id)?;
        let dir = self.tenant_dir(tenant_id);
        self.close_when_idle(tenant_id, || match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!(tenant_id, "deleted tenant directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DbError::Filesystem {
                path: dir.clone(),
                source,
            }),
        })
    }

    /// Closes every tenant handle and the main handle.
    pub fn close_all(&self) {
        let slots: Vec<Arc<TenantSlot>> = lock(&self.tenants).drain().map(|(_, s)| s).collect();
        let count = slots.len();
        for slot in slots {
            Self::retire(slot);
        }

        let main = lock(&self.main).take();
        if let Some(handle) = main {
            close_handle(handle);
        }
        tracing::info!(tenants = count, "closed all databases");
    }

    /// Whether `tenant_id` currently has a cached handle.
    pub fn is_open(&self, tenant_id: &str) -> bool {
        lock(&self.tenants).contains_key(tenant_id)
    }

    /// Ids of all cached tenants, sorted.
    pub fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.tenants).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of cached tenant handles.
    pub fn open_tenant_count(&self) -> usize {
        lock(&self.tenants).len()
    }

    /// Current pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            open_tenants: self.open_tenant_count(),
            tenants_opened: self.opened.load(Ordering::Relaxed),
            tenants_evicted: self.evicted.load(Ordering::Relaxed),
            main_open: lock(&self.main).is_some(),
        }
    }
}

impl Drop for TenantPool {
    fn drop(&mut self) {
        self.close_all();
    }
}
