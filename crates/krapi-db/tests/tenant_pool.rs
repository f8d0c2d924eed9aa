use krapi_db::{
    DbError, DbRuntimeSettings, PoolSettings, TenantPool, TENANT_DB_FILE, TENANT_FILES_DIR,
};
use krapi_types::SqlValue;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn pool_in(root: &Path, max_open_tenants: usize) -> TenantPool {
    TenantPool::new(PoolSettings {
        main_db_path: root.join("main.db"),
        tenant_root: root.join("projects"),
        runtime: DbRuntimeSettings::default(),
        max_open_tenants,
    })
}

fn pool_with_timeout(root: &Path, busy_timeout_ms: u64) -> TenantPool {
    TenantPool::new(PoolSettings {
        main_db_path: root.join("main.db"),
        tenant_root: root.join("projects"),
        runtime: DbRuntimeSettings {
            busy_timeout_ms,
            ..DbRuntimeSettings::default()
        },
        max_open_tenants: 8,
    })
}

fn sidecar(db: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = db.as_os_str().to_owned();
    name.push(suffix);
    name.into()
}

#[test]
fn main_handle_is_a_singleton_with_main_schema() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = pool_in(dir.path(), 8);

    let first = pool.main_handle().expect("main should open");
    let second = pool.main_handle().expect("main should open again");
    assert!(Arc::ptr_eq(&first, &second));
    assert!(dir.path().join("main.db").exists());

    let result = first
        .execute(
            "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name IN ($1, $2, $3)",
            &["admin_users".into(), "projects".into(), "sessions".into()],
        )
        .expect("should query");
    assert_eq!(result.rows[0]["n"], json!(3));
}

#[test]
fn tenant_handle_creates_directory_layout() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = pool_in(dir.path(), 8);

    let handle = pool.tenant_handle("tenant-layout").expect("tenant should open");
    let tenant_dir = dir.path().join("projects").join("tenant-layout");
    assert!(tenant_dir.join(TENANT_DB_FILE).exists());
    assert!(tenant_dir.join(TENANT_FILES_DIR).is_dir());
    assert!(handle.was_created());
    assert_eq!(handle.tenant_id(), Some("tenant-layout"));
    assert!(pool.is_open("tenant-layout"));
}

#[test]
fn concurrent_first_access_opens_a_single_handle() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = pool_in(dir.path(), 8);

    let handles: Vec<_> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..16)
            .map(|_| scope.spawn(|| pool.tenant_handle("tenant-race")))
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("worker should not panic").expect("should open"))
            .collect()
    });

    for handle in &handles[1..] {
        assert!(Arc::ptr_eq(&handles[0], handle), "all callers share one handle");
    }
    let stats = pool.stats();
    assert_eq!(stats.open_tenants, 1);
    assert_eq!(stats.tenants_opened, 1, "exactly one physical open");

    let entries: Vec<_> = std::fs::read_dir(dir.path().join("projects"))
        .expect("tenant root should exist")
        .collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn invalid_tenant_ids_are_rejected() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = pool_in(dir.path(), 8);

    let too_long = "x".repeat(129);
    for bad in ["", "../escape", "a/b", "with space", too_long.as_str()] {
        let err = pool.tenant_handle(bad).expect_err("should reject");
        assert!(matches!(err, DbError::InvalidTenantId(_)), "{bad:?}: {err:?}");
    }
}

#[test]
fn unavailable_directory_is_reported() {
    let dir = tempfile::tempdir().expect("temp dir");
    // A regular file where the tenant root should be.
    let root = dir.path().join("not-a-dir");
    std::fs::write(&root, b"occupied").expect("write blocker");

    let pool = TenantPool::new(PoolSettings {
        main_db_path: dir.path().join("main.db"),
        tenant_root: root,
        runtime: DbRuntimeSettings::default(),
        max_open_tenants: 8,
    });
    let err = pool.tenant_handle("tenant-blocked").expect_err("should fail");
    assert!(matches!(err, DbError::TenantUnavailable { .. }), "{err:?}");
    assert!(!pool.is_open("tenant-blocked"));
}

#[test]
fn close_tenant_is_a_noop_for_unknown_tenants() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = pool_in(dir.path(), 8);
    pool.close_tenant("never-opened").expect("nothing to close");
    assert_eq!(pool.stats().open_tenants, 0);
}

#[test]
fn close_tenant_checkpoints_and_removes_sidecars() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = pool_in(dir.path(), 8);

    let handle = pool.tenant_handle("tenant-close").expect("tenant should open");
    handle
        .execute(
            "INSERT INTO folders (id, tenant_id, name, path) VALUES ($1, $2, $3, $4)",
            &["f1".into(), "tenant-close".into(), "docs".into(), "/docs".into()],
        )
        .expect("insert should succeed");
    let db_path = handle.path().to_path_buf();
    drop(handle);

    pool.close_tenant("tenant-close").expect("close should succeed");
    assert!(!pool.is_open("tenant-close"));
    assert!(!sidecar(&db_path, "-wal").exists(), "wal sidecar removed");
    assert!(!sidecar(&db_path, "-shm").exists(), "shm sidecar removed");

    // Data survives the close.
    let reopened = pool.tenant_handle("tenant-close").expect("tenant should reopen");
    assert!(!reopened.was_created());
    let result = reopened
        .execute("SELECT name FROM folders WHERE id = $1", &["f1".into()])
        .expect("should query");
    assert_eq!(result.rows[0]["name"], json!("docs"));
}

#[test]
fn least_recently_used_tenant_is_evicted() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = pool_in(dir.path(), 2);

    drop(pool.tenant_handle("tenant-a").expect("open a"));
    drop(pool.tenant_handle("tenant-b").expect("open b"));
    // Touch a so that b becomes the least recently used.
    drop(pool.tenant_handle("tenant-a").expect("touch a"));
    drop(pool.tenant_handle("tenant-c").expect("open c"));

    assert_eq!(pool.tenant_ids(), vec!["tenant-a", "tenant-c"]);
    assert_eq!(pool.open_tenant_count(), 2);
    let stats = pool.stats();
    assert_eq!(stats.tenants_evicted, 1);
    assert_eq!(stats.open_tenants, 2);

    // The evicted tenant reopens transparently.
    let b = pool.tenant_handle("tenant-b").expect("reopen b");
    assert!(!b.was_created());
}

#[test]
fn handles_in_use_survive_eviction() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = pool_in(dir.path(), 1);

    let a1 = pool.tenant_handle("tenant-a").expect("open a");
    let b = pool.tenant_handle("tenant-b").expect("open b");
    let a2 = pool.tenant_handle("tenant-a").expect("a again");
    assert!(Arc::ptr_eq(&a1, &a2), "one live handle per tenant");
    assert_eq!(pool.stats().tenants_evicted, 0);
    assert_eq!(pool.open_tenant_count(), 2, "cache runs over while both are busy");
    assert_eq!(pool.stats().tenants_opened, 2);

    drop((a1, a2, b));
    drop(pool.tenant_handle("tenant-c").expect("open c"));
    assert_eq!(pool.tenant_ids(), vec!["tenant-c"]);
    assert_eq!(pool.stats().tenants_evicted, 2);
}

#[test]
fn delete_tenant_waits_for_running_users() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = pool_in(dir.path(), 8);

    let handle = pool.tenant_handle("tenant-busy").expect("tenant should open");
    let tenant_dir = pool.tenant_dir("tenant-busy");
    let started = Instant::now();
    std::thread::scope(|scope| {
        scope.spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            handle
                .execute(
                    "INSERT INTO folders (id, tenant_id, name, path) VALUES ($1, $2, $3, $4)",
                    &["f1".into(), "tenant-busy".into(), "late".into(), "/late".into()],
                )
                .expect("write while delete waits");
        });
        pool.delete_tenant("tenant-busy").expect("delete should succeed");
    });

    assert!(started.elapsed() >= Duration::from_millis(100), "delete waited");
    assert!(!tenant_dir.exists());
    assert!(!pool.is_open("tenant-busy"));
}

#[test]
fn close_gives_up_on_a_handle_held_past_the_busy_timeout() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = pool_with_timeout(dir.path(), 50);

    let held = pool.tenant_handle("tenant-held").expect("tenant should open");
    let err = pool.close_tenant("tenant-held").expect_err("handle is held");
    assert!(matches!(err, DbError::TenantBusy(_)), "{err:?}");
    assert!(pool.is_open("tenant-held"));

    let again = pool.tenant_handle("tenant-held").expect("still served");
    assert!(Arc::ptr_eq(&held, &again));
    let err = pool.delete_tenant("tenant-held").expect_err("handle is held");
    assert!(matches!(err, DbError::TenantBusy(_)), "{err:?}");
    assert!(pool.tenant_dir("tenant-held").exists());

    drop((held, again));
    pool.delete_tenant("tenant-held").expect("delete after release");
    assert!(!pool.tenant_dir("tenant-held").exists());
}

#[test]
fn delete_tenant_removes_directory() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = pool_in(dir.path(), 8);

    drop(pool.tenant_handle("tenant-gone").expect("tenant should open"));
    let tenant_dir = pool.tenant_dir("tenant-gone");
    assert!(tenant_dir.exists());

    pool.delete_tenant("tenant-gone").expect("delete should succeed");
    assert!(!tenant_dir.exists());
    assert!(!pool.is_open("tenant-gone"));

    // Deleting again is fine.
    pool.delete_tenant("tenant-gone").expect("second delete is a no-op");
}

#[test]
fn structured_values_round_trip_through_allow_listed_columns() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = pool_in(dir.path(), 8);
    let handle = pool.tenant_handle("tenant-json").expect("tenant should open");

    let permissions = json!(["read", "write"]);
    let metadata = json!({"department": "sales", "tags": ["a", "b"], "level": 3});
    handle
        .execute(
            "INSERT INTO project_users (id, tenant_id, username, email, permissions, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                "u1".into(),
                "tenant-json".into(),
                "ada".into(),
                "ada@example.com".into(),
                SqlValue::Json(permissions.clone()),
                SqlValue::Json(metadata.clone()),
            ],
        )
        .expect("insert should succeed");

    let result = handle
        .execute(
            "SELECT username, permissions, metadata FROM project_users WHERE id = $1",
            &["u1".into()],
        )
        .expect("select should succeed");
    assert_eq!(result.row_count, 1);
    let row = &result.rows[0];
    assert_eq!(row["permissions"], permissions);
    assert_eq!(row["metadata"], metadata);
    assert_eq!(row["username"], json!("ada"));
}

#[test]
fn close_all_releases_everything() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = pool_in(dir.path(), 8);

    drop(pool.main_handle().expect("main"));
    drop(pool.tenant_handle("tenant-one").expect("one"));
    drop(pool.tenant_handle("tenant-two").expect("two"));

    pool.close_all();
    let stats = pool.stats();
    assert_eq!(stats.open_tenants, 0);
    assert!(!stats.main_open);
}
