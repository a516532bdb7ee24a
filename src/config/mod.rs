//! Configuration and path resolution.
//!
//! ctxhub keeps everything under `~/.ctxhub/`:
//! - **Tenants**: one directory per tenant under `~/.ctxhub/tenants/<id>/`
//! - **Single store**: `~/.ctxhub/data/context.db` for single-tenant use
//!
//! Environment variables override the defaults; explicit paths override both.

use crate::storage::RetryPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tenant id that bypasses authentication unless overridden.
pub const DEFAULT_DEMO_TENANT: &str = "demo";

/// File name of each tenant's store inside its directory.
pub const TENANT_DB_FILE: &str = "tenant.db";

/// Settings applied to every opened store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite's own wait on a locked database before reporting busy.
    /// This wait blocks the connection, so it stays at zero and the retry
    /// policy's async backoff does the waiting.
    pub busy_timeout: Duration,
    /// Backoff for writes that still fail busy.
    pub retry: RetryPolicy,
    /// Use the backup-guarded migrator on open.
    pub safe_migrations: bool,
    /// Persist pre-migration snapshots here as well as in memory.
    pub backup_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::ZERO,
            retry: RetryPolicy::default(),
            safe_migrations: true,
            backup_dir: None,
        }
    }
}

/// Settings for the tenant lifecycle manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Parent of all tenant directories.
    pub data_root: PathBuf,
    /// Tenant id admitted without authentication; `None` disables it.
    pub demo_tenant: Option<String>,
    pub store: StoreConfig,
    /// Instances idle longer than this are reaped.
    pub idle_timeout: Duration,
    /// How often the reaper sweeps.
    pub sweep_interval: Duration,
}

impl ManagerConfig {
    /// Defaults rooted at `data_root`.
    #[must_use]
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            demo_tenant: Some(DEFAULT_DEMO_TENANT.to_string()),
            store: StoreConfig::default(),
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }

    /// Resolve the data root and demo tenant from the environment.
    ///
    /// Returns `None` when no home directory can be found and neither an
    /// explicit root nor `CTXHUB_DATA_DIR` is set.
    #[must_use]
    pub fn from_env(explicit_root: Option<&Path>) -> Option<Self> {
        let mut config = Self::new(resolve_data_root(explicit_root)?);
        config.demo_tenant = resolve_demo_tenant();
        Some(config)
    }

    /// Directory owned by one tenant.
    #[must_use]
    pub fn tenant_dir(&self, tenant_id: &str) -> PathBuf {
        self.data_root.join(tenant_id)
    }

    /// Store settings for one tenant; snapshots go to `<backup_dir>/<tenant_id>/`.
    #[must_use]
    pub fn tenant_store_config(&self, tenant_id: &str) -> StoreConfig {
        let mut config = self.store.clone();
        config.backup_dir = config.backup_dir.map(|dir| dir.join(tenant_id));
        config
    }

    /// Store file owned by one tenant.
    #[must_use]
    pub fn tenant_db_path(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join(TENANT_DB_FILE)
    }
}

/// `~/.ctxhub`, if a home directory exists.
#[must_use]
pub fn global_ctxhub_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".ctxhub"))
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

/// Resolve the tenant data root.
///
/// Priority:
/// 1. `explicit_path`
/// 2. `CTXHUB_DATA_DIR`
/// 3. `~/.ctxhub/tenants`
#[must_use]
pub fn resolve_data_root(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }
    env_path("CTXHUB_DATA_DIR").or_else(|| global_ctxhub_dir().map(|dir| dir.join("tenants")))
}

/// Resolve the single-tenant store path.
///
/// Priority:
/// 1. `explicit_path`
/// 2. `CTXHUB_DB`
/// 3. `~/.ctxhub/data/context.db`
#[must_use]
pub fn resolve_db_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }
    env_path("CTXHUB_DB")
        .or_else(|| global_ctxhub_dir().map(|dir| dir.join("data").join("context.db")))
}

/// Demo tenant id: `CTXHUB_DEMO_TENANT` if set (empty disables), else `demo`.
#[must_use]
pub fn resolve_demo_tenant() -> Option<String> {
    demo_tenant_from(std::env::var("CTXHUB_DEMO_TENANT").ok())
}

fn demo_tenant_from(value: Option<String>) -> Option<String> {
    match value {
        Some(v) if v.trim().is_empty() => None,
        Some(v) => Some(v.trim().to_string()),
        None => Some(DEFAULT_DEMO_TENANT.to_string()),
    }
}
