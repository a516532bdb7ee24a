//! Tenant instance lifecycle.
//!
//! Each tenant id maps to a slot. A short std mutex guards the slot map;
//! each slot owns an async mutex around the tenant's live instance, so
//! materialize, evict, suspend and delete for one tenant are serialized
//! without ever blocking unrelated tenants.
//!
//! A slot is only authoritative while it is registered in the map. Empty
//! slots are removed under their own lock, so a task that was waiting on a
//! removed slot re-checks registration and starts over with a fresh one.

use super::auth::{Authenticator, CreateTenantOptions, TenantCredentials, TenantInfo, TenantStatus};
use super::handler::{ContextHandler, RequestHandler};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::storage::Store;
use crate::validate;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// A live store and handler for one tenant.
#[derive(Debug)]
struct TenantInstance {
    handler: Arc<ContextHandler>,
    last_used: Instant,
}

impl TenantInstance {
    fn touch(&mut self) -> Arc<ContextHandler> {
        self.last_used = Instant::now();
        Arc::clone(&self.handler)
    }

    async fn close(self, tenant_id: &str) {
        if let Err(e) = self.handler.close().await {
            error!(tenant_id, error = %e, "Failed to close tenant instance");
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    instance: tokio::sync::Mutex<Option<TenantInstance>>,
}

/// Authenticator record plus whether an instance is live.
#[derive(Debug, Clone, Serialize)]
pub struct TenantSummary {
    #[serde(flatten)]
    pub info: TenantInfo,
    pub instance_active: bool,
}

/// Owns every tenant's live instance.
pub struct TenantManager {
    config: ManagerConfig,
    auth: Arc<dyn Authenticator>,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for TenantManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TenantManager {
    #[must_use]
    pub fn new(config: ManagerConfig, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            config,
            auth,
            slots: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn existing_slot(&self, tenant_id: &str) -> Option<Arc<Slot>> {
        self.lock_slots().get(tenant_id).cloned()
    }

    fn slot(&self, tenant_id: &str) -> Arc<Slot> {
        Arc::clone(self.lock_slots().entry(tenant_id.to_string()).or_default())
    }

    fn is_registered(&self, tenant_id: &str, slot: &Arc<Slot>) -> bool {
        self.lock_slots()
            .get(tenant_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Drop `slot` from the map if it is still the registered one.
    /// Callers hold the slot lock and have left it empty.
    fn remove_slot(&self, tenant_id: &str, slot: &Arc<Slot>) {
        let mut slots = self.lock_slots();
        if slots
            .get(tenant_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(tenant_id);
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn all_slots(&self) -> Vec<(String, Arc<Slot>)> {
        self.lock_slots()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect()
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        // The map holds no invariants a panicking holder could break.
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn is_demo(&self, tenant_id: &str) -> bool {
        self.config.demo_tenant.as_deref() == Some(tenant_id)
    }

    async fn is_admitted(&self, tenant_id: &str) -> Result<bool> {
        if self.is_demo(tenant_id) {
            return Ok(true);
        }
        Ok(self
            .auth
            .get_tenant_info(tenant_id)
            .await?
            .is_some_and(|info| info.status == TenantStatus::Active))
    }

    /// The tenant's handler, materializing it on first use.
    ///
    /// Returns `Ok(None)`, with no side effects, for unknown or inactive
    /// tenants.
    ///
    /// # Errors
    ///
    /// Returns `Error::TenantUnavailable` if the store cannot be opened or
    /// the manager has shut down, or the authenticator's error.
    pub async fn get_tenant_server(&self, tenant_id: &str) -> Result<Option<Arc<ContextHandler>>> {
        if validate::validate_tenant_id(tenant_id).is_err() {
            debug!(tenant_id, "Rejected malformed tenant id");
            return Ok(None);
        }

        if let Some(slot) = self.existing_slot(tenant_id) {
            if let Some(instance) = slot.instance.lock().await.as_mut() {
                return Ok(Some(instance.touch()));
            }
        }

        if !self.is_admitted(tenant_id).await? {
            debug!(tenant_id, "Tenant unknown or inactive");
            return Ok(None);
        }

        loop {
            if self.is_shutting_down() {
                return Err(self.shut_down_error(tenant_id));
            }
            let slot = self.slot(tenant_id);
            let mut guard = slot.instance.lock().await;
            if !self.is_registered(tenant_id, &slot) {
                continue;
            }
            if self.is_shutting_down() {
                self.remove_slot(tenant_id, &slot);
                return Err(self.shut_down_error(tenant_id));
            }
            if let Some(instance) = guard.as_mut() {
                return Ok(Some(instance.touch()));
            }
            // Suspend or delete may have won the slot while we waited.
            if !self.is_admitted(tenant_id).await? {
                self.remove_slot(tenant_id, &slot);
                return Ok(None);
            }

            let handler = match self.materialize(tenant_id).await {
                Ok(handler) => Arc::new(handler),
                Err(e) => {
                    self.remove_slot(tenant_id, &slot);
                    return Err(e);
                }
            };
            *guard = Some(TenantInstance {
                handler: Arc::clone(&handler),
                last_used: Instant::now(),
            });
            info!(tenant_id, "Materialized tenant instance");
            return Ok(Some(handler));
        }
    }

    fn shut_down_error(&self, tenant_id: &str) -> Error {
        debug!(tenant_id, "Rejected request after shutdown");
        Error::TenantUnavailable {
            tenant_id: tenant_id.to_string(),
            reason: "tenant manager is shut down".to_string(),
        }
    }

    async fn materialize(&self, tenant_id: &str) -> Result<ContextHandler> {
        let path = self.config.tenant_db_path(tenant_id);
        match Store::open(&path, self.config.tenant_store_config(tenant_id)).await {
            Ok(store) => Ok(ContextHandler::new(store)),
            Err(e) => {
                error!(tenant_id, path = %path.display(), error = %e, "Tenant store failed to open");
                Err(Error::TenantUnavailable {
                    tenant_id: tenant_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Register a tenant and create its data directory.
    ///
    /// The store itself is created lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns the authenticator's error, or `Error::PathIo` if the
    /// directory cannot be created.
    pub async fn create_tenant(&self, options: CreateTenantOptions) -> Result<TenantCredentials> {
        let credentials = self.auth.create_tenant(options).await?;
        let dir = self.config.tenant_dir(&credentials.tenant_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| Error::PathIo { path: dir, source })?;
        info!(tenant_id = %credentials.tenant_id, "Created tenant");
        Ok(credentials)
    }

    /// Close the live instance, then mark the tenant deleted.
    ///
    /// On-disk data is kept.
    ///
    /// # Errors
    ///
    /// Returns the authenticator's error (e.g. `Error::TenantNotFound`).
    pub async fn delete_tenant(&self, tenant_id: &str) -> Result<()> {
        self.evict_then(tenant_id, "delete", self.auth.delete_tenant(tenant_id))
            .await
    }

    /// Close the live instance, then revoke the tenant's access.
    ///
    /// # Errors
    ///
    /// Returns the authenticator's error (e.g. `Error::TenantNotFound`).
    pub async fn suspend_tenant(&self, tenant_id: &str) -> Result<()> {
        self.evict_then(tenant_id, "suspend", self.auth.revoke_tenant(tenant_id))
            .await
    }

    /// Evict under the slot lock and run `update` before releasing it, so no
    /// request can see the tenant's new status with a live instance.
    ///
    /// The slot is taken (not just looked up) so an in-flight materialize
    /// finishes first; it is removed again before the lock is released.
    async fn evict_then<F>(&self, tenant_id: &str, reason: &str, update: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        let slot = self.slot(tenant_id);
        let mut guard = slot.instance.lock().await;
        if let Some(instance) = guard.take() {
            instance.close(tenant_id).await;
            info!(tenant_id, reason, "Evicted tenant instance");
        }
        let result = update.await;
        self.remove_slot(tenant_id, &slot);
        drop(guard);
        result
    }

    /// Authenticator records annotated with instance liveness.
    ///
    /// # Errors
    ///
    /// Returns the authenticator's error.
    pub async fn list_tenants(&self) -> Result<Vec<TenantSummary>> {
        let tenants = self.auth.list_tenants().await?;
        let mut out = Vec::with_capacity(tenants.len());
        for info in tenants {
            let mut instance_active = false;
            if let Some(slot) = self.existing_slot(&info.tenant_id) {
                instance_active = slot.instance.lock().await.is_some();
            }
            out.push(TenantSummary {
                info,
                instance_active,
            });
        }
        Ok(out)
    }

    /// Tenants the authenticator considers active.
    ///
    /// # Errors
    ///
    /// Returns the authenticator's error.
    pub async fn get_active_tenant_count(&self) -> Result<usize> {
        Ok(self
            .auth
            .list_tenants()
            .await?
            .iter()
            .filter(|t| t.status == TenantStatus::Active)
            .count())
    }

    /// Live instances in this process.
    pub async fn get_active_instance_count(&self) -> usize {
        let mut count = 0;
        for (_, slot) in self.all_slots() {
            if slot.instance.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Close instances unused for longer than `max_idle` and drop empty
    /// slots.
    ///
    /// Durable data and authenticator records are untouched. Returns the
    /// number of instances evicted.
    pub async fn cleanup_inactive_instances(&self, max_idle: Duration) -> usize {
        let mut evicted = 0;
        for (tenant_id, slot) in self.all_slots() {
            let mut guard = slot.instance.lock().await;
            let idle = guard
                .as_ref()
                .is_some_and(|instance| instance.last_used.elapsed() > max_idle);
            if idle {
                if let Some(instance) = guard.take() {
                    instance.close(&tenant_id).await;
                    info!(tenant_id = %tenant_id, "Reaped idle tenant instance");
                    evicted += 1;
                }
            }
            if guard.is_none() {
                self.remove_slot(&tenant_id, &slot);
            }
        }
        if evicted > 0 {
            debug!(evicted, "Idle sweep complete");
        }
        evicted
    }

    /// Close every live instance concurrently, then clear the registry.
    ///
    /// Later `get_tenant_server` calls fail with `Error::TenantUnavailable`.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut closing = JoinSet::new();
        for (tenant_id, slot) in self.all_slots() {
            closing.spawn(async move {
                let instance = slot.instance.lock().await.take();
                if let Some(instance) = instance {
                    instance.close(&tenant_id).await;
                }
            });
        }
        while let Some(joined) = closing.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Instance close task failed");
            }
        }
        self.lock_slots().clear();
        info!("Tenant manager shut down");
    }

    /// Sweep idle instances every `sweep_interval` until the handle is
    /// stopped or the manager is dropped.
    #[must_use]
    pub fn spawn_reaper(self: &Arc<Self>) -> ReaperHandle {
        let manager: Weak<Self> = Arc::downgrade(self);
        let every = self.config.sweep_interval;
        let max_idle = self.config.idle_timeout;
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.cleanup_inactive_instances(max_idle).await;
                    }
                }
            }
            debug!("Reaper stopped");
        });

        ReaperHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

/// Stops the idle reaper when asked or when dropped.
#[derive(Debug)]
pub struct ReaperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Reaper task failed");
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
