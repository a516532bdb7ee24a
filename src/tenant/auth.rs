//! Tenant identity and credentials.
//!
//! The lifecycle manager treats an [`Authenticator`] as the source of truth
//! for who exists and who is active. [`MemoryAuthenticator`] keeps that
//! state in process, storing only SHA-256 digests of issued API keys.

use crate::error::{Error, Result};
use crate::validate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

const API_KEY_PREFIX: &str = "ctx_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Deleted,
}

impl TenantStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Deleted => "deleted",
        }
    }
}

/// What the authenticator knows about a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantInfo {
    pub tenant_id: String,
    pub status: TenantStatus,
    /// Unix milliseconds
    pub created_at: i64,
    pub last_used: Option<i64>,
    pub permissions: Vec<String>,
}

/// Result of a successful key check.
#[derive(Debug, Clone, Serialize)]
pub struct AuthContext {
    pub tenant_id: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateTenantOptions {
    /// Generated when absent.
    pub tenant_id: Option<String>,
    pub permissions: Option<Vec<String>>,
}

impl CreateTenantOptions {
    #[must_use]
    pub fn with_id(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            permissions: None,
        }
    }
}

/// Issued once at creation; the plaintext key is never stored.
#[derive(Debug, Clone, Serialize)]
pub struct TenantCredentials {
    pub tenant_id: String,
    pub api_key: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve an API key to its tenant.
    async fn authenticate(&self, api_key: &str) -> Result<AuthContext>;

    /// Tenant record, `None` if unknown.
    async fn get_tenant_info(&self, tenant_id: &str) -> Result<Option<TenantInfo>>;

    async fn create_tenant(&self, options: CreateTenantOptions) -> Result<TenantCredentials>;

    async fn delete_tenant(&self, tenant_id: &str) -> Result<()>;

    /// Suspend a tenant; its keys stop authenticating.
    async fn revoke_tenant(&self, tenant_id: &str) -> Result<()>;

    async fn list_tenants(&self) -> Result<Vec<TenantInfo>>;
}

#[derive(Debug)]
struct TenantRecord {
    info: TenantInfo,
    key_digest: String,
}

/// In-process authenticator.
#[derive(Debug, Default)]
pub struct MemoryAuthenticator {
    tenants: RwLock<HashMap<String, TenantRecord>>,
}

impl MemoryAuthenticator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn key_digest(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn generate_api_key() -> String {
    format!("{API_KEY_PREFIX}{}", uuid::Uuid::new_v4().simple())
}

fn generate_tenant_id() -> String {
    format!("tenant_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

#[async_trait]
impl Authenticator for MemoryAuthenticator {
    async fn authenticate(&self, api_key: &str) -> Result<AuthContext> {
        let digest = key_digest(api_key);
        let mut tenants = self.tenants.write().await;
        let record = tenants
            .values_mut()
            .find(|r| r.key_digest == digest)
            .ok_or_else(|| Error::Unauthorized("invalid API key".to_string()))?;

        if record.info.status != TenantStatus::Active {
            return Err(Error::Unauthorized(format!(
                "tenant {} is {}",
                record.info.tenant_id,
                record.info.status.as_str()
            )));
        }
        record.info.last_used = Some(chrono::Utc::now().timestamp_millis());

        Ok(AuthContext {
            tenant_id: record.info.tenant_id.clone(),
            permissions: record.info.permissions.clone(),
        })
    }

    async fn get_tenant_info(&self, tenant_id: &str) -> Result<Option<TenantInfo>> {
        Ok(self
            .tenants
            .read()
            .await
            .get(tenant_id)
            .map(|r| r.info.clone()))
    }

    async fn create_tenant(&self, options: CreateTenantOptions) -> Result<TenantCredentials> {
        let tenant_id = options.tenant_id.unwrap_or_else(generate_tenant_id);
        validate::validate_tenant_id(&tenant_id)?;

        let mut tenants = self.tenants.write().await;
        if tenants
            .get(&tenant_id)
            .is_some_and(|r| r.info.status != TenantStatus::Deleted)
        {
            return Err(Error::Validation(format!(
                "tenant '{tenant_id}' already exists"
            )));
        }

        let api_key = generate_api_key();
        tenants.insert(
            tenant_id.clone(),
            TenantRecord {
                info: TenantInfo {
                    tenant_id: tenant_id.clone(),
                    status: TenantStatus::Active,
                    created_at: chrono::Utc::now().timestamp_millis(),
                    last_used: None,
                    permissions: options
                        .permissions
                        .unwrap_or_else(|| vec!["read".to_string(), "write".to_string()]),
                },
                key_digest: key_digest(&api_key),
            },
        );
        info!(tenant_id = %tenant_id, "Registered tenant");

        Ok(TenantCredentials { tenant_id, api_key })
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<()> {
        let mut tenants = self.tenants.write().await;
        let record = tenants.get_mut(tenant_id).ok_or_else(|| Error::TenantNotFound {
            tenant_id: tenant_id.to_string(),
        })?;
        record.info.status = TenantStatus::Deleted;
        record.key_digest.clear();
        Ok(())
    }

    async fn revoke_tenant(&self, tenant_id: &str) -> Result<()> {
        let mut tenants = self.tenants.write().await;
        let record = tenants.get_mut(tenant_id).ok_or_else(|| Error::TenantNotFound {
            tenant_id: tenant_id.to_string(),
        })?;
        if record.info.status == TenantStatus::Active {
            record.info.status = TenantStatus::Suspended;
        }
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<TenantInfo>> {
        let mut tenants: Vec<TenantInfo> = self
            .tenants
            .read()
            .await
            .values()
            .map(|r| r.info.clone())
            .collect();
        tenants.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(tenants)
    }
}
