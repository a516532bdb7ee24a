//! Multi-tenant serving.
//!
//! - [`auth`] - Tenant identity, credentials and status
//! - [`handler`] - Request dispatch onto one tenant's store
//! - [`manager`] - Lazy instance lifecycle, eviction and shutdown

pub mod auth;
pub mod handler;
pub mod manager;

pub use auth::{
    AuthContext, Authenticator, CreateTenantOptions, MemoryAuthenticator, TenantCredentials,
    TenantInfo, TenantStatus,
};
pub use handler::{ContextHandler, Request, RequestHandler, Response, ResponseError};
pub use manager::{ReaperHandle, TenantManager, TenantSummary};
