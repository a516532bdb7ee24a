//! Error types for ctxhub.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - JSON-RPC style numeric codes for the request handler
//! - Retryability flags for client self-correction
//! - Busy/locked classification for the store's retry policy
//! - Structured JSON output for protocol consumers

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ctxhub operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Validation
    ValidationError,
    RequiredField,

    // Not Found
    NotFound,
    TenantNotFound,

    // Database
    DatabaseError,
    StoreClosed,

    // Migration
    MigrationError,
    RollbackError,
    SchemaInvalid,

    // Tenant
    TenantUnavailable,
    Unauthorized,

    // I/O
    IoError,
    JsonError,
    ConfigError,

    // Internal
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::RequiredField => "REQUIRED_FIELD",
            Self::NotFound => "NOT_FOUND",
            Self::TenantNotFound => "TENANT_NOT_FOUND",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::StoreClosed => "STORE_CLOSED",
            Self::MigrationError => "MIGRATION_ERROR",
            Self::RollbackError => "ROLLBACK_ERROR",
            Self::SchemaInvalid => "SCHEMA_INVALID",
            Self::TenantUnavailable => "TENANT_UNAVAILABLE",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::ConfigError => "CONFIG_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Numeric code used in handler responses.
    ///
    /// Client errors reuse the JSON-RPC reserved range; server-side
    /// faults use the 1000+ application range.
    #[must_use]
    pub const fn rpc_code(&self) -> i32 {
        match self {
            Self::ValidationError | Self::RequiredField => -32602,
            Self::JsonError => -32700,
            Self::InternalError => -32603,
            Self::NotFound => 1001,
            Self::DatabaseError | Self::StoreClosed => 1003,
            Self::MigrationError | Self::RollbackError | Self::SchemaInvalid => 1004,
            Self::TenantNotFound | Self::TenantUnavailable => 1005,
            Self::Unauthorized => 1006,
            Self::IoError | Self::ConfigError => 1007,
        }
    }

    /// Whether a client should retry, possibly with corrected input.
    ///
    /// True for validation errors and transient database faults.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ValidationError
                | Self::RequiredField
                | Self::DatabaseError
                | Self::TenantUnavailable
        )
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in ctxhub operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Required field missing: {0}")]
    RequiredField(&'static str),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database error in {operation}: {source}")]
    DatabaseOperation {
        operation: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database error in {operation}: still busy after {attempts} attempts")]
    RetryExhausted { operation: String, attempts: u32 },

    #[error("Store is closed")]
    Closed,

    #[error("Migration {version} failed ({name}): {reason}")]
    MigrationFailed {
        version: u32,
        name: String,
        reason: String,
    },

    #[error("Rollback of migration {version} failed: {reason}")]
    RollbackFailed { version: u32, reason: String },

    #[error("Rollback of migration {version} failed: {name} is not reversible")]
    IrreversibleMigration { version: u32, name: String },

    #[error("Cannot rollback to version {target}: current version is {current}")]
    InvalidRollbackTarget { target: u32, current: u32 },

    #[error("Cannot rollback: dependent migrations exist (version {version} is required by {dependents:?})")]
    DependentMigrations { version: u32, dependents: Vec<u32> },

    #[error("Duplicate migration version: {version}")]
    DuplicateMigration { version: u32 },

    #[error("Schema validation failed: {}", .0.join("; "))]
    SchemaValidation(Vec<String>),

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("Tenant not found: {tenant_id}")]
    TenantNotFound { tenant_id: String },

    #[error("Tenant server unavailable for {tenant_id}: {reason}")]
    TenantUnavailable { tenant_id: String, reason: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("IO error at {}: {source}", path.display())]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::RequiredField(_) => ErrorCode::RequiredField,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Database(_) | Self::DatabaseOperation { .. } | Self::RetryExhausted { .. } => {
                ErrorCode::DatabaseError
            }
            Self::Closed => ErrorCode::StoreClosed,
            Self::MigrationFailed { .. } | Self::DuplicateMigration { .. } | Self::Backup(_) => {
                ErrorCode::MigrationError
            }
            Self::RollbackFailed { .. }
            | Self::IrreversibleMigration { .. }
            | Self::InvalidRollbackTarget { .. }
            | Self::DependentMigrations { .. } => ErrorCode::RollbackError,
            Self::SchemaValidation(_) => ErrorCode::SchemaInvalid,
            Self::TenantNotFound { .. } => ErrorCode::TenantNotFound,
            Self::TenantUnavailable { .. } => ErrorCode::TenantUnavailable,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::PathIo { .. } | Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Whether this is a "database busy/locked" condition worth retrying.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Database(e) | Self::DatabaseOperation { source: e, .. } => is_busy_sqlite(e),
            _ => false,
        }
    }

    /// Attach the failing operation name to a raw storage fault.
    ///
    /// Validation, not-found and already-annotated errors pass through untouched.
    #[must_use]
    pub fn in_operation(self, operation: &str) -> Self {
        match self {
            Self::Database(source) => Self::DatabaseOperation {
                operation: operation.to_string(),
                source,
            },
            other => other,
        }
    }

    /// Context-aware recovery hint.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Validation(msg) => {
                if msg.contains("status") {
                    Some("Valid statuses: active, paused, completed, archived".to_string())
                } else if msg.contains("type") {
                    Some(
                        "Valid types: decision, code, standard, status, todo, note, config, issue, reference"
                            .to_string(),
                    )
                } else if msg.contains("tag") {
                    Some(
                        "Tags: at most 50, each at most 100 chars of letters, digits, '_', '-', '.', spaces"
                            .to_string(),
                    )
                } else {
                    None
                }
            }
            Self::RetryExhausted { .. } => {
                Some("The store is under heavy write contention; retry later.".to_string())
            }
            Self::DependentMigrations { .. } => Some(
                "Roll back the dependent migrations first, one version at a time.".to_string(),
            ),
            Self::TenantUnavailable { .. } => {
                Some("Check the tenant's data directory and logs.".to_string())
            }
            _ => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "code": code.rpc_code(),
            "message": self.to_string(),
            "data": {
                "kind": code.as_str(),
                "retryable": code.is_retryable(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["data"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}

fn is_busy_sqlite(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked
    )
}
