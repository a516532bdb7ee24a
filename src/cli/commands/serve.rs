//! Serve command: newline-delimited JSON requests on stdin.
//!
//! Each line is a request envelope:
//!
//! ```json
//! {"tenant": "t1", "id": 1, "method": "list_projects", "params": {}}
//! ```
//!
//! Lines without a `tenant` are admin requests (`create_tenant`,
//! `delete_tenant`, `suspend_tenant`, `list_tenants`). One response line is
//! written per request, in order.

use crate::cli::ServeArgs;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::tenant::{
    CreateTenantOptions, MemoryAuthenticator, Request, RequestHandler, Response, TenantManager,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    tenant: Option<String>,
    #[serde(flatten)]
    request: Request,
}

#[derive(Debug, Deserialize)]
struct TenantIdParams {
    tenant_id: String,
}

/// Execute the serve command until stdin closes.
///
/// # Errors
///
/// Returns an error if no data directory can be resolved, the runtime
/// cannot start, or stdout cannot be written.
pub fn execute(args: &ServeArgs) -> Result<()> {
    let mut config = ManagerConfig::from_env(args.data_dir.as_deref()).ok_or_else(|| {
        Error::Config("no data directory: pass --data-dir or set CTXHUB_DATA_DIR".to_string())
    })?;
    config.idle_timeout = Duration::from_secs(args.idle_timeout_secs);
    config.sweep_interval = Duration::from_secs(args.sweep_interval_secs.max(1));
    config.store.backup_dir.clone_from(&args.backup_dir);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: ManagerConfig) -> Result<()> {
    info!(data_root = %config.data_root.display(), "Serving tenants");
    let manager = Arc::new(TenantManager::new(
        config,
        Arc::new(MemoryAuthenticator::new()),
    ));
    let reaper = manager.spawn_reaper();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let outcome = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(Error::Io(e)),
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = respond(&manager, &line).await;
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        if let Err(e) = stdout.write_all(&out).await {
            break Err(Error::Io(e));
        }
        if let Err(e) = stdout.flush().await {
            break Err(Error::Io(e));
        }
    };

    reaper.stop().await;
    manager.shutdown().await;
    outcome
}

async fn respond(manager: &TenantManager, line: &str) -> Response {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => return Response::parse_error(format!("Parse error: {e}")),
    };

    let Some(tenant_id) = envelope.tenant else {
        return admin(manager, envelope.request).await;
    };

    let id = envelope.request.id.clone();
    match manager.get_tenant_server(&tenant_id).await {
        Ok(Some(handler)) => handler.handle_request(envelope.request).await,
        Ok(None) => {
            debug!(tenant_id = %tenant_id, "Request for unknown tenant");
            Response::failure(id, &Error::TenantNotFound { tenant_id })
        }
        Err(e) => Response::failure(id, &e),
    }
}

async fn admin(manager: &TenantManager, request: Request) -> Response {
    let Request { id, method, params } = request;
    match admin_call(manager, &method, params).await {
        Ok(Some(result)) => Response::success(id, result),
        Ok(None) => Response::method_not_found(id, &method),
        Err(e) => Response::failure(id, &e),
    }
}

fn tenant_id_param(method: &str, params: Value) -> Result<String> {
    serde_json::from_value::<TenantIdParams>(params)
        .map(|p| p.tenant_id)
        .map_err(|e| Error::Validation(format!("invalid params for {method}: {e}")))
}

async fn admin_call(manager: &TenantManager, method: &str, params: Value) -> Result<Option<Value>> {
    match method {
        "create_tenant" => {
            let options: CreateTenantOptions = if params.is_null() {
                CreateTenantOptions::default()
            } else {
                serde_json::from_value(params)
                    .map_err(|e| Error::Validation(format!("invalid params for {method}: {e}")))?
            };
            Ok(Some(serde_json::to_value(manager.create_tenant(options).await?)?))
        }
        "delete_tenant" => {
            manager.delete_tenant(&tenant_id_param(method, params)?).await?;
            Ok(Some(serde_json::json!({ "deleted": true })))
        }
        "suspend_tenant" => {
            manager.suspend_tenant(&tenant_id_param(method, params)?).await?;
            Ok(Some(serde_json::json!({ "suspended": true })))
        }
        "list_tenants" => Ok(Some(serde_json::to_value(manager.list_tenants().await?)?)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> TenantManager {
        TenantManager::new(
            ManagerConfig::new(dir.path()),
            Arc::new(MemoryAuthenticator::new()),
        )
    }

    #[tokio::test]
    async fn test_admin_then_tenant_request() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let created = respond(
            &manager,
            r#"{"id": 1, "method": "create_tenant", "params": {"tenant_id": "t1"}}"#,
        )
        .await;
        assert!(created.is_success());
        assert_eq!(created.result.unwrap()["tenant_id"], "t1");

        let upserted = respond(
            &manager,
            r#"{"tenant": "t1", "id": 2, "method": "upsert_project", "params": {"name": "demo"}}"#,
        )
        .await;
        assert_eq!(upserted.id, json!(2));
        assert!(upserted.is_success(), "{:?}", upserted.error);

        let listed = respond(&manager, r#"{"id": 3, "method": "list_tenants"}"#).await;
        let tenants = listed.result.unwrap();
        assert_eq!(tenants[0]["tenant_id"], "t1");
        assert_eq!(tenants[0]["instance_active"], true);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_lines_and_unknown_tenants() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let garbage = respond(&manager, "{not json").await;
        assert_eq!(garbage.error.unwrap().code, crate::tenant::handler::PARSE_ERROR);

        let unknown = respond(
            &manager,
            r#"{"tenant": "ghost", "id": 9, "method": "list_projects"}"#,
        )
        .await;
        assert_eq!(unknown.id, json!(9));
        assert_eq!(unknown.error.unwrap().data["kind"], "TENANT_NOT_FOUND");

        let missing = respond(&manager, r#"{"method": "delete_tenant", "params": {}}"#).await;
        assert_eq!(missing.error.unwrap().code, -32602);
    }
}
