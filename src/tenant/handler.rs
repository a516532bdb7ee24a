//! Per-tenant request handling.
//!
//! A [`RequestHandler`] turns protocol requests into store calls. The
//! lifecycle manager only builds and closes handlers; it never looks inside
//! requests.

use crate::error::{Error, Result};
use crate::model::{ContextInput, ProjectInput, SearchOptions, SystemInput};
use crate::storage::Store;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// JSON-RPC "parse error".
pub const PARSE_ERROR: i32 = -32700;

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i32 = -32601;

/// One protocol request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Value::Null,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Result or error for one request, echoing its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: Value, error: &Error) -> Self {
        let mut structured = error.to_structured_json();
        Self {
            id,
            result: None,
            error: Some(ResponseError {
                code: error.error_code().rpc_code(),
                message: error.to_string(),
                data: structured["data"].take(),
            }),
        }
    }

    #[must_use]
    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self {
            id,
            result: None,
            error: Some(ResponseError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {method}"),
                data: Value::Null,
            }),
        }
    }

    #[must_use]
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            id: Value::Null,
            result: None,
            error: Some(ResponseError {
                code: PARSE_ERROR,
                message: message.into(),
                data: Value::Null,
            }),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, request: Request) -> Response;

    /// Release the handler's resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListProjectsParams {
    include_archived: bool,
}

#[derive(Debug, Deserialize)]
struct ProjectContextParams {
    name: String,
    #[serde(default)]
    system_specific: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    name: String,
    status: String,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SharedParams {
    #[serde(rename = "type")]
    entry_type: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RecentParams {
    since: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct HostnameParams {
    hostname: String,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    entity_type: String,
    entity_id: String,
    #[serde(default)]
    limit: Option<u32>,
}

fn params<T: DeserializeOwned>(method: &str, raw: Value) -> Result<T> {
    let raw = if raw.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        raw
    };
    serde_json::from_value(raw)
        .map_err(|e| Error::Validation(format!("invalid params for {method}: {e}")))
}

fn to_value<T: Serialize>(value: &T) -> Result<Option<Value>> {
    Ok(Some(serde_json::to_value(value)?))
}

/// Serves store operations for one tenant.
#[derive(Debug)]
pub struct ContextHandler {
    store: Store,
}

impl ContextHandler {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// `Ok(None)` means the method is unknown.
    async fn dispatch(&self, method: &str, raw: Value) -> Result<Option<Value>> {
        let store = &self.store;
        match method {
            "upsert_project" => {
                to_value(&store.upsert_project(params::<ProjectInput>(method, raw)?).await?)
            }
            "get_project" => {
                let p: NameParams = params(method, raw)?;
                let project = store
                    .get_project(&p.name)
                    .await?
                    .ok_or_else(|| Error::NotFound {
                        entity: "project",
                        id: p.name.clone(),
                    })?;
                to_value(&project)
            }
            "list_projects" => {
                let p: ListProjectsParams = params(method, raw)?;
                to_value(&store.list_projects(p.include_archived).await?)
            }
            "update_project_status" => {
                let p: StatusParams = params(method, raw)?;
                to_value(
                    &store
                        .update_project_status(&p.name, &p.status, p.note.as_deref())
                        .await?,
                )
            }
            "get_project_context" => {
                let p: ProjectContextParams = params(method, raw)?;
                to_value(&store.get_project_context(&p.name, p.system_specific).await?)
            }
            "store_context" => {
                to_value(&store.store_context(params::<ContextInput>(method, raw)?).await?)
            }
            "search_context" => {
                to_value(&store.search_context(params::<SearchOptions>(method, raw)?).await?)
            }
            "get_shared_context" => {
                let p: SharedParams = params(method, raw)?;
                to_value(&store.get_shared_context(p.entry_type.as_deref(), p.limit).await?)
            }
            "get_recent_updates" => {
                let p: RecentParams = params(method, raw)?;
                to_value(&store.get_recent_updates(p.since.as_deref(), p.limit).await?)
            }
            "register_system" => {
                to_value(&store.register_system(params::<SystemInput>(method, raw)?).await?)
            }
            "get_current_system" => to_value(&store.get_current_system().await?),
            "set_current_system" => {
                let p: HostnameParams = params(method, raw)?;
                to_value(&store.set_current_system(&p.hostname).await?)
            }
            "list_systems" => to_value(&store.list_systems().await?),
            "get_migration_status" => to_value(&store.get_migration_status().await?),
            "get_history" => {
                let p: HistoryParams = params(method, raw)?;
                to_value(&store.get_history(&p.entity_type, &p.entity_id, p.limit).await?)
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl RequestHandler for ContextHandler {
    async fn handle_request(&self, request: Request) -> Response {
        let Request { id, method, params } = request;
        debug!(method = %method, "Handling request");

        match self.dispatch(&method, params).await {
            Ok(Some(result)) => Response::success(id, result),
            Ok(None) => Response::method_not_found(id, &method),
            Err(e) => {
                debug!(method = %method, error = %e, "Request failed");
                Response::failure(id, &e)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}
