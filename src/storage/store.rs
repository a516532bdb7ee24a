//! The per-tenant context store.
//!
//! One SQLite file, one connection. Every call hops onto the blocking pool
//! and takes the connection mutex, so a `Store` can be shared freely across
//! tasks. Writes go through [`Store::mutate`]: an IMMEDIATE transaction that
//! also flushes the operation's history rows, re-submitted by the retry
//! policy when SQLite reports the database busy.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::model::{
    ContextEntry, ContextInput, ContextType, Project, ProjectContext, ProjectInput,
    ProjectStatus, SearchOptions, System, SystemInput,
};
use crate::storage::history::{self, Action, HistoryEntry, MutationContext};
use crate::storage::migrations::{BackupManager, MigrationStatus, Migrator, SafeMigrator};
use crate::storage::search;
use crate::validate::{self, MAX_KEY_LEN, MAX_NAME_LEN};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const DEFAULT_SEARCH_LIMIT: u32 = 20;
const MAX_SEARCH_LIMIT: u32 = 1000;
const RECENT_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

const PROJECT_COLUMNS: &str = "p.id, p.name, p.description, p.status, p.repository_url, \
     p.local_directory, p.tags, p.metadata, p.primary_system_id, p.created_at, p.updated_at, \
     p.last_accessed";

const ENTRY_COLUMNS: &str = "e.id, e.project_id, p.name, e.system_id, e.role_id, e.type, \
     e.key, e.value, e.is_system_specific, e.tags, e.metadata, e.created_at, e.updated_at";

const SYSTEM_COLUMNS: &str =
    "id, hostname, name, platform, is_current, metadata, created_at, last_seen";

/// SQLite-backed store for projects, context entries and systems.
#[derive(Debug)]
pub struct Store {
    conn: Arc<Mutex<Option<Connection>>>,
    closed: AtomicBool,
    config: StoreConfig,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (creating if needed) the store at `path` and bring its schema
    /// up to date before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or a migration fails.
    pub async fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = {
            let path = path.clone();
            let config = config.clone();
            blocking(move || open_file(&path, &config)).await?
        };
        info!(path = %path.display(), "Opened store");
        Ok(Self::from_connection(conn, config, Some(path)))
    }

    /// Open a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub async fn open_memory(config: StoreConfig) -> Result<Self> {
        let conn = {
            let config = config.clone();
            blocking(move || {
                let mut conn = Connection::open_in_memory()?;
                configure(&conn, &config)?;
                run_migrations(&mut conn, &config, None)?;
                Ok(conn)
            })
            .await?
        };
        Ok(Self::from_connection(conn, config, None))
    }

    fn from_connection(conn: Connection, config: StoreConfig, path: Option<PathBuf>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            closed: AtomicBool::new(false),
            config,
            path,
        }
    }

    /// Backing file, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let conn = Arc::clone(&self.conn);
        blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Other("store connection lock poisoned".to_string()))?;
            let conn = guard.as_mut().ok_or(Error::Closed)?;
            f(conn)
        })
        .await
    }

    /// Execute a write inside an IMMEDIATE transaction.
    ///
    /// History rows recorded on the context are written before commit. The
    /// whole closure is re-run when SQLite reports busy, so it must not
    /// carry side effects outside the transaction.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or `Error::RetryExhausted` after the
    /// retry budget is spent. The transaction is rolled back on error.
    pub async fn mutate<F, R>(&self, op: &'static str, f: F) -> Result<R>
    where
        F: Fn(&Transaction<'_>, &mut MutationContext) -> Result<R> + Send + Sync + 'static,
        R: Send + 'static,
    {
        let f = Arc::new(f);
        self.config
            .retry
            .run(op, || {
                let f = Arc::clone(&f);
                self.with_conn(move |conn| {
                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    let mut ctx = MutationContext::new(op);

                    let result = f(&tx, &mut ctx)?;

                    for entry in &ctx.entries {
                        history::insert_entry(&tx, entry)?;
                    }
                    tx.commit()?;
                    Ok(result)
                })
            })
            .await
    }

    // =================
    // Project Operations
    // =================

    /// Create a project or merge `input` into the existing one of that name.
    ///
    /// Absent fields keep their stored values.
    ///
    /// # Errors
    ///
    /// Returns `Error::RequiredField` / `Error::Validation` for bad input.
    pub async fn upsert_project(&self, input: ProjectInput) -> Result<Project> {
        validate::require("name", &input.name)?;
        let name = input.name.trim().to_string();
        validate::check_len("name", &name, MAX_NAME_LEN)?;
        let status = input
            .status
            .as_deref()
            .map(validate::normalize_project_status)
            .transpose()?
            .map(|s| s.as_str());
        let tags = input
            .tags
            .as_deref()
            .map(validate::validate_tags)
            .transpose()?
            .map(|t| serde_json::to_string(&t))
            .transpose()?;
        let metadata = input
            .metadata
            .as_ref()
            .map(validate::validate_metadata)
            .transpose()?;
        let ProjectInput {
            description,
            repository_url,
            local_directory,
            primary_system_id,
            ..
        } = input;

        self.mutate("upsert_project", move |tx, ctx| {
            let now = now_ms();
            let existing = project_by_name(tx, &name)?;

            let id = if let Some(old) = existing {
                tx.execute(
                    "UPDATE projects SET
                       description = COALESCE(?1, description),
                       status = COALESCE(?2, status),
                       repository_url = COALESCE(?3, repository_url),
                       local_directory = COALESCE(?4, local_directory),
                       tags = COALESCE(?5, tags),
                       metadata = COALESCE(?6, metadata),
                       primary_system_id = COALESCE(?7, primary_system_id),
                       updated_at = ?8,
                       last_accessed = ?8
                     WHERE id = ?9",
                    rusqlite::params![
                        description,
                        status,
                        repository_url,
                        local_directory,
                        tags,
                        metadata,
                        primary_system_id,
                        now,
                        old.id
                    ],
                )?;
                let new = project_by_id(tx, old.id)?;
                ctx.record_change(
                    "project",
                    old.id,
                    Action::ProjectUpdated,
                    Some(serde_json::to_string(&old)?),
                    Some(serde_json::to_string(&new)?),
                    None,
                );
                old.id
            } else {
                tx.execute(
                    "INSERT INTO projects (name, description, status, repository_url, local_directory,
                                           tags, metadata, primary_system_id, created_at, updated_at, last_accessed)
                     VALUES (?1, ?2, COALESCE(?3, 'active'), ?4, ?5, COALESCE(?6, '[]'), COALESCE(?7, '{}'), ?8, ?9, ?9, ?9)",
                    rusqlite::params![
                        name,
                        description,
                        status,
                        repository_url,
                        local_directory,
                        tags,
                        metadata,
                        primary_system_id,
                        now
                    ],
                )?;
                let id = tx.last_insert_rowid();
                ctx.record("project", id, Action::ProjectCreated);
                id
            };

            project_by_id(tx, id)
        })
        .await
    }

    /// Look up a project by name without touching `last_accessed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_project(&self, name: &str) -> Result<Option<Project>> {
        let name = name.trim().to_string();
        self.with_conn(move |conn| project_by_name(conn, &name))
            .await
            .map_err(|e| e.in_operation("get_project"))
    }

    /// Projects by most recent access; archived ones only when asked.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_projects(&self, include_archived: bool) -> Result<Vec<Project>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {PROJECT_COLUMNS} FROM projects p
                 WHERE ?1 OR p.status != 'archived'
                 ORDER BY p.last_accessed DESC, p.id DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let projects = stmt
                .query_map([include_archived], map_project)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(projects)
        })
        .await
        .map_err(|e| e.in_operation("list_projects"))
    }

    /// Set a project's status, recording the change (and `note`) in history.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown project and
    /// `Error::Validation` for an unknown status.
    pub async fn update_project_status(
        &self,
        name: &str,
        status: &str,
        note: Option<&str>,
    ) -> Result<Project> {
        validate::require("name", name)?;
        let status = validate::normalize_project_status(status)?;
        let name = name.trim().to_string();
        let note = note.map(str::to_string);

        self.mutate("update_project_status", move |tx, ctx| {
            let old = project_by_name(tx, &name)?.ok_or_else(|| Error::NotFound {
                entity: "project",
                id: name.clone(),
            })?;
            let now = now_ms();
            tx.execute(
                "UPDATE projects SET status = ?1, updated_at = ?2, last_accessed = ?2 WHERE id = ?3",
                rusqlite::params![status.as_str(), now, old.id],
            )?;
            ctx.record_change(
                "project",
                old.id,
                Action::ProjectStatusChanged,
                Some(old.status.as_str().to_string()),
                Some(status.as_str().to_string()),
                note.as_deref(),
            );
            project_by_id(tx, old.id)
        })
        .await
    }

    /// A project and its entries, newest first; bumps `last_accessed`.
    ///
    /// `system_specific` narrows entries to (or away from) system-specific ones.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown project.
    pub async fn get_project_context(
        &self,
        name: &str,
        system_specific: Option<bool>,
    ) -> Result<ProjectContext> {
        let name = name.trim().to_string();
        self.mutate("get_project_context", move |tx, _ctx| {
            let project = project_by_name(tx, &name)?.ok_or_else(|| Error::NotFound {
                entity: "project",
                id: name.clone(),
            })?;
            tx.execute(
                "UPDATE projects SET last_accessed = ?1 WHERE id = ?2",
                rusqlite::params![now_ms(), project.id],
            )?;

            let sql = format!(
                "SELECT {ENTRY_COLUMNS}
                 FROM context_entries e LEFT JOIN projects p ON p.id = e.project_id
                 WHERE e.project_id = ?1 AND (?2 IS NULL OR e.is_system_specific = ?2)
                 ORDER BY e.updated_at DESC, e.id DESC"
            );
            let mut stmt = tx.prepare(&sql)?;
            let entries = stmt
                .query_map(rusqlite::params![project.id, system_specific], map_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let project = project_by_id(tx, project.id)?;
            Ok(ProjectContext { project, entries })
        })
        .await
    }

    // =================
    // Context Operations
    // =================

    /// Insert or update the entry identified by (project, key).
    ///
    /// A named project that does not exist yet is created. The search
    /// shadow row is refreshed in the same transaction; a failure there is
    /// logged and does not fail the write.
    ///
    /// # Errors
    ///
    /// Returns `Error::RequiredField` / `Error::Validation` for bad input.
    pub async fn store_context(&self, input: ContextInput) -> Result<ContextEntry> {
        validate::require("key", &input.key)?;
        validate::require("value", &input.value)?;
        validate::require("type", &input.entry_type)?;
        let key = input.key.trim().to_string();
        validate::check_len("key", &key, MAX_KEY_LEN)?;
        validate::validate_value(&input.value)?;
        let entry_type = validate::normalize_context_type(&input.entry_type)?;
        let project = match input.project.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => {
                validate::check_len("project", name, MAX_NAME_LEN)?;
                Some(name.to_string())
            }
            _ => None,
        };
        if let Some(role) = &input.role_id {
            validate::check_len("role_id", role, MAX_NAME_LEN)?;
        }
        let tags = input
            .tags
            .as_deref()
            .map(validate::validate_tags)
            .transpose()?
            .map(|t| serde_json::to_string(&t))
            .transpose()?;
        let metadata = input
            .metadata
            .as_ref()
            .map(validate::validate_metadata)
            .transpose()?;
        let ContextInput {
            value,
            is_system_specific,
            role_id,
            ..
        } = input;

        self.mutate("store_context", move |tx, ctx| {
            let now = now_ms();
            let project_id = match &project {
                Some(name) => Some(ensure_project(tx, ctx, name, now)?),
                None => None,
            };
            let system_id = if is_system_specific {
                current_system_id(tx)?
            } else {
                None
            };

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM context_entries WHERE project_id IS ?1 AND key = ?2",
                    rusqlite::params![project_id, key],
                    |row| row.get(0),
                )
                .optional()?;

            let id = if let Some(id) = existing {
                tx.execute(
                    "UPDATE context_entries SET
                       type = ?1,
                       value = ?2,
                       is_system_specific = ?3,
                       system_id = ?4,
                       role_id = COALESCE(?5, role_id),
                       tags = COALESCE(?6, tags),
                       metadata = COALESCE(?7, metadata),
                       updated_at = ?8
                     WHERE id = ?9",
                    rusqlite::params![
                        entry_type.as_str(),
                        value,
                        is_system_specific,
                        system_id,
                        role_id,
                        tags,
                        metadata,
                        now,
                        id
                    ],
                )?;
                ctx.record("context_entry", id, Action::ContextUpdated);
                id
            } else {
                tx.execute(
                    "INSERT INTO context_entries (project_id, system_id, role_id, type, key, value,
                                                  is_system_specific, tags, metadata, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, COALESCE(?8, '[]'), COALESCE(?9, '{}'), ?10, ?10)",
                    rusqlite::params![
                        project_id,
                        system_id,
                        role_id,
                        entry_type.as_str(),
                        key,
                        value,
                        is_system_specific,
                        tags,
                        metadata,
                        now
                    ],
                )?;
                let id = tx.last_insert_rowid();
                ctx.record("context_entry", id, Action::ContextCreated);
                id
            };

            if let Err(e) = search::index_entry(tx, id, &key, &value, entry_type.as_str()) {
                warn!(entry_id = id, error = %e, "Search index update failed");
            }

            entry_by_id(tx, id)
        })
        .await
    }

    /// Filtered search, newest first.
    ///
    /// All filters are conjunctive; `tags` matches entries carrying any of
    /// the given tags. Results are capped at `min(limit, 1000)`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a bad type, tag or `since` value.
    pub async fn search_context(&self, options: SearchOptions) -> Result<Vec<ContextEntry>> {
        let mut sql = format!(
            "SELECT {ENTRY_COLUMNS}
             FROM context_entries e LEFT JOIN projects p ON p.id = e.project_id
             WHERE 1 = 1"
        );
        let mut params: Vec<SqlValue> = Vec::new();

        if let Some(project) = options.project.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            sql.push_str(" AND p.name = ?");
            params.push(SqlValue::Text(project.to_string()));
        }
        if let Some(entry_type) = options.entry_type.as_deref() {
            let entry_type = validate::normalize_context_type(entry_type)?;
            sql.push_str(" AND e.type = ?");
            params.push(SqlValue::Text(entry_type.as_str().to_string()));
        }
        if let Some(since) = options.since.as_deref() {
            sql.push_str(" AND e.updated_at >= ?");
            params.push(SqlValue::Integer(validate::parse_since(since, now_ms())?));
        }
        if let Some(flag) = options.system_specific {
            sql.push_str(" AND e.is_system_specific = ?");
            params.push(SqlValue::Integer(i64::from(flag)));
        }
        if let Some(tags) = options.tags.as_deref() {
            let tags = validate::validate_tags(tags)?;
            if !tags.is_empty() {
                let placeholders = vec!["?"; tags.len()].join(", ");
                sql.push_str(&format!(
                    " AND EXISTS (SELECT 1 FROM json_each(e.tags) WHERE json_each.value IN ({placeholders}))"
                ));
                params.extend(tags.into_iter().map(SqlValue::Text));
            }
        }
        if let Some(query) = options.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            sql.push_str(
                " AND e.id IN (SELECT rowid FROM context_search WHERE context_search MATCH ?)",
            );
            params.push(SqlValue::Text(validate::fts_query(query)));
        }

        let limit = options
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .min(MAX_SEARCH_LIMIT);
        sql.push_str(" ORDER BY e.updated_at DESC, e.id DESC LIMIT ?");
        params.push(SqlValue::Integer(i64::from(limit)));

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), map_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            debug!(results = entries.len(), "Context search");
            Ok(entries)
        })
        .await
        .map_err(|e| e.in_operation("search_context"))
    }

    /// Entries that belong to no project.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for an unknown type.
    pub async fn get_shared_context(
        &self,
        entry_type: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<ContextEntry>> {
        let entry_type = entry_type
            .map(validate::normalize_context_type)
            .transpose()?
            .map(|t| t.as_str());
        let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT).min(MAX_SEARCH_LIMIT);

        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS}
                 FROM context_entries e LEFT JOIN projects p ON p.id = e.project_id
                 WHERE e.project_id IS NULL AND (?1 IS NULL OR e.type = ?1)
                 ORDER BY e.updated_at DESC, e.id DESC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(rusqlite::params![entry_type, limit], map_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
        .map_err(|e| e.in_operation("get_shared_context"))
    }

    /// Entries updated since `since` (default: the last 24 hours).
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for an unparseable `since`.
    pub async fn get_recent_updates(
        &self,
        since: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<ContextEntry>> {
        let now = now_ms();
        let since = match since {
            Some(s) => validate::parse_since(s, now)?,
            None => now - RECENT_WINDOW_MS,
        };
        self.search_context(SearchOptions {
            since: Some(since.to_string()),
            limit,
            ..SearchOptions::default()
        })
        .await
    }

    // ================
    // System Operations
    // ================

    /// Register a host, or refresh it if the hostname is known.
    ///
    /// With `set_current`, every other system loses its current flag in
    /// the same transaction.
    ///
    /// # Errors
    ///
    /// Returns `Error::RequiredField` / `Error::Validation` for bad input.
    pub async fn register_system(&self, input: SystemInput) -> Result<System> {
        validate::require("hostname", &input.hostname)?;
        let hostname = input.hostname.trim().to_string();
        validate::check_len("hostname", &hostname, MAX_NAME_LEN)?;
        let metadata = input
            .metadata
            .as_ref()
            .map(validate::validate_metadata)
            .transpose()?;
        let SystemInput {
            name,
            platform,
            set_current,
            ..
        } = input;

        self.mutate("register_system", move |tx, ctx| {
            let now = now_ms();
            if set_current {
                tx.execute("UPDATE systems SET is_current = 0 WHERE is_current = 1", [])?;
            }

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM systems WHERE hostname = ?1",
                    [&hostname],
                    |row| row.get(0),
                )
                .optional()?;

            let id = if let Some(id) = existing {
                tx.execute(
                    "UPDATE systems SET
                       name = COALESCE(?1, name),
                       platform = COALESCE(?2, platform),
                       metadata = COALESCE(?3, metadata),
                       is_current = CASE WHEN ?4 THEN 1 ELSE is_current END,
                       last_seen = ?5
                     WHERE id = ?6",
                    rusqlite::params![name, platform, metadata, set_current, now, id],
                )?;
                ctx.record("system", id, Action::SystemUpdated);
                id
            } else {
                tx.execute(
                    "INSERT INTO systems (hostname, name, platform, is_current, metadata, created_at, last_seen)
                     VALUES (?1, ?2, ?3, ?4, COALESCE(?5, '{}'), ?6, ?6)",
                    rusqlite::params![hostname, name, platform, set_current, metadata, now],
                )?;
                let id = tx.last_insert_rowid();
                ctx.record("system", id, Action::SystemRegistered);
                id
            };

            system_by_id(tx, id)
        })
        .await
    }

    /// The system flagged current, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_current_system(&self) -> Result<Option<System>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {SYSTEM_COLUMNS} FROM systems WHERE is_current = 1 LIMIT 1");
            Ok(conn.query_row(&sql, [], map_system).optional()?)
        })
        .await
        .map_err(|e| e.in_operation("get_current_system"))
    }

    /// Make `hostname` the only current system.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown hostname.
    pub async fn set_current_system(&self, hostname: &str) -> Result<System> {
        let hostname = hostname.trim().to_string();
        self.mutate("set_current_system", move |tx, ctx| {
            let id: i64 = tx
                .query_row(
                    "SELECT id FROM systems WHERE hostname = ?1",
                    [&hostname],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| Error::NotFound {
                    entity: "system",
                    id: hostname.clone(),
                })?;
            tx.execute("UPDATE systems SET is_current = 0 WHERE is_current = 1", [])?;
            tx.execute(
                "UPDATE systems SET is_current = 1, last_seen = ?1 WHERE id = ?2",
                rusqlite::params![now_ms(), id],
            )?;
            ctx.record("system", id, Action::SystemUpdated);
            system_by_id(tx, id)
        })
        .await
    }

    /// All registered systems, most recently seen first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_systems(&self) -> Result<Vec<System>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {SYSTEM_COLUMNS} FROM systems ORDER BY last_seen DESC, id DESC");
            let mut stmt = conn.prepare(&sql)?;
            let systems = stmt
                .query_map([], map_system)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(systems)
        })
        .await
        .map_err(|e| e.in_operation("list_systems"))
    }

    // =========
    // Metadata
    // =========

    /// Current and latest schema versions plus applied/pending lists.
    ///
    /// # Errors
    ///
    /// Returns an error if `schema_migrations` cannot be read.
    pub async fn get_migration_status(&self) -> Result<MigrationStatus> {
        self.with_conn(|conn| Migrator::builtin().status(conn))
            .await
            .map_err(|e| e.in_operation("get_migration_status"))
    }

    /// History rows for one entity, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_history(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<HistoryEntry>> {
        let entity_type = entity_type.to_string();
        let entity_id = entity_id.to_string();
        self.with_conn(move |conn| {
            Ok(history::get_entries(conn, &entity_type, &entity_id, limit)?)
        })
        .await
        .map_err(|e| e.in_operation("get_history"))
    }

    /// Close the connection. Later calls fail with `Error::Closed`;
    /// closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite refuses to close the connection.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let conn = Arc::clone(&self.conn);
        blocking(move || {
            let taken = conn
                .lock()
                .map_err(|_| Error::Other("store connection lock poisoned".to_string()))?
                .take();
            if let Some(conn) = taken {
                conn.close().map_err(|(_, e)| Error::Database(e))?;
            }
            Ok(())
        })
        .await?;
        debug!(path = ?self.path, "Closed store");
        Ok(())
    }
}

async fn blocking<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(format!("store task failed: {e}")))?
}

fn open_file(path: &Path, config: &StoreConfig) -> Result<Connection> {
    let mut conn = connect(path, config)?;
    run_migrations(&mut conn, config, Some(path))?;
    Ok(conn)
}

/// Open and configure a store file without migrating it.
pub(crate) fn connect(path: &Path, config: &StoreConfig) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| Error::PathIo {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let conn = Connection::open(path)?;
    configure(&conn, config)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

fn configure(conn: &Connection, config: &StoreConfig) -> Result<()> {
    conn.busy_timeout(config.busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Backup-guarded migrator for a store at `path`.
pub(crate) fn safe_migrator(config: &StoreConfig, path: Option<&Path>) -> SafeMigrator {
    let backups = match &config.backup_dir {
        Some(dir) => {
            let stem = path
                .and_then(Path::file_stem)
                .map_or_else(|| "memory".to_string(), |s| s.to_string_lossy().into_owned());
            BackupManager::with_dir(dir, stem)
        }
        None => BackupManager::in_memory(),
    };
    SafeMigrator::new(Migrator::builtin(), backups)
}

fn run_migrations(conn: &mut Connection, config: &StoreConfig, path: Option<&Path>) -> Result<()> {
    let applied = if config.safe_migrations {
        safe_migrator(config, path).migrate(conn)?
    } else {
        Migrator::builtin().migrate(conn)?
    };
    if !applied.is_empty() {
        info!(versions = ?applied, "Store schema migrated");
    }
    Ok(())
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn ensure_project(
    tx: &Transaction<'_>,
    ctx: &mut MutationContext,
    name: &str,
    now: i64,
) -> Result<i64> {
    let existing: Option<i64> = tx
        .query_row("SELECT id FROM projects WHERE name = ?1", [name], |row| row.get(0))
        .optional()?;
    if let Some(id) = existing {
        tx.execute(
            "UPDATE projects SET last_accessed = ?1 WHERE id = ?2",
            rusqlite::params![now, id],
        )?;
        return Ok(id);
    }

    tx.execute(
        "INSERT INTO projects (name, status, created_at, updated_at, last_accessed)
         VALUES (?1, 'active', ?2, ?2, ?2)",
        rusqlite::params![name, now],
    )?;
    let id = tx.last_insert_rowid();
    ctx.record("project", id, Action::ProjectCreated);
    Ok(id)
}

fn current_system_id(conn: &Connection) -> Result<Option<i64>> {
    Ok(conn
        .query_row("SELECT id FROM systems WHERE is_current = 1 LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?)
}

fn project_by_name(conn: &Connection, name: &str) -> Result<Option<Project>> {
    let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects p WHERE p.name = ?1");
    Ok(conn.query_row(&sql, [name], map_project).optional()?)
}

fn project_by_id(conn: &Connection, id: i64) -> Result<Project> {
    let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects p WHERE p.id = ?1");
    Ok(conn.query_row(&sql, [id], map_project)?)
}

fn entry_by_id(conn: &Connection, id: i64) -> Result<ContextEntry> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS}
         FROM context_entries e LEFT JOIN projects p ON p.id = e.project_id
         WHERE e.id = ?1"
    );
    Ok(conn.query_row(&sql, [id], map_entry)?)
}

fn system_by_id(conn: &Connection, id: i64) -> Result<System> {
    let sql = format!("SELECT {SYSTEM_COLUMNS} FROM systems WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], map_system)?)
}

fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn json_map(raw: Option<String>) -> Map<String, Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn map_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        status: ProjectStatus::from_str(&row.get::<_, String>(3)?),
        repository_url: row.get(4)?,
        local_directory: row.get(5)?,
        tags: json_list(row.get(6)?),
        metadata: json_map(row.get(7)?),
        primary_system_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        last_accessed: row.get(11)?,
    })
}

fn map_entry(row: &Row<'_>) -> rusqlite::Result<ContextEntry> {
    Ok(ContextEntry {
        id: row.get(0)?,
        project_id: row.get(1)?,
        project_name: row.get(2)?,
        system_id: row.get(3)?,
        role_id: row.get(4)?,
        entry_type: ContextType::from_str(&row.get::<_, String>(5)?),
        key: row.get(6)?,
        value: row.get(7)?,
        is_system_specific: row.get(8)?,
        tags: json_list(row.get(9)?),
        metadata: json_map(row.get(10)?),
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn map_system(row: &Row<'_>) -> rusqlite::Result<System> {
    Ok(System {
        id: row.get(0)?,
        hostname: row.get(1)?,
        name: row.get(2)?,
        platform: row.get(3)?,
        is_current: row.get(4)?,
        metadata: json_map(row.get(5)?),
        created_at: row.get(6)?,
        last_seen: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::storage::RetryPolicy;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn memory_store() -> Store {
        Store::open_memory(StoreConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_project_is_idempotent() {
        let store = memory_store().await;

        let first = store.upsert_project(ProjectInput::named("demo")).await.unwrap();
        let second = store.upsert_project(ProjectInput::named("demo")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(store.list_projects(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_project_merges_absent_fields() {
        let store = memory_store().await;
        store
            .upsert_project(ProjectInput {
                name: "api".into(),
                description: Some("REST backend".into()),
                tags: Some(vec!["rust".into()]),
                ..ProjectInput::default()
            })
            .await
            .unwrap();

        let merged = store
            .upsert_project(ProjectInput {
                name: "api".into(),
                repository_url: Some("https://example.com/api.git".into()),
                ..ProjectInput::default()
            })
            .await
            .unwrap();

        assert_eq!(merged.description.as_deref(), Some("REST backend"));
        assert_eq!(merged.tags, vec!["rust"]);
        assert_eq!(merged.repository_url.as_deref(), Some("https://example.com/api.git"));
        assert_eq!(merged.status, ProjectStatus::Active);
    }

    #[tokio::test]
    async fn test_upsert_project_validation() {
        let store = memory_store().await;
        assert!(matches!(
            store.upsert_project(ProjectInput::named("  ")).await,
            Err(Error::RequiredField("name"))
        ));

        let bad_tags = ProjectInput {
            name: "p".into(),
            tags: Some(vec!["no;semicolons".into()]),
            ..ProjectInput::default()
        };
        assert!(matches!(
            store.upsert_project(bad_tags).await,
            Err(Error::Validation(_))
        ));
        assert!(store.list_projects(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_context_upserts_by_project_and_key() {
        let store = memory_store().await;

        let first = store
            .store_context(ContextInput::new("db", "postgres", "decision").in_project("api"))
            .await
            .unwrap();
        let second = store
            .store_context(ContextInput::new("db", "sqlite", "decision").in_project("api"))
            .await
            .unwrap();
        let shared = store
            .store_context(ContextInput::new("db", "shared value", "note"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.value, "sqlite");
        assert_eq!(second.project_name.as_deref(), Some("api"));
        assert_ne!(shared.id, first.id);
        assert!(shared.project_id.is_none());

        let again = store
            .store_context(ContextInput::new("db", "shared v2", "note"))
            .await
            .unwrap();
        assert_eq!(again.id, shared.id);

        // The project was created on demand.
        let project = store.get_project("api").await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Active);
    }

    #[tokio::test]
    async fn test_store_context_requires_fields_and_known_type() {
        let store = memory_store().await;
        assert!(matches!(
            store.store_context(ContextInput::new("", "v", "note")).await,
            Err(Error::RequiredField("key"))
        ));
        assert!(matches!(
            store.store_context(ContextInput::new("k", "v", "")).await,
            Err(Error::RequiredField("type"))
        ));
        assert!(matches!(
            store.store_context(ContextInput::new("k", "v", "nonsense")).await,
            Err(Error::Validation(_))
        ));

        let synonym = store
            .store_context(ContextInput::new("k", "v", "bug"))
            .await
            .unwrap();
        assert_eq!(synonym.entry_type, ContextType::Issue);
    }

    #[tokio::test]
    async fn test_search_scenario() {
        let store = memory_store().await;
        let entry = store
            .store_context(ContextInput::new("k1", "hello world", "note"))
            .await
            .unwrap();

        let hits = store.search_context(SearchOptions::query("hello")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, entry.id);

        let misses = store
            .search_context(SearchOptions::query("nonexistent"))
            .await
            .unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn test_search_punctuation_is_safe() {
        let store = memory_store().await;
        store
            .store_context(ContextInput::new("flags", "pass --release-mode to cargo", "config"))
            .await
            .unwrap();

        let hits = store
            .search_context(SearchOptions::query("release-mode"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        // Unbalanced quotes and operators must not be a syntax error.
        store
            .search_context(SearchOptions::query("\"AND (*"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_search_treats_operators_as_words() {
        let store = memory_store().await;
        store
            .store_context(ContextInput::new("music", "rock or not, and roll", "note"))
            .await
            .unwrap();

        for query in ["OR", "NOT", "rock AND", "AND NOT OR"] {
            let hits = store
                .search_context(SearchOptions::query(query))
                .await
                .unwrap();
            assert_eq!(hits.len(), 1, "query {query:?}");
        }
    }

    #[tokio::test]
    async fn test_bad_since_is_a_validation_error() {
        let store = memory_store().await;
        for since in ["-1é", "-999999999999999d"] {
            let err = store
                .search_context(SearchOptions {
                    since: Some(since.to_string()),
                    ..SearchOptions::default()
                })
                .await
                .unwrap_err();
            assert_eq!(err.error_code(), ErrorCode::ValidationError, "{since}");
        }
        assert!(store.get_recent_updates(Some("-1é"), None).await.is_err());
    }

    #[tokio::test]
    async fn test_search_index_failure_does_not_fail_write() {
        let store = memory_store().await;
        store
            .with_conn(|conn| {
                conn.execute_batch("DROP TABLE context_search")?;
                Ok(())
            })
            .await
            .unwrap();

        let entry = store
            .store_context(ContextInput::new("k1", "still saved", "note"))
            .await
            .unwrap();
        assert_eq!(entry.value, "still saved");

        let shared = store.get_shared_context(None, None).await.unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].id, entry.id);
    }

    #[tokio::test]
    async fn test_search_filters_compose() {
        let store = memory_store().await;
        store
            .store_context(
                ContextInput::new("auth", "use oauth tokens", "decision")
                    .in_project("web")
                    .with_tags(["security", "backend"]),
            )
            .await
            .unwrap();
        store
            .store_context(
                ContextInput::new("style", "rustfmt defaults", "standard")
                    .in_project("web")
                    .with_tags(["tooling"]),
            )
            .await
            .unwrap();
        store
            .store_context(ContextInput::new("auth", "api keys", "decision").in_project("cli"))
            .await
            .unwrap();

        let web = store
            .search_context(SearchOptions {
                project: Some("web".into()),
                ..SearchOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(web.len(), 2);

        let decisions_in_web = store
            .search_context(SearchOptions {
                project: Some("web".into()),
                entry_type: Some("decision".into()),
                ..SearchOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(decisions_in_web.len(), 1);
        assert_eq!(decisions_in_web[0].value, "use oauth tokens");

        let tagged = store
            .search_context(SearchOptions {
                tags: Some(vec!["tooling".into(), "nope".into()]),
                ..SearchOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].key, "style");

        let limited = store
            .search_context(SearchOptions {
                limit: Some(1),
                ..SearchOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].project_name.as_deref(), Some("cli"));

        let future = store
            .search_context(SearchOptions {
                since: Some((now_ms() + 60_000).to_string()),
                ..SearchOptions::default()
            })
            .await
            .unwrap();
        assert!(future.is_empty());

        assert!(matches!(
            store
                .search_context(SearchOptions {
                    since: Some("last tuesday".into()),
                    ..SearchOptions::default()
                })
                .await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_shared_and_recent() {
        let store = memory_store().await;
        store
            .store_context(ContextInput::new("editor", "helix", "config"))
            .await
            .unwrap();
        store
            .store_context(ContextInput::new("todo-1", "write docs", "todo").in_project("p"))
            .await
            .unwrap();

        let shared = store.get_shared_context(None, None).await.unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].key, "editor");
        assert!(store
            .get_shared_context(Some("todo"), None)
            .await
            .unwrap()
            .is_empty());

        assert_eq!(store.get_recent_updates(None, None).await.unwrap().len(), 2);
        assert_eq!(
            store.get_recent_updates(Some("-1h"), Some(1)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_project_status_and_history() {
        let store = memory_store().await;
        let project = store.upsert_project(ProjectInput::named("site")).await.unwrap();

        let updated = store
            .update_project_status("site", "on_hold", Some("waiting for design"))
            .await
            .unwrap();
        assert_eq!(updated.status, ProjectStatus::Paused);

        let history = store
            .get_history("project", &project.id.to_string(), None)
            .await
            .unwrap();
        assert_eq!(history[0].action, Action::ProjectStatusChanged);
        assert_eq!(history[0].user_note.as_deref(), Some("waiting for design"));
        assert_eq!(history[0].old_value.as_deref(), Some("active"));
        assert_eq!(history.last().map(|h| h.action), Some(Action::ProjectCreated));

        assert!(matches!(
            store.update_project_status("missing", "active", None).await,
            Err(Error::NotFound { entity: "project", .. })
        ));
    }

    #[tokio::test]
    async fn test_archived_projects_hidden_by_default() {
        let store = memory_store().await;
        store.upsert_project(ProjectInput::named("live")).await.unwrap();
        store.upsert_project(ProjectInput::named("old")).await.unwrap();
        store
            .update_project_status("old", "archived", None)
            .await
            .unwrap();

        let visible = store.list_projects(false).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "live");
        assert_eq!(store.list_projects(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_project_context() {
        let store = memory_store().await;
        store
            .register_system(SystemInput::new("laptop").current())
            .await
            .unwrap();
        store
            .store_context(ContextInput::new("arch", "hexagonal", "decision").in_project("svc"))
            .await
            .unwrap();
        store
            .store_context(ContextInput {
                is_system_specific: true,
                ..ContextInput::new("path", "/home/dev/svc", "config").in_project("svc")
            })
            .await
            .unwrap();

        let all = store.get_project_context("svc", None).await.unwrap();
        assert_eq!(all.project.name, "svc");
        assert_eq!(all.entries.len(), 2);

        let local = store.get_project_context("svc", Some(true)).await.unwrap();
        assert_eq!(local.entries.len(), 1);
        assert_eq!(local.entries[0].key, "path");
        assert!(local.entries[0].system_id.is_some());

        assert!(matches!(
            store.get_project_context("nope", None).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_single_current_system() {
        let store = memory_store().await;
        assert!(store.get_current_system().await.unwrap().is_none());

        store
            .register_system(SystemInput::new("desktop").current())
            .await
            .unwrap();
        store
            .register_system(SystemInput::new("laptop").current())
            .await
            .unwrap();
        store.register_system(SystemInput::new("ci")).await.unwrap();

        let current = store.get_current_system().await.unwrap().unwrap();
        assert_eq!(current.hostname, "laptop");

        store.set_current_system("desktop").await.unwrap();
        let systems = store.list_systems().await.unwrap();
        assert_eq!(systems.len(), 3);
        assert_eq!(systems.iter().filter(|s| s.is_current).count(), 1);
        assert_eq!(
            store.get_current_system().await.unwrap().unwrap().hostname,
            "desktop"
        );

        assert!(matches!(
            store.set_current_system("mainframe").await,
            Err(Error::NotFound { entity: "system", .. })
        ));
    }

    #[tokio::test]
    async fn test_migration_status_after_open() {
        let store = memory_store().await;
        let status = store.get_migration_status().await.unwrap();
        assert_eq!(status.current_version, status.latest_version);
        assert!(status.pending.is_empty());
        assert_eq!(status.applied.len(), status.latest_version as usize);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = memory_store().await;
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.list_projects(true).await, Err(Error::Closed)));
        assert!(matches!(
            store.upsert_project(ProjectInput::named("x")).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("tenant.db");

        let store = Store::open(&path, StoreConfig::default()).await.unwrap();
        store.upsert_project(ProjectInput::named("kept")).await.unwrap();
        store.close().await.unwrap();

        let reopened = Store::open(&path, StoreConfig::default()).await.unwrap();
        let projects = reopened.list_projects(true).await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "kept");
    }

    #[tokio::test]
    async fn test_backup_dir_receives_snapshot_on_first_open() {
        let dir = TempDir::new().unwrap();
        let backups = dir.path().join("backups");
        let config = StoreConfig {
            backup_dir: Some(backups.clone()),
            ..StoreConfig::default()
        };

        let store = Store::open(dir.path().join("tenant.db"), config.clone())
            .await
            .unwrap();
        store.close().await.unwrap();
        let files: Vec<_> = std::fs::read_dir(&backups).unwrap().collect();
        assert_eq!(files.len(), 1);

        // Already migrated: no second snapshot.
        Store::open(dir.path().join("tenant.db"), config).await.unwrap();
        assert_eq!(std::fs::read_dir(&backups).unwrap().count(), 1);
    }

    /// Hold the write lock from another connection until told to release.
    fn hold_write_lock(path: PathBuf) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        std::thread::spawn(move || {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("BEGIN IMMEDIATE").unwrap();
            locked_tx.send(()).unwrap();
            let _ = release_rx.recv();
            conn.execute_batch("COMMIT").unwrap();
        });
        (locked_rx, release_tx)
    }

    fn contended_config(base_delay: Duration) -> StoreConfig {
        StoreConfig {
            busy_timeout: Duration::ZERO,
            retry: RetryPolicy {
                max_attempts: 5,
                base_delay,
            },
            ..StoreConfig::default()
        }
    }

    #[tokio::test]
    async fn test_write_retries_through_contention() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tenant.db");
        let store = Store::open(&path, contended_config(Duration::from_millis(40)))
            .await
            .unwrap();

        let (locked, release) = hold_write_lock(path);
        locked.recv().unwrap();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let _ = release.send(());
        });

        let project = store.upsert_project(ProjectInput::named("eventually")).await.unwrap();
        assert_eq!(project.name, "eventually");
    }

    #[tokio::test]
    async fn test_write_gives_up_after_retry_budget() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tenant.db");
        let store = Store::open(&path, StoreConfig::default()).await.unwrap();

        let (locked, release) = hold_write_lock(path);
        locked.recv().unwrap();

        let started = std::time::Instant::now();
        let err = store
            .upsert_project(ProjectInput::named("never"))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        release.send(()).unwrap();

        // 100 + 200 + 400 + 800 ms of backoff, with no blocking busy wait.
        assert!(elapsed >= Duration::from_millis(1500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3100), "{elapsed:?}");

        assert_eq!(err.error_code(), ErrorCode::DatabaseError);
        match err {
            Error::RetryExhausted { operation, attempts } => {
                assert_eq!(operation, "upsert_project");
                assert_eq!(attempts, 5);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }
}
