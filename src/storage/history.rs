//! Update history: one row per mutation, written in the same transaction.

use rusqlite::{Connection, Result};
use serde::Serialize;

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ProjectCreated,
    ProjectUpdated,
    ProjectStatusChanged,
    ContextCreated,
    ContextUpdated,
    SystemRegistered,
    SystemUpdated,
}

impl Action {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectCreated => "project_created",
            Self::ProjectUpdated => "project_updated",
            Self::ProjectStatusChanged => "project_status_changed",
            Self::ContextCreated => "context_created",
            Self::ContextUpdated => "context_updated",
            Self::SystemRegistered => "system_registered",
            Self::SystemUpdated => "system_updated",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "project_created" => Self::ProjectCreated,
            "project_updated" => Self::ProjectUpdated,
            "project_status_changed" => Self::ProjectStatusChanged,
            "context_created" => Self::ContextCreated,
            "context_updated" => Self::ContextUpdated,
            "system_registered" => Self::SystemRegistered,
            "system_updated" => Self::SystemUpdated,
            _ => return None,
        })
    }
}

/// A row of `update_history`.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub action: Action,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub user_note: Option<String>,
    pub created_at: i64,
}

impl HistoryEntry {
    /// New entry; the id is assigned on insert.
    #[must_use]
    pub fn new(entity_type: &str, entity_id: &str, action: Action) -> Self {
        Self {
            id: 0,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            action,
            old_value: None,
            new_value: None,
            user_note: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[must_use]
    pub fn with_values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    #[must_use]
    pub fn with_note(mut self, note: Option<&str>) -> Self {
        self.user_note = note.map(ToString::to_string);
        self
    }
}

/// Side effects collected while a mutation runs.
#[derive(Debug)]
pub struct MutationContext {
    pub op_name: String,
    pub entries: Vec<HistoryEntry>,
}

impl MutationContext {
    #[must_use]
    pub fn new(op_name: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, entity_type: &str, entity_id: impl ToString, action: Action) {
        self.entries
            .push(HistoryEntry::new(entity_type, &entity_id.to_string(), action));
    }

    pub fn record_change(
        &mut self,
        entity_type: &str,
        entity_id: impl ToString,
        action: Action,
        old_value: Option<String>,
        new_value: Option<String>,
        note: Option<&str>,
    ) {
        self.entries.push(
            HistoryEntry::new(entity_type, &entity_id.to_string(), action)
                .with_values(old_value, new_value)
                .with_note(note),
        );
    }
}

/// Insert a history row.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn insert_entry(conn: &Connection, entry: &HistoryEntry) -> Result<i64> {
    conn.execute(
        "INSERT INTO update_history (entity_type, entity_id, action, old_value, new_value, user_note, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            entry.entity_type,
            entry.entity_id,
            entry.action.as_str(),
            entry.old_value,
            entry.new_value,
            entry.user_note,
            entry.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// History for one entity, newest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_entries(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    limit: Option<u32>,
) -> Result<Vec<HistoryEntry>> {
    let limit = limit.unwrap_or(100);
    let mut stmt = conn.prepare(
        "SELECT id, entity_type, entity_id, action, old_value, new_value, user_note, created_at
         FROM update_history
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at DESC, id DESC
         LIMIT ?3",
    )?;

    let rows = stmt.query_map(rusqlite::params![entity_type, entity_id, limit], |row| {
        let action: String = row.get(3)?;
        let action = Action::parse(&action).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown history action: {action}").into(),
            )
        })?;
        Ok(HistoryEntry {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            action,
            old_value: row.get(4)?,
            new_value: row.get(5)?,
            user_note: row.get(6)?,
            created_at: row.get(7)?,
        })
    })?;

    rows.collect()
}
