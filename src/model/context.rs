//! Context entry model and search options.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of context entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    Decision,
    Code,
    Standard,
    Status,
    Todo,
    Note,
    Config,
    Issue,
    Reference,
}

impl ContextType {
    pub const ALL: [Self; 9] = [
        Self::Decision,
        Self::Code,
        Self::Standard,
        Self::Status,
        Self::Todo,
        Self::Note,
        Self::Config,
        Self::Issue,
        Self::Reference,
    ];

    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Code => "code",
            Self::Standard => "standard",
            Self::Status => "status",
            Self::Todo => "todo",
            Self::Note => "note",
            Self::Config => "config",
            Self::Issue => "issue",
            Self::Reference => "reference",
        }
    }

    /// Parse a stored value. Unknown values read back as `Note`.
    #[must_use]
    pub fn from_str(s: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .unwrap_or(Self::Note)
    }
}

/// A stored context entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: i64,

    /// `None` for shared entries
    pub project_id: Option<i64>,

    /// Name of the owning project (joined on read)
    pub project_name: Option<String>,

    /// Host the entry is specific to, if any
    pub system_id: Option<i64>,

    pub role_id: Option<String>,

    #[serde(rename = "type")]
    pub entry_type: ContextType,

    pub key: String,

    pub value: String,

    pub is_system_specific: bool,

    pub tags: Vec<String>,

    pub metadata: Map<String, Value>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

/// Partial context entry for `store_context`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextInput {
    /// Owning project name; missing projects are created. `None` stores a shared entry.
    #[serde(alias = "project_name")]
    pub project: Option<String>,
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Map<String, Value>>,
    pub is_system_specific: bool,
    pub role_id: Option<String>,
}

impl ContextInput {
    pub fn new(key: impl Into<String>, value: impl Into<String>, entry_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            entry_type: entry_type.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn in_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }
}

/// Conjunctive filters for `search_context`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    #[serde(alias = "project_name")]
    pub project: Option<String>,
    /// Free-text query against the search index
    pub query: Option<String>,
    #[serde(rename = "type")]
    pub entry_type: Option<String>,
    /// Match entries carrying any of these tags
    pub tags: Option<Vec<String>>,
    /// Millis, RFC 3339, or relative (`-7d`, `-12h`, `-30m`)
    pub since: Option<String>,
    pub system_specific: Option<bool>,
    pub limit: Option<u32>,
}

impl SearchOptions {
    #[must_use]
    pub fn query(q: impl Into<String>) -> Self {
        Self {
            query: Some(q.into()),
            ..Self::default()
        }
    }
}

/// A project together with its entries.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectContext {
    pub project: super::Project,
    pub entries: Vec<ContextEntry>,
}
