//! Project model.
//!
//! Projects group context entries under a unique name and carry
//! repository/location hints plus free-form tags and metadata.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Project status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Paused,
    Completed,
    Archived,
}

impl ProjectStatus {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    /// Parse a stored value. Unknown values read back as `Active`.
    #[must_use]
    pub fn from_str(s: &str) -> Self {
        match s {
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "archived" => Self::Archived,
            _ => Self::Active,
        }
    }
}

impl Default for ProjectStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// A project row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,

    /// Unique display name
    pub name: String,

    pub description: Option<String>,

    pub status: ProjectStatus,

    pub repository_url: Option<String>,

    pub local_directory: Option<String>,

    /// Order-irrelevant tag set
    pub tags: Vec<String>,

    pub metadata: Map<String, Value>,

    /// System the project primarily lives on
    pub primary_system_id: Option<i64>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,

    /// Last read or write through the project (Unix milliseconds)
    pub last_accessed: i64,
}

/// Partial project used for upserts.
///
/// `None` fields are preserved from the existing row on update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectInput {
    pub name: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub repository_url: Option<String>,
    pub local_directory: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Map<String, Value>>,
    pub primary_system_id: Option<i64>,
}

impl ProjectInput {
    /// Input carrying only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}
