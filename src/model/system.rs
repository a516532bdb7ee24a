//! Physical host registry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A registered host. At most one row is current.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct System {
    pub id: i64,
    pub hostname: String,
    pub name: Option<String>,
    pub platform: Option<String>,
    pub is_current: bool,
    pub metadata: Map<String, Value>,
    pub created_at: i64,
    pub last_seen: i64,
}

/// Registration request for `register_system`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemInput {
    pub hostname: String,
    pub name: Option<String>,
    pub platform: Option<String>,
    pub metadata: Option<Map<String, Value>>,
    /// Make this the current system, clearing the previous one
    pub set_current: bool,
}

impl SystemInput {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn current(mut self) -> Self {
        self.set_current = true;
        self
    }
}
