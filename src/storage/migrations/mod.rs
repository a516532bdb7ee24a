//! Versioned schema migrations.
//!
//! Migrations are plain values in a static, ordered registry compiled into
//! the binary. Each carries a forward step, an optional inverse, and the
//! versions it builds on. The `schema_migrations` table records which
//! versions have been applied and how long each took.
//!
//! # Submodules
//!
//! - [`engine`] - Transactional apply / rollback
//! - [`backup`] - Online-backup snapshots for the enhanced engine
//! - [`enhanced`] - Backup, schema validation and dependency-checked rollback

pub mod backup;
pub mod engine;
pub mod enhanced;

pub use backup::{BackupManager, Snapshot};
pub use engine::{MigrationRecord, MigrationStatus, Migrator, PendingMigration};
pub use enhanced::{SafeMigrator, SchemaReport};

use crate::storage::search;
use regex::Regex;
use rusqlite::Transaction;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// One half of a migration: raw SQL or a Rust data step.
#[derive(Clone, Copy)]
pub enum Step {
    Sql(&'static str),
    Rust(fn(&Transaction<'_>) -> rusqlite::Result<()>),
}

impl Step {
    /// Run the step inside the caller's transaction.
    pub(crate) fn apply(&self, tx: &Transaction<'_>) -> rusqlite::Result<()> {
        match self {
            Self::Sql(sql) => tx.execute_batch(sql),
            Self::Rust(f) => f(tx),
        }
    }

    #[must_use]
    pub const fn sql(&self) -> Option<&'static str> {
        match self {
            Self::Sql(sql) => Some(sql),
            Self::Rust(_) => None,
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sql(sql) => f.debug_tuple("Sql").field(&sql.len()).finish(),
            Self::Rust(_) => f.write_str("Rust(..)"),
        }
    }
}

/// A versioned schema change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: Step,
    pub down: Option<Step>,
    /// Versions this migration structurally builds on.
    pub dependencies: &'static [u32],
}

impl Migration {
    #[must_use]
    pub const fn is_reversible(&self) -> bool {
        self.down.is_some()
    }

    /// Tables this migration creates, by SQL inspection of its forward step.
    #[must_use]
    pub fn created_tables(&self) -> BTreeSet<String> {
        self.up.sql().map(created_tables).unwrap_or_default()
    }

    /// Tables this migration drops, by SQL inspection of its forward step.
    #[must_use]
    pub fn dropped_tables(&self) -> BTreeSet<String> {
        self.up.sql().map(dropped_tables).unwrap_or_default()
    }

    /// Whether this migration builds on `earlier`, either by declaration or
    /// because its forward SQL references a table `earlier` creates.
    #[must_use]
    pub fn depends_on(&self, earlier: &Migration) -> bool {
        if self.version <= earlier.version {
            return false;
        }
        if self.dependencies.contains(&earlier.version) {
            return true;
        }
        let Some(sql) = self.up.sql() else {
            return false;
        };
        earlier
            .created_tables()
            .iter()
            .any(|table| references_table(sql, table))
    }
}

static CREATE_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bCREATE\s+(?:VIRTUAL\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?["`\[]?(\w+)"#)
        .expect("static create pattern")
});

static DROP_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bDROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?["`\[]?(\w+)"#)
        .expect("static drop pattern")
});

static RENAME_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bALTER\s+TABLE\s+["`\[]?(\w+)["`\]]?\s+RENAME\s+TO\s+["`\[]?(\w+)"#)
        .expect("static rename pattern")
});

fn created_tables(sql: &str) -> BTreeSet<String> {
    let mut tables: BTreeSet<String> = CREATE_TABLE
        .captures_iter(sql)
        .map(|c| c[1].to_lowercase())
        .collect();
    tables.extend(RENAME_TABLE.captures_iter(sql).map(|c| c[2].to_lowercase()));
    tables
}

fn dropped_tables(sql: &str) -> BTreeSet<String> {
    let mut tables: BTreeSet<String> = DROP_TABLE
        .captures_iter(sql)
        .map(|c| c[1].to_lowercase())
        .collect();
    tables.extend(RENAME_TABLE.captures_iter(sql).map(|c| c[1].to_lowercase()));
    tables
}

fn references_table(sql: &str, table: &str) -> bool {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(table)))
        .map(|re| re.is_match(sql))
        .unwrap_or(false)
}

const fn strictly_increasing(migrations: &[Migration]) -> bool {
    let mut i = 0;
    while i < migrations.len() {
        if migrations[i].version == 0 {
            return false;
        }
        if i > 0 && migrations[i].version <= migrations[i - 1].version {
            return false;
        }
        i += 1;
    }
    true
}

const _: () = assert!(
    strictly_increasing(MIGRATIONS),
    "migration versions must be non-zero and strictly increasing"
);

/// All built-in migrations, in version order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_core_tables",
        up: Step::Sql(
            r"
            CREATE TABLE systems (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hostname TEXT NOT NULL UNIQUE,
                name TEXT,
                platform TEXT,
                is_current INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                last_seen INTEGER NOT NULL
            );

            CREATE TABLE projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'paused', 'completed', 'archived')),
                repository_url TEXT,
                local_directory TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL
            );

            CREATE TABLE context_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER REFERENCES projects(id) ON DELETE CASCADE,
                system_id INTEGER REFERENCES systems(id) ON DELETE SET NULL,
                type TEXT NOT NULL
                    CHECK (type IN ('decision', 'code', 'standard', 'status', 'todo',
                                    'note', 'config', 'issue', 'reference')),
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                is_system_specific INTEGER NOT NULL DEFAULT 0,
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(project_id, key)
            );

            CREATE INDEX idx_context_entries_project ON context_entries(project_id);
            CREATE INDEX idx_context_entries_type ON context_entries(type);
            CREATE INDEX idx_context_entries_updated ON context_entries(updated_at DESC);
            CREATE INDEX idx_projects_last_accessed ON projects(last_accessed DESC);
            ",
        ),
        down: Some(Step::Sql(
            r"
            DROP TABLE context_entries;
            DROP TABLE projects;
            DROP TABLE systems;
            ",
        )),
        dependencies: &[],
    },
    Migration {
        version: 2,
        name: "create_update_history",
        up: Step::Sql(
            r"
            CREATE TABLE update_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                action TEXT NOT NULL,
                old_value TEXT,
                new_value TEXT,
                user_note TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX idx_update_history_entity ON update_history(entity_type, entity_id);
            ",
        ),
        down: Some(Step::Sql("DROP TABLE update_history;")),
        dependencies: &[],
    },
    Migration {
        version: 3,
        name: "create_context_search",
        up: Step::Sql(
            r"
            CREATE VIRTUAL TABLE context_search USING fts5(key, value, type);
            ",
        ),
        down: Some(Step::Sql("DROP TABLE context_search;")),
        dependencies: &[1],
    },
    Migration {
        version: 4,
        name: "backfill_context_search",
        up: Step::Rust(search::rebuild_index),
        down: Some(Step::Sql("DELETE FROM context_search;")),
        dependencies: &[3],
    },
    Migration {
        version: 5,
        name: "add_role_and_primary_system",
        up: Step::Sql(
            r"
            ALTER TABLE context_entries ADD COLUMN role_id TEXT;
            ALTER TABLE projects ADD COLUMN primary_system_id INTEGER;
            ",
        ),
        down: Some(Step::Sql(
            r"
            ALTER TABLE context_entries DROP COLUMN role_id;
            ALTER TABLE projects DROP COLUMN primary_system_id;
            ",
        )),
        dependencies: &[1],
    },
];
