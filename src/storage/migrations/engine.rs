//! Transactional migration engine.
//!
//! All pending migrations are applied inside one encompassing transaction:
//! either every pending version is recorded or none is. Rollback reverts
//! one version per transaction, newest first.

use super::{Migration, MIGRATIONS};
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A row of `schema_migrations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub version: u32,
    pub name: String,
    /// Unix milliseconds
    pub applied_at: i64,
    pub execution_time_ms: i64,
    pub is_reversible: bool,
}

/// A registered migration that has not been applied yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    pub version: u32,
    pub name: String,
}

/// Snapshot of a store's schema version.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub current_version: u32,
    pub latest_version: u32,
    pub applied: Vec<MigrationRecord>,
    pub pending: Vec<PendingMigration>,
}

/// Applies and reverts an ordered set of migrations.
#[derive(Debug, Clone)]
pub struct Migrator {
    migrations: Vec<Migration>,
}

impl Default for Migrator {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Migrator {
    /// Build from any list; it is sorted by version.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateMigration` if two entries share a version,
    /// and `Error::Validation` for version 0 (reserved for "nothing applied").
    pub fn new(migrations: &[Migration]) -> Result<Self> {
        let mut migrations = migrations.to_vec();
        migrations.sort_by_key(|m| m.version);

        if migrations.first().is_some_and(|m| m.version == 0) {
            return Err(Error::Validation(
                "migration version 0 is reserved".to_string(),
            ));
        }
        if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(Error::DuplicateMigration {
                version: pair[0].version,
            });
        }

        Ok(Self { migrations })
    }

    /// The built-in registry, already checked at compile time.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            migrations: MIGRATIONS.to_vec(),
        }
    }

    #[must_use]
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    #[must_use]
    pub fn get(&self, version: u32) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.version == version)
    }

    #[must_use]
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map_or(0, |m| m.version)
    }

    /// Create the tracking table if it is missing.
    ///
    /// Checks first so that an up-to-date store sees no writes at all.
    ///
    /// # Errors
    ///
    /// Returns an error if the check or the create fails.
    pub fn ensure_table(conn: &Connection) -> Result<()> {
        if !Self::table_exists(conn)? {
            conn.execute_batch(
                "CREATE TABLE schema_migrations (
                    version INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    applied_at INTEGER NOT NULL,
                    execution_time_ms INTEGER NOT NULL DEFAULT 0,
                    is_reversible INTEGER NOT NULL DEFAULT 0
                )",
            )?;
        }
        Ok(())
    }

    fn table_exists(conn: &Connection) -> Result<bool> {
        Ok(conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'")?
            .exists([])?)
    }

    /// Highest applied version, or 0 when nothing was ever applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn current_version(conn: &Connection) -> Result<u32> {
        if !Self::table_exists(conn)? {
            return Ok(0);
        }
        let version: Option<u32> = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(version.unwrap_or(0))
    }

    /// Applied migrations in ascending version order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn applied(conn: &Connection) -> Result<Vec<MigrationRecord>> {
        if !Self::table_exists(conn)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(
            "SELECT version, name, applied_at, execution_time_ms, is_reversible
             FROM schema_migrations ORDER BY version ASC",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(MigrationRecord {
                    version: row.get(0)?,
                    name: row.get(1)?,
                    applied_at: row.get(2)?,
                    execution_time_ms: row.get(3)?,
                    is_reversible: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Registered migrations above the current version.
    ///
    /// # Errors
    ///
    /// Returns an error if the current version cannot be read.
    pub fn pending(&self, conn: &Connection) -> Result<Vec<&Migration>> {
        let current = Self::current_version(conn)?;
        Ok(self
            .migrations
            .iter()
            .filter(|m| m.version > current)
            .collect())
    }

    /// Current/latest version plus applied and pending lists.
    ///
    /// # Errors
    ///
    /// Returns an error if the tracking table cannot be read.
    pub fn status(&self, conn: &Connection) -> Result<MigrationStatus> {
        let applied = Self::applied(conn)?;
        let current_version = applied.last().map_or(0, |r| r.version);
        let pending = self
            .migrations
            .iter()
            .filter(|m| m.version > current_version)
            .map(|m| PendingMigration {
                version: m.version,
                name: m.name.to_string(),
            })
            .collect();

        Ok(MigrationStatus {
            current_version,
            latest_version: self.latest_version(),
            applied,
            pending,
        })
    }

    /// Apply every pending migration in one transaction.
    ///
    /// Returns the versions applied, ascending. An up-to-date store is left
    /// untouched and yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns `Error::MigrationFailed` for the first failing migration; the
    /// whole transaction is rolled back, so no version from this call is
    /// recorded.
    pub fn migrate(&self, conn: &mut Connection) -> Result<Vec<u32>> {
        let current = Self::current_version(conn)?;

        if current > self.latest_version() {
            warn!(
                current,
                latest = self.latest_version(),
                "Store schema is newer than this build"
            );
        }

        let pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.version > current)
            .collect();

        if pending.is_empty() {
            debug!(version = current, "Schema up to date");
            return Ok(Vec::new());
        }

        let tx = conn.transaction()?;
        Self::ensure_table(&tx)?;
        let mut applied = Vec::with_capacity(pending.len());

        for migration in pending {
            info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            let started = Instant::now();

            migration
                .up
                .apply(&tx)
                .map_err(|e| Error::MigrationFailed {
                    version: migration.version,
                    name: migration.name.to_string(),
                    reason: e.to_string(),
                })?;

            let elapsed = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at, execution_time_ms, is_reversible)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    migration.version,
                    migration.name,
                    chrono::Utc::now().timestamp_millis(),
                    elapsed,
                    migration.is_reversible(),
                ],
            )
            .map_err(|e| Error::MigrationFailed {
                version: migration.version,
                name: migration.name.to_string(),
                reason: e.to_string(),
            })?;

            applied.push(migration.version);
        }

        tx.commit()?;
        info!(
            from = current,
            to = applied.last().copied().unwrap_or(current),
            count = applied.len(),
            "Migrations complete"
        );
        Ok(applied)
    }

    /// Revert applied migrations newer than `target`, newest first.
    ///
    /// Each version is reverted in its own transaction. A migration without
    /// an inverse stops the rollback; versions already reverted by this
    /// call stay reverted.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidRollbackTarget` if `target >= current`
    /// - `Error::IrreversibleMigration` for a migration lacking an inverse
    /// - `Error::RollbackFailed` if an inverse step fails or the applied
    ///   version is unknown to this migrator
    pub fn rollback(&self, conn: &mut Connection, target: u32) -> Result<Vec<u32>> {
        let current = Self::current_version(conn)?;
        if target >= current {
            return Err(Error::InvalidRollbackTarget { target, current });
        }

        let mut to_revert: Vec<u32> = Self::applied(conn)?
            .into_iter()
            .map(|r| r.version)
            .filter(|v| *v > target)
            .collect();
        to_revert.sort_unstable_by(|a, b| b.cmp(a));

        let mut reverted = Vec::with_capacity(to_revert.len());
        for version in to_revert {
            let migration = self.get(version).ok_or_else(|| Error::RollbackFailed {
                version,
                reason: "migration is not registered".to_string(),
            })?;
            let down = migration.down.ok_or_else(|| Error::IrreversibleMigration {
                version,
                name: migration.name.to_string(),
            })?;

            info!(version, name = migration.name, "Rolling back migration");

            let tx = conn.transaction()?;
            down.apply(&tx).map_err(|e| Error::RollbackFailed {
                version,
                reason: e.to_string(),
            })?;
            tx.execute("DELETE FROM schema_migrations WHERE version = ?1", [version])
                .map_err(|e| Error::RollbackFailed {
                    version,
                    reason: e.to_string(),
                })?;
            tx.commit()?;

            reverted.push(version);
        }

        info!(from = current, to = target, "Rollback complete");
        Ok(reverted)
    }

    /// Versions in `versions` unknown to this migrator.
    pub(crate) fn unknown_versions(&self, versions: &[u32]) -> Vec<u32> {
        let known: HashSet<u32> = self.migrations.iter().map(|m| m.version).collect();
        versions.iter().copied().filter(|v| !known.contains(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::Step;

    fn widget_migrations() -> Vec<Migration> {
        vec![
            Migration {
                version: 1,
                name: "widgets",
                up: Step::Sql("CREATE TABLE widgets (id INTEGER PRIMARY KEY, name TEXT);"),
                down: Some(Step::Sql("DROP TABLE widgets;")),
                dependencies: &[],
            },
            Migration {
                version: 3,
                name: "gizmos",
                up: Step::Sql("CREATE TABLE gizmos (id INTEGER PRIMARY KEY);"),
                down: Some(Step::Sql("DROP TABLE gizmos;")),
                dependencies: &[],
            },
            Migration {
                version: 2,
                name: "widget_color",
                up: Step::Sql("ALTER TABLE widgets ADD COLUMN color TEXT;"),
                down: Some(Step::Sql("ALTER TABLE widgets DROP COLUMN color;")),
                dependencies: &[1],
            },
        ]
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .unwrap()
            .exists([name])
            .unwrap()
    }

    fn total_changes(conn: &Connection) -> i64 {
        conn.query_row("SELECT total_changes()", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_out_of_order_input_applies_ascending() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&widget_migrations()).unwrap();

        let applied = migrator.migrate(&mut conn).unwrap();
        assert_eq!(applied, vec![1, 2, 3]);
        assert_eq!(Migrator::current_version(&conn).unwrap(), 3);

        let versions: Vec<u32> = Migrator::applied(&conn)
            .unwrap()
            .into_iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_migrate_twice_is_a_no_op() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&widget_migrations()).unwrap();
        migrator.migrate(&mut conn).unwrap();

        let before = total_changes(&conn);
        let records_before = Migrator::applied(&conn).unwrap();

        let applied = migrator.migrate(&mut conn).unwrap();
        assert!(applied.is_empty());
        assert_eq!(total_changes(&conn), before);
        assert_eq!(Migrator::applied(&conn).unwrap(), records_before);
    }

    #[test]
    fn test_failed_migration_records_nothing() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut migrations = widget_migrations();
        migrations.push(Migration {
            version: 4,
            name: "broken",
            up: Step::Sql("CREATE TABLE oops (; nonsense"),
            down: None,
            dependencies: &[],
        });
        let migrator = Migrator::new(&migrations).unwrap();

        let err = migrator.migrate(&mut conn).unwrap_err();
        assert!(matches!(err, Error::MigrationFailed { version: 4, .. }));
        assert!(err.to_string().starts_with("Migration 4 failed"));

        assert_eq!(Migrator::current_version(&conn).unwrap(), 0);
        assert!(!table_exists(&conn, "widgets"));
    }

    #[test]
    fn test_failed_first_migration_leaves_no_tracking_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&[Migration {
            version: 1,
            name: "broken",
            up: Step::Sql("CREATE TABLE oops (; nonsense"),
            down: None,
            dependencies: &[],
        }])
        .unwrap();

        assert!(migrator.migrate(&mut conn).is_err());
        assert!(!table_exists(&conn, "schema_migrations"));

        // Read paths tolerate the missing table without creating it.
        let status = migrator.status(&conn).unwrap();
        assert_eq!(status.current_version, 0);
        assert!(status.applied.is_empty());
        assert_eq!(migrator.pending(&conn).unwrap().len(), 1);
        assert!(!table_exists(&conn, "schema_migrations"));
    }

    #[test]
    fn test_duplicate_versions_rejected() {
        let mut migrations = widget_migrations();
        migrations.push(migrations[0]);
        assert!(matches!(
            Migrator::new(&migrations),
            Err(Error::DuplicateMigration { version: 1 })
        ));
    }

    #[test]
    fn test_rollback_to_target() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&widget_migrations()).unwrap();
        migrator.migrate(&mut conn).unwrap();

        let reverted = migrator.rollback(&mut conn, 1).unwrap();
        assert_eq!(reverted, vec![3, 2]);
        assert_eq!(Migrator::current_version(&conn).unwrap(), 1);
        assert!(table_exists(&conn, "widgets"));
        assert!(!table_exists(&conn, "gizmos"));
    }

    #[test]
    fn test_rollback_rejects_non_lower_target() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&widget_migrations()).unwrap();
        migrator.migrate(&mut conn).unwrap();

        assert!(matches!(
            migrator.rollback(&mut conn, 3),
            Err(Error::InvalidRollbackTarget { target: 3, current: 3 })
        ));
        assert!(migrator.rollback(&mut conn, 7).is_err());
    }

    #[test]
    fn test_irreversible_migration_stops_rollback() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut migrations = widget_migrations();
        migrations[1].down = None; // gizmos (v3)
        let migrator = Migrator::new(&migrations).unwrap();
        migrator.migrate(&mut conn).unwrap();

        let err = migrator.rollback(&mut conn, 0).unwrap_err();
        assert!(matches!(err, Error::IrreversibleMigration { version: 3, .. }));
        assert_eq!(Migrator::current_version(&conn).unwrap(), 3);
    }

    #[test]
    fn test_status_reports_pending() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrations = widget_migrations();
        Migrator::new(&migrations[..1]).unwrap().migrate(&mut conn).unwrap();

        let status = Migrator::new(&migrations).unwrap().status(&conn).unwrap();
        assert_eq!(status.current_version, 1);
        assert_eq!(status.latest_version, 3);
        assert_eq!(
            status.pending.iter().map(|p| p.version).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(status.applied[0].is_reversible);
    }

    #[test]
    fn test_builtin_registry_applies_cleanly() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::builtin();
        migrator.migrate(&mut conn).unwrap();
        assert_eq!(Migrator::current_version(&conn).unwrap(), migrator.latest_version());
        assert!(table_exists(&conn, "context_search"));

        migrator.rollback(&mut conn, 0).unwrap();
        assert!(!table_exists(&conn, "projects"));
    }
}
