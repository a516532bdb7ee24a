//! Migration engine with backups, schema validation and dependency checks.
//!
//! `SafeMigrator` wraps [`Migrator`]: it validates the schema before and
//! after every change, snapshots the store first, and restores the snapshot
//! if the change fails or leaves the schema invalid.

use super::{BackupManager, Migration, Migrator, Snapshot};
use crate::error::{Error, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{error, info, warn};

/// Outcome of a schema validation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaReport {
    /// Messages from `PRAGMA integrity_check` other than `ok`.
    pub integrity_errors: Vec<String>,
    /// Rows reported by `PRAGMA foreign_key_check`.
    pub foreign_key_violations: usize,
    /// Recorded versions this build does not know about.
    pub unknown_versions: Vec<u32>,
    /// Tables applied migrations should have produced but are absent.
    pub missing_tables: Vec<String>,
}

impl SchemaReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.integrity_errors.is_empty()
            && self.foreign_key_violations == 0
            && self.unknown_versions.is_empty()
            && self.missing_tables.is_empty()
    }

    /// Human-readable problems, empty when valid.
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .integrity_errors
            .iter()
            .map(|e| format!("integrity check: {e}"))
            .collect();
        if self.foreign_key_violations > 0 {
            out.push(format!(
                "{} foreign key violation(s)",
                self.foreign_key_violations
            ));
        }
        out.extend(
            self.unknown_versions
                .iter()
                .map(|v| format!("unknown migration version {v} recorded")),
        );
        out.extend(
            self.missing_tables
                .iter()
                .map(|t| format!("expected table '{t}' is missing")),
        );
        out
    }
}

/// Backup-guarded migrator.
#[derive(Debug, Clone, Default)]
pub struct SafeMigrator {
    migrator: Migrator,
    backups: BackupManager,
}

impl SafeMigrator {
    #[must_use]
    pub fn new(migrator: Migrator, backups: BackupManager) -> Self {
        Self { migrator, backups }
    }

    #[must_use]
    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    /// Inspect the store without writing to it.
    ///
    /// # Errors
    ///
    /// Returns an error if a pragma or catalog query fails.
    pub fn validate_schema(&self, conn: &Connection) -> Result<SchemaReport> {
        let integrity_errors = {
            let mut stmt = conn.prepare("PRAGMA integrity_check")?;
            stmt.query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .filter(|msg| msg != "ok")
                .collect()
        };

        let foreign_key_violations = {
            let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
            let mut rows = stmt.query([])?;
            let mut n = 0;
            while rows.next()?.is_some() {
                n += 1;
            }
            n
        };

        let tables = existing_tables(conn)?;
        let applied: Vec<u32> = if tables.contains("schema_migrations") {
            Migrator::applied(conn)?.into_iter().map(|r| r.version).collect()
        } else {
            Vec::new()
        };

        let missing_tables = self
            .expected_tables(&applied)
            .into_iter()
            .filter(|t| !tables.contains(t))
            .collect();

        Ok(SchemaReport {
            integrity_errors,
            foreign_key_violations,
            unknown_versions: self.migrator.unknown_versions(&applied),
            missing_tables,
        })
    }

    /// Tables created and not later dropped by the given applied versions.
    fn expected_tables(&self, applied: &[u32]) -> BTreeSet<String> {
        let mut expected = BTreeSet::new();
        for migration in self
            .migrator
            .migrations()
            .iter()
            .filter(|m| applied.contains(&m.version))
        {
            for table in migration.dropped_tables() {
                expected.remove(&table);
            }
            expected.extend(migration.created_tables());
        }
        expected
    }

    fn check(&self, conn: &Connection, stage: &str) -> Result<()> {
        let report = self.validate_schema(conn)?;
        if report.is_valid() {
            return Ok(());
        }
        let problems = report.problems();
        warn!(stage, ?problems, "Schema validation failed");
        Err(Error::SchemaValidation(problems))
    }

    /// Validate, snapshot, migrate, validate again.
    ///
    /// # Errors
    ///
    /// - `Error::SchemaValidation` if the store is invalid before starting,
    ///   or invalid after migrating (the snapshot is restored first)
    /// - the engine's error if a migration fails (the snapshot is restored first)
    pub fn migrate(&self, conn: &mut Connection) -> Result<Vec<u32>> {
        self.check(conn, "pre-migrate")?;

        if self.migrator.pending(conn)?.is_empty() {
            return Ok(Vec::new());
        }

        let current = Migrator::current_version(conn)?;
        let snapshot = self.backups.create(conn, current)?;

        let outcome = self
            .migrator
            .migrate(conn)
            .and_then(|applied| self.check(conn, "post-migrate").map(|()| applied));
        self.restore_on_failure(outcome, &snapshot, conn)
    }

    /// Roll back to `target` after checking nothing still applied depends on
    /// the versions being reverted.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidRollbackTarget` if `target >= current`
    /// - `Error::DependentMigrations` if a reverted version has a later
    ///   applied dependent
    /// - `Error::SchemaValidation` before or after the rollback
    /// - the engine's rollback errors (the snapshot is restored first)
    pub fn safe_rollback(&self, conn: &mut Connection, target: u32) -> Result<Vec<u32>> {
        self.check(conn, "pre-rollback")?;

        let current = Migrator::current_version(conn)?;
        if target >= current {
            return Err(Error::InvalidRollbackTarget { target, current });
        }

        let applied: Vec<&Migration> = Migrator::applied(conn)?
            .iter()
            .filter_map(|r| self.migrator.get(r.version))
            .collect();
        for reverted in applied.iter().filter(|m| m.version > target) {
            let dependents: Vec<u32> = applied
                .iter()
                .filter(|later| later.depends_on(reverted))
                .map(|later| later.version)
                .collect();
            if !dependents.is_empty() {
                return Err(Error::DependentMigrations {
                    version: reverted.version,
                    dependents,
                });
            }
        }

        let snapshot = self.backups.create(conn, current)?;
        let outcome = self
            .migrator
            .rollback(conn, target)
            .and_then(|reverted| self.check(conn, "post-rollback").map(|()| reverted));
        self.restore_on_failure(outcome, &snapshot, conn)
    }

    fn restore_on_failure<T>(
        &self,
        outcome: Result<T>,
        snapshot: &Snapshot,
        conn: &mut Connection,
    ) -> Result<T> {
        match outcome {
            Ok(value) => Ok(value),
            Err(e) => {
                error!(error = %e, version = snapshot.version, "Schema change failed, restoring backup");
                if let Err(restore_err) = self.backups.restore(snapshot, conn) {
                    error!(error = %restore_err, "Backup restore failed");
                    return Err(restore_err);
                }
                info!(version = snapshot.version, "Store restored to pre-change state");
                Err(e)
            }
        }
    }
}

fn existing_tables(conn: &Connection) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT lower(name) FROM sqlite_master WHERE type = 'table'")?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::{Step, MIGRATIONS};
    use rusqlite::Transaction;

    fn drop_widgets(tx: &Transaction<'_>) -> rusqlite::Result<()> {
        tx.execute_batch("DROP TABLE widgets;")
    }

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
                version: 2,
                name: "widget_parts",
                up: Step::Sql(
                    "CREATE TABLE widget_parts (id INTEGER PRIMARY KEY, widget_id INTEGER REFERENCES widgets(id));",
                ),
                down: Some(Step::Sql("DROP TABLE widget_parts;")),
                dependencies: &[],
            },
        ]
    }

    fn safe(migrations: &[Migration]) -> SafeMigrator {
        SafeMigrator::new(Migrator::new(migrations).unwrap(), BackupManager::in_memory())
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        existing_tables(conn).unwrap().contains(name)
    }

    #[test]
    fn test_clean_migrate_validates() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = SafeMigrator::default();
        let applied = migrator.migrate(&mut conn).unwrap();
        assert_eq!(applied.len(), MIGRATIONS.len());

        let report = migrator.validate_schema(&conn).unwrap();
        assert!(report.is_valid(), "{:?}", report.problems());
        assert!(migrator.migrate(&mut conn).unwrap().is_empty());
    }

    #[test]
    fn test_post_validation_failure_restores_backup() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut migrations = widget_migrations();
        safe(&migrations[..1]).migrate(&mut conn).unwrap();
        conn.execute("INSERT INTO widgets (name) VALUES ('keep me')", []).unwrap();

        // Drops a table the validator still expects, invisible to SQL inspection.
        migrations.push(Migration {
            version: 3,
            name: "sneaky_drop",
            up: Step::Rust(drop_widgets),
            down: None,
            dependencies: &[],
        });

        let err = safe(&migrations).migrate(&mut conn).unwrap_err();
        match err {
            Error::SchemaValidation(problems) => {
                assert!(problems.iter().any(|p| p.contains("widgets")));
            }
            other => panic!("expected SchemaValidation, got {other:?}"),
        }

        assert_eq!(Migrator::current_version(&conn).unwrap(), 1);
        let name: String = conn
            .query_row("SELECT name FROM widgets", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "keep me");
    }

    #[test]
    fn test_failed_migration_is_reraised() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut migrations = widget_migrations();
        migrations.push(Migration {
            version: 3,
            name: "broken",
            up: Step::Sql("INSERT INTO no_such_table VALUES (1);"),
            down: None,
            dependencies: &[],
        });

        let err = safe(&migrations).migrate(&mut conn).unwrap_err();
        assert!(matches!(err, Error::MigrationFailed { version: 3, .. }));
        assert!(!table_exists(&conn, "widgets"));
    }

    #[test]
    fn test_safe_rollback_refuses_with_dependents() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = safe(&widget_migrations());
        migrator.migrate(&mut conn).unwrap();

        let err = migrator.safe_rollback(&mut conn, 0).unwrap_err();
        match &err {
            Error::DependentMigrations { version, dependents } => {
                assert_eq!(*version, 1);
                assert_eq!(dependents, &vec![2]);
            }
            other => panic!("expected DependentMigrations, got {other:?}"),
        }
        assert!(err.to_string().starts_with("Cannot rollback: dependent migrations exist"));
        assert_eq!(Migrator::current_version(&conn).unwrap(), 2);

        // Peeling the dependent first makes the chain reversible.
        assert_eq!(migrator.safe_rollback(&mut conn, 1).unwrap(), vec![2]);
        assert_eq!(migrator.safe_rollback(&mut conn, 0).unwrap(), vec![1]);
        assert!(!table_exists(&conn, "widgets"));
    }

    #[test]
    fn test_unknown_recorded_version_is_invalid() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = safe(&widget_migrations());
        migrator.migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (99, 'future', 0)",
            [],
        )
        .unwrap();

        let report = migrator.validate_schema(&conn).unwrap();
        assert_eq!(report.unknown_versions, vec![99]);
        assert!(matches!(
            migrator.migrate(&mut conn),
            Err(Error::SchemaValidation(_))
        ));
    }

    #[test]
    fn test_validate_does_not_write() {
        let conn = Connection::open_in_memory().unwrap();
        let report = SafeMigrator::default().validate_schema(&conn).unwrap();
        assert!(report.is_valid());
        assert!(!table_exists(&conn, "schema_migrations"));
    }
}
