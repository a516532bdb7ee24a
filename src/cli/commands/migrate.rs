//! Migrate command implementations.

use crate::cli::MigrateCommands;
use crate::config::{resolve_db_path, StoreConfig};
use crate::error::{Error, Result};
use crate::storage::store::{connect, safe_migrator};
use crate::storage::SafeMigrator;
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct ChangeOutput<'a> {
    action: &'a str,
    versions: &'a [u32],
    current_version: u32,
}

/// Execute a migrate subcommand against a single store file.
///
/// # Errors
///
/// Returns an error if the store cannot be opened, a migration or rollback
/// fails, or validation finds problems.
pub fn execute(
    command: &MigrateCommands,
    db_path: Option<&PathBuf>,
    backup_dir: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    let db_path = resolve_db_path(db_path.map(PathBuf::as_path))
        .ok_or_else(|| Error::Config("no store path: pass --db or set CTXHUB_DB".to_string()))?;

    let config = StoreConfig {
        backup_dir: backup_dir.cloned(),
        ..StoreConfig::default()
    };
    let mut conn = connect(&db_path, &config)?;
    let migrator = safe_migrator(&config, Some(&db_path));

    match command {
        MigrateCommands::Status => execute_status(&conn, &migrator, &db_path, json),
        MigrateCommands::Up => {
            let applied = migrator.migrate(&mut conn)?;
            print_change("migrate", &applied, &conn, json)
        }
        MigrateCommands::Rollback { target } => {
            let reverted = migrator.safe_rollback(&mut conn, *target)?;
            print_change("rollback", &reverted, &conn, json)
        }
        MigrateCommands::Validate => execute_validate(&conn, &migrator, json),
    }
}

fn execute_status(
    conn: &Connection,
    migrator: &SafeMigrator,
    db_path: &Path,
    json: bool,
) -> Result<()> {
    let status = migrator.migrator().status(conn)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Store: {}", db_path.display());
    println!(
        "Schema version: {} (latest {})",
        status.current_version, status.latest_version
    );
    for record in &status.applied {
        let reversible = if record.is_reversible { "" } else { " [irreversible]" };
        println!(
            "  applied  v{:<3} {} ({}ms){reversible}",
            record.version, record.name, record.execution_time_ms
        );
    }
    for pending in &status.pending {
        println!("  pending  v{:<3} {}", pending.version, pending.name);
    }
    Ok(())
}

fn print_change(action: &str, versions: &[u32], conn: &Connection, json: bool) -> Result<()> {
    let current_version = crate::storage::Migrator::current_version(conn)?;

    if json {
        let output = ChangeOutput {
            action,
            versions,
            current_version,
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    if versions.is_empty() {
        println!("Nothing to {action}; schema is at v{current_version}");
    } else {
        let list: Vec<String> = versions.iter().map(|v| format!("v{v}")).collect();
        println!("{action}: {} -> now at v{current_version}", list.join(", "));
    }
    Ok(())
}

fn execute_validate(conn: &Connection, migrator: &SafeMigrator, json: bool) -> Result<()> {
    let report = migrator.validate_schema(conn)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.is_valid() {
        println!("Schema is valid");
    }

    if report.is_valid() {
        Ok(())
    } else {
        Err(Error::SchemaValidation(report.problems()))
    }
}
