//! Pre-migration snapshots via the SQLite online backup API.

use crate::error::{Error, Result};
use rusqlite::backup::{Backup, Progress};
use rusqlite::{Connection, DatabaseName};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const PAGES_PER_STEP: std::ffi::c_int = 256;

/// An in-memory copy of a store taken before a schema change.
#[derive(Debug)]
pub struct Snapshot {
    copy: Connection,
    /// Schema version at the time of the snapshot.
    pub version: u32,
    /// Unix milliseconds
    pub created_at: i64,
    /// Persisted copy, when a backup directory is configured.
    pub file: Option<PathBuf>,
}

/// Takes and restores snapshots.
#[derive(Debug, Clone, Default)]
pub struct BackupManager {
    backup_dir: Option<PathBuf>,
    stem: String,
}

impl BackupManager {
    /// Snapshots stay in memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Snapshots are also written to `dir` as `<stem>-v<version>-<millis>.db`.
    #[must_use]
    pub fn with_dir(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            backup_dir: Some(dir.into()),
            stem: stem.into(),
        }
    }

    #[must_use]
    pub fn backup_dir(&self) -> Option<&Path> {
        self.backup_dir.as_deref()
    }

    /// Copy every page of `conn` into a fresh snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Error::Backup` if the copy or the file write fails.
    pub fn create(&self, conn: &Connection, version: u32) -> Result<Snapshot> {
        let mut copy = Connection::open_in_memory()?;
        Backup::new(conn, &mut copy)
            .and_then(|b| b.run_to_completion(PAGES_PER_STEP, Duration::ZERO, None))
            .map_err(|e| Error::Backup(format!("snapshot failed: {e}")))?;

        let created_at = chrono::Utc::now().timestamp_millis();
        let file = match &self.backup_dir {
            Some(dir) => Some(self.persist(&copy, dir, version, created_at)?),
            None => None,
        };

        info!(version, file = ?file, "Created pre-migration backup");
        Ok(Snapshot {
            copy,
            version,
            created_at,
            file,
        })
    }

    fn persist(&self, copy: &Connection, dir: &Path, version: u32, millis: i64) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).map_err(|source| Error::PathIo {
            path: dir.to_path_buf(),
            source,
        })?;
        let stem = if self.stem.is_empty() { "store" } else { &self.stem };
        let path = dir.join(format!("{stem}-v{version}-{millis}.db"));
        copy.backup(DatabaseName::Main, &path, None::<fn(Progress)>)
            .map_err(|e| Error::Backup(format!("writing {}: {e}", path.display())))?;
        Ok(path)
    }

    /// Overwrite `conn` with the snapshot's pages.
    ///
    /// # Errors
    ///
    /// Returns `Error::Backup` if the copy fails.
    pub fn restore(&self, snapshot: &Snapshot, conn: &mut Connection) -> Result<()> {
        Backup::new(&snapshot.copy, conn)
            .and_then(|b| b.run_to_completion(PAGES_PER_STEP, Duration::ZERO, None))
            .map_err(|e| Error::Backup(format!("restore failed: {e}")))?;
        debug!(version = snapshot.version, "Restored pre-migration backup");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_restore_undoes_changes() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY); INSERT INTO items VALUES (1);")
            .unwrap();

        let manager = BackupManager::in_memory();
        let snapshot = manager.create(&conn, 1).unwrap();
        assert!(snapshot.file.is_none());

        conn.execute_batch("INSERT INTO items VALUES (2); CREATE TABLE extra (x);")
            .unwrap();
        assert_eq!(count(&conn), 2);

        manager.restore(&snapshot, &mut conn).unwrap();
        assert_eq!(count(&conn), 1);
        let extra: bool = conn
            .prepare("SELECT 1 FROM sqlite_master WHERE name = 'extra'")
            .unwrap()
            .exists([])
            .unwrap();
        assert!(!extra);
    }

    #[test]
    fn test_persisted_backup_file() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY); INSERT INTO items VALUES (7);")
            .unwrap();

        let snapshot = BackupManager::with_dir(dir.path(), "tenant")
            .create(&conn, 3)
            .unwrap();
        let file = snapshot.file.unwrap();
        let name = file.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("tenant-v3-"));
        assert!(name.ends_with(".db"));

        let reopened = Connection::open(&file).unwrap();
        assert_eq!(count(&reopened), 1);
    }
}
