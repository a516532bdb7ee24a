//! Shadow full-text index over context entries.
//!
//! `context_search` is an FTS5 table keyed by the entry's rowid. It holds a
//! copy of key, type and the first `MAX_SEARCH_TEXT_BYTES` of the value.

use crate::validate::{truncate_on_char_boundary, MAX_SEARCH_TEXT_BYTES};
use rusqlite::{Connection, Transaction};

/// Replace the shadow row for one entry.
///
/// # Errors
///
/// Returns an error if the FTS table is missing or the write fails.
pub fn index_entry(
    conn: &Connection,
    id: i64,
    key: &str,
    value: &str,
    entry_type: &str,
) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM context_search WHERE rowid = ?1", [id])?;
    conn.execute(
        "INSERT INTO context_search (rowid, key, value, type) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            id,
            key,
            truncate_on_char_boundary(value, MAX_SEARCH_TEXT_BYTES),
            entry_type
        ],
    )?;
    Ok(())
}

/// Rebuild the whole shadow index from `context_entries`.
///
/// # Errors
///
/// Returns an error if either table is missing or a write fails.
pub fn rebuild_index(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM context_search", [])?;

    let mut stmt = tx.prepare("SELECT id, key, value, type FROM context_entries")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (id, key, value, entry_type) in &rows {
        index_entry(tx, *id, key, value, entry_type)?;
    }
    tracing::debug!(entries = rows.len(), "Rebuilt context search index");
    Ok(())
}
