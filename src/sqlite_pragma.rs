//! Connection tuning shared by every SQLite handle
//!
//! Watchers, the scheduler and external readers all hold their own
//! connection to the same file, so WAL mode and a busy timeout are required
//! for readers to keep working while a flush or aggregation cycle commits.

use rusqlite::Connection;
use std::time::Duration;

/// How long a writer waits on a locked database before giving up
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply WAL, NORMAL sync, in-memory temp store and a bounded autocheckpoint
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pragmas_applied() {
        let dir = tempdir().unwrap();
        let conn = Connection::open(dir.path().join("pragma.db")).unwrap();
        apply_optimized_pragmas(&conn).unwrap();

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let checkpoint: i32 = conn
            .query_row("PRAGMA wal_autocheckpoint", [], |row| row.get(0))
            .unwrap();
        assert_eq!(checkpoint, 1000);
    }
}
