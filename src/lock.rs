use chrono::Utc;
use log::{info, warn};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;

use crate::error::MigrateError;

pub const LOCK_TABLE: &str = "_buildwise_migration_lock";

const CREATE_LOCK_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _buildwise_migration_lock (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    holder      TEXT NOT NULL,
    pid         INTEGER NOT NULL,
    token       TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);
"#;

/// Contents of the lock row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockInfo {
    pub holder: String,
    pub pid: i64,
    pub token: String,
    pub acquired_at: String,
}

/// Advisory lock guarding a migration run.
///
/// A single row (id = 1) in `_buildwise_migration_lock` marks the database as
/// being migrated. The row is inserted with `INSERT OR IGNORE`, so two runners
/// racing on the same file serialize on SQLite's write lock and exactly one
/// of them sees the insert take effect. The lock is released explicitly via
/// [`MigrationLock::release`] or, failing that, when the guard is dropped.
pub struct MigrationLock<'a> {
    conn: &'a Connection,
    token: String,
    released: bool,
}

impl<'a> MigrationLock<'a> {
    pub fn acquire(conn: &'a Connection, holder: &str) -> Result<Self, MigrateError> {
        // Reads are not blocked by another writer's RESERVED lock, so a held
        // lock is reported even while its owner is mid-write.
        Self::ensure_free(conn)?;

        conn.execute_batch(CREATE_LOCK_TABLE_SQL)
            .map_err(Self::held_if_busy)?;

        let now = Utc::now();
        let pid = std::process::id();
        let token = format!(
            "{}-{}",
            pid,
            now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros())
        );

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO _buildwise_migration_lock (id, holder, pid, token, acquired_at)
                 VALUES (1, ?1, ?2, ?3, ?4)",
                params![holder, pid, token, now.to_rfc3339()],
            )
            .map_err(Self::held_if_busy)?;

        if inserted == 0 {
            return Err(Self::held_error(Self::current(conn)?));
        }

        info!("Acquired migration lock as '{}' (token {})", holder, token);

        Ok(Self {
            conn,
            token,
            released: false,
        })
    }

    /// A write that timed out waiting for the database means another run is
    /// writing: report it as a held lock rather than a database failure.
    pub fn held_if_busy(err: rusqlite::Error) -> MigrateError {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                warn!("Database busy while taking the migration lock: {}", err);
                Self::held_error(None)
            }
            _ => MigrateError::DatabaseError(err),
        }
    }

    /// Read the current lock row, if any. Never mutates the database.
    pub fn current(conn: &Connection) -> Result<Option<LockInfo>, MigrateError> {
        let table_exists: bool = conn.query_row(
            "SELECT count(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [LOCK_TABLE],
            |row| row.get(0),
        )?;

        if !table_exists {
            return Ok(None);
        }

        let info = conn
            .query_row(
                "SELECT holder, pid, token, acquired_at FROM _buildwise_migration_lock WHERE id = 1",
                [],
                |row| {
                    Ok(LockInfo {
                        holder: row.get(0)?,
                        pid: row.get(1)?,
                        token: row.get(2)?,
                        acquired_at: row.get(3)?,
                    })
                },
            )
            .optional()?;

        Ok(info)
    }

    /// Fail with `LockHeldError` if another run holds the lock.
    pub fn ensure_free(conn: &Connection) -> Result<(), MigrateError> {
        match Self::current(conn)? {
            Some(info) => Err(Self::held_error(Some(info))),
            None => Ok(()),
        }
    }

    /// Remove the lock row regardless of who holds it. Used to recover from a
    /// run that crashed while holding the lock.
    pub fn force_release(conn: &Connection) -> Result<Option<LockInfo>, MigrateError> {
        let info = Self::current(conn)?;
        if info.is_some() {
            conn.execute("DELETE FROM _buildwise_migration_lock WHERE id = 1", [])?;
        }
        Ok(info)
    }

    pub fn release(mut self) -> Result<(), MigrateError> {
        self.released = true;
        self.delete_own_row()
    }

    fn delete_own_row(&self) -> Result<(), MigrateError> {
        let deleted = self.conn.execute(
            "DELETE FROM _buildwise_migration_lock WHERE id = 1 AND token = ?1",
            [&self.token],
        )?;
        if deleted == 0 {
            warn!(
                "Migration lock (token {}) was already gone when releasing",
                self.token
            );
        } else {
            info!("Released migration lock");
        }
        Ok(())
    }

    fn held_error(info: Option<LockInfo>) -> MigrateError {
        match info {
            Some(info) => MigrateError::LockHeldError {
                holder: format!("{} (pid {})", info.holder, info.pid),
                acquired_at: info.acquired_at,
            },
            None => MigrateError::LockHeldError {
                holder: "another writer (database busy)".to_owned(),
                acquired_at: "unknown".to_owned(),
            },
        }
    }
}

impl Drop for MigrationLock<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.delete_own_row() {
            warn!("Failed to release migration lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::Database;

    fn file_db() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buildwise.db");
        Connection::open(&path).unwrap();
        (dir, path)
    }

    #[test]
    fn test_second_acquire_fails_fast() {
        let (_dir, path) = file_db();
        let first = Database::open(&path, &DatabaseConfig::default()).unwrap();
        let second = Database::open(&path, &DatabaseConfig::default()).unwrap();

        let lock = MigrationLock::acquire(first.conn(), "runner-a").unwrap();
        let err = MigrationLock::acquire(second.conn(), "runner-b").err().unwrap();
        match err {
            MigrateError::LockHeldError { holder, .. } => assert!(holder.starts_with("runner-a")),
            other => panic!("expected LockHeldError, got {other:?}"),
        }

        lock.release().unwrap();
        let _relock = MigrationLock::acquire(second.conn(), "runner-b").unwrap();
        let info = MigrationLock::current(first.conn()).unwrap().unwrap();
        assert_eq!(info.holder, "runner-b");
    }

    #[test]
    fn test_drop_releases_lock() {
        let (_dir, path) = file_db();
        let db = Database::open(&path, &DatabaseConfig::default()).unwrap();
        {
            let _lock = MigrationLock::acquire(db.conn(), "runner-a").unwrap();
            assert!(MigrationLock::current(db.conn()).unwrap().is_some());
        }
        assert!(MigrationLock::current(db.conn()).unwrap().is_none());
        assert!(MigrationLock::ensure_free(db.conn()).is_ok());
    }

    #[test]
    fn test_current_without_table_does_not_create_it() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(MigrationLock::current(&conn).unwrap().is_none());
        let count: i64 = conn
            .query_row("SELECT count(*) FROM sqlite_master", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_force_release_clears_stale_lock() {
        let conn = Connection::open_in_memory().unwrap();
        let lock = MigrationLock::acquire(&conn, "crashed-run").unwrap();
        std::mem::forget(lock);

        assert!(MigrationLock::ensure_free(&conn).is_err());
        let released = MigrationLock::force_release(&conn).unwrap().unwrap();
        assert_eq!(released.holder, "crashed-run");
        assert!(MigrationLock::ensure_free(&conn).is_ok());
    }

    #[test]
    fn test_acquire_while_other_connection_writes_is_lock_held() {
        let (_dir, path) = file_db();
        let writer = Database::open(&path, &DatabaseConfig::default()).unwrap();
        let impatient = DatabaseConfig {
            busy_timeout_ms: 100,
            ..DatabaseConfig::default()
        };
        let second = Database::open(&path, &impatient).unwrap();

        writer
            .conn()
            .execute_batch("CREATE TABLE t (v INTEGER); BEGIN IMMEDIATE; INSERT INTO t VALUES (1);")
            .unwrap();

        let err = MigrationLock::acquire(second.conn(), "runner-b").err().unwrap();
        assert!(matches!(err, MigrateError::LockHeldError { .. }), "got {err:?}");

        writer.conn().execute_batch("ROLLBACK").unwrap();
        assert!(MigrationLock::acquire(second.conn(), "runner-b").is_ok());
    }
}
