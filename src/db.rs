use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use rusqlite::{Connection, OpenFlags};

use crate::config::DatabaseConfig;
use crate::error::MigrateError;

/// Exclusive handle on the BuildWise SQLite file for the duration of a run.
pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    /// Open an existing database file. The file is never created: a missing
    /// file is a run-level error, not an empty schema.
    pub fn open(path: &Path, config: &DatabaseConfig) -> Result<Self, MigrateError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(path, flags).map_err(|source| {
            MigrateError::DatabaseUnavailable {
                path: path.to_path_buf(),
                source,
            }
        })?;

        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;

        // Touch the schema so a non-database file fails here rather than mid-run
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|source| MigrateError::DatabaseUnavailable {
            path: path.to_path_buf(),
            source,
        })?;

        info!(
            "Database opened at: {} (SQLite {})",
            path.display(),
            rusqlite::version()
        );

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Run `f` inside a named savepoint: released on success, rolled back on error.
///
/// Nests inside an enclosing transaction (the dry-run rehearsal) and behaves
/// like its own transaction otherwise.
pub fn with_savepoint<T, F>(conn: &Connection, name: &str, f: F) -> Result<T, MigrateError>
where
    F: FnOnce(&Connection) -> Result<T, MigrateError>,
{
    conn.execute_batch(&format!("SAVEPOINT {name}"))?;

    match f(conn) {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {name}"))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) =
                conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
            {
                warn!("Failed to roll back savepoint '{}': {}", name, rollback_err);
            }
            Err(err)
        }
    }
}
