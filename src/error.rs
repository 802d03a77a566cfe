use rusqlite::Error as RusqliteError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] Box<figment::Error>),

    #[error("Cannot open database '{}': {source}", path.display())]
    DatabaseUnavailable {
        path: PathBuf,
        source: RusqliteError,
    },

    #[error("Invalid migration plan: {0}")]
    PlanError(String),

    /// The step's table does not exist. Never treated as "column missing".
    #[error("Table '{table}' does not exist")]
    SchemaError { table: String },

    #[error("Migration of {table}.{target} failed: {source}")]
    MigrationFailed {
        table: String,
        target: String,
        source: RusqliteError,
    },

    #[error("Backfill of {table}.{column} failed: {source}")]
    BackfillFailed {
        table: String,
        column: String,
        source: RusqliteError,
    },

    /// Index names are schema-wide; the name is taken by another table.
    #[error("Index '{index}' for table '{table}' already exists on table '{owner}'")]
    IndexNameConflict {
        index: String,
        table: String,
        owner: String,
    },

    #[error("Migration already in progress (held by '{holder}' since {acquired_at})")]
    LockHeldError { holder: String, acquired_at: String },

    #[error("Rebuild of '{table}' lost rows: {before} before, {after} after")]
    RowCountMismatch {
        table: String,
        before: i64,
        after: i64,
    },

    #[error("Error: {0}")]
    Error(String),
}

impl MigrateError {
    /// Errors that end the whole run rather than a single step.
    pub fn is_run_level(&self) -> bool {
        matches!(
            self,
            MigrateError::LockHeldError { .. }
                | MigrateError::DatabaseUnavailable { .. }
                | MigrateError::ConfigError(_)
                | MigrateError::PlanError(_)
                | MigrateError::IoError(_)
        )
    }
}

impl From<figment::Error> for MigrateError {
    fn from(err: figment::Error) -> Self {
        MigrateError::ConfigError(Box::new(err))
    }
}
