use log::{debug, info, warn};
use rusqlite::Connection;

use crate::db::with_savepoint;
use crate::error::MigrateError;
use crate::introspect::SchemaInspector;
use crate::utils::Utils;

use super::step::RebuildCheck;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildStats {
    pub rows: i64,
    pub copied_columns: Vec<String>,
}

/// Destructive table change: create the new shape, copy, drop, rename.
///
/// Runs in a single savepoint. The copy must preserve the row count and the
/// new table must pass `foreign_key_check`, otherwise everything is rolled
/// back. Explicit indexes and triggers of the old table are recreated. Columns
/// that exist only in the old table abort the rebuild unless the check names
/// them as the column to remove.
pub struct TableRebuilder<'a> {
    conn: &'a Connection,
}

impl<'a> TableRebuilder<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn rebuild(
        &self,
        table: &str,
        definition: &str,
        check: &RebuildCheck,
    ) -> Result<RebuildStats, MigrateError> {
        // foreign_keys can only be switched outside a transaction; inside the
        // dry-run rehearsal enforcement is deferred instead.
        let restore_fk = if self.conn.is_autocommit() {
            let enabled: bool = self
                .conn
                .query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
            if enabled {
                self.conn.execute_batch("PRAGMA foreign_keys = OFF")?;
            }
            enabled
        } else {
            false
        };

        let result = with_savepoint(self.conn, "buildwise_rebuild", |conn| {
            Self::copy_and_swap(conn, table, definition, check)
        });

        if restore_fk {
            if let Err(e) = self.conn.execute_batch("PRAGMA foreign_keys = ON") {
                warn!("Failed to re-enable foreign keys after rebuilding '{}': {}", table, e);
            }
        }

        let stats = result?;
        info!(
            "Rebuilt '{}': {} rows, {} columns copied",
            table,
            stats.rows,
            stats.copied_columns.len()
        );
        Ok(stats)
    }

    fn copy_and_swap(
        conn: &Connection,
        table: &str,
        definition: &str,
        check: &RebuildCheck,
    ) -> Result<RebuildStats, MigrateError> {
        let failed = |source: rusqlite::Error| MigrateError::MigrationFailed {
            table: table.to_owned(),
            target: check.column().to_owned(),
            source,
        };

        let inspector = SchemaInspector::new(conn);
        let old_columns = inspector.columns(table)?;
        let dependents = inspector.dependent_sql(table)?;
        let before = inspector.row_count(table)?;

        conn.execute_batch("PRAGMA defer_foreign_keys = ON")?;

        let tmp = format!("{}__rebuild", table);
        let tmp_q = Utils::quote_ident(&tmp);
        let table_q = Utils::quote_ident(table);

        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {tmp_q}; CREATE TABLE {tmp_q} ({definition});"
        ))
        .map_err(failed)?;

        let new_columns = inspector.columns(&tmp)?;
        let in_new = |name: &str| new_columns.iter().any(|c| c.name.eq_ignore_ascii_case(name));

        let dropped: Vec<&str> = old_columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|&name| !in_new(name))
            .filter(|&name| {
                !matches!(check, RebuildCheck::Absent(col) if col.eq_ignore_ascii_case(name))
            })
            .collect();
        if !dropped.is_empty() {
            return Err(MigrateError::Error(format!(
                "Rebuild of '{}' would drop columns not named by the step: {}",
                table,
                dropped.join(", ")
            )));
        }

        let copied: Vec<String> = old_columns
            .iter()
            .filter(|c| in_new(c.name.as_str()))
            .map(|c| c.name.clone())
            .collect();
        if copied.is_empty() {
            return Err(MigrateError::Error(format!(
                "Rebuild of '{}' shares no columns with the new definition",
                table
            )));
        }

        let column_list = copied
            .iter()
            .map(|c| Utils::quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let copy_sql = format!(
            "INSERT INTO {tmp_q} ({column_list}) SELECT {column_list} FROM {table_q}"
        );
        debug!("Executing: {}", copy_sql);
        conn.execute(&copy_sql, []).map_err(failed)?;

        let after = inspector.row_count(&tmp)?;
        if before != after {
            return Err(MigrateError::RowCountMismatch {
                table: table.to_owned(),
                before,
                after,
            });
        }

        // Legacy rename keeps views and triggers elsewhere from being
        // re-validated against the momentarily missing table.
        conn.execute_batch("PRAGMA legacy_alter_table = ON")?;
        let swap = conn.execute_batch(&format!(
            "DROP TABLE {table_q}; ALTER TABLE {tmp_q} RENAME TO {table_q};"
        ));
        conn.execute_batch("PRAGMA legacy_alter_table = OFF")?;
        swap.map_err(failed)?;

        for sql in &dependents {
            debug!("Recreating: {}", sql);
            conn.execute_batch(sql).map_err(failed)?;
        }

        let violations: i64 = conn.query_row(
            "SELECT count(*) FROM pragma_foreign_key_check(?1)",
            [table],
            |row| row.get(0),
        )?;
        if violations > 0 {
            return Err(MigrateError::Error(format!(
                "Rebuild of '{}' leaves {} foreign key violations",
                table, violations
            )));
        }

        Ok(RebuildStats {
            rows: after,
            copied_columns: copied,
        })
    }
}
