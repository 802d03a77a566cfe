use log::{debug, info};
use rusqlite::Connection;

use crate::db::with_savepoint;
use crate::error::MigrateError;
use crate::utils::Utils;

use super::step::Backfill;

/// Populates a column on rows that predate it.
///
/// Only rows where the column IS NULL and the source yields a value are
/// touched, so explicit values are never overwritten and a repeated run
/// updates nothing.
pub struct BackfillPass<'a> {
    conn: &'a Connection,
}

impl<'a> BackfillPass<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn update_sql(table: &str, column: &str, backfill: &Backfill) -> String {
        let column = Utils::quote_ident(column);
        format!(
            "UPDATE {table} SET {column} = ({from}) WHERE {column} IS NULL AND ({from}) IS NOT NULL",
            table = Utils::quote_ident(table),
            column = column,
            from = backfill.from,
        )
    }

    /// Run the backfill in its own savepoint. Returns the number of rows updated.
    ///
    /// A failure rolls back the backfill only; the column added before it stays.
    pub fn run(&self, table: &str, column: &str, backfill: &Backfill) -> Result<usize, MigrateError> {
        let sql = Self::update_sql(table, column, backfill);
        debug!("Executing: {}", sql);

        let updated = with_savepoint(self.conn, "buildwise_backfill", |conn| {
            conn.execute(&sql, []).map_err(|source| MigrateError::BackfillFailed {
                table: table.to_owned(),
                column: column.to_owned(),
                source,
            })
        })?;

        info!("{}.{}: backfilled {} rows", table, column, updated);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PHASE_FROM_PROJECT: &str =
        "SELECT p.construction_phase FROM projects p WHERE p.id = cost_positions.project_id";

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE projects (id INTEGER PRIMARY KEY, construction_phase VARCHAR(50));
             CREATE TABLE cost_positions (
                 id INTEGER PRIMARY KEY,
                 project_id INTEGER,
                 construction_phase VARCHAR(50)
             );
             INSERT INTO projects (id, construction_phase) VALUES (1, 'rohbau'), (2, 'innenausbau'), (3, NULL);
             INSERT INTO cost_positions (id, project_id, construction_phase) VALUES
                 (10, 1, NULL),
                 (11, 1, 'fertigstellung'),
                 (12, 2, NULL),
                 (13, 3, NULL),
                 (14, 99, NULL);",
        )
        .unwrap();
        conn
    }

    fn phases(conn: &Connection) -> Vec<(i64, Option<String>)> {
        let mut stmt = conn
            .prepare("SELECT id, construction_phase FROM cost_positions ORDER BY id")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_backfill_only_fills_nulls() {
        let conn = conn();
        let pass = BackfillPass::new(&conn);
        let backfill = Backfill {
            from: PHASE_FROM_PROJECT.into(),
        };

        let updated = pass.run("cost_positions", "construction_phase", &backfill).unwrap();
        assert_eq!(updated, 2);

        assert_eq!(
            phases(&conn),
            vec![
                (10, Some("rohbau".into())),
                (11, Some("fertigstellung".into())),
                (12, Some("innenausbau".into())),
                (13, None),
                (14, None),
            ]
        );
    }

    #[test]
    fn test_backfill_rerun_is_noop() {
        let conn = conn();
        let pass = BackfillPass::new(&conn);
        let backfill = Backfill {
            from: PHASE_FROM_PROJECT.into(),
        };

        pass.run("cost_positions", "construction_phase", &backfill).unwrap();
        let before = phases(&conn);
        assert_eq!(pass.run("cost_positions", "construction_phase", &backfill).unwrap(), 0);
        assert_eq!(phases(&conn), before);
    }

    #[test]
    fn test_backfill_failure_leaves_rows_untouched() {
        let conn = conn();
        let pass = BackfillPass::new(&conn);
        let backfill = Backfill {
            from: "SELECT p.phase_that_does_not_exist FROM projects p".into(),
        };

        let before = phases(&conn);
        let err = pass.run("cost_positions", "construction_phase", &backfill).unwrap_err();
        assert!(matches!(err, MigrateError::BackfillFailed { .. }));
        assert_eq!(phases(&conn), before);
        assert!(conn.is_autocommit());
    }
}
