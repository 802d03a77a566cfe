use log::{debug, info};
use rusqlite::Connection;

use crate::error::MigrateError;
use crate::introspect::{SchemaInspector, SchemaSnapshot};

use super::rebuild::TableRebuilder;
use super::step::{MigrationStep, Presence, StepKind};

/// What the mutator did with a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Applied,
    AlreadyPresent,
}

/// Applies a step's DDL if and only if its target is missing from the snapshot.
pub struct AdditiveMutator<'a> {
    conn: &'a Connection,
}

impl<'a> AdditiveMutator<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn apply(
        &self,
        step: &MigrationStep,
        snapshot: &SchemaSnapshot,
    ) -> Result<Mutation, MigrateError> {
        if step.presence_in(snapshot)? == Presence::Present {
            info!("{}.{}: already present", step.table, step.target());
            return Ok(Mutation::AlreadyPresent);
        }

        match &step.kind {
            StepKind::CreateIndex { index, .. } => {
                // CREATE INDEX IF NOT EXISTS would silently skip a name taken elsewhere
                if let Some(owner) = SchemaInspector::new(self.conn).index_table(index)? {
                    return Err(MigrateError::IndexNameConflict {
                        index: index.clone(),
                        table: step.table.clone(),
                        owner,
                    });
                }
                self.execute_ddl(step)?;
            }
            StepKind::RebuildTable { definition, check } => {
                TableRebuilder::new(self.conn).rebuild(&step.table, definition, check)?;
            }
            _ => self.execute_ddl(step)?,
        }

        info!("{}.{}: applied", step.table, step.target());
        Ok(Mutation::Applied)
    }

    fn execute_ddl(&self, step: &MigrationStep) -> Result<(), MigrateError> {
        if let Some(ddl) = step.ddl() {
            debug!("Executing: {}", ddl);
            self.conn
                .execute_batch(&ddl)
                .map_err(|source| MigrateError::MigrationFailed {
                    table: step.table.clone(),
                    target: step.target().to_owned(),
                    source,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE milestones (id INTEGER PRIMARY KEY, title TEXT NOT NULL);
             INSERT INTO milestones (title) VALUES ('Elektro'), ('Sanitär');",
        )
        .unwrap();
        conn
    }

    fn apply_fresh(conn: &Connection, step: &MigrationStep) -> Result<Mutation, MigrateError> {
        let snapshot = SchemaInspector::new(conn).snapshot([step.table.as_str()]).unwrap();
        AdditiveMutator::new(conn).apply(step, &snapshot)
    }

    #[test]
    fn test_add_column_then_already_present() {
        let conn = conn();
        let step = MigrationStep::add_column("m", "milestones", "archived_by", "VARCHAR(100)");

        assert_eq!(apply_fresh(&conn, &step).unwrap(), Mutation::Applied);
        let after_first = SchemaInspector::new(&conn).columns("milestones").unwrap();

        assert_eq!(apply_fresh(&conn, &step).unwrap(), Mutation::AlreadyPresent);
        let after_second = SchemaInspector::new(&conn).columns("milestones").unwrap();
        assert_eq!(after_first, after_second);

        let col = after_second.iter().find(|c| c.name == "archived_by").unwrap();
        assert_eq!(col.decl_type, "VARCHAR(100)");
    }

    #[test]
    fn test_missing_table_is_schema_error() {
        let conn = conn();
        let step = MigrationStep::add_column("d", "acceptance_defects", "photo_url", "TEXT");
        assert!(matches!(
            apply_fresh(&conn, &step),
            Err(MigrateError::SchemaError { .. })
        ));
    }

    #[test]
    fn test_ddl_error_is_migration_failed() {
        let conn = conn();
        // SQLite refuses NOT NULL columns without a default on ADD COLUMN
        let step = MigrationStep::add_column("m", "milestones", "priority", "INTEGER")
            .with_constraints("NOT NULL");
        match apply_fresh(&conn, &step) {
            Err(MigrateError::MigrationFailed { table, target, .. }) => {
                assert_eq!(table, "milestones");
                assert_eq!(target, "priority");
            }
            other => panic!("expected MigrationFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_create_table_and_index_are_idempotent() {
        let conn = conn();
        let table = MigrationStep::create_table(
            "fees",
            "buildwise_fees",
            "id INTEGER PRIMARY KEY, project_id INTEGER, amount NUMERIC",
        );
        let index = MigrationStep::create_index(
            "fees.idx",
            "buildwise_fees",
            "idx_buildwise_fees_project",
            &["project_id"],
        );

        assert_eq!(apply_fresh(&conn, &table).unwrap(), Mutation::Applied);
        assert_eq!(apply_fresh(&conn, &index).unwrap(), Mutation::Applied);
        assert_eq!(apply_fresh(&conn, &table).unwrap(), Mutation::AlreadyPresent);
        assert_eq!(apply_fresh(&conn, &index).unwrap(), Mutation::AlreadyPresent);
    }

    #[test]
    fn test_index_name_taken_by_other_table_is_conflict() {
        let conn = conn();
        conn.execute_batch(
            "CREATE TABLE notifications (id INTEGER PRIMARY KEY, recipient_id INTEGER);
             CREATE INDEX idx_shared ON notifications (recipient_id);",
        )
        .unwrap();

        let step = MigrationStep::create_index("m.idx", "milestones", "idx_shared", &["title"]);
        match apply_fresh(&conn, &step) {
            Err(MigrateError::IndexNameConflict { index, table, owner }) => {
                assert_eq!(index, "idx_shared");
                assert_eq!(table, "milestones");
                assert_eq!(owner, "notifications");
            }
            other => panic!("expected IndexNameConflict, got {other:?}"),
        }
        assert!(!SchemaInspector::new(&conn)
            .table("milestones")
            .unwrap()
            .has_index("idx_shared"));
    }

    proptest! {
        /// However many times a set of column steps is applied, the schema
        /// ends up with exactly one copy of each column.
        #[test]
        fn prop_add_column_converges(
            columns in proptest::collection::btree_set("[a-z][a-z_]{0,10}", 1..6),
            repeats in 1usize..4,
        ) {
            let conn = conn();
            let steps: Vec<_> = columns
                .iter()
                .filter(|c| c.as_str() != "id" && c.as_str() != "title")
                .map(|c| MigrationStep::add_column(c, "milestones", c, "TEXT"))
                .collect();

            let mut first_schema: Option<Vec<crate::introspect::ColumnInfo>> = None;
            for round in 0..repeats {
                for step in &steps {
                    let mutation = apply_fresh(&conn, step).unwrap();
                    let expected = if round == 0 { Mutation::Applied } else { Mutation::AlreadyPresent };
                    prop_assert_eq!(mutation, expected);
                }
                let schema = SchemaInspector::new(&conn).columns("milestones").unwrap();
                let first = first_schema.get_or_insert_with(|| schema.clone());
                prop_assert_eq!(&*first, &schema);
            }

            let names = SchemaInspector::new(&conn).table("milestones").unwrap();
            prop_assert_eq!(names.columns.len(), 2 + steps.len());
        }
    }
}
