use log::debug;
use rusqlite::{Connection, OptionalExtension};

use crate::error::MigrateError;
use crate::utils::Utils;

use super::snapshot::{ColumnInfo, SchemaSnapshot, TableSchema};

/// Read-only view of the live schema. Every call goes to the database; nothing
/// is cached between calls.
pub struct SchemaInspector<'a> {
    conn: &'a Connection,
}

impl<'a> SchemaInspector<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, MigrateError> {
        let exists = self.conn.query_row(
            "SELECT count(*) > 0 FROM sqlite_master
             WHERE type = 'table' AND lower(name) = lower(?1)",
            [table],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn require_table(&self, table: &str) -> Result<(), MigrateError> {
        if self.table_exists(table)? {
            Ok(())
        } else {
            Err(MigrateError::SchemaError {
                table: table.to_owned(),
            })
        }
    }

    /// Columns of `table` in declaration order. A missing table is a
    /// `SchemaError`, never an empty list.
    pub fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, MigrateError> {
        self.require_table(table)?;

        let mut stmt = self.conn.prepare(
            r#"SELECT name, type, "notnull", dflt_value, pk
               FROM pragma_table_info(?1)
               ORDER BY cid"#,
        )?;

        let columns = stmt
            .query_map([table], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    decl_type: row.get(1)?,
                    not_null: row.get(2)?,
                    default_value: row.get(3)?,
                    primary_key: row.get::<_, i64>(4)? > 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(columns)
    }

    /// Names of all indexes on `table`, including SQLite's automatic ones.
    pub fn index_names(&self, table: &str) -> Result<Vec<String>, MigrateError> {
        self.require_table(table)?;

        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'index' AND lower(tbl_name) = lower(?1)
             ORDER BY name",
        )?;

        let names = stmt
            .query_map([table], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(names)
    }

    /// Table owning the index `name`, looked up across the whole schema.
    pub fn index_table(&self, name: &str) -> Result<Option<String>, MigrateError> {
        let owner = self
            .conn
            .query_row(
                "SELECT tbl_name FROM sqlite_master
                 WHERE type = 'index' AND lower(name) = lower(?1)",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    /// `CREATE INDEX` / `CREATE TRIGGER` statements attached to `table`.
    /// Automatic indexes have no SQL and are skipped.
    pub fn dependent_sql(&self, table: &str) -> Result<Vec<String>, MigrateError> {
        let mut stmt = self.conn.prepare(
            "SELECT sql FROM sqlite_master
             WHERE type IN ('index', 'trigger') AND lower(tbl_name) = lower(?1)
               AND sql IS NOT NULL
             ORDER BY type, name",
        )?;

        let sql = stmt
            .query_map([table], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(sql)
    }

    pub fn table(&self, table: &str) -> Result<TableSchema, MigrateError> {
        let columns = self.columns(table)?;
        let indexes = self.index_names(table)?;
        Ok(TableSchema {
            name: table.to_owned(),
            columns,
            indexes,
        })
    }

    pub fn row_count(&self, table: &str) -> Result<i64, MigrateError> {
        let count = self.conn.query_row(
            &format!("SELECT count(*) FROM {}", Utils::quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Snapshot the given tables. Tables that do not exist are simply absent
    /// from the snapshot; steps decide whether that is an error.
    pub fn snapshot<'t, I>(&self, tables: I) -> Result<SchemaSnapshot, MigrateError>
    where
        I: IntoIterator<Item = &'t str>,
    {
        let mut snapshot = SchemaSnapshot::new();
        for table in tables {
            if snapshot.has_table(table) {
                continue;
            }
            if self.table_exists(table)? {
                snapshot.insert(self.table(table)?);
            } else {
                debug!("Table '{}' not present in snapshot", table);
            }
        }
        Ok(snapshot)
    }

    /// Re-read one table into `snapshot` after a mutation.
    pub fn refresh(&self, snapshot: &mut SchemaSnapshot, table: &str) -> Result<(), MigrateError> {
        if self.table_exists(table)? {
            snapshot.insert(self.table(table)?);
        } else {
            snapshot.remove(table);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE projects (
                 id INTEGER PRIMARY KEY,
                 name VARCHAR(255) NOT NULL,
                 construction_phase VARCHAR(50) DEFAULT 'planning'
             );
             CREATE INDEX idx_projects_name ON projects (name);
             INSERT INTO projects (name) VALUES ('Rohbau Nord'), ('Sanierung Süd');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_columns_reflect_table_info() {
        let conn = conn();
        let inspector = SchemaInspector::new(&conn);
        let columns = inspector.columns("projects").unwrap();

        assert_eq!(
            columns,
            vec![
                ColumnInfo {
                    name: "id".into(),
                    decl_type: "INTEGER".into(),
                    not_null: false,
                    default_value: None,
                    primary_key: true,
                },
                ColumnInfo {
                    name: "name".into(),
                    decl_type: "VARCHAR(255)".into(),
                    not_null: true,
                    default_value: None,
                    primary_key: false,
                },
                ColumnInfo {
                    name: "construction_phase".into(),
                    decl_type: "VARCHAR(50)".into(),
                    not_null: false,
                    default_value: Some("'planning'".into()),
                    primary_key: false,
                },
            ]
        );
    }

    #[test]
    fn test_missing_table_is_error_not_empty() {
        let conn = conn();
        let inspector = SchemaInspector::new(&conn);
        assert!(matches!(
            inspector.columns("acceptance_defects"),
            Err(MigrateError::SchemaError { .. })
        ));
        assert!(matches!(
            inspector.index_names("acceptance_defects"),
            Err(MigrateError::SchemaError { .. })
        ));
    }

    #[test]
    fn test_reads_are_fresh() {
        let conn = conn();
        let inspector = SchemaInspector::new(&conn);
        assert!(!inspector.table("projects").unwrap().has_column("archived_at"));

        conn.execute("ALTER TABLE projects ADD COLUMN archived_at DATETIME", [])
            .unwrap();
        assert!(inspector.table("projects").unwrap().has_column("archived_at"));
    }

    #[test]
    fn test_snapshot_skips_missing_tables() {
        let conn = conn();
        let inspector = SchemaInspector::new(&conn);
        let snapshot = inspector
            .snapshot(["projects", "acceptance_defects", "PROJECTS"])
            .unwrap();

        assert!(snapshot.has_table("projects"));
        assert!(!snapshot.has_table("acceptance_defects"));
        assert_eq!(snapshot.tables().count(), 1);
        assert!(snapshot
            .table("projects")
            .unwrap()
            .has_index("idx_projects_name"));
    }

    #[test]
    fn test_row_count_and_dependent_sql() {
        let conn = conn();
        let inspector = SchemaInspector::new(&conn);
        assert_eq!(inspector.row_count("projects").unwrap(), 2);

        let sql = inspector.dependent_sql("projects").unwrap();
        assert_eq!(sql.len(), 1);
        assert!(sql[0].starts_with("CREATE INDEX idx_projects_name"));
    }

    #[test]
    fn test_index_table_is_schema_wide() {
        let conn = conn();
        let inspector = SchemaInspector::new(&conn);
        assert_eq!(
            inspector.index_table("IDX_PROJECTS_NAME").unwrap(),
            Some("projects".to_owned())
        );
        assert_eq!(inspector.index_table("idx_missing").unwrap(), None);
    }
}
