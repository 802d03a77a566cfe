use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::MigrateError;

/// One row of `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

/// Columns and index names of a single table, as read from the database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<String>,
}

impl TableSchema {
    /// SQLite identifiers are case-insensitive, so lookups are too.
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|col| col.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.iter().any(|idx| idx.eq_ignore_ascii_case(name))
    }
}

/// Transient view of the tables a plan touches, read at the start of a run
/// and refreshed table-by-table as steps mutate the schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchemaSnapshot {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    pub fn insert(&mut self, table: TableSchema) {
        self.tables.insert(Self::key(&table.name), table);
    }

    pub fn remove(&mut self, name: &str) {
        self.tables.remove(&Self::key(name));
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&Self::key(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// Like [`SchemaSnapshot::table`], but a missing table is a `SchemaError`.
    pub fn require_table(&self, name: &str) -> Result<&TableSchema, MigrateError> {
        self.table(name).ok_or_else(|| MigrateError::SchemaError {
            table: name.to_owned(),
        })
    }

    #[allow(dead_code)]
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }
}
