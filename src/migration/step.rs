use serde::{Deserialize, Serialize};

use crate::error::MigrateError;
use crate::introspect::SchemaSnapshot;
use crate::utils::Utils;

/// Value source for populating a column on pre-existing rows.
///
/// `from` is a SQL expression evaluated per row of the step's table, usually a
/// correlated subquery such as
/// `SELECT p.construction_phase FROM projects p WHERE p.id = cost_positions.project_id`.
/// The NULL guard is added by the backfill pass, never by the expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backfill {
    pub from: String,
}

/// Condition that tells whether a destructive rebuild is still pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildCheck {
    /// The column must exist without a NOT NULL constraint.
    Nullable(String),
    /// The column must no longer exist.
    Absent(String),
}

impl RebuildCheck {
    pub fn column(&self) -> &str {
        match self {
            RebuildCheck::Nullable(column) | RebuildCheck::Absent(column) => column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// `CREATE TABLE IF NOT EXISTS table (definition)`.
    CreateTable { definition: String },
    /// `ALTER TABLE table ADD COLUMN column column_type [constraints]`, with
    /// an optional backfill for rows that predate the column.
    AddColumn {
        column: String,
        column_type: String,
        #[serde(default)]
        constraints: Option<String>,
        #[serde(default)]
        backfill: Option<Backfill>,
    },
    /// `CREATE [UNIQUE] INDEX IF NOT EXISTS index ON table (columns)`.
    CreateIndex {
        index: String,
        columns: Vec<String>,
        #[serde(default)]
        unique: bool,
    },
    /// Copy into a freshly defined table, drop the old one and rename.
    RebuildTable {
        definition: String,
        check: RebuildCheck,
    },
}

/// Result of checking a step's post-condition against the live schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Satisfied,
    /// The column exists but its declared type differs from the step's.
    TypeDrift,
    Unsatisfied,
}

/// Whether a step's target already exists in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Missing,
}

/// One unit of schema change. Applying it twice must be a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub id: String,
    pub table: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl MigrationStep {
    pub fn create_table(id: &str, table: &str, definition: &str) -> Self {
        Self {
            id: id.to_owned(),
            table: table.to_owned(),
            kind: StepKind::CreateTable {
                definition: definition.trim().to_owned(),
            },
        }
    }

    pub fn add_column(id: &str, table: &str, column: &str, column_type: &str) -> Self {
        Self {
            id: id.to_owned(),
            table: table.to_owned(),
            kind: StepKind::AddColumn {
                column: column.to_owned(),
                column_type: column_type.to_owned(),
                constraints: None,
                backfill: None,
            },
        }
    }

    pub fn create_index(id: &str, table: &str, index: &str, columns: &[&str]) -> Self {
        Self {
            id: id.to_owned(),
            table: table.to_owned(),
            kind: StepKind::CreateIndex {
                index: index.to_owned(),
                columns: columns.iter().map(|c| (*c).to_owned()).collect(),
                unique: false,
            },
        }
    }

    pub fn rebuild_table(id: &str, table: &str, definition: &str, check: RebuildCheck) -> Self {
        Self {
            id: id.to_owned(),
            table: table.to_owned(),
            kind: StepKind::RebuildTable {
                definition: definition.trim().to_owned(),
                check,
            },
        }
    }

    /// Attach extra column constraints (e.g. `DEFAULT 0`). Only meaningful
    /// for `AddColumn`; ignored otherwise.
    pub fn with_constraints(mut self, extra: &str) -> Self {
        if let StepKind::AddColumn { constraints, .. } = &mut self.kind {
            *constraints = Some(extra.to_owned());
        }
        self
    }

    /// Attach a backfill. Only meaningful for `AddColumn`; ignored otherwise.
    pub fn with_backfill(mut self, from: &str) -> Self {
        if let StepKind::AddColumn { backfill, .. } = &mut self.kind {
            *backfill = Some(Backfill {
                from: from.trim().to_owned(),
            });
        }
        self
    }

    pub fn unique(mut self) -> Self {
        if let StepKind::CreateIndex { unique, .. } = &mut self.kind {
            *unique = true;
        }
        self
    }

    /// Name of the object this step creates or changes.
    pub fn target(&self) -> &str {
        match &self.kind {
            StepKind::CreateTable { .. } | StepKind::RebuildTable { .. } => &self.table,
            StepKind::AddColumn { column, .. } => column,
            StepKind::CreateIndex { index, .. } => index,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            StepKind::CreateTable { .. } => "create_table",
            StepKind::AddColumn { .. } => "add_column",
            StepKind::CreateIndex { .. } => "create_index",
            StepKind::RebuildTable { .. } => "rebuild_table",
        }
    }

    pub fn backfill(&self) -> Option<(&str, &Backfill)> {
        match &self.kind {
            StepKind::AddColumn {
                column,
                backfill: Some(backfill),
                ..
            } => Some((column.as_str(), backfill)),
            _ => None,
        }
    }

    pub fn is_destructive(&self) -> bool {
        matches!(self.kind, StepKind::RebuildTable { .. })
    }

    /// DDL for the additive kinds. Rebuilds are multi-statement and handled
    /// by the table rebuilder.
    pub fn ddl(&self) -> Option<String> {
        let table = Utils::quote_ident(&self.table);
        match &self.kind {
            StepKind::CreateTable { definition } => Some(format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                table, definition
            )),
            StepKind::AddColumn {
                column,
                column_type,
                constraints,
                ..
            } => {
                let mut ddl = format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    table,
                    Utils::quote_ident(column),
                    column_type
                );
                if let Some(extra) = constraints {
                    ddl.push(' ');
                    ddl.push_str(extra);
                }
                Some(ddl)
            }
            StepKind::CreateIndex {
                index,
                columns,
                unique,
            } => {
                let columns = columns
                    .iter()
                    .map(|c| Utils::quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                Some(format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    if *unique { "UNIQUE " } else { "" },
                    Utils::quote_ident(index),
                    table,
                    columns
                ))
            }
            StepKind::RebuildTable { .. } => None,
        }
    }

    /// Decide whether the step still has work to do.
    ///
    /// Every kind except `CreateTable` requires its table to exist; a missing
    /// table is a `SchemaError` rather than "target missing".
    pub fn presence_in(&self, snapshot: &SchemaSnapshot) -> Result<Presence, MigrateError> {
        if let StepKind::CreateTable { .. } = self.kind {
            return Ok(if snapshot.has_table(&self.table) {
                Presence::Present
            } else {
                Presence::Missing
            });
        }

        let table = snapshot.require_table(&self.table)?;
        let present = match &self.kind {
            StepKind::CreateTable { .. } => true,
            StepKind::AddColumn { column, .. } => table.has_column(column),
            StepKind::CreateIndex { index, .. } => table.has_index(index),
            StepKind::RebuildTable { check, .. } => match check {
                RebuildCheck::Nullable(column) => {
                    table.column(column).is_some_and(|col| !col.not_null)
                }
                RebuildCheck::Absent(column) => !table.has_column(column),
            },
        };

        Ok(if present {
            Presence::Present
        } else {
            Presence::Missing
        })
    }

    /// Check the step's post-condition. Returns the outcome and a detail line.
    ///
    /// Stricter than [`MigrationStep::presence_in`]: an added column whose
    /// declared type differs is reported as [`CheckOutcome::TypeDrift`].
    pub fn check_in(&self, snapshot: &SchemaSnapshot) -> (CheckOutcome, String) {
        let Some(table) = snapshot.table(&self.table) else {
            return (CheckOutcome::Unsatisfied, format!("table '{}' does not exist", self.table));
        };

        match &self.kind {
            StepKind::CreateTable { .. } => (CheckOutcome::Satisfied, "table exists".to_owned()),
            StepKind::AddColumn {
                column,
                column_type,
                ..
            } => match table.column(column) {
                None => (CheckOutcome::Unsatisfied, format!("column '{}' is missing", column)),
                Some(col) if !Utils::same_decl_type(&col.decl_type, column_type) => (
                    CheckOutcome::TypeDrift,
                    format!(
                        "column '{}' has type '{}', expected '{}'",
                        column, col.decl_type, column_type
                    ),
                ),
                Some(col) => (CheckOutcome::Satisfied, format!("column '{}' {}", column, col.decl_type)),
            },
            StepKind::CreateIndex { index, .. } => {
                if table.has_index(index) {
                    (CheckOutcome::Satisfied, format!("index '{}' exists", index))
                } else {
                    (CheckOutcome::Unsatisfied, format!("index '{}' is missing", index))
                }
            }
            StepKind::RebuildTable { check, .. } => match check {
                RebuildCheck::Nullable(column) => match table.column(column) {
                    None => (CheckOutcome::Unsatisfied, format!("column '{}' is missing", column)),
                    Some(col) if col.not_null => {
                        (CheckOutcome::Unsatisfied, format!("column '{}' is still NOT NULL", column))
                    }
                    Some(_) => (CheckOutcome::Satisfied, format!("column '{}' is nullable", column)),
                },
                RebuildCheck::Absent(column) => {
                    if table.has_column(column) {
                        (CheckOutcome::Unsatisfied, format!("column '{}' still exists", column))
                    } else {
                        (CheckOutcome::Satisfied, format!("column '{}' is gone", column))
                    }
                }
            },
        }
    }

    /// Reject definitions that cannot be applied safely.
    pub fn validate(&self) -> Result<(), MigrateError> {
        let invalid = |what: String| {
            Err(MigrateError::PlanError(format!("step '{}': {}", self.id, what)))
        };

        if self.id.trim().is_empty() {
            return Err(MigrateError::PlanError(
                "step with empty id".to_owned(),
            ));
        }
        if !Utils::is_identifier(&self.table) {
            return invalid(format!("invalid table name '{}'", self.table));
        }

        match &self.kind {
            StepKind::CreateTable { definition } | StepKind::RebuildTable { definition, .. } => {
                if definition.trim().is_empty() {
                    return invalid("empty table definition".to_owned());
                }
                if definition.contains(';') {
                    return invalid("table definition must be a single statement".to_owned());
                }
                if let StepKind::RebuildTable { check, .. } = &self.kind {
                    if !Utils::is_identifier(check.column()) {
                        return invalid(format!("invalid column name '{}'", check.column()));
                    }
                }
            }
            StepKind::AddColumn {
                column,
                column_type,
                constraints,
                backfill,
            } => {
                if !Utils::is_identifier(column) {
                    return invalid(format!("invalid column name '{}'", column));
                }
                let type_ok = !column_type.trim().is_empty()
                    && column_type
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || " _(),".contains(c));
                if !type_ok {
                    return invalid(format!("invalid column type '{}'", column_type));
                }
                if constraints.as_deref().is_some_and(|c| c.contains(';')) {
                    return invalid("constraints must not contain ';'".to_owned());
                }
                if let Some(backfill) = backfill {
                    if backfill.from.trim().is_empty() || backfill.from.contains(';') {
                        return invalid("backfill must be a single expression".to_owned());
                    }
                    // ADD COLUMN .. DEFAULT fills every existing row, leaving
                    // no NULLs for the backfill to populate.
                    let has_default = constraints.as_deref().is_some_and(|c| {
                        c.split(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_')
                            .any(|word| word.eq_ignore_ascii_case("default"))
                    });
                    if has_default {
                        return invalid(
                            "a backfilled column cannot declare a DEFAULT".to_owned(),
                        );
                    }
                }
            }
            StepKind::CreateIndex { index, columns, .. } => {
                if !Utils::is_identifier(index) {
                    return invalid(format!("invalid index name '{}'", index));
                }
                if columns.is_empty() {
                    return invalid("index without columns".to_owned());
                }
                if let Some(bad) = columns.iter().find(|c| !Utils::is_identifier(c)) {
                    return invalid(format!("invalid index column '{}'", bad));
                }
            }
        }

        Ok(())
    }
}
