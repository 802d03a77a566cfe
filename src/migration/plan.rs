use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::MigrateError;

use super::step::MigrationStep;

/// Ordered list of migration steps.
///
/// Steps run exactly in the order given here. A step that depends on an
/// earlier one (a backfill reading a column another step adds, an index on a
/// table created earlier) must be listed after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    name: String,
    steps: Vec<MigrationStep>,
}

/// On-disk shape of a plan file.
#[derive(Debug, Deserialize)]
struct PlanFile {
    name: Option<String>,
    #[serde(default)]
    steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn new(name: &str, steps: Vec<MigrationStep>) -> Result<Self, MigrateError> {
        let mut seen = HashSet::new();
        for step in &steps {
            step.validate()?;
            if !seen.insert(step.id.as_str()) {
                return Err(MigrateError::PlanError(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        Ok(Self {
            name: name.to_owned(),
            steps,
        })
    }

    /// Parse a TOML plan:
    ///
    /// ```toml
    /// name = "buildwise-2024-06"
    ///
    /// [[steps]]
    /// id = "milestones.archived_by"
    /// table = "milestones"
    /// kind = "add_column"
    /// column = "archived_by"
    /// column_type = "VARCHAR(100)"
    /// ```
    pub fn from_toml_str(default_name: &str, text: &str) -> Result<Self, MigrateError> {
        let file: PlanFile = toml::from_str(text)
            .map_err(|e| MigrateError::PlanError(format!("cannot parse plan: {}", e)))?;
        let name = file.name.unwrap_or_else(|| default_name.to_owned());
        Self::new(&name, file.steps)
    }

    pub fn from_file(path: &Path) -> Result<Self, MigrateError> {
        let text = fs::read_to_string(path)?;
        let default_name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plan".to_owned());
        Self::from_toml_str(&default_name, &text)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Distinct tables touched by the plan, in first-use order.
    pub fn tables(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .map(|step| step.table.as_str())
            .filter(|table| seen.insert(table.to_ascii_lowercase()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::step::{Backfill, RebuildCheck, StepKind};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_duplicate_ids_rejected() {
        let steps = vec![
            MigrationStep::add_column("dup", "milestones", "archived_by", "VARCHAR(100)"),
            MigrationStep::add_column("dup", "milestones", "archived_at", "DATETIME"),
        ];
        let err = MigrationPlan::new("test", steps).unwrap_err();
        assert!(err.to_string().contains("duplicate step id 'dup'"));
    }

    #[test]
    fn test_tables_keep_first_use_order() {
        let plan = MigrationPlan::new(
            "test",
            vec![
                MigrationStep::add_column("a", "projects", "construction_phase", "VARCHAR(50)"),
                MigrationStep::add_column("b", "cost_positions", "construction_phase", "VARCHAR(50)"),
                MigrationStep::add_column("c", "Projects", "archived_at", "DATETIME"),
            ],
        )
        .unwrap();
        assert_eq!(plan.tables(), vec!["projects", "cost_positions"]);
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_parse_toml_plan() {
        let text = r#"
            name = "defects-2024"

            [[steps]]
            id = "defects.table"
            table = "acceptance_defects"
            kind = "create_table"
            definition = "id INTEGER PRIMARY KEY, acceptance_id INTEGER NOT NULL"

            [[steps]]
            id = "cost_positions.construction_phase"
            table = "cost_positions"
            kind = "add_column"
            column = "construction_phase"
            column_type = "VARCHAR(50)"
            backfill = { from = "SELECT p.construction_phase FROM projects p WHERE p.id = cost_positions.project_id" }

            [[steps]]
            id = "notifications.recipient_idx"
            table = "notifications"
            kind = "create_index"
            index = "idx_notifications_recipient"
            columns = ["recipient_id", "is_read"]

            [[steps]]
            id = "quotes.nullable_milestone"
            table = "quotes"
            kind = "rebuild_table"
            definition = "id INTEGER PRIMARY KEY, milestone_id INTEGER"
            check = { nullable = "milestone_id" }
        "#;

        let plan = MigrationPlan::from_toml_str("fallback", text).unwrap();
        assert_eq!(plan.name(), "defects-2024");
        assert_eq!(plan.len(), 4);

        assert_eq!(
            plan.steps()[1].kind,
            StepKind::AddColumn {
                column: "construction_phase".into(),
                column_type: "VARCHAR(50)".into(),
                constraints: None,
                backfill: Some(Backfill {
                    from: "SELECT p.construction_phase FROM projects p WHERE p.id = cost_positions.project_id".into()
                }),
            }
        );
        assert_eq!(
            plan.steps()[2].kind,
            StepKind::CreateIndex {
                index: "idx_notifications_recipient".into(),
                columns: vec!["recipient_id".into(), "is_read".into()],
                unique: false,
            }
        );
        assert_eq!(
            plan.steps()[3].kind,
            StepKind::RebuildTable {
                definition: "id INTEGER PRIMARY KEY, milestone_id INTEGER".into(),
                check: RebuildCheck::Nullable("milestone_id".into()),
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_kind_and_invalid_steps() {
        let unknown = r#"
            [[steps]]
            id = "x"
            table = "milestones"
            kind = "drop_everything"
        "#;
        assert!(matches!(
            MigrationPlan::from_toml_str("p", unknown),
            Err(MigrateError::PlanError(_))
        ));

        let invalid = r#"
            [[steps]]
            id = "x"
            table = "milestones"
            kind = "add_column"
            column = "bad name"
            column_type = "TEXT"
        "#;
        assert!(MigrationPlan::from_toml_str("p", invalid).is_err());
    }

    #[test]
    fn test_from_file_uses_stem_as_default_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotfix.toml");
        std::fs::write(
            &path,
            "[[steps]]\nid = \"a\"\ntable = \"invoices\"\nkind = \"add_column\"\ncolumn = \"paid_at\"\ncolumn_type = \"DATETIME\"\n",
        )
        .unwrap();

        let plan = MigrationPlan::from_file(&path).unwrap();
        assert_eq!(plan.name(), "hotfix");
        assert_eq!(plan.steps()[0].target(), "paid_at");
    }
}
