use crate::error::MigrateError;
use crate::migration::{MigrationPlan, MigrationStep, RebuildCheck};

pub const PLAN_NAME: &str = "buildwise";

const PHASE_FROM_PROJECT_FOR_MILESTONE: &str =
    "SELECT p.construction_phase FROM projects p WHERE p.id = milestones.project_id";

const PHASE_FROM_PROJECT_FOR_COST_POSITION: &str =
    "SELECT p.construction_phase FROM projects p WHERE p.id = cost_positions.project_id";

const BUILDWISE_FEES_DEFINITION: &str = r#"
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id          INTEGER NOT NULL REFERENCES projects(id),
    quote_id            INTEGER REFERENCES quotes(id),
    cost_position_id    INTEGER REFERENCES cost_positions(id),
    service_provider_id INTEGER,
    fee_amount          NUMERIC NOT NULL DEFAULT 0,
    fee_percentage      NUMERIC NOT NULL DEFAULT 4.0,
    status              VARCHAR(20) NOT NULL DEFAULT 'open',
    invoice_number      VARCHAR(50),
    invoice_date        DATETIME,
    due_date            DATETIME,
    paid_at             DATETIME,
    created_at          DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at          DATETIME DEFAULT CURRENT_TIMESTAMP
"#;

/// `acceptance_defects` with `task_id` nullable. Every column a live table
/// may carry is listed: the rebuild refuses to drop columns it does not know.
const ACCEPTANCE_DEFECTS_DEFINITION: &str = r#"
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    acceptance_id   INTEGER NOT NULL REFERENCES acceptances(id),
    milestone_id    INTEGER REFERENCES milestones(id),
    task_id         INTEGER,
    title           VARCHAR(255) NOT NULL,
    description     TEXT,
    severity        VARCHAR(20) NOT NULL DEFAULT 'minor',
    location        VARCHAR(255),
    photos          TEXT,
    resolved        BOOLEAN NOT NULL DEFAULT 0,
    resolved_at     DATETIME,
    created_at      DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at      DATETIME DEFAULT CURRENT_TIMESTAMP
"#;

/// The ordered migration plan for the BuildWise database.
///
/// Order matters: phase columns are added to `projects` before anything is
/// backfilled from them, and the fee table exists before its index.
pub fn plan() -> Result<MigrationPlan, MigrateError> {
    let steps = vec![
        // Projects
        MigrationStep::add_column(
            "projects.construction_phase",
            "projects",
            "construction_phase",
            "VARCHAR(50)",
        ),
        // Milestones (Gewerke)
        MigrationStep::add_column(
            "milestones.archived_by",
            "milestones",
            "archived_by",
            "VARCHAR(100)",
        ),
        MigrationStep::add_column(
            "milestones.archived_at",
            "milestones",
            "archived_at",
            "DATETIME",
        ),
        MigrationStep::add_column(
            "milestones.construction_phase",
            "milestones",
            "construction_phase",
            "VARCHAR(50)",
        )
        .with_backfill(PHASE_FROM_PROJECT_FOR_MILESTONE),
        MigrationStep::add_column(
            "milestones.requires_inspection",
            "milestones",
            "requires_inspection",
            "BOOLEAN",
        )
        .with_constraints("NOT NULL DEFAULT 0"),
        // Cost positions
        MigrationStep::add_column(
            "cost_positions.construction_phase",
            "cost_positions",
            "construction_phase",
            "VARCHAR(50)",
        )
        .with_backfill(PHASE_FROM_PROJECT_FOR_COST_POSITION),
        // Quotes and invoices
        MigrationStep::add_column(
            "quotes.contact_released",
            "quotes",
            "contact_released",
            "BOOLEAN",
        )
        .with_constraints("NOT NULL DEFAULT 0"),
        MigrationStep::add_column("invoices.paid_at", "invoices", "paid_at", "DATETIME"),
        MigrationStep::add_column(
            "invoices.payment_reference",
            "invoices",
            "payment_reference",
            "VARCHAR(100)",
        ),
        // Acceptance and defects
        MigrationStep::add_column(
            "acceptance_defects.task_id",
            "acceptance_defects",
            "task_id",
            "INTEGER",
        ),
        MigrationStep::rebuild_table(
            "acceptance_defects.task_id_nullable",
            "acceptance_defects",
            ACCEPTANCE_DEFECTS_DEFINITION,
            RebuildCheck::Nullable("task_id".to_owned()),
        ),
        // Notifications
        MigrationStep::create_index(
            "notifications.recipient_idx",
            "notifications",
            "idx_notifications_recipient_read",
            &["recipient_id", "is_read"],
        ),
        // Platform fees
        MigrationStep::create_table(
            "buildwise_fees.table",
            "buildwise_fees",
            BUILDWISE_FEES_DEFINITION,
        ),
        MigrationStep::create_index(
            "buildwise_fees.project_idx",
            "buildwise_fees",
            "idx_buildwise_fees_project",
            &["project_id"],
        ),
        MigrationStep::create_index(
            "buildwise_fees.invoice_number_idx",
            "buildwise_fees",
            "idx_buildwise_fees_invoice_number",
            &["invoice_number"],
        )
        .unique(),
    ];

    MigrationPlan::new(PLAN_NAME, steps)
}
