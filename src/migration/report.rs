use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use strum::{AsRefStr, Display, EnumIter};

use crate::error::MigrateError;
use crate::utils::Utils;

use super::plan::MigrationPlan;
use super::step::{CheckOutcome, MigrationStep};
use super::verify::Verification;

/// Per-step lifecycle: `Pending -> Applied | AlreadyPresent | Planned` or
/// `Pending -> Failed`. Verification is recorded alongside, not as a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepState {
    Pending,
    Planned,
    Applied,
    AlreadyPresent,
    Failed,
}

impl StepState {
    pub fn label(&self) -> String {
        self.as_ref().replace('_', " ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "kebab-case")]
pub enum RunMode {
    Apply,
    DryRun,
    VerifyOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub id: String,
    pub table: String,
    pub target: String,
    pub kind: String,
    pub state: StepState,
    pub backfilled_rows: Option<usize>,
    pub error: Option<String>,
    pub backfill_error: Option<String>,
    pub verified: Option<bool>,
    pub verification: Option<String>,
    pub warning: Option<String>,
}

impl StepReport {
    pub fn pending(step: &MigrationStep) -> Self {
        Self {
            id: step.id.clone(),
            table: step.table.clone(),
            target: step.target().to_owned(),
            kind: step.kind_name().to_owned(),
            state: StepState::Pending,
            backfilled_rows: None,
            error: None,
            backfill_error: None,
            verified: None,
            verification: None,
            warning: None,
        }
    }

    pub fn fail(&mut self, err: &MigrateError) {
        self.state = StepState::Failed;
        self.error = Some(err.to_string());
    }

    /// A step is fine when it did not fail, its backfill (if any) completed,
    /// and verification (if it ran) was satisfied.
    pub fn is_ok(&self) -> bool {
        self.state != StepState::Failed
            && self.backfill_error.is_none()
            && self.verified != Some(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub plan: String,
    pub database: String,
    pub mode: RunMode,
    pub started_at: String,
    pub elapsed_ms: u64,
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub fn new(plan: &MigrationPlan, database: &Path, mode: RunMode) -> Self {
        Self {
            plan: plan.name().to_owned(),
            database: database.display().to_string(),
            mode,
            started_at: Utc::now().to_rfc3339(),
            elapsed_ms: 0,
            steps: plan.steps().iter().map(StepReport::pending).collect(),
        }
    }

    pub fn record_verification(&mut self, verifications: Vec<Verification>) {
        for verification in verifications {
            if let Some(step) = self.steps.iter_mut().find(|s| s.id == verification.step_id) {
                let verified = match verification.outcome {
                    CheckOutcome::Satisfied => true,
                    CheckOutcome::Unsatisfied => false,
                    // A column this run added must match; a pre-existing one
                    // cannot be changed by the step, so drift is only reported.
                    CheckOutcome::TypeDrift => {
                        let added_now = matches!(step.state, StepState::Applied | StepState::Planned);
                        if !added_now {
                            step.warning = Some(verification.detail.clone());
                        }
                        !added_now
                    }
                };
                step.verified = Some(verified);
                step.verification = Some(verification.detail);
            }
        }
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    }

    pub fn is_success(&self) -> bool {
        self.steps.iter().all(StepReport::is_ok)
    }

    pub fn count(&self, state: StepState) -> usize {
        self.steps.iter().filter(|s| s.state == state).count()
    }

    pub fn verified_count(&self) -> usize {
        self.steps.iter().filter(|s| s.verified == Some(true)).count()
    }

    pub fn to_json(&self) -> Result<String, MigrateError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| MigrateError::Error(format!("Failed to serialize report: {}", e)))
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Migration plan '{}' on {} ({})",
            self.plan, self.database, self.mode
        );

        let label_width = self
            .steps
            .iter()
            .map(|s| s.id.len())
            .max()
            .unwrap_or(0);

        for step in &self.steps {
            let mut line = format!(
                "  {:<17} {:<width$}",
                format!("[{}]", step.state.label()),
                step.id,
                width = label_width
            );
            if let Some(rows) = step.backfilled_rows {
                let verb = if self.mode == RunMode::DryRun { "would backfill" } else { "backfilled" };
                let _ = write!(line, "  {} {} rows", verb, rows);
            }
            match step.verified {
                Some(true) => line.push_str("  verified"),
                Some(false) => {
                    let _ = write!(
                        line,
                        "  NOT verified: {}",
                        step.verification.as_deref().unwrap_or("")
                    );
                }
                None => {}
            }
            if let Some(warning) = &step.warning {
                let _ = write!(line, "  (warning: {})", warning);
            }
            let _ = writeln!(out, "{}", line.trim_end());

            if let Some(err) = &step.error {
                let _ = writeln!(out, "      error: {}", err);
            }
            if let Some(err) = &step.backfill_error {
                let _ = writeln!(out, "      backfill warning: {}", err);
            }
        }

        let verified_part = if self.steps.iter().any(|s| s.verified.is_some()) {
            format!("; {}/{} verified", self.verified_count(), self.steps.len())
        } else {
            String::new()
        };
        let _ = writeln!(
            out,
            "Summary: {} applied, {} planned, {} already present, {} failed{} in {}",
            self.count(StepState::Applied),
            self.count(StepState::Planned),
            self.count(StepState::AlreadyPresent),
            self.count(StepState::Failed),
            verified_part,
            Utils::format_elapsed(Duration::from_millis(self.elapsed_ms)),
        );
        let _ = writeln!(
            out,
            "Result: {}",
            if self.is_success() { "OK" } else { "FAILED" }
        );

        out
    }
}
