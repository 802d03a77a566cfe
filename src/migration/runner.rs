use std::time::Instant;

use log::{error, info, warn, Level};
use logging_timer::timer;
use rusqlite::{Transaction, TransactionBehavior};

use crate::db::Database;
use crate::error::MigrateError;
use crate::introspect::SchemaInspector;
use crate::lock::MigrationLock;

use super::backfill::BackfillPass;
use super::mutator::{AdditiveMutator, Mutation};
use super::plan::MigrationPlan;
use super::report::{RunMode, RunReport, StepState};
use super::verify::VerificationPass;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Name written into the lock row.
    pub holder: String,
}

/// Drives a plan through Inspector -> Mutator -> Backfill -> Verification.
///
/// Step-level failures are recorded in the report and the run moves on to
/// the next step. Run-level failures (lock held, unreadable schema) are
/// returned as `Err` before or instead of a report.
pub struct Migrator<'a> {
    db: &'a Database,
    plan: &'a MigrationPlan,
    options: RunOptions,
}

impl<'a> Migrator<'a> {
    pub fn new(db: &'a Database, plan: &'a MigrationPlan, options: RunOptions) -> Self {
        Self { db, plan, options }
    }

    pub fn run(&self) -> Result<RunReport, MigrateError> {
        let _tmr = timer!(Level::Info; "Migrator::run", "{} ({} steps)", self.plan.name(), self.plan.len());
        let start = Instant::now();

        let mut report = RunReport::new(self.plan, self.db.path(), self.options.mode);
        match self.options.mode {
            RunMode::Apply => self.apply(&mut report)?,
            RunMode::DryRun => self.rehearse(&mut report)?,
            RunMode::VerifyOnly => self.verify(&mut report)?,
        }
        report.set_elapsed(start.elapsed());

        if report.is_success() {
            info!("Migration plan '{}' completed successfully", self.plan.name());
        } else {
            warn!("Migration plan '{}' finished with failures", self.plan.name());
        }

        Ok(report)
    }

    fn apply(&self, report: &mut RunReport) -> Result<(), MigrateError> {
        let conn = self.db.conn();
        let lock = MigrationLock::acquire(conn, &self.options.holder)?;

        self.execute_steps(report, StepState::Applied)?;
        self.verify(report)?;

        lock.release()
    }

    /// Execute the whole plan inside one transaction and roll it back. The
    /// report shows exactly what a real run would do, including backfill row
    /// counts and the predicted verification result.
    fn rehearse(&self, report: &mut RunReport) -> Result<(), MigrateError> {
        let conn = self.db.conn();
        MigrationLock::ensure_free(conn)?;

        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(MigrationLock::held_if_busy)?;
        let outcome = self
            .execute_steps(report, StepState::Planned)
            .and_then(|_| self.verify(report));
        tx.rollback()?;
        info!("Dry run: all changes rolled back");

        outcome
    }

    fn verify(&self, report: &mut RunReport) -> Result<(), MigrateError> {
        let verifications = VerificationPass::new(self.db.conn()).verify(self.plan)?;
        report.record_verification(verifications);
        Ok(())
    }

    fn execute_steps(&self, report: &mut RunReport, done: StepState) -> Result<(), MigrateError> {
        let conn = self.db.conn();
        let inspector = SchemaInspector::new(conn);
        let mutator = AdditiveMutator::new(conn);
        let backfill_pass = BackfillPass::new(conn);

        let mut snapshot = inspector.snapshot(self.plan.tables())?;

        for (step, entry) in self.plan.steps().iter().zip(report.steps.iter_mut()) {
            info!("Step {}: {} {}.{}", step.id, step.kind_name(), step.table, step.target());

            let mutation = match mutator.apply(step, &snapshot) {
                Ok(mutation) => mutation,
                Err(err) if err.is_run_level() => return Err(err),
                Err(err) => {
                    error!("Step {} failed: {}", step.id, err);
                    entry.fail(&err);
                    continue;
                }
            };

            entry.state = match mutation {
                Mutation::Applied => {
                    inspector.refresh(&mut snapshot, &step.table)?;
                    done
                }
                Mutation::AlreadyPresent => StepState::AlreadyPresent,
            };

            if let Some((column, backfill)) = step.backfill() {
                match backfill_pass.run(&step.table, column, backfill) {
                    Ok(rows) => entry.backfilled_rows = Some(rows),
                    Err(err) => {
                        warn!("Step {}: {}", step.id, err);
                        entry.backfill_error = Some(err.to_string());
                    }
                }
            }
        }

        Ok(())
    }
}
