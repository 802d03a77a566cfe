use log::{info, warn, Level};
use logging_timer::timer;
use rusqlite::Connection;
use serde::Serialize;

use crate::error::MigrateError;
use crate::introspect::SchemaInspector;

use super::plan::MigrationPlan;
use super::step::CheckOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub step_id: String,
    pub outcome: CheckOutcome,
    pub detail: String,
}

/// Re-reads the schema and checks every step's post-condition. Never writes.
pub struct VerificationPass<'a> {
    conn: &'a Connection,
}

impl<'a> VerificationPass<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn verify(&self, plan: &MigrationPlan) -> Result<Vec<Verification>, MigrateError> {
        let _tmr = timer!(Level::Debug; "VerificationPass::verify", "{} steps", plan.len());

        let snapshot = SchemaInspector::new(self.conn).snapshot(plan.tables())?;

        let results: Vec<Verification> = plan
            .steps()
            .iter()
            .map(|step| {
                let (outcome, detail) = step.check_in(&snapshot);
                match outcome {
                    CheckOutcome::Satisfied => info!("Verified {}: {}", step.id, detail),
                    CheckOutcome::TypeDrift => warn!("Type drift {}: {}", step.id, detail),
                    CheckOutcome::Unsatisfied => warn!("Unsatisfied {}: {}", step.id, detail),
                }
                Verification {
                    step_id: step.id.clone(),
                    outcome,
                    detail,
                }
            })
            .collect();

        Ok(results)
    }
}
