pub mod backfill;
pub mod mutator;
pub mod plan;
pub mod rebuild;
pub mod report;
pub mod runner;
pub mod step;
pub mod verify;

pub use plan::MigrationPlan;
pub use report::{RunMode, RunReport, StepState};
pub use runner::{Migrator, RunOptions};
pub use step::{Backfill, MigrationStep, RebuildCheck, StepKind};
