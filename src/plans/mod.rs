pub mod buildwise;

use std::path::Path;

use log::info;

use crate::error::MigrateError;
use crate::migration::MigrationPlan;

/// Load the plan from `path`, or fall back to the built-in BuildWise plan.
pub fn load(path: Option<&Path>) -> Result<MigrationPlan, MigrateError> {
    let plan = match path {
        Some(path) => MigrationPlan::from_file(path)?,
        None => buildwise::plan()?,
    };
    info!("Loaded migration plan '{}' ({} steps)", plan.name(), plan.len());
    Ok(plan)
}
