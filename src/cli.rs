use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, info};

use crate::config::Config;
use crate::db::Database;
use crate::error::MigrateError;
use crate::lock::MigrationLock;
use crate::logging;
use crate::migration::{MigrationPlan, Migrator, RunMode, RunOptions};
use crate::plans;

#[derive(Parser)]
#[command(
    name = "buildwise-migrate",
    version,
    about = "BuildWise: idempotent schema migrations for the SQLite database"
)]
pub struct Cli {
    /// Configuration file (default: config.toml in the platform config directory)
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Apply the migration plan to the database
    Migrate {
        /// Database file (default: from config, else buildwise.db or instance/buildwise.db)
        #[arg(long = "db", short = 'd')]
        db: Option<PathBuf>,

        /// Rehearse the plan inside a transaction that is always rolled back
        #[arg(long = "dry-run", conflicts_with = "verify_only", default_value_t = false)]
        dry_run: bool,

        /// Only check that every step's target exists; never writes
        #[arg(long = "verify-only", default_value_t = false)]
        verify_only: bool,

        /// TOML plan file (default: the built-in BuildWise plan)
        #[arg(long = "plan", short = 'p')]
        plan: Option<PathBuf>,

        /// Output format of the final report
        #[arg(long = "format", value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List the steps of the plan in execution order
    Steps {
        /// TOML plan file (default: the built-in BuildWise plan)
        #[arg(long = "plan", short = 'p')]
        plan: Option<PathBuf>,
    },

    /// Release a migration lock left behind by a crashed run
    Unlock {
        /// Database file (default: from config, else buildwise.db or instance/buildwise.db)
        #[arg(long = "db", short = 'd')]
        db: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    /// Returns `Ok(true)` when every step succeeded, `Ok(false)` when the run
    /// completed with step failures.
    pub fn handle_command_line() -> Result<bool, MigrateError> {
        let args = Cli::parse();

        let config = Config::load(args.config.as_deref())?;
        let _logger = logging::init(&config.logging)?;
        debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

        match args.command {
            Command::Migrate {
                db,
                dry_run,
                verify_only,
                plan,
                format,
            } => {
                let mode = match (dry_run, verify_only) {
                    (true, _) => RunMode::DryRun,
                    (_, true) => RunMode::VerifyOnly,
                    _ => RunMode::Apply,
                };
                Self::migrate(&config, db.as_deref(), plan.as_deref(), mode, format)
            }
            Command::Steps { plan } => {
                let plan = plans::load(plan.as_deref())?;
                print!("{}", Self::render_steps(&plan));
                Ok(true)
            }
            Command::Unlock { db } => Self::unlock(&config, db.as_deref()),
        }
    }

    fn open_database(config: &Config, db_override: Option<&Path>) -> Result<Database, MigrateError> {
        let path = match db_override {
            Some(path) => path.to_path_buf(),
            None => config.database.resolve_path(&std::env::current_dir()?)?,
        };
        Database::open(&path, &config.database)
    }

    fn migrate(
        config: &Config,
        db_override: Option<&Path>,
        plan_path: Option<&Path>,
        mode: RunMode,
        format: OutputFormat,
    ) -> Result<bool, MigrateError> {
        let plan = plans::load(plan_path)?;
        let db = Self::open_database(config, db_override)?;

        info!(
            "Running plan '{}' on {} ({})",
            plan.name(),
            db.path().display(),
            mode
        );

        let options = RunOptions {
            mode,
            holder: config.lock.holder_name(),
        };
        let report = Migrator::new(&db, &plan, options).run()?;

        match format {
            OutputFormat::Text => print!("{}", report.render_text()),
            OutputFormat::Json => println!("{}", report.to_json()?),
        }

        Ok(report.is_success())
    }

    fn unlock(config: &Config, db_override: Option<&Path>) -> Result<bool, MigrateError> {
        let db = Self::open_database(config, db_override)?;
        match MigrationLock::force_release(db.conn())? {
            Some(info) => println!(
                "Released migration lock held by '{}' (pid {}) since {}",
                info.holder, info.pid, info.acquired_at
            ),
            None => println!("No migration lock held on {}", db.path().display()),
        }
        Ok(true)
    }

    fn render_steps(plan: &MigrationPlan) -> String {
        let width = plan.steps().iter().map(|s| s.id.len()).max().unwrap_or(0);
        let mut out = format!("Plan '{}' ({} steps)\n", plan.name(), plan.len());
        for (i, step) in plan.steps().iter().enumerate() {
            let mut line = format!(
                "{:>3}. {:<width$}  {:<13} {}.{}",
                i + 1,
                step.id,
                step.kind_name(),
                step.table,
                step.target(),
                width = width
            );
            if step.backfill().is_some() {
                line.push_str("  (backfill)");
            }
            if step.is_destructive() {
                line.push_str("  (destructive)");
            }
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}
