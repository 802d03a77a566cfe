use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::MigrateError;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: Option<PathBuf>,
}

impl LoggingConfig {
    const LOG_LEVELS: [&'static str; 5] = ["error", "warn", "info", "debug", "trace"];
    const DEFAULT_LEVEL: &'static str = "info";

    fn ensure_valid(&mut self) {
        let str_original = self.level.clone();
        self.level = self.level.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.level.as_str()) {
            eprintln!(
                "Config error: log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::DEFAULT_LEVEL
            );
            self.level = Self::DEFAULT_LEVEL.to_owned();
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Self::DEFAULT_LEVEL.to_string(),
            directory: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// Explicit database file. When unset, the well-known locations are probed.
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Locations probed, in order, when no path is configured.
    pub const CANDIDATE_PATHS: [&'static str; 2] = ["buildwise.db", "instance/buildwise.db"];
    const BUSY_TIMEOUT_MS: u64 = 5000;

    /// Resolve the database file relative to `base_dir`.
    ///
    /// A configured path always wins, even if it does not exist: opening it
    /// will then fail with a clear error instead of silently picking another file.
    pub fn resolve_path(&self, base_dir: &Path) -> Result<PathBuf, MigrateError> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }

        Self::CANDIDATE_PATHS
            .iter()
            .map(|candidate| base_dir.join(candidate))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                MigrateError::Error(format!(
                    "No database path configured and none of {:?} exist in '{}'",
                    Self::CANDIDATE_PATHS,
                    base_dir.display()
                ))
            })
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: None,
            busy_timeout_ms: Self::BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct LockConfig {
    /// Name recorded in the lock row. Defaults to `$USER` (or "unknown").
    pub holder: Option<String>,
}

impl LockConfig {
    pub fn holder_name(&self) -> String {
        match &self.holder {
            Some(holder) if !holder.trim().is_empty() => holder.trim().to_owned(),
            _ => std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".to_owned()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub lock: LockConfig,
}

impl Config {
    pub const ENV_PREFIX: &'static str = "BUILDWISE_MIGRATE_";

    /// Default location of `config.toml` in the platform config directory.
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "buildwise-migrate")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Layers defaults, the TOML file (if present) and `BUILDWISE_MIGRATE_*`
    /// environment variables. Nested keys use `__`, e.g.
    /// `BUILDWISE_MIGRATE_DATABASE__PATH`.
    pub fn load(config_path: Option<&Path>) -> Result<Self, MigrateError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        let config_path = config_path
            .map(Path::to_path_buf)
            .or_else(Self::default_config_path);
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        let mut config: Config = figment
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"))
            .extract()?;

        config.ensure_valid();

        Ok(config)
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
    }
}
