use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};

use crate::config::LoggingConfig;
use crate::error::MigrateError;

const LOG_BASENAME: &str = "buildwise-migrate";
const ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const KEEP_LOG_FILES: usize = 10;

/// Build the flexi_logger spec string for the configured level.
pub fn log_spec(config: &LoggingConfig) -> String {
    format!("warn, buildwise_migrate={}", config.level)
}

/// Start the logger. `RUST_LOG` takes precedence over the configured level.
///
/// The returned handle must be kept alive for the lifetime of the process,
/// otherwise buffered file output may be lost.
pub fn init(config: &LoggingConfig) -> Result<LoggerHandle, MigrateError> {
    let logger = Logger::try_with_env_or_str(log_spec(config))
        .map_err(|e| MigrateError::Error(format!("Invalid log specification: {}", e)))?
        .format(flexi_logger::detailed_format);

    let logger = match &config.directory {
        Some(dir) => logger
            .log_to_file(FileSpec::default().directory(dir).basename(LOG_BASENAME))
            .rotate(
                Criterion::Size(ROTATE_BYTES),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(KEEP_LOG_FILES),
            )
            .duplicate_to_stderr(Duplicate::Warn),
        None => logger.log_to_stderr(),
    };

    logger
        .start()
        .map_err(|e| MigrateError::Error(format!("Failed to start logger: {}", e)))
}
