mod cli;
mod config;
mod db;
mod error;
mod introspect;
mod lock;
mod logging;
mod migration;
mod plans;
mod utils;

use cli::Cli;
use error::MigrateError;
use log::error;

fn main() {
    match Cli::handle_command_line() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            error!("{:?}", err);
            eprintln!("{}", err);
            if let MigrateError::LockHeldError { .. } = err {
                eprintln!(
                    "If no migration is running, release the lock with `buildwise-migrate unlock`."
                );
            }
            std::process::exit(1);
        }
    }
}
