pub mod cli;
pub mod commands;
pub mod controller;
pub mod engine;
pub mod error;
pub mod poller;

use cli::{Cli, Commands};
use colored::Colorize;
use commands::AppContext;
use error::CliError;
use runwarden_core::config::{self, Config};
use runwarden_core::logging::{self, LogLevel};
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub fn load_config(explicit: Option<&Path>) -> Result<Config, CliError> {
    let config = match explicit {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };
    Ok(config)
}

/// Starts the session log, mirrored to stderr when `tee` is set. A broken
/// config still gets a logger with the default settings; the config error
/// itself surfaces when the command runs.
pub fn init_logging(verbose: u8, config_path: Option<&Path>, tee: bool) {
    let logging_config = load_config(config_path)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = LogLevel::resolve(verbose);

    match logging::init_session_logger(&logging_config, level, tee) {
        Ok(path) => tracing::debug!("Session log at {}", path.display()),
        Err(e) => {
            eprintln!(
                "{}",
                format!("[ERROR] Failed to initialize session logger: {}", e).red()
            );
            logging::init_stderr_logger(level);
        }
    }
}

pub fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(cli.config.as_deref())?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::warn!("Interrupted, shutting down");
        on_interrupt.cancel();
    }) {
        tracing::warn!("Could not install Ctrl-C handler: {}", e);
    }

    let context = AppContext::new(config, cancel);
    match cli.command {
        Commands::Run(args) => commands::run::handle_run(args, &context),
        Commands::Reattach(args) => commands::reattach::handle_reattach(args, &context),
        Commands::Abort(args) => commands::abort::handle_abort(args, &context),
        Commands::RetryRun(args) => commands::retry_run::handle_retry_run(args, &context),
        Commands::CheckAlive(args) => commands::check_alive::handle_check_alive(args, &context),
        Commands::SubmitCommand(args) => {
            commands::submit_command::handle_submit_command(args, &context)
        }
    }
}
