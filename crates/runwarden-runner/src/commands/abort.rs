use colored::Colorize;
use runwarden_core::errors::{ConfigError, DomainError};
use runwarden_core::run_cache::RunDataCache;

use crate::cli::AbortArgs;
use crate::commands::{block_on, AppContext};
use crate::engine::{HttpWorkflowEngine, WorkflowEngine};
use crate::error::CliError;

pub fn handle_abort(args: AbortArgs, context: &AppContext) -> Result<(), CliError> {
    let url = context.server_url(&args.server)?;
    let engine = HttpWorkflowEngine::new(&url)?;
    block_on(abort(&engine, &args))?.map(|_| ())
}

/// Aborts the named run, or the latest one cached in `--cache-dir`.
pub async fn abort(engine: &dyn WorkflowEngine, args: &AbortArgs) -> Result<String, CliError> {
    let run_id = match (&args.run_id, &args.cache_dir) {
        (Some(id), None) => id.clone(),
        (None, Some(dir)) => {
            RunDataCache::latest(dir)?.ok_or_else(|| DomainError::RunIdNotCached(dir.clone()))?
        }
        (Some(_), Some(_)) => {
            return Err(ConfigError::General(
                "Specify either --run-id or --cache-dir, not both".to_string(),
            )
            .into())
        }
        (None, None) => {
            return Err(
                ConfigError::General("Specify either --run-id or --cache-dir".to_string()).into(),
            )
        }
    };

    engine.abort(&run_id).await?;
    println!("- Requested abort of run {}", run_id.yellow());
    Ok(run_id)
}
