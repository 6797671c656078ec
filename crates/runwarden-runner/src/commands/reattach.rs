use colored::Colorize;
use runwarden_core::errors::DomainError;
use runwarden_core::model::{RunHandle, RunStatus};
use runwarden_core::run_cache::RunDataCache;
use std::sync::Arc;

use crate::cli::ReattachArgs;
use crate::commands::run::follow_run;
use crate::commands::{block_on, AppContext};
use crate::engine::{HttpWorkflowEngine, WorkflowEngine};
use crate::error::CliError;

pub fn handle_reattach(args: ReattachArgs, context: &AppContext) -> Result<(), CliError> {
    let url = context.server_url(&args.server)?;
    let engine: Arc<dyn WorkflowEngine> = Arc::new(HttpWorkflowEngine::new(&url)?);
    block_on(reattach(engine, &args, context))?.map(|_| ())
}

pub async fn reattach(
    engine: Arc<dyn WorkflowEngine>,
    args: &ReattachArgs,
    context: &AppContext,
) -> Result<RunStatus, CliError> {
    let run_id = match &args.run_id {
        Some(id) => id.clone(),
        None => RunDataCache::latest(&args.cache_dir)?
            .ok_or_else(|| DomainError::RunIdNotCached(args.cache_dir.clone()))?,
    };
    println!("- Following run {}", run_id.cyan());

    follow_run(
        engine,
        RunHandle::submitted(run_id, args.cache_dir.clone()),
        args.options.as_deref(),
        args.execution_root.as_deref(),
        context,
    )
    .await
}
