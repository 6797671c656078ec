use colored::Colorize;
use runwarden_core::digest::{find_run_dir, ErrorDigest, ErrorDigestExtractor};
use runwarden_core::lock::ExecutionLock;
use runwarden_core::model::{RunHandle, RunStatus};
use runwarden_core::run_cache::RunDataCache;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cli::RunArgs;
use crate::commands::{block_on, AppContext};
use crate::engine::{
    workflow_log_dir, workflow_log_file, HttpWorkflowEngine, WorkflowEngine, WorkflowSubmission,
};
use crate::error::CliError;
use crate::poller::{PollSettings, WorkflowPoller};

pub fn handle_run(args: RunArgs, context: &AppContext) -> Result<(), CliError> {
    let url = context.server_url(&args.server)?;
    let engine: Arc<dyn WorkflowEngine> = Arc::new(HttpWorkflowEngine::new(&url)?);
    block_on(run_workflow(engine, &args, context))?.map(|_| ())
}

pub async fn run_workflow(
    engine: Arc<dyn WorkflowEngine>,
    args: &RunArgs,
    context: &AppContext,
) -> Result<RunStatus, CliError> {
    fs_err::create_dir_all(&args.cache_dir)?;
    let lock = ExecutionLock::acquire(&args.cache_dir)?;
    tracing::debug!("Acquired {}", lock.path().display());

    let result = submit_or_reattach(engine, args, context).await;

    if let Err(e) = lock.release() {
        tracing::warn!("Failed to release lock in '{}': {}", args.cache_dir.display(), e);
    }
    result
}

async fn submit_or_reattach(
    engine: Arc<dyn WorkflowEngine>,
    args: &RunArgs,
    context: &AppContext,
) -> Result<RunStatus, CliError> {
    let reattached = if args.try_reattach {
        active_cached_run(engine.as_ref(), &args.cache_dir).await?
    } else {
        None
    };

    let run_id = match reattached {
        Some(run_id) => {
            println!("- Reattaching to active run {}", run_id.cyan());
            run_id
        }
        None => {
            let submission = WorkflowSubmission {
                workflow_source: args.workflow.clone(),
                inputs: args.inputs.clone(),
                options: args.options.clone(),
                dependencies: args.imports.clone(),
            };
            let run_id = engine.submit(&submission).await?;
            RunDataCache::record(&args.cache_dir, &run_id)?;
            println!("- Submitted run {}", run_id.cyan());
            run_id
        }
    };

    follow_run(
        engine,
        RunHandle::submitted(run_id, args.cache_dir.clone()),
        args.options.as_deref(),
        args.execution_root.as_deref(),
        context,
    )
    .await
}

/// The latest cached run, if the engine still reports it as active.
async fn active_cached_run(
    engine: &dyn WorkflowEngine,
    cache_dir: &Path,
) -> Result<Option<String>, CliError> {
    let Some(run_id) = RunDataCache::latest(cache_dir)? else {
        tracing::info!("No cached run in '{}', submitting", cache_dir.display());
        return Ok(None);
    };
    match engine.status(&run_id).await {
        Ok(status) if status.is_active() => Ok(Some(run_id)),
        Ok(status) => {
            tracing::info!("Cached run {} is {}, submitting a new one", run_id, status);
            Ok(None)
        }
        Err(e) => {
            tracing::warn!("Could not query cached run {}: {}", run_id, e);
            Ok(None)
        }
    }
}

pub(crate) fn log_file_for(options: Option<&Path>, run_id: &str) -> Option<PathBuf> {
    let options = options?;
    match workflow_log_dir(options) {
        Ok(Some(dir)) => Some(workflow_log_file(&dir, run_id)),
        Ok(None) => None,
        Err(e) => {
            tracing::warn!("Could not read '{}': {}", options.display(), e);
            None
        }
    }
}

/// Polls the run until it settles. Non-success is an error carrying the
/// digest of the run's failed steps.
pub(crate) async fn follow_run(
    engine: Arc<dyn WorkflowEngine>,
    mut handle: RunHandle,
    options: Option<&Path>,
    execution_root: Option<&Path>,
    context: &AppContext,
) -> Result<RunStatus, CliError> {
    let log_file = log_file_for(options, &handle.run_id);
    let poller = WorkflowPoller::new(
        engine,
        PollSettings::from(&context.config.poll),
        context.cancel.clone(),
    )
    .with_sink(context.sink.clone());

    let status = poller.wait(&mut handle, log_file.as_deref()).await?;
    if status == RunStatus::Succeeded {
        println!("{} Run {} succeeded", "✓".green(), handle.run_id);
        return Ok(status);
    }

    let digest = match execution_root {
        Some(root) => digest_for(root, &handle.run_id),
        None => ErrorDigest::default(),
    };
    Err(CliError::RunFailed {
        run_id: handle.run_id,
        status,
        digest,
    })
}

fn digest_for(execution_root: &Path, run_id: &str) -> ErrorDigest {
    tracing::info!("Detected failed status, extracting errors ...");
    match find_run_dir(execution_root, run_id) {
        Ok(dir) => ErrorDigestExtractor::default().extract(&dir),
        Err(e) => {
            tracing::warn!("{}", e);
            ErrorDigest::default()
        }
    }
}
