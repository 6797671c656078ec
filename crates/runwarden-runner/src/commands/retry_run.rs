use colored::Colorize;
use runwarden_core::constants::{dirs, rc_codes};
use runwarden_core::errors::ConfigError;
use runwarden_core::model::{AttemptOutcome, JobAttemptRecord, JobResourceEnvelope, Walltime};
use runwarden_core::rc::{publish_rc, write_rc_if_missing};
use runwarden_scheduler::container::{prepare_job_script, write_run_script};
use runwarden_scheduler::{ContainerInvocation, SchedulerAdapter};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;

use crate::cli::RetryRunArgs;
use crate::commands::{block_on, AppContext};
use crate::controller::{ControllerError, ControllerEvent, JobSpec, RetryController, RetrySettings};
use crate::error::CliError;

const JOB_SHELL: &str = "/bin/bash";

pub fn handle_retry_run(args: RetryRunArgs, context: &AppContext) -> Result<(), CliError> {
    let kind = context.scheduler_kind(args.scheduler.as_deref())?;
    let adapter = context.scheduler(kind);
    block_on(retry_run(adapter, &args, context))?.map(|_| ())
}

fn settings_for(args: &RetryRunArgs, context: &AppContext) -> RetrySettings {
    let mut retry = context.config.retry.clone();
    if let Some(attempts) = args.attempts {
        retry.attempts = attempts;
    }
    if let Some(multiplier) = args.multiplier {
        retry.multiplier = multiplier;
    }
    if let Some(max) = args.max_memory_gb {
        retry.max_memory_gb = max;
    }
    retry.kill_hung_jobs |= args.kill_hung_jobs;
    RetrySettings::from(&retry)
}

/// Wraps the engine-generated job script in a container invocation and
/// returns the host path of the script the scheduler should run.
fn prepare_run_script(args: &RetryRunArgs, context: &AppContext) -> Result<PathBuf, CliError> {
    let inner_script = prepare_job_script(&args.cwd, &args.container_cwd)?;
    let container = &context.config.container;
    let mut bind_mounts = container.bind_mounts.clone();
    bind_mounts.extend(args.bind_mounts.iter().cloned());

    let invocation = ContainerInvocation {
        runtime: container.runtime.clone(),
        image: args.image.clone(),
        host_cwd: args.cwd.clone(),
        container_cwd: args.container_cwd.clone(),
        bind_mounts,
        shell: JOB_SHELL.to_string(),
        script: inner_script,
    };
    let env_setup = args
        .env_setup
        .as_deref()
        .or(container.env_setup.as_deref());
    Ok(write_run_script(&args.cwd, env_setup, &invocation)?)
}

pub async fn retry_run(
    adapter: Arc<dyn SchedulerAdapter>,
    args: &RetryRunArgs,
    context: &AppContext,
) -> Result<JobAttemptRecord, CliError> {
    let execution_dir = args.cwd.join(dirs::EXECUTION);
    if !execution_dir.is_dir() {
        return Err(ConfigError::General(format!(
            "missing dir: {}",
            execution_dir.display()
        ))
        .into());
    }

    let settings = settings_for(args, context);
    let walltime: Walltime = args.walltime.parse()?;
    let requested = JobResourceEnvelope::new(args.cores, args.memory_gb, walltime)?;
    let baseline = settings.policy.fit_baseline(&requested)?;
    let script = prepare_run_script(args, context)?;

    let extra_args = match &args.scheduler_args {
        Some(raw) => vec![raw.clone()],
        None => context.config.scheduler.extra_args.clone(),
    };
    let spec = JobSpec {
        job_name: args.job_name.clone(),
        working_dir: args.cwd.clone(),
        script,
        baseline,
        extra_args,
    };

    let (tx, rx) = mpsc::channel();
    let printer = thread::spawn(move || {
        for event in rx {
            print_event(&event);
        }
    });

    let controller = RetryController::new(
        adapter,
        settings,
        spec,
        context.cancel.clone(),
    )
    .with_events(tx);
    let result = controller.run().await;
    drop(controller);
    if printer.join().is_err() {
        tracing::warn!("Event printer thread panicked");
    }

    match result {
        Ok(record) => {
            if !publish_rc(&execution_dir)? {
                tracing::warn!(
                    "Job succeeded but left no rc.tmp in '{}'",
                    execution_dir.display()
                );
                write_rc_if_missing(&execution_dir, &rc_codes::FAILED.to_string())?;
            }
            Ok(record)
        }
        Err(ControllerError::Cancelled) => Err(ControllerError::Cancelled.into()),
        Err(e) => {
            write_rc_if_missing(&execution_dir, &rc_codes::FAILED.to_string())?;
            Err(e.into())
        }
    }
}

fn print_event(event: &ControllerEvent) {
    match event {
        ControllerEvent::Resumed { attempt } => {
            println!("- Resuming from attempt {}", attempt);
        }
        ControllerEvent::Submitted {
            attempt,
            job_id,
            envelope,
        } => {
            println!(
                "- [attempt {}] Submitted job {} ({})",
                attempt,
                job_id.to_string().cyan(),
                envelope
            );
        }
        ControllerEvent::StateChanged { job_id, state } => {
            println!("  Job {} is {}", job_id, state);
        }
        ControllerEvent::HangDetected { job_id, killed } => {
            let action = if *killed { "killed" } else { "left running" };
            println!(
                "  {} Job {} is pinned at its memory limit, {}",
                "!".yellow(),
                job_id,
                action
            );
        }
        ControllerEvent::Finished {
            job_id,
            exit_code,
            outcome,
        } => match outcome {
            AttemptOutcome::Succeeded => {
                println!("  {} Job {} completed", "✓".green(), job_id);
            }
            AttemptOutcome::Failed(reason) => {
                println!(
                    "  {} Job {} failed with code {} ({})",
                    "✗".red(),
                    job_id,
                    exit_code,
                    reason
                );
            }
            AttemptOutcome::Pending => {}
        },
        ControllerEvent::SuspiciousSuccess { job_id, log } => {
            println!(
                "  {} Failure keywords in {} of successful job {}",
                "!".yellow(),
                log.display(),
                job_id
            );
        }
        ControllerEvent::Escalated { from, to, reason } => {
            println!("- Escalating after {}: {} -> {}", reason, from, to);
        }
    }
}
