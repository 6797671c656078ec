use runwarden_core::constants::dirs;
use runwarden_core::errors::ConfigError;
use runwarden_core::escalation::EscalationPolicy;
use runwarden_core::model::{FailureReason, JobResourceEnvelope, Walltime};
use runwarden_scheduler::{shell_word, ContainerInvocation, SchedulerAdapter, SubmitRequest};
use std::path::Path;

use crate::cli::SubmitCommandArgs;
use crate::commands::AppContext;
use crate::error::CliError;

pub fn handle_submit_command(args: SubmitCommandArgs, context: &AppContext) -> Result<(), CliError> {
    let kind = context.scheduler_kind(args.scheduler.as_deref())?;
    let adapter = context.scheduler(kind);
    println!("{}", render_submit_command(adapter.as_ref(), &args, context)?);
    Ok(())
}

/// The attempt number encoded by an `attempt-N` path component, 1 if absent.
pub fn attempt_from_path(cwd: &Path) -> Result<u32, CliError> {
    let attempts: Vec<&str> = cwd
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .filter_map(|c| c.strip_prefix(dirs::ENGINE_ATTEMPT_PREFIX))
        .collect();
    match attempts.as_slice() {
        [] => Ok(1),
        [n] => n.parse::<u32>().ok().filter(|n| *n > 0).ok_or_else(|| {
            ConfigError::General(format!("invalid attempt number in '{}'", cwd.display())).into()
        }),
        _ => Err(ConfigError::General(format!(
            "more than one attempt component in '{}'",
            cwd.display()
        ))
        .into()),
    }
}

/// The envelope for the attempt named by `cwd`: the baseline escalated in
/// both dimensions once per earlier attempt.
pub fn attempt_envelope(
    args: &SubmitCommandArgs,
    policy: &EscalationPolicy,
) -> Result<JobResourceEnvelope, CliError> {
    let walltime: Walltime = args.walltime.parse()?;
    let requested = JobResourceEnvelope::new(args.cores, args.memory_gb, walltime)?;
    let baseline = policy.fit_baseline(&requested)?;
    let attempt = attempt_from_path(&args.cwd)?;
    Ok(policy.escalate_times(&baseline, FailureReason::Unknown, attempt - 1))
}

pub fn render_submit_command(
    adapter: &dyn SchedulerAdapter,
    args: &SubmitCommandArgs,
    context: &AppContext,
) -> Result<String, CliError> {
    let retry = &context.config.retry;
    let policy = EscalationPolicy {
        multiplier: args.multiplier.unwrap_or(retry.multiplier),
        max_memory_gb: args.max_memory_gb.unwrap_or(retry.max_memory_gb),
        max_walltime: Some(Walltime::from_hours(args.max_walltime_hours)),
    };
    let envelope = attempt_envelope(args, &policy)?;

    let container = &context.config.container;
    let mut bind_mounts = container.bind_mounts.clone();
    bind_mounts.extend(args.bind_mounts.iter().cloned());
    let invocation = ContainerInvocation {
        runtime: container.runtime.clone(),
        image: args.image.clone(),
        host_cwd: args.cwd.clone(),
        container_cwd: args.container_cwd.clone(),
        bind_mounts,
        shell: args.shell.clone(),
        script: args.script.clone(),
    };

    let request = SubmitRequest {
        envelope,
        job_name: args.job_name.clone(),
        working_dir: args.cwd.clone(),
        script: args.script.clone(),
        stdout: args.stdout.clone(),
        stderr: args.stderr.clone(),
        extra_args: match &args.scheduler_args {
            Some(raw) => vec![raw.clone()],
            None => context.config.scheduler.extra_args.clone(),
        },
    };
    let (program, cmd_args) = adapter.wrapped_submit_command(&request, &invocation.to_shell_line());

    let mut words = vec![program];
    words.extend(cmd_args.iter().map(|a| shell_word(a)));
    Ok(words.join(" "))
}
