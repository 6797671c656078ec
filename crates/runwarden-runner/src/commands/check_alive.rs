use runwarden_core::constants::{dirs, rc_codes};
use runwarden_core::hang::{one_in, HangDetector};
use runwarden_core::model::SchedulerJobId;
use runwarden_core::rc::write_rc_if_missing;
use runwarden_scheduler::{JobState, SchedulerAdapter};

use crate::cli::CheckAliveArgs;
use crate::commands::{block_on, AppContext};
use crate::error::CliError;

/// One call in this many samples memory; keeps load on the scheduler down.
const HANG_SAMPLE_ODDS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// Still queued or running; the scheduler state was printed.
    Alive(String),
    /// Killed for sitting at its memory limit.
    KilledHung,
    /// Suspended or exited abnormally; an rc of -1 is in place.
    Failed,
    Finished,
}

pub fn handle_check_alive(args: CheckAliveArgs, context: &AppContext) -> Result<(), CliError> {
    let kind = context.scheduler_kind(args.scheduler.as_deref())?;
    let adapter = context.scheduler(kind);
    let sample = args.kill_hung_jobs && one_in(HANG_SAMPLE_ODDS);
    let detector = context.config.retry.hang_detector();
    let job_id = SchedulerJobId(args.job_id);
    block_on(check_alive(adapter.as_ref(), &job_id, sample, detector))?.map(|_| ())
}

/// Prints the scheduler state while the job is alive. Silence means the job
/// is over, in which case an abnormal end leaves `rc` = -1 behind.
pub async fn check_alive(
    adapter: &dyn SchedulerAdapter,
    job_id: &SchedulerJobId,
    sample_memory: bool,
    detector: HangDetector,
) -> Result<Liveness, CliError> {
    let status = adapter.query_status(job_id).await?;

    if matches!(status.state, JobState::Pending | JobState::Running) {
        println!("{}", status.raw);
    }

    if sample_memory && status.state == JobState::Running && is_hung(adapter, job_id, detector).await? {
        adapter.kill(job_id).await;
        write_failed_rc(adapter, job_id).await?;
        return Ok(Liveness::KilledHung);
    }

    if status.abnormal {
        write_failed_rc(adapter, job_id).await?;
        return Ok(Liveness::Failed);
    }

    Ok(match status.state {
        JobState::Pending | JobState::Running => Liveness::Alive(status.raw),
        _ => Liveness::Finished,
    })
}

async fn is_hung(
    adapter: &dyn SchedulerAdapter,
    job_id: &SchedulerJobId,
    detector: HangDetector,
) -> Result<bool, CliError> {
    let telemetry = adapter.sample_memory(job_id).await?;
    let Some(requested) = adapter.requested_memory_gb(job_id).await? else {
        return Ok(false);
    };
    Ok(detector.is_hung(&telemetry, requested))
}

async fn write_failed_rc(
    adapter: &dyn SchedulerAdapter,
    job_id: &SchedulerJobId,
) -> Result<(), CliError> {
    let execution_dir = adapter.working_dir(job_id).await?.join(dirs::EXECUTION);
    if write_rc_if_missing(&execution_dir, &rc_codes::FAILED.to_string())? {
        tracing::info!("Wrote rc {} for job {}", rc_codes::FAILED, job_id);
    }
    Ok(())
}
