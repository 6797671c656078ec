use crate::adapter::{JobExit, JobState, JobStatus, SchedulerAdapter, SubmitRequest};
use crate::error::{Result, SchedulerError};
use crate::runner::CommandRunner;
use async_trait::async_trait;
use regex::Regex;
use runwarden_core::hang::MemoryTelemetry;
use runwarden_core::model::{FailureReason, SchedulerJobId};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

const SBATCH: &str = "sbatch";
const SACCT: &str = "sacct";
const SCANCEL: &str = "scancel";

pub fn parse_submission(stdout: &str) -> Result<SchedulerJobId> {
    let pattern = Regex::new(r"Submitted batch job (\d+)")
        .map_err(|e| SchedulerError::Submission(e.to_string()))?;
    pattern
        .captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| SchedulerJobId(m.as_str().to_string()))
        .ok_or_else(|| {
            SchedulerError::Submission(format!(
                "could not find a job id in sbatch output: {}",
                stdout.trim()
            ))
        })
}

pub fn classify_state(state: &str) -> JobStatus {
    let job_state = match state {
        "PENDING" | "REQUEUED" | "CONFIGURING" | "RESIZING" => JobState::Pending,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" => JobState::Running,
        "COMPLETED" | "FAILED" | "CANCELLED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL"
        | "PREEMPTED" | "BOOT_FAIL" | "DEADLINE" | "SUSPENDED" => JobState::Finished,
        _ => JobState::Unknown,
    };
    JobStatus {
        state: job_state,
        raw: state.to_string(),
        abnormal: job_state == JobState::Finished && state != "COMPLETED",
    }
}

pub fn classify_reason(state: &str) -> FailureReason {
    match state {
        "OUT_OF_MEMORY" => FailureReason::MemoryLimitExceeded,
        "TIMEOUT" | "DEADLINE" => FailureReason::WalltimeExceeded,
        _ => FailureReason::Other,
    }
}

/// Picks the allocation record (not a `.batch`/`.extern` step) out of
/// `sacct --json`.
pub fn parse_job(stdout: &str, job_id: &SchedulerJobId) -> Result<Value> {
    let root: Value = serde_json::from_str(stdout)
        .map_err(|e| SchedulerError::Transient(format!("unreadable sacct output: {}", e)))?;
    let jobs = root
        .get("jobs")
        .and_then(Value::as_array)
        .ok_or_else(|| SchedulerError::Transient("sacct output has no jobs".to_string()))?;
    jobs.iter()
        .find(|job| match job.get("job_id") {
            Some(Value::Number(n)) => n.to_string() == job_id.0,
            Some(Value::String(s)) => s == &job_id.0,
            _ => false,
        })
        .cloned()
        .ok_or_else(|| SchedulerError::Transient(format!("sacct does not know job {}", job_id)))
}

/// `state.current` is a string in older Slurm releases and a list in newer ones.
pub fn job_state(job: &Value) -> String {
    let current = job.get("state").and_then(|s| s.get("current"));
    match current {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => job
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

/// `exit_code.return_code` is a bare number or `{"number": n, "set": true}`.
pub fn job_exit_code(job: &Value) -> Option<i32> {
    let code = job.get("exit_code")?.get("return_code")?;
    let number = match code {
        Value::Number(n) => n.as_i64(),
        Value::Object(_) => code.get("number").and_then(Value::as_i64),
        _ => None,
    }?;
    i32::try_from(number).ok()
}

pub struct SlurmAdapter {
    runner: Arc<dyn CommandRunner>,
}

impl SlurmAdapter {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn query_job(&self, job_id: &SchedulerJobId) -> Result<Value> {
        let args = vec!["-j".to_string(), job_id.0.clone(), "--json".to_string()];
        let stdout = self
            .runner
            .run_command(SACCT, &args)
            .await
            .map_err(|e| SchedulerError::Transient(e.to_string()))?;
        parse_job(&stdout, job_id)
    }
}

#[async_trait]
impl SchedulerAdapter for SlurmAdapter {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn submit_command(&self, request: &SubmitRequest) -> (String, Vec<String>) {
        let env = &request.envelope;
        let mut args = request.split_extra_args();
        args.extend([
            format!("--cpus-per-task={}", env.cpu_count),
            format!("--mem-per-cpu={}G", env.memory_gb),
            format!("--time={}:00", env.walltime),
            format!("--job-name={}", request.job_name),
            format!("--chdir={}", request.working_dir.display()),
            format!("--output={}", request.stdout.display()),
            format!("--error={}", request.stderr.display()),
            request.script.display().to_string(),
        ]);
        (SBATCH.to_string(), args)
    }

    fn wrapped_submit_command(
        &self,
        request: &SubmitRequest,
        command_line: &str,
    ) -> (String, Vec<String>) {
        let (program, mut args) = self.submit_command(request);
        args.pop();
        args.push(format!("--wrap={}", command_line));
        (program, args)
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SchedulerJobId> {
        let (program, args) = self.submit_command(request);
        let stdout = self
            .runner
            .run_command(&program, &args)
            .await
            .map_err(|e| SchedulerError::Submission(e.to_string()))?;
        let job_id = parse_submission(&stdout)?;
        tracing::info!("Submitted Slurm job {} ({})", job_id, request.job_name);
        Ok(job_id)
    }

    async fn query_status(&self, job_id: &SchedulerJobId) -> Result<JobStatus> {
        let job = self.query_job(job_id).await?;
        Ok(classify_state(&job_state(&job)))
    }

    async fn query_exit(&self, job_id: &SchedulerJobId) -> Result<JobExit> {
        let job = self.query_job(job_id).await?;
        let state = job_state(&job);
        let code = job_exit_code(&job).unwrap_or(0);
        let exit_code = if state != "COMPLETED" && code == 0 {
            -1
        } else {
            code
        };
        Ok(JobExit {
            exit_code,
            reason: classify_reason(&state),
            raw_reason: state,
        })
    }

    async fn kill(&self, job_id: &SchedulerJobId) {
        match self.runner.run_command(SCANCEL, &[job_id.0.clone()]).await {
            Ok(_) => tracing::info!("Cancelled Slurm job {}", job_id),
            Err(e) => tracing::warn!("Failed to cancel Slurm job {}: {}", job_id, e),
        }
    }

    async fn sample_memory(&self, _job_id: &SchedulerJobId) -> Result<MemoryTelemetry> {
        Ok(MemoryTelemetry::Unsupported)
    }

    async fn requested_memory_gb(&self, _job_id: &SchedulerJobId) -> Result<Option<f64>> {
        Ok(None)
    }

    async fn working_dir(&self, job_id: &SchedulerJobId) -> Result<PathBuf> {
        let job = self.query_job(job_id).await?;
        job.get("working_directory")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| {
                SchedulerError::Transient(format!(
                    "no working directory reported for job {}",
                    job_id
                ))
            })
    }
}
