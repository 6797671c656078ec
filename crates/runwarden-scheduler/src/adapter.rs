use crate::error::Result;
use crate::lsf::LsfAdapter;
use crate::runner::CommandRunner;
use crate::slurm::SlurmAdapter;
use async_trait::async_trait;
use runwarden_core::config::SchedulerKind;
use runwarden_core::hang::MemoryTelemetry;
use runwarden_core::model::{FailureReason, JobResourceEnvelope, SchedulerJobId};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub envelope: JobResourceEnvelope,
    pub job_name: String,
    pub working_dir: PathBuf,
    pub script: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    /// Raw scheduler arguments, each entry split on whitespace.
    pub extra_args: Vec<String>,
}

impl SubmitRequest {
    pub(crate) fn split_extra_args(&self) -> Vec<String> {
        self.extra_args
            .iter()
            .flat_map(|a| a.split_whitespace())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Finished,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    /// The scheduler's own state string, e.g. `RUN` or `PENDING`.
    pub raw: String,
    /// Suspended or exited without the job script completing.
    pub abnormal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobExit {
    pub exit_code: i32,
    pub reason: FailureReason,
    pub raw_reason: String,
}

impl JobStatus {
    /// LSF `PSUSP`/`USUSP`/`SSUSP` and Slurm `SUSPENDED`.
    pub fn is_suspended(&self) -> bool {
        self.raw.contains("SUSP")
    }
}

impl JobExit {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// A zero exit code does not count as success when the job ended abnormally.
    pub fn with_abnormal_end(self, status: &JobStatus) -> Self {
        if status.abnormal && self.succeeded() {
            Self {
                exit_code: -1,
                reason: FailureReason::Other,
                raw_reason: if self.raw_reason.is_empty() {
                    status.raw.clone()
                } else {
                    self.raw_reason
                },
            }
        } else {
            self
        }
    }
}

#[async_trait]
pub trait SchedulerAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// The submission binary and its arguments for `request`.
    fn submit_command(&self, request: &SubmitRequest) -> (String, Vec<String>);

    /// Like `submit_command`, but runs `command_line` in place of the script.
    fn wrapped_submit_command(
        &self,
        request: &SubmitRequest,
        command_line: &str,
    ) -> (String, Vec<String>) {
        let (program, mut args) = self.submit_command(request);
        args.pop();
        args.push("--wrap".to_string());
        args.push(command_line.to_string());
        (program, args)
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SchedulerJobId>;

    async fn query_status(&self, job_id: &SchedulerJobId) -> Result<JobStatus>;

    /// Only meaningful once the job is `Finished`.
    async fn query_exit(&self, job_id: &SchedulerJobId) -> Result<JobExit>;

    /// Best effort: failures are logged and swallowed.
    async fn kill(&self, job_id: &SchedulerJobId);

    async fn sample_memory(&self, job_id: &SchedulerJobId) -> Result<MemoryTelemetry>;

    /// Total memory the job asked for, when the scheduler reports it.
    async fn requested_memory_gb(&self, job_id: &SchedulerJobId) -> Result<Option<f64>>;

    async fn working_dir(&self, job_id: &SchedulerJobId) -> Result<PathBuf>;
}

pub fn build_adapter(
    kind: SchedulerKind,
    runner: Arc<dyn CommandRunner>,
) -> Arc<dyn SchedulerAdapter> {
    match kind {
        SchedulerKind::Lsf => Arc::new(LsfAdapter::new(runner)),
        SchedulerKind::Slurm => Arc::new(SlurmAdapter::new(runner)),
    }
}

/// Converts a scheduler memory figure such as `12.3 Gbytes`, `800M` or
/// `8 G` to gigabytes. Returns `None` for empty or unit-less values.
pub fn parse_memory_gb(value: &str) -> Option<f64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let factor = match unit.trim().chars().next()?.to_ascii_uppercase() {
        'K' => 1.0 / (1024.0 * 1024.0),
        'M' => 1.0 / 1024.0,
        'G' => 1.0,
        'T' => 1024.0,
        _ => return None,
    };
    Some(number * factor)
}
