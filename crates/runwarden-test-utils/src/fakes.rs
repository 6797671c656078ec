use async_trait::async_trait;
use runwarden_core::hang::MemoryTelemetry;
use runwarden_core::model::{FailureReason, RunStatus, SchedulerJobId};
use runwarden_runner::engine::{EngineError, WorkflowEngine, WorkflowSubmission};
use runwarden_scheduler::{
    JobExit, JobState, JobStatus, Result, SchedulerAdapter, SchedulerError, SubmitRequest,
};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

/// How one submitted job behaves: the states it walks through, then its exit.
#[derive(Debug, Clone)]
pub struct ScriptedJob {
    pub states: Vec<JobState>,
    pub exit: JobExit,
    pub memory: MemoryTelemetry,
}

impl ScriptedJob {
    pub fn succeeding() -> Self {
        Self {
            states: vec![JobState::Pending, JobState::Running, JobState::Finished],
            exit: JobExit {
                exit_code: 0,
                reason: FailureReason::Other,
                raw_reason: String::new(),
            },
            memory: MemoryTelemetry::Unsupported,
        }
    }

    pub fn failing(reason: FailureReason) -> Self {
        let raw_reason = match reason {
            FailureReason::MemoryLimitExceeded => "TERM_MEMLIMIT",
            FailureReason::WalltimeExceeded => "TERM_RUNLIMIT",
            _ => "",
        };
        Self {
            exit: JobExit {
                exit_code: 1,
                reason,
                raw_reason: raw_reason.to_string(),
            },
            ..Self::succeeding()
        }
    }

    pub fn with_states(mut self, states: Vec<JobState>) -> Self {
        self.states = states;
        self
    }

    pub fn with_memory(mut self, memory: MemoryTelemetry) -> Self {
        self.memory = memory;
        self
    }
}

struct ActiveJob {
    script: ScriptedJob,
    polls: usize,
    killed: bool,
}

/// An in-memory scheduler replaying `ScriptedJob`s in submission order.
/// Once the script runs out every further job succeeds.
#[derive(Default)]
pub struct FakeScheduler {
    queue: Mutex<VecDeque<ScriptedJob>>,
    active: Mutex<HashMap<String, ActiveJob>>,
    submissions: Mutex<Vec<SubmitRequest>>,
    kills: Mutex<Vec<SchedulerJobId>>,
    status_failures: Mutex<u32>,
    submit_error: Option<String>,
    requested_memory_gb: Option<f64>,
    working_dir: Option<PathBuf>,
}

impl FakeScheduler {
    pub fn new(jobs: Vec<ScriptedJob>) -> Self {
        Self {
            queue: Mutex::new(jobs.into()),
            ..Self::default()
        }
    }

    pub fn rejecting_submissions(message: &str) -> Self {
        Self {
            submit_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// The next `n` status queries fail transiently.
    pub fn with_status_failures(self, n: u32) -> Self {
        if let Ok(mut failures) = self.status_failures.lock() {
            *failures = n;
        }
        self
    }

    pub fn with_requested_memory(mut self, gb: f64) -> Self {
        self.requested_memory_gb = Some(gb);
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Registers a job as already submitted, as if by an earlier process.
    pub fn adopt(&self, job_id: &str, script: ScriptedJob) {
        self.active.lock().expect("poisoned").insert(
            job_id.to_string(),
            ActiveJob {
                script,
                polls: 0,
                killed: false,
            },
        );
    }

    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.submissions.lock().expect("poisoned").clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().expect("poisoned").len()
    }

    pub fn kills(&self) -> Vec<SchedulerJobId> {
        self.kills.lock().expect("poisoned").clone()
    }

    fn unknown(job_id: &SchedulerJobId) -> SchedulerError {
        SchedulerError::Transient(format!("unknown job {}", job_id))
    }
}

#[async_trait]
impl SchedulerAdapter for FakeScheduler {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn submit_command(&self, request: &SubmitRequest) -> (String, Vec<String>) {
        (
            "fake-submit".to_string(),
            vec![request.script.display().to_string()],
        )
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SchedulerJobId> {
        if let Some(message) = &self.submit_error {
            return Err(SchedulerError::Submission(message.clone()));
        }
        let script = self
            .queue
            .lock()
            .expect("poisoned")
            .pop_front()
            .unwrap_or_else(ScriptedJob::succeeding);

        let mut submissions = self.submissions.lock().expect("poisoned");
        submissions.push(request.clone());
        let job_id = SchedulerJobId((100 + submissions.len()).to_string());
        self.active.lock().expect("poisoned").insert(
            job_id.0.clone(),
            ActiveJob {
                script,
                polls: 0,
                killed: false,
            },
        );
        Ok(job_id)
    }

    async fn query_status(&self, job_id: &SchedulerJobId) -> Result<JobStatus> {
        {
            let mut failures = self.status_failures.lock().expect("poisoned");
            if *failures > 0 {
                *failures -= 1;
                return Err(SchedulerError::Transient("scheduler unreachable".into()));
            }
        }
        let mut active = self.active.lock().expect("poisoned");
        let job = active.get_mut(&job_id.0).ok_or_else(|| Self::unknown(job_id))?;
        let state = if job.killed {
            JobState::Finished
        } else {
            let last = job.script.states.len().saturating_sub(1);
            let state = job
                .script
                .states
                .get(job.polls.min(last))
                .copied()
                .unwrap_or(JobState::Finished);
            job.polls += 1;
            state
        };
        let failed = job.killed || !job.script.exit.succeeded();
        Ok(JobStatus {
            state,
            raw: format!("{:?}", state).to_uppercase(),
            abnormal: state == JobState::Finished && failed,
        })
    }

    async fn query_exit(&self, job_id: &SchedulerJobId) -> Result<JobExit> {
        let active = self.active.lock().expect("poisoned");
        let job = active.get(&job_id.0).ok_or_else(|| Self::unknown(job_id))?;
        if job.killed {
            return Ok(JobExit {
                exit_code: -1,
                reason: FailureReason::Other,
                raw_reason: "TERM_OWNER".to_string(),
            });
        }
        Ok(job.script.exit.clone())
    }

    async fn kill(&self, job_id: &SchedulerJobId) {
        self.kills.lock().expect("poisoned").push(job_id.clone());
        if let Some(job) = self.active.lock().expect("poisoned").get_mut(&job_id.0) {
            job.killed = true;
        }
    }

    async fn sample_memory(&self, job_id: &SchedulerJobId) -> Result<MemoryTelemetry> {
        let active = self.active.lock().expect("poisoned");
        let job = active.get(&job_id.0).ok_or_else(|| Self::unknown(job_id))?;
        Ok(job.script.memory)
    }

    async fn requested_memory_gb(&self, _job_id: &SchedulerJobId) -> Result<Option<f64>> {
        Ok(self.requested_memory_gb)
    }

    async fn working_dir(&self, job_id: &SchedulerJobId) -> Result<PathBuf> {
        self.working_dir.clone().ok_or_else(|| Self::unknown(job_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineReply {
    Status(RunStatus),
    Malformed,
    /// The engine answers with this HTTP status code.
    Rejected(u16),
}

/// An in-memory workflow engine answering status queries from a script.
/// The last reply repeats once the script is exhausted.
pub struct FakeWorkflowEngine {
    run_id: String,
    replies: Mutex<VecDeque<EngineReply>>,
    last: Mutex<EngineReply>,
    submissions: Mutex<Vec<WorkflowSubmission>>,
    aborted: Mutex<Vec<String>>,
    queried: Mutex<Vec<String>>,
}

impl FakeWorkflowEngine {
    pub fn new(run_id: &str, statuses: Vec<RunStatus>) -> Self {
        Self::scripted(run_id, statuses.into_iter().map(EngineReply::Status).collect())
    }

    pub fn scripted(run_id: &str, replies: Vec<EngineReply>) -> Self {
        Self {
            run_id: run_id.to_string(),
            replies: Mutex::new(replies.into()),
            last: Mutex::new(EngineReply::Status(RunStatus::Succeeded)),
            submissions: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            queried: Mutex::new(Vec::new()),
        }
    }

    pub fn submissions(&self) -> Vec<WorkflowSubmission> {
        self.submissions.lock().expect("poisoned").clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.aborted.lock().expect("poisoned").clone()
    }

    /// Run ids passed to `status`, in call order.
    pub fn queried(&self) -> Vec<String> {
        self.queried.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl WorkflowEngine for FakeWorkflowEngine {
    async fn submit(&self, submission: &WorkflowSubmission) -> std::result::Result<String, EngineError> {
        self.submissions
            .lock()
            .expect("poisoned")
            .push(submission.clone());
        Ok(self.run_id.clone())
    }

    async fn status(&self, run_id: &str) -> std::result::Result<RunStatus, EngineError> {
        self.queried.lock().expect("poisoned").push(run_id.to_string());
        let mut last = self.last.lock().expect("poisoned");
        let reply = match self.replies.lock().expect("poisoned").pop_front() {
            Some(reply) => {
                *last = reply;
                reply
            }
            None => *last,
        };
        match reply {
            EngineReply::Status(status) => Ok(status),
            EngineReply::Malformed => Err(EngineError::Malformed(
                "expected results in response".to_string(),
            )),
            EngineReply::Rejected(status) => Err(EngineError::Rejected {
                url: format!("fake://{}/query", run_id),
                status,
                body: "unavailable".to_string(),
            }),
        }
    }

    async fn abort(&self, run_id: &str) -> std::result::Result<(), EngineError> {
        self.aborted.lock().expect("poisoned").push(run_id.to_string());
        Ok(())
    }
}
