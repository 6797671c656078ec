use runwarden_core::attempts::{AttemptLog, ResumePoint};
use runwarden_core::config::RetryConfig;
use runwarden_core::constants::{dirs, files, keywords};
use runwarden_core::errors::{ConfigError, DomainError};
use runwarden_core::escalation::EscalationPolicy;
use runwarden_core::hang::{jittered_secs, HangCheckSchedule, HangDetector, MemoryTelemetry};
use runwarden_core::model::{
    AttemptOutcome, FailureReason, JobAttemptRecord, JobInformation, JobResourceEnvelope,
    SchedulerJobId,
};
use runwarden_scheduler::{
    JobExit, JobState, JobStatus, SchedulerAdapter, SchedulerError, SubmitRequest,
};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Submission of attempt {attempt} failed: {source}")]
    Submission {
        attempt: u32,
        #[source]
        source: SchedulerError,
    },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Job failed after {attempts} attempt(s); last failure: {reason}, last request: {envelope}")]
    Exhausted {
        attempts: u32,
        reason: FailureReason,
        envelope: JobResourceEnvelope,
    },

    #[error("Job supervision was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Total submissions allowed, including the first.
    pub attempts: u32,
    pub policy: EscalationPolicy,
    pub hang_detector: HangDetector,
    pub kill_hung_jobs: bool,
    pub hang_check_interval: Duration,
    pub min_poll: Duration,
    pub max_poll: Duration,
    pub pending_poll: Duration,
    pub max_query_failures: u32,
}

impl From<&RetryConfig> for RetrySettings {
    fn from(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            policy: config.escalation_policy(),
            hang_detector: config.hang_detector(),
            kill_hung_jobs: config.kill_hung_jobs,
            hang_check_interval: Duration::from_secs(config.hang_check_interval_mins * 60),
            min_poll: Duration::from_secs(config.min_poll_secs),
            max_poll: Duration::from_secs(config.max_poll_secs),
            pending_poll: Duration::from_secs(config.pending_poll_secs),
            max_query_failures: config.max_query_failures,
        }
    }
}

/// What the controller supervises: one job script in one working directory.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_name: String,
    pub working_dir: PathBuf,
    pub script: PathBuf,
    pub baseline: JobResourceEnvelope,
    pub extra_args: Vec<String>,
}

impl JobSpec {
    pub fn retries_dir(&self) -> PathBuf {
        self.working_dir.join(dirs::EXECUTION).join(dirs::RETRIES)
    }

    pub fn attempt_dir(&self, attempt: u32) -> PathBuf {
        self.retries_dir().join(format!("attempt_{}", attempt))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Success(JobAttemptRecord),
    Exhausted {
        attempts: u32,
        reason: FailureReason,
        envelope: JobResourceEnvelope,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Submitting(JobResourceEnvelope),
    Monitoring(JobAttemptRecord),
    /// Carries the last status seen, or `None` when the scheduler could no
    /// longer be queried.
    Classifying(JobAttemptRecord, Option<JobStatus>),
    Escalating(JobAttemptRecord, FailureReason),
    Terminated(Termination),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Resumed {
        attempt: u32,
    },
    Submitted {
        attempt: u32,
        job_id: SchedulerJobId,
        envelope: JobResourceEnvelope,
    },
    StateChanged {
        job_id: SchedulerJobId,
        state: String,
    },
    HangDetected {
        job_id: SchedulerJobId,
        killed: bool,
    },
    Finished {
        job_id: SchedulerJobId,
        exit_code: i32,
        outcome: AttemptOutcome,
    },
    SuspiciousSuccess {
        job_id: SchedulerJobId,
        log: PathBuf,
    },
    Escalated {
        from: JobResourceEnvelope,
        to: JobResourceEnvelope,
        reason: FailureReason,
    },
}

enum MonitorOutcome {
    Finished(JobStatus),
    Lost,
}

/// Drives one job through submit, monitor, classify and escalate until it
/// succeeds or runs out of attempts.
pub struct RetryController {
    adapter: Arc<dyn SchedulerAdapter>,
    settings: RetrySettings,
    spec: JobSpec,
    log: AttemptLog,
    cancel: CancellationToken,
    events: Option<Sender<ControllerEvent>>,
}

impl RetryController {
    pub fn new(
        adapter: Arc<dyn SchedulerAdapter>,
        settings: RetrySettings,
        spec: JobSpec,
        cancel: CancellationToken,
    ) -> Self {
        let log = AttemptLog::in_dir(&spec.retries_dir());
        Self {
            adapter,
            settings,
            spec,
            log,
            cancel,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Sender<ControllerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn attempt_log(&self) -> &AttemptLog {
        &self.log
    }

    fn emit(&self, event: ControllerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn initial_state(&self) -> Result<ControllerState, ControllerError> {
        let state = match self.log.resume_point()? {
            ResumePoint::Fresh => {
                ControllerState::Submitting(self.settings.policy.fit_baseline(&self.spec.baseline)?)
            }
            ResumePoint::Monitor(record) => {
                tracing::info!(
                    "Resuming attempt {} (job {}) from the attempt log",
                    record.attempt_number,
                    record.scheduler_job_id
                );
                self.emit(ControllerEvent::Resumed {
                    attempt: record.attempt_number,
                });
                ControllerState::Monitoring(record)
            }
            ResumePoint::Escalate(record, reason) => {
                self.emit(ControllerEvent::Resumed {
                    attempt: record.attempt_number,
                });
                ControllerState::Escalating(record, reason)
            }
            ResumePoint::Finished(record) => {
                ControllerState::Terminated(Termination::Success(record))
            }
        };
        Ok(state)
    }

    pub async fn run(&self) -> Result<JobAttemptRecord, ControllerError> {
        let mut state = ControllerState::Idle;
        loop {
            tracing::debug!("Controller state: {:?}", state);
            state = match state {
                ControllerState::Idle => self.initial_state()?,
                ControllerState::Submitting(envelope) => {
                    ControllerState::Monitoring(self.submit(envelope).await?)
                }
                ControllerState::Monitoring(record) => match self.monitor(&record).await? {
                    MonitorOutcome::Finished(status) => {
                        ControllerState::Classifying(record, Some(status))
                    }
                    MonitorOutcome::Lost => ControllerState::Classifying(record, None),
                },
                ControllerState::Classifying(record, last_status) => {
                    self.classify(record, last_status).await?
                }
                ControllerState::Escalating(record, reason) => self.escalate(record, reason),
                ControllerState::Terminated(Termination::Success(record)) => return Ok(record),
                ControllerState::Terminated(Termination::Exhausted {
                    attempts,
                    reason,
                    envelope,
                }) => {
                    return Err(ControllerError::Exhausted {
                        attempts,
                        reason,
                        envelope,
                    })
                }
            };
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<(), ControllerError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ControllerError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Sleeps while `job_id` is on the cluster. A cancellation kills the job.
    async fn wait_in_flight(
        &self,
        job_id: &SchedulerJobId,
        duration: Duration,
    ) -> Result<(), ControllerError> {
        if let Err(e) = self.sleep(duration).await {
            tracing::warn!("Cancelled while job {} is in flight, killing it", job_id);
            self.adapter.kill(job_id).await;
            return Err(e);
        }
        Ok(())
    }

    fn jittered_poll(&self) -> Duration {
        Duration::from_secs(jittered_secs(
            self.settings.min_poll.as_secs(),
            self.settings.max_poll.as_secs(),
        ))
    }

    async fn submit(
        &self,
        envelope: JobResourceEnvelope,
    ) -> Result<JobAttemptRecord, ControllerError> {
        let attempt = envelope.attempt_number;
        let attempt_dir = self.spec.attempt_dir(attempt);
        fs_err::create_dir_all(&attempt_dir).map_err(ConfigError::Io)?;

        let stdout = attempt_dir.join("stdout");
        let stderr = attempt_dir.join("stderr");
        for stale in [&stdout, &stderr] {
            if stale.exists() {
                fs_err::remove_file(stale).map_err(ConfigError::Io)?;
            }
        }

        let request = SubmitRequest {
            envelope,
            job_name: format!("attempt_{}_{}", attempt, self.spec.job_name),
            working_dir: self.spec.working_dir.clone(),
            script: self.spec.script.clone(),
            stdout,
            stderr,
            extra_args: self.spec.extra_args.clone(),
        };

        tracing::info!("Submitting {}", envelope);
        let job_id = self
            .adapter
            .submit(&request)
            .await
            .map_err(|source| ControllerError::Submission { attempt, source })?;

        let info = JobInformation {
            job_id: job_id.clone(),
            walltime: envelope.walltime,
            memory_gb: envelope.memory_gb,
            attempt,
        };
        let info_json = serde_json::to_string_pretty(&info).map_err(ConfigError::Json)?;
        fs_err::write(attempt_dir.join(files::JOB_INFORMATION), info_json)
            .map_err(ConfigError::Io)?;

        let record = JobAttemptRecord::pending(job_id.clone(), envelope);
        self.log.append(&record)?;

        self.emit(ControllerEvent::Submitted {
            attempt,
            job_id,
            envelope,
        });
        Ok(record)
    }

    async fn monitor(&self, record: &JobAttemptRecord) -> Result<MonitorOutcome, ControllerError> {
        let job_id = &record.scheduler_job_id;
        let mut last_state = String::new();
        let mut running_since: Option<Instant> = None;
        let mut schedule = HangCheckSchedule::every(self.settings.hang_check_interval);
        let mut failures = 0u32;

        loop {
            let status = match self.adapter.query_status(job_id).await {
                Ok(status) if status.state != JobState::Unknown => status,
                Ok(status) => {
                    failures += 1;
                    tracing::warn!(
                        "Job {} reported unrecognised state '{}' ({}/{})",
                        job_id,
                        status.raw,
                        failures,
                        self.settings.max_query_failures
                    );
                    if failures > self.settings.max_query_failures {
                        return Ok(MonitorOutcome::Lost);
                    }
                    self.wait_in_flight(job_id, self.settings.min_poll).await?;
                    continue;
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    tracing::warn!(
                        "Status query for job {} failed ({}/{}): {}",
                        job_id,
                        failures,
                        self.settings.max_query_failures,
                        e
                    );
                    if failures > self.settings.max_query_failures {
                        return Ok(MonitorOutcome::Lost);
                    }
                    self.wait_in_flight(job_id, self.settings.min_poll).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            failures = 0;

            if status.raw != last_state {
                tracing::info!("Job {} is {}", job_id, status.raw);
                last_state = status.raw.clone();
                self.emit(ControllerEvent::StateChanged {
                    job_id: job_id.clone(),
                    state: status.raw.clone(),
                });
            }

            let wait = match status.state {
                JobState::Finished => return Ok(MonitorOutcome::Finished(status)),
                JobState::Pending => self.settings.pending_poll,
                JobState::Running => {
                    let since = *running_since.get_or_insert_with(Instant::now);
                    if schedule.is_due(since.elapsed()) {
                        self.check_hang(record).await;
                    }
                    self.jittered_poll()
                }
                JobState::Unknown => self.settings.min_poll,
            };

            self.wait_in_flight(job_id, wait).await?;
        }
    }

    async fn check_hang(&self, record: &JobAttemptRecord) {
        let job_id = &record.scheduler_job_id;
        let telemetry = match self.adapter.sample_memory(job_id).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Could not sample memory of job {}: {}", job_id, e);
                return;
            }
        };
        if let MemoryTelemetry::Sampled(sample) = telemetry {
            tracing::debug!(
                "Job {} memory: max {:.2}G, avg {:.2}G",
                job_id,
                sample.max_gb,
                sample.avg_gb
            );
        }

        let requested = record.envelope.total_memory_gb() as f64;
        if !self.settings.hang_detector.is_hung(&telemetry, requested) {
            return;
        }

        tracing::warn!("Job {} has exhausted its requested memory", job_id);
        let killed = self.settings.kill_hung_jobs;
        if killed {
            self.adapter.kill(job_id).await;
        }
        self.emit(ControllerEvent::HangDetected {
            job_id: job_id.clone(),
            killed,
        });
    }

    async fn query_exit(&self, job_id: &SchedulerJobId) -> Result<Option<JobExit>, ControllerError> {
        let mut failures = 0u32;
        loop {
            match self.adapter.query_exit(job_id).await {
                Ok(exit) => return Ok(Some(exit)),
                Err(e) if e.is_transient() => {
                    failures += 1;
                    tracing::warn!("Exit query for job {} failed: {}", job_id, e);
                    if failures > self.settings.max_query_failures {
                        return Ok(None);
                    }
                    self.wait_in_flight(job_id, self.settings.min_poll).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn classify(
        &self,
        record: JobAttemptRecord,
        last_status: Option<JobStatus>,
    ) -> Result<ControllerState, ControllerError> {
        let job_id = record.scheduler_job_id.clone();
        let exit = match &last_status {
            None => None,
            Some(status) if status.is_suspended() => {
                // A suspended job still holds its slot until it is killed.
                tracing::warn!("Job {} is suspended ({}), killing it", job_id, status.raw);
                self.adapter.kill(&job_id).await;
                Some(JobExit {
                    exit_code: -1,
                    reason: FailureReason::Other,
                    raw_reason: status.raw.clone(),
                })
            }
            Some(status) => self
                .query_exit(&job_id)
                .await?
                .map(|exit| exit.with_abnormal_end(status)),
        };

        let (exit_code, outcome) = match &exit {
            Some(exit) if exit.succeeded() => (0, AttemptOutcome::Succeeded),
            Some(exit) => {
                tracing::warn!(
                    "Job {} completed with errors. code: {}, reason: {}",
                    job_id,
                    exit.exit_code,
                    exit.raw_reason
                );
                (exit.exit_code, AttemptOutcome::Failed(exit.reason))
            }
            None => {
                tracing::warn!("Lost track of job {}; treating the failure as unknown", job_id);
                (-1, AttemptOutcome::Failed(FailureReason::Unknown))
            }
        };

        let finished = record.with_outcome(outcome);
        self.log.append(&finished)?;
        self.emit(ControllerEvent::Finished {
            job_id: job_id.clone(),
            exit_code,
            outcome,
        });

        Ok(match outcome {
            AttemptOutcome::Succeeded => {
                tracing::info!("Job {} completed successfully", job_id);
                self.check_logs(&finished);
                ControllerState::Terminated(Termination::Success(finished))
            }
            AttemptOutcome::Failed(reason) => ControllerState::Escalating(finished, reason),
            AttemptOutcome::Pending => ControllerState::Monitoring(finished),
        })
    }

    /// Warns when a successful job's logs mention an error anyway.
    fn check_logs(&self, record: &JobAttemptRecord) {
        let dir = self.spec.attempt_dir(record.attempt_number);
        for log in [dir.join("stderr"), dir.join("stdout")] {
            if log_mentions_failure(&log) {
                tracing::warn!(
                    "Failure keywords found in '{}' of successful job {}",
                    log.display(),
                    record.scheduler_job_id
                );
                self.emit(ControllerEvent::SuspiciousSuccess {
                    job_id: record.scheduler_job_id.clone(),
                    log,
                });
            }
        }
    }

    fn escalate(&self, record: JobAttemptRecord, reason: FailureReason) -> ControllerState {
        if record.attempt_number >= self.settings.attempts {
            return ControllerState::Terminated(Termination::Exhausted {
                attempts: record.attempt_number,
                reason,
                envelope: record.envelope,
            });
        }
        let next = self.settings.policy.escalate(&record.envelope, reason);
        tracing::info!("Escalating after {}: {} -> {}", reason, record.envelope, next);
        self.emit(ControllerEvent::Escalated {
            from: record.envelope,
            to: next,
            reason,
        });
        ControllerState::Submitting(next)
    }
}

fn log_mentions_failure(path: &Path) -> bool {
    let Ok(bytes) = std::fs::read(path) else {
        return false;
    };
    String::from_utf8_lossy(&bytes).lines().any(|line| {
        let lower = line.to_lowercase();
        keywords::SUSPICIOUS_SUCCESS.iter().any(|k| lower.contains(k))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_settings_from_config() {
        let config = RetryConfig {
            attempts: 0,
            ..RetryConfig::default()
        };
        let settings = RetrySettings::from(&config);
        assert_eq!(settings.attempts, 1);
        assert_eq!(settings.pending_poll, Duration::from_secs(1200));
        assert_eq!(settings.hang_check_interval, Duration::from_secs(7200));
    }

    #[test]
    fn test_log_keyword_scan() {
        let dir = tempdir().unwrap();
        let clean = dir.path().join("clean");
        let noisy = dir.path().join("noisy");
        std::fs::write(&clean, "all done\n").unwrap();
        std::fs::write(&noisy, "process Terminated by signal\n").unwrap();
        assert!(!log_mentions_failure(&clean));
        assert!(log_mentions_failure(&noisy));
        assert!(!log_mentions_failure(&dir.path().join("missing")));
    }

    #[test]
    fn test_attempt_dirs() {
        let spec = JobSpec {
            job_name: "align".into(),
            working_dir: PathBuf::from("/w"),
            script: PathBuf::from("/w/execution/run_script.sh"),
            baseline: JobResourceEnvelope::new(
                1,
                1,
                runwarden_core::model::Walltime::from_hours(1),
            )
            .unwrap(),
            extra_args: vec![],
        };
        assert_eq!(
            spec.attempt_dir(2),
            PathBuf::from("/w/execution/retries/attempt_2")
        );
    }
}
