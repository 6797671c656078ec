use crate::errors::DomainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Requested job walltime with minute resolution, rendered as `H:MM`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Walltime {
    minutes: u64,
}

impl Walltime {
    pub fn from_minutes(minutes: u64) -> Self {
        Self { minutes }
    }

    pub fn from_hours(hours: u64) -> Self {
        Self {
            minutes: hours * 60,
        }
    }

    pub fn minutes(&self) -> u64 {
        self.minutes
    }

    pub fn hours(&self) -> u64 {
        self.minutes / 60
    }

    pub fn scaled(&self, multiplier: u32) -> Self {
        Self {
            minutes: self.minutes.saturating_mul(u64::from(multiplier)),
        }
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:02}", self.minutes / 60, self.minutes % 60)
    }
}

impl FromStr for Walltime {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::InvalidWalltime(s.to_string());
        let (hours, minutes) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hours: u64 = hours.parse().map_err(|_| invalid())?;
        let minutes: u64 = minutes.parse().map_err(|_| invalid())?;
        if minutes >= 60 {
            return Err(invalid());
        }
        let walltime = Walltime {
            minutes: hours * 60 + minutes,
        };
        if walltime.minutes == 0 {
            return Err(invalid());
        }
        Ok(walltime)
    }
}

impl TryFrom<String> for Walltime {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Walltime> for String {
    fn from(value: Walltime) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobResourceEnvelope {
    pub cpu_count: u32,
    pub memory_gb: u64,
    pub walltime: Walltime,
    pub attempt_number: u32,
}

impl JobResourceEnvelope {
    pub fn new(cpu_count: u32, memory_gb: u64, walltime: Walltime) -> Result<Self, DomainError> {
        if cpu_count == 0 {
            return Err(DomainError::InvalidEnvelope(
                "cpu count must be positive".to_string(),
            ));
        }
        if memory_gb == 0 {
            return Err(DomainError::InvalidEnvelope(
                "memory must be positive".to_string(),
            ));
        }
        Ok(Self {
            cpu_count,
            memory_gb,
            walltime,
            attempt_number: 1,
        })
    }

    pub fn total_memory_gb(&self) -> u64 {
        self.memory_gb * u64::from(self.cpu_count)
    }

    pub fn next_attempt(&self, memory_gb: u64, walltime: Walltime) -> Self {
        Self {
            cpu_count: self.cpu_count,
            memory_gb,
            walltime,
            attempt_number: self.attempt_number + 1,
        }
    }
}

impl fmt::Display for JobResourceEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempt {} (cpu={}, mem={}G, walltime={})",
            self.attempt_number, self.cpu_count, self.memory_gb, self.walltime
        )
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MemoryLimitExceeded,
    WalltimeExceeded,
    Other,
    Unknown,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::MemoryLimitExceeded => write!(f, "memory limit exceeded"),
            FailureReason::WalltimeExceeded => write!(f, "walltime exceeded"),
            FailureReason::Other => write!(f, "other"),
            FailureReason::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Succeeded,
    Failed(FailureReason),
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct SchedulerJobId(pub String);

impl fmt::Display for SchedulerJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt_number: u32,
    pub scheduler_job_id: SchedulerJobId,
    pub envelope: JobResourceEnvelope,
    pub outcome: AttemptOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl JobAttemptRecord {
    pub fn pending(scheduler_job_id: SchedulerJobId, envelope: JobResourceEnvelope) -> Self {
        Self {
            attempt_number: envelope.attempt_number,
            scheduler_job_id,
            envelope,
            outcome: AttemptOutcome::Pending,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_outcome(&self, outcome: AttemptOutcome) -> Self {
        Self {
            outcome,
            recorded_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Per-attempt metadata written next to the attempt's logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInformation {
    pub job_id: SchedulerJobId,
    pub walltime: Walltime,
    pub memory_gb: u64,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    fn rank(&self) -> u8 {
        match self {
            RunStatus::Submitted => 0,
            RunStatus::Running => 1,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Aborted => 2,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Submitted | RunStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if *self == next {
            return true;
        }
        self.is_active() && next.rank() > self.rank()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Submitted => write!(f, "submitted"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "submitted" => Ok(RunStatus::Submitted),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "aborted" => Ok(RunStatus::Aborted),
            _ => Err(DomainError::InvalidRunStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub run_id: String,
    pub working_directory: PathBuf,
    status: RunStatus,
}

impl RunHandle {
    pub fn submitted(run_id: String, working_directory: PathBuf) -> Self {
        Self {
            run_id,
            working_directory,
            status: RunStatus::Submitted,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Moves the handle forward. Returns whether the status changed.
    pub fn advance(&mut self, next: RunStatus) -> Result<bool, DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::StatusRegression {
                from: self.status,
                to: next,
            });
        }
        let changed = self.status != next;
        self.status = next;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walltime_parse_and_display() {
        let w: Walltime = "4:00".parse().unwrap();
        assert_eq!(w.minutes(), 240);
        assert_eq!(w.to_string(), "4:00");

        let w: Walltime = "12:30".parse().unwrap();
        assert_eq!(w.to_string(), "12:30");
        assert_eq!(w.scaled(2).to_string(), "25:00");
    }

    #[test]
    fn test_walltime_rejects_garbage() {
        assert!("4".parse::<Walltime>().is_err());
        assert!("4:75".parse::<Walltime>().is_err());
        assert!("a:00".parse::<Walltime>().is_err());
        assert!("0:00".parse::<Walltime>().is_err());
    }

    #[test]
    fn test_walltime_serializes_as_string() {
        let info = JobInformation {
            job_id: SchedulerJobId("42".into()),
            walltime: Walltime::from_hours(8),
            memory_gb: 16,
            attempt: 2,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["walltime"], "8:00");
        assert_eq!(json["job_id"], "42");
        let back: JobInformation = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_envelope_requires_positive_resources() {
        assert!(JobResourceEnvelope::new(0, 8, Walltime::from_hours(1)).is_err());
        assert!(JobResourceEnvelope::new(4, 0, Walltime::from_hours(1)).is_err());
        let env = JobResourceEnvelope::new(4, 8, Walltime::from_hours(1)).unwrap();
        assert_eq!(env.attempt_number, 1);
        assert_eq!(env.total_memory_gb(), 32);
    }

    #[test]
    fn test_run_status_parse_is_case_insensitive() {
        assert_eq!("Running".parse::<RunStatus>().unwrap(), RunStatus::Running);
        assert_eq!(
            "SUCCEEDED".parse::<RunStatus>().unwrap(),
            RunStatus::Succeeded
        );
        assert!("On Hold".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_run_handle_transitions_are_monotonic() {
        let mut handle = RunHandle::submitted("abc".into(), PathBuf::from("/tmp/run"));
        assert!(handle.advance(RunStatus::Running).unwrap());
        assert!(!handle.advance(RunStatus::Running).unwrap());
        assert!(handle.advance(RunStatus::Submitted).is_err());
        assert!(handle.advance(RunStatus::Failed).unwrap());
        assert!(handle.advance(RunStatus::Succeeded).is_err());
        assert_eq!(handle.status(), RunStatus::Failed);
    }

    #[test]
    fn test_submitted_may_jump_to_terminal() {
        let mut handle = RunHandle::submitted("abc".into(), PathBuf::from("/tmp/run"));
        assert!(handle.advance(RunStatus::Aborted).unwrap());
    }

    #[test]
    fn test_attempt_outcome_serialization() {
        let json = serde_json::to_string(&AttemptOutcome::Failed(FailureReason::WalltimeExceeded))
            .unwrap();
        assert_eq!(json, r#"{"status":"failed","reason":"walltime_exceeded"}"#);
        let pending = serde_json::to_string(&AttemptOutcome::Pending).unwrap();
        assert_eq!(pending, r#"{"status":"pending"}"#);
    }
}
