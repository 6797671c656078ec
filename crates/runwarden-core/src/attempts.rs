use crate::constants::files;
use crate::errors::ConfigError;
use crate::model::{AttemptOutcome, FailureReason, JobAttemptRecord};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only JSON-lines log of attempts for one job.
///
/// A record is rewritten (appended again) whenever its outcome changes; on
/// load the last line for each attempt number wins.
#[derive(Debug, Clone)]
pub struct AttemptLog {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    Fresh,
    /// The job was submitted but its outcome was never recorded.
    Monitor(JobAttemptRecord),
    Escalate(JobAttemptRecord, FailureReason),
    Finished(JobAttemptRecord),
}

impl AttemptLog {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(files::ATTEMPT_LOG),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &JobAttemptRecord) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<JobAttemptRecord>, ConfigError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs_err::read_to_string(&self.path)?;

        let mut by_attempt: BTreeMap<u32, JobAttemptRecord> = BTreeMap::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JobAttemptRecord>(line) {
                Ok(record) => {
                    by_attempt.insert(record.attempt_number, record);
                }
                Err(e) => {
                    tracing::warn!(
                        "Skipping unreadable line {} of '{}': {}",
                        idx + 1,
                        self.path.display(),
                        e
                    );
                }
            }
        }
        Ok(by_attempt.into_values().collect())
    }

    pub fn resume_point(&self) -> Result<ResumePoint, ConfigError> {
        let records = self.load()?;
        let Some(last) = records.into_iter().last() else {
            return Ok(ResumePoint::Fresh);
        };
        Ok(match last.outcome {
            AttemptOutcome::Pending => ResumePoint::Monitor(last),
            AttemptOutcome::Failed(reason) => ResumePoint::Escalate(last, reason),
            AttemptOutcome::Succeeded => ResumePoint::Finished(last),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobResourceEnvelope, SchedulerJobId, Walltime};
    use tempfile::tempdir;

    fn first_envelope() -> JobResourceEnvelope {
        JobResourceEnvelope::new(4, 8, Walltime::from_hours(4)).unwrap()
    }

    #[test]
    fn test_empty_log_is_fresh() {
        let dir = tempdir().unwrap();
        let log = AttemptLog::in_dir(dir.path());
        assert!(log.load().unwrap().is_empty());
        assert_eq!(log.resume_point().unwrap(), ResumePoint::Fresh);
    }

    #[test]
    fn test_round_trip_restores_attempt_and_envelope() {
        let dir = tempdir().unwrap();
        let log = AttemptLog::in_dir(dir.path());

        let first = JobAttemptRecord::pending(SchedulerJobId("100".into()), first_envelope());
        log.append(&first).unwrap();
        log.append(&first.with_outcome(AttemptOutcome::Failed(
            FailureReason::WalltimeExceeded,
        )))
        .unwrap();

        let second_env = first_envelope().next_attempt(8, Walltime::from_hours(8));
        let second = JobAttemptRecord::pending(SchedulerJobId("101".into()), second_env);
        log.append(&second).unwrap();

        let reloaded = AttemptLog::in_dir(dir.path());
        let records = reloaded.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].outcome,
            AttemptOutcome::Failed(FailureReason::WalltimeExceeded)
        );

        match reloaded.resume_point().unwrap() {
            ResumePoint::Monitor(record) => {
                assert_eq!(record.attempt_number, 2);
                assert_eq!(record.envelope, second_env);
                assert_eq!(record.scheduler_job_id, SchedulerJobId("101".into()));
            }
            other => panic!("unexpected resume point: {:?}", other),
        }
    }

    #[test]
    fn test_torn_trailing_line_is_skipped() {
        let dir = tempdir().unwrap();
        let log = AttemptLog::in_dir(dir.path());
        let record = JobAttemptRecord::pending(SchedulerJobId("7".into()), first_envelope());
        log.append(&record.with_outcome(AttemptOutcome::Failed(FailureReason::Other)))
            .unwrap();

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap();
        file.write_all(b"{\"attempt_number\":2,").unwrap();

        match log.resume_point().unwrap() {
            ResumePoint::Escalate(record, reason) => {
                assert_eq!(record.attempt_number, 1);
                assert_eq!(reason, FailureReason::Other);
            }
            other => panic!("unexpected resume point: {:?}", other),
        }
    }
}
