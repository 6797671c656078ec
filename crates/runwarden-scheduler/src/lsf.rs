use crate::adapter::{
    parse_memory_gb, JobExit, JobState, JobStatus, SchedulerAdapter, SubmitRequest,
};
use crate::error::{Result, SchedulerError};
use crate::runner::CommandRunner;
use async_trait::async_trait;
use regex::Regex;
use runwarden_core::hang::{MemorySample, MemoryTelemetry};
use runwarden_core::model::{FailureReason, SchedulerJobId};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

const BSUB: &str = "bsub";
const BJOBS: &str = "bjobs";
const BKILL: &str = "bkill";

#[derive(Deserialize)]
struct BjobsOutput {
    #[serde(rename = "JOBS")]
    jobs: usize,
    #[serde(rename = "RECORDS", default)]
    records: Vec<Map<String, Value>>,
}

pub fn parse_submission(stdout: &str) -> Result<SchedulerJobId> {
    let pattern =
        Regex::new(r"Job <(\d+)>").map_err(|e| SchedulerError::Submission(e.to_string()))?;
    pattern
        .captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| SchedulerJobId(m.as_str().to_string()))
        .ok_or_else(|| {
            SchedulerError::Submission(format!(
                "could not find a job id in bsub output: {}",
                stdout.trim()
            ))
        })
}

pub fn classify_state(stat: &str) -> JobStatus {
    let state = match stat {
        "PEND" | "WAIT" | "PROV" => JobState::Pending,
        "RUN" => JobState::Running,
        "DONE" | "EXIT" | "UNKWN" | "ZOMBI" => JobState::Finished,
        s if s.contains("SUSP") => JobState::Finished,
        _ => JobState::Unknown,
    };
    JobStatus {
        state,
        raw: stat.to_string(),
        abnormal: matches!(stat, "EXIT" | "UNKWN" | "ZOMBI") || stat.contains("SUSP"),
    }
}

pub fn classify_reason(exit_reason: &str) -> FailureReason {
    if exit_reason.contains("TERM_MEMLIMIT") {
        FailureReason::MemoryLimitExceeded
    } else if exit_reason.contains("TERM_RUNLIMIT") {
        FailureReason::WalltimeExceeded
    } else {
        FailureReason::Other
    }
}

fn field<'a>(record: &'a Map<String, Value>, name: &str) -> &'a str {
    record.get(name).and_then(Value::as_str).unwrap_or("").trim()
}

pub struct LsfAdapter {
    runner: Arc<dyn CommandRunner>,
}

impl LsfAdapter {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Runs `bjobs -o <fields> -json <id>` and returns the single record.
    async fn query_record(
        &self,
        job_id: &SchedulerJobId,
        fields: &str,
    ) -> Result<Map<String, Value>> {
        let args = vec![
            "-o".to_string(),
            fields.to_string(),
            "-json".to_string(),
            job_id.0.clone(),
        ];
        let stdout = self
            .runner
            .run_command(BJOBS, &args)
            .await
            .map_err(|e| SchedulerError::Transient(e.to_string()))?;
        parse_record(&stdout)
    }
}

pub fn parse_record(stdout: &str) -> Result<Map<String, Value>> {
    let output: BjobsOutput = serde_json::from_str(stdout)
        .map_err(|e| SchedulerError::Transient(format!("unreadable bjobs output: {}", e)))?;
    if output.jobs != 1 {
        return Err(SchedulerError::Transient(format!(
            "expected one bjobs record, got {}",
            output.jobs
        )));
    }
    let record = output
        .records
        .into_iter()
        .next()
        .ok_or_else(|| SchedulerError::Transient("bjobs returned no records".to_string()))?;
    if let Some(error) = record.get("ERROR") {
        return Err(SchedulerError::Transient(format!(
            "bjobs reported an error: {}",
            error.as_str().unwrap_or_default()
        )));
    }
    Ok(record)
}

#[async_trait]
impl SchedulerAdapter for LsfAdapter {
    fn name(&self) -> &'static str {
        "lsf"
    }

    fn submit_command(&self, request: &SubmitRequest) -> (String, Vec<String>) {
        let env = &request.envelope;
        let mut args = request.split_extra_args();
        args.extend([
            "-n".to_string(),
            env.cpu_count.to_string(),
            "-W".to_string(),
            env.walltime.to_string(),
            "-R".to_string(),
            format!(
                "rusage[mem={}]span[ptile={}]",
                env.memory_gb, env.cpu_count
            ),
            "-J".to_string(),
            request.job_name.clone(),
            "-cwd".to_string(),
            request.working_dir.display().to_string(),
            "-o".to_string(),
            request.stdout.display().to_string(),
            "-e".to_string(),
            request.stderr.display().to_string(),
            request.script.display().to_string(),
        ]);
        (BSUB.to_string(), args)
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SchedulerJobId> {
        let (program, args) = self.submit_command(request);
        let stdout = self
            .runner
            .run_command(&program, &args)
            .await
            .map_err(|e| SchedulerError::Submission(e.to_string()))?;
        let job_id = parse_submission(&stdout)?;
        tracing::info!("Submitted LSF job {} ({})", job_id, request.job_name);
        Ok(job_id)
    }

    async fn query_status(&self, job_id: &SchedulerJobId) -> Result<JobStatus> {
        let record = self.query_record(job_id, "STAT:6").await?;
        Ok(classify_state(field(&record, "STAT")))
    }

    async fn query_exit(&self, job_id: &SchedulerJobId) -> Result<JobExit> {
        let record = self
            .query_record(job_id, "EXIT_CODE:6 EXIT_REASON:50")
            .await?;
        let raw_code = field(&record, "EXIT_CODE");
        let raw_reason = field(&record, "EXIT_REASON").to_string();

        let exit_code = if raw_code.is_empty() {
            // A job terminated by LSF may carry a TERM_ reason without a code.
            if raw_reason.starts_with("TERM_") {
                -1
            } else {
                0
            }
        } else {
            raw_code.parse::<i32>().map_err(|_| {
                SchedulerError::Transient(format!("unparseable exit code '{}'", raw_code))
            })?
        };

        Ok(JobExit {
            exit_code,
            reason: classify_reason(&raw_reason),
            raw_reason,
        })
    }

    async fn kill(&self, job_id: &SchedulerJobId) {
        match self.runner.run_command(BKILL, &[job_id.0.clone()]).await {
            Ok(out) => tracing::info!("Killed LSF job {}: {}", job_id, out.trim()),
            Err(e) => tracing::warn!("Failed to kill LSF job {}: {}", job_id, e),
        }
    }

    async fn sample_memory(&self, job_id: &SchedulerJobId) -> Result<MemoryTelemetry> {
        let record = self.query_record(job_id, "AVG_MEM:50 MAX_MEM:50").await?;
        let max = parse_memory_gb(field(&record, "MAX_MEM"));
        let avg = parse_memory_gb(field(&record, "AVG_MEM"));
        Ok(match (max, avg) {
            (Some(max_gb), Some(avg_gb)) => MemoryTelemetry::Sampled(MemorySample { max_gb, avg_gb }),
            _ => MemoryTelemetry::Unsupported,
        })
    }

    async fn requested_memory_gb(&self, job_id: &SchedulerJobId) -> Result<Option<f64>> {
        let record = self.query_record(job_id, "MEMLIMIT:15 SLOTS:10").await?;
        let limit = parse_memory_gb(field(&record, "MEMLIMIT"));
        let slots = field(&record, "SLOTS").parse::<u32>().ok();
        Ok(match (limit, slots) {
            (Some(limit), Some(slots)) => Some(limit * f64::from(slots)),
            _ => None,
        })
    }

    async fn working_dir(&self, job_id: &SchedulerJobId) -> Result<PathBuf> {
        let record = self.query_record(job_id, "EXEC_CWD:4096").await?;
        let cwd = field(&record, "EXEC_CWD");
        if cwd.is_empty() {
            return Err(SchedulerError::Transient(format!(
                "no working directory reported for job {}",
                job_id
            )));
        }
        Ok(PathBuf::from(cwd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submission() {
        let id = parse_submission("Job <4242> is submitted to queue <normal>.\n").unwrap();
        assert_eq!(id, SchedulerJobId("4242".into()));
        assert!(matches!(
            parse_submission("Request aborted by esub."),
            Err(SchedulerError::Submission(_))
        ));
    }

    #[test]
    fn test_classify_state() {
        assert_eq!(classify_state("PEND").state, JobState::Pending);
        assert_eq!(classify_state("PROV").state, JobState::Pending);
        assert_eq!(classify_state("RUN").state, JobState::Running);
        assert_eq!(classify_state("DONE").state, JobState::Finished);
        assert!(!classify_state("DONE").abnormal);
        assert!(classify_state("EXIT").abnormal);
        let susp = classify_state("USUSP");
        assert_eq!(susp.state, JobState::Finished);
        assert!(susp.abnormal);
        assert!(susp.is_suspended());
        assert!(classify_state("ZOMBI").abnormal);
        assert!(classify_state("UNKWN").abnormal);
        assert!(!classify_state("EXIT").is_suspended());
        assert_eq!(classify_state("WEIRD").state, JobState::Unknown);
    }

    #[test]
    fn test_classify_reason() {
        assert_eq!(
            classify_reason("TERM_MEMLIMIT: job killed after reaching LSF memory usage limit"),
            FailureReason::MemoryLimitExceeded
        );
        assert_eq!(
            classify_reason("TERM_RUNLIMIT: job killed after reaching LSF run time limit"),
            FailureReason::WalltimeExceeded
        );
        assert_eq!(classify_reason(""), FailureReason::Other);
    }

    #[test]
    fn test_parse_record_error_is_transient() {
        let err = parse_record(r#"{"JOBS":1,"RECORDS":[{"JOBID":"1","ERROR":"Job <1> is not found"}]}"#)
            .unwrap_err();
        assert!(err.is_transient());

        let err = parse_record("not json").unwrap_err();
        assert!(err.is_transient());

        let record = parse_record(r#"{"JOBS":1,"RECORDS":[{"STAT":"RUN"}]}"#).unwrap();
        assert_eq!(field(&record, "STAT"), "RUN");
    }
}
