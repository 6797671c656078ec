use runwarden_core::attempts::AttemptLog;
use runwarden_core::config::RetryConfig;
use runwarden_core::hang::{MemorySample, MemoryTelemetry};
use runwarden_core::model::{
    AttemptOutcome, FailureReason, JobAttemptRecord, JobResourceEnvelope, SchedulerJobId,
    Walltime,
};
use runwarden_runner::controller::{
    ControllerError, ControllerEvent, JobSpec, RetryController, RetrySettings,
};
use async_trait::async_trait;
use runwarden_core::config::SchedulerKind;
use runwarden_scheduler::{build_adapter, CommandRunner, JobState, SchedulerError};
use runwarden_test_utils::{FakeScheduler, ScriptedJob};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn spec(dir: &Path) -> JobSpec {
    JobSpec {
        job_name: "align".into(),
        working_dir: dir.to_path_buf(),
        script: dir.join("execution").join("run_script.sh"),
        baseline: JobResourceEnvelope::new(4, 8, Walltime::from_hours(4)).unwrap(),
        extra_args: vec![],
    }
}

fn settings(config: RetryConfig) -> RetrySettings {
    RetrySettings::from(&config)
}

fn controller(scheduler: &Arc<FakeScheduler>, dir: &Path, config: RetryConfig) -> RetryController {
    RetryController::new(
        scheduler.clone(),
        settings(config),
        spec(dir),
        CancellationToken::new(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_success_stops_after_first_attempt() {
    let dir = tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::new(vec![ScriptedJob::succeeding()]));

    let record = controller(&scheduler, dir.path(), RetryConfig::default())
        .run()
        .await
        .unwrap();

    assert_eq!(record.attempt_number, 1);
    assert_eq!(record.outcome, AttemptOutcome::Succeeded);
    assert_eq!(scheduler.submission_count(), 1);

    let submitted = &scheduler.submissions()[0];
    assert_eq!(submitted.job_name, "attempt_1_align");
    assert_eq!(
        submitted.stdout,
        dir.path().join("execution/retries/attempt_1/stdout")
    );
    assert!(dir
        .path()
        .join("execution/retries/attempt_1/job_information.json")
        .exists());
}

#[tokio::test(start_paused = true)]
async fn test_walltime_failure_doubles_walltime() {
    let dir = tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::new(vec![
        ScriptedJob::failing(FailureReason::WalltimeExceeded),
        ScriptedJob::succeeding(),
    ]));

    let record = controller(&scheduler, dir.path(), RetryConfig::default())
        .run()
        .await
        .unwrap();

    assert_eq!(record.attempt_number, 2);
    let envelopes: Vec<JobResourceEnvelope> =
        scheduler.submissions().iter().map(|s| s.envelope).collect();
    assert_eq!(envelopes[1].walltime, Walltime::from_hours(8));
    assert_eq!(envelopes[1].memory_gb, 8);
    assert_eq!(scheduler.submissions()[1].job_name, "attempt_2_align");
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_after_exactly_bound_submissions() {
    let dir = tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::new(vec![
        ScriptedJob::failing(FailureReason::MemoryLimitExceeded),
        ScriptedJob::failing(FailureReason::MemoryLimitExceeded),
        ScriptedJob::failing(FailureReason::MemoryLimitExceeded),
        ScriptedJob::succeeding(),
    ]));

    let err = controller(&scheduler, dir.path(), RetryConfig::default())
        .run()
        .await
        .unwrap_err();

    match err {
        ControllerError::Exhausted {
            attempts,
            reason,
            envelope,
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(reason, FailureReason::MemoryLimitExceeded);
            assert_eq!(envelope.memory_gb, 32);
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
    assert_eq!(scheduler.submission_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_submission_error_fails_fast() {
    let dir = tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::rejecting_submissions("queue closed"));

    let err = controller(&scheduler, dir.path(), RetryConfig::default())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Submission { attempt: 1, .. }));
    assert!(AttemptLog::in_dir(&dir.path().join("execution/retries"))
        .load()
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_query_failures_are_absorbed() {
    let dir = tempdir().unwrap();
    let scheduler =
        Arc::new(FakeScheduler::new(vec![ScriptedJob::succeeding()]).with_status_failures(3));

    controller(&scheduler, dir.path(), RetryConfig::default())
        .run()
        .await
        .unwrap();
    assert_eq!(scheduler.submission_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_job_escalates_both_resources() {
    let dir = tempdir().unwrap();
    let scheduler = Arc::new(
        FakeScheduler::new(vec![ScriptedJob::succeeding(), ScriptedJob::succeeding()])
            .with_status_failures(3),
    );
    let config = RetryConfig {
        max_query_failures: 2,
        ..RetryConfig::default()
    };

    let record = controller(&scheduler, dir.path(), config).run().await.unwrap();
    assert_eq!(record.attempt_number, 2);

    let second = scheduler.submissions()[1].envelope;
    assert_eq!(second.memory_gb, 16);
    assert_eq!(second.walltime, Walltime::from_hours(8));

    let records = AttemptLog::in_dir(&dir.path().join("execution/retries"))
        .load()
        .unwrap();
    assert_eq!(
        records[0].outcome,
        AttemptOutcome::Failed(FailureReason::Unknown)
    );
}

#[tokio::test(start_paused = true)]
async fn test_hung_job_is_killed_and_retried_with_more_memory() {
    let dir = tempdir().unwrap();
    let pinned = MemoryTelemetry::Sampled(MemorySample {
        max_gb: 32.0,
        avg_gb: 31.0,
    });
    let scheduler = Arc::new(FakeScheduler::new(vec![
        ScriptedJob::succeeding()
            .with_states(vec![JobState::Running])
            .with_memory(pinned),
        ScriptedJob::succeeding(),
    ]));
    let config = RetryConfig {
        kill_hung_jobs: true,
        hang_check_interval_mins: 0,
        ..RetryConfig::default()
    };

    let record = controller(&scheduler, dir.path(), config).run().await.unwrap();

    assert_eq!(scheduler.kills(), vec![SchedulerJobId("101".into())]);
    assert_eq!(record.attempt_number, 2);
    assert_eq!(scheduler.submissions()[1].envelope.memory_gb, 16);
}

#[tokio::test(start_paused = true)]
async fn test_hang_without_kill_flag_only_reports() {
    let dir = tempdir().unwrap();
    let pinned = MemoryTelemetry::Sampled(MemorySample {
        max_gb: 32.0,
        avg_gb: 31.0,
    });
    let scheduler = Arc::new(FakeScheduler::new(vec![ScriptedJob::succeeding()
        .with_states(vec![
            JobState::Running,
            JobState::Running,
            JobState::Finished,
        ])
        .with_memory(pinned)]));
    let config = RetryConfig {
        hang_check_interval_mins: 0,
        ..RetryConfig::default()
    };
    let (tx, rx) = mpsc::channel();

    controller(&scheduler, dir.path(), config)
        .with_events(tx)
        .run()
        .await
        .unwrap();

    assert!(scheduler.kills().is_empty());
    let events: Vec<ControllerEvent> = rx.try_iter().collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, ControllerEvent::HangDetected { killed: false, .. })));
}

#[tokio::test(start_paused = true)]
async fn test_resume_monitors_pending_attempt_without_resubmitting() {
    let dir = tempdir().unwrap();
    let log = AttemptLog::in_dir(&dir.path().join("execution/retries"));
    let envelope = JobResourceEnvelope::new(4, 8, Walltime::from_hours(4)).unwrap();
    log.append(&JobAttemptRecord::pending(
        SchedulerJobId("555".into()),
        envelope,
    ))
    .unwrap();

    let scheduler = Arc::new(FakeScheduler::new(vec![]));
    scheduler.adopt("555", ScriptedJob::succeeding());

    let record = controller(&scheduler, dir.path(), RetryConfig::default())
        .run()
        .await
        .unwrap();

    assert_eq!(record.scheduler_job_id, SchedulerJobId("555".into()));
    assert_eq!(scheduler.submission_count(), 0);
    assert_eq!(log.load().unwrap()[0].outcome, AttemptOutcome::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_recorded_failure_escalates() {
    let dir = tempdir().unwrap();
    let log = AttemptLog::in_dir(&dir.path().join("execution/retries"));
    let envelope = JobResourceEnvelope::new(4, 8, Walltime::from_hours(4)).unwrap();
    log.append(
        &JobAttemptRecord::pending(SchedulerJobId("555".into()), envelope)
            .with_outcome(AttemptOutcome::Failed(FailureReason::WalltimeExceeded)),
    )
    .unwrap();

    let scheduler = Arc::new(FakeScheduler::new(vec![ScriptedJob::succeeding()]));
    let record = controller(&scheduler, dir.path(), RetryConfig::default())
        .run()
        .await
        .unwrap();

    assert_eq!(record.attempt_number, 2);
    assert_eq!(
        scheduler.submissions()[0].envelope.walltime,
        Walltime::from_hours(8)
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_kills_in_flight_job() {
    let dir = tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::new(vec![
        ScriptedJob::succeeding().with_states(vec![JobState::Pending])
    ]));
    let cancel = CancellationToken::new();
    let controller = RetryController::new(
        scheduler.clone(),
        settings(RetryConfig::default()),
        spec(dir.path()),
        cancel.clone(),
    );
    cancel.cancel();

    let err = controller.run().await.unwrap_err();
    assert!(matches!(err, ControllerError::Cancelled));
    assert_eq!(scheduler.kills().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_attempt_logs_are_cleared_before_submission() {
    let dir = tempdir().unwrap();
    let attempt_dir = dir.path().join("execution/retries/attempt_1");
    std::fs::create_dir_all(&attempt_dir).unwrap();
    std::fs::write(attempt_dir.join("stderr"), "Killed by signal 9\n").unwrap();

    let scheduler = Arc::new(FakeScheduler::new(vec![ScriptedJob::succeeding()]));
    let (tx, rx) = mpsc::channel();
    let record = controller(&scheduler, dir.path(), RetryConfig::default())
        .with_events(tx)
        .run()
        .await
        .unwrap();

    assert_eq!(record.outcome, AttemptOutcome::Succeeded);
    assert!(!attempt_dir.join("stderr").exists());
    let events: Vec<ControllerEvent> = rx.try_iter().collect();
    assert!(!events
        .iter()
        .any(|e| matches!(e, ControllerEvent::SuspiciousSuccess { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ControllerEvent::Finished { exit_code: 0, .. })));
}

#[tokio::test(start_paused = true)]
async fn test_baseline_over_ceiling_is_clamped_and_retry_never_shrinks() {
    let dir = tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::new(vec![
        ScriptedJob::failing(FailureReason::MemoryLimitExceeded),
        ScriptedJob::succeeding(),
    ]));
    let mut job = spec(dir.path());
    job.baseline = JobResourceEnvelope::new(4, 200, Walltime::from_hours(4)).unwrap();

    let record = RetryController::new(
        scheduler.clone(),
        settings(RetryConfig::default()),
        job,
        CancellationToken::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(record.attempt_number, 2);
    let requests: Vec<(u64, u64)> = scheduler
        .submissions()
        .iter()
        .map(|r| (r.envelope.memory_gb, r.envelope.total_memory_gb()))
        .collect();
    assert_eq!(requests, vec![(112, 448), (112, 448)]);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_status_failures_kills_job() {
    let dir = tempdir().unwrap();
    let scheduler =
        Arc::new(FakeScheduler::new(vec![ScriptedJob::succeeding()]).with_status_failures(3));
    let cancel = CancellationToken::new();
    let controller = RetryController::new(
        scheduler.clone(),
        settings(RetryConfig::default()),
        spec(dir.path()),
        cancel.clone(),
    );
    cancel.cancel();

    let err = controller.run().await.unwrap_err();
    assert!(matches!(err, ControllerError::Cancelled));
    assert_eq!(scheduler.submission_count(), 1);
    assert_eq!(scheduler.kills(), vec![SchedulerJobId("101".into())]);
}

/// Replays canned scheduler output in order and records each command line.
#[derive(Default)]
struct CannedRunner {
    outputs: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<String>>,
}

impl CannedRunner {
    fn new(outputs: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            outputs: Mutex::new(outputs.iter().map(|o| o.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for CannedRunner {
    async fn run_command(
        &self,
        command: &str,
        args: &[String],
    ) -> runwarden_scheduler::Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", command, args.join(" ")));
        self.outputs
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| SchedulerError::Transient("no canned output left".into()))
    }
}

fn bjobs(record: &str) -> String {
    format!(r#"{{"COMMAND":"bjobs","JOBS":1,"RECORDS":[{}]}}"#, record)
}

#[tokio::test(start_paused = true)]
async fn test_suspended_lsf_job_is_killed_and_resubmitted() {
    let dir = tempdir().unwrap();
    let suspended = bjobs(r#"{"STAT":"USUSP"}"#);
    let done = bjobs(r#"{"STAT":"DONE"}"#);
    let exit = bjobs(r#"{"EXIT_CODE":"","EXIT_REASON":""}"#);
    let runner = CannedRunner::new(&[
        "Job <11> is submitted to queue <normal>.",
        suspended.as_str(),
        "Job <11> is being terminated",
        "Job <12> is submitted to queue <normal>.",
        done.as_str(),
        exit.as_str(),
    ]);
    let adapter = build_adapter(SchedulerKind::Lsf, runner.clone());
    let (tx, rx) = mpsc::channel();

    let record = RetryController::new(
        adapter,
        settings(RetryConfig {
            attempts: 2,
            ..RetryConfig::default()
        }),
        spec(dir.path()),
        CancellationToken::new(),
    )
    .with_events(tx)
    .run()
    .await
    .unwrap();

    assert_eq!(record.attempt_number, 2);
    assert_eq!(record.scheduler_job_id, SchedulerJobId("12".into()));
    let calls = runner.calls();
    assert_eq!(calls[2], "bkill 11");
    assert!(calls[3].starts_with("bsub "));
    assert!(calls[3].contains("rusage[mem=16]"));

    let events: Vec<ControllerEvent> = rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(
        e,
        ControllerEvent::Finished {
            exit_code: -1,
            outcome: AttemptOutcome::Failed(FailureReason::Other),
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_lsf_exit_without_code_is_not_a_success() {
    let dir = tempdir().unwrap();
    let exited = bjobs(r#"{"STAT":"EXIT"}"#);
    let exit = bjobs(r#"{"EXIT_CODE":"","EXIT_REASON":""}"#);
    let runner = CannedRunner::new(&[
        "Job <11> is submitted to queue <normal>.",
        exited.as_str(),
        exit.as_str(),
    ]);
    let adapter = build_adapter(SchedulerKind::Lsf, runner.clone());

    let err = RetryController::new(
        adapter,
        settings(RetryConfig {
            attempts: 1,
            ..RetryConfig::default()
        }),
        spec(dir.path()),
        CancellationToken::new(),
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        ControllerError::Exhausted {
            attempts: 1,
            reason: FailureReason::Other,
            ..
        }
    ));
    assert!(!runner.calls().iter().any(|c| c.starts_with("bkill")));
}
