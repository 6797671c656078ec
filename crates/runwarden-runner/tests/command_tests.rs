use runwarden_core::config::SchedulerKind;
use runwarden_core::errors::DomainError;
use runwarden_core::hang::{HangDetector, MemorySample, MemoryTelemetry};
use runwarden_core::lock::ExecutionLock;
use runwarden_core::model::{FailureReason, RunStatus, SchedulerJobId};
use runwarden_core::rc::read_rc;
use runwarden_core::run_cache::RunDataCache;
use runwarden_runner::cli::{
    AbortArgs, ReattachArgs, RetryRunArgs, RunArgs, ServerArgs, SubmitCommandArgs,
};
use runwarden_runner::commands::abort::abort;
use runwarden_runner::commands::check_alive::{check_alive, Liveness};
use runwarden_runner::commands::reattach::reattach;
use runwarden_runner::commands::retry_run::retry_run;
use runwarden_runner::commands::run::run_workflow;
use runwarden_runner::commands::submit_command::{attempt_from_path, render_submit_command};
use runwarden_runner::commands::AppContext;
use runwarden_runner::controller::ControllerError;
use runwarden_runner::error::CliError;
use runwarden_runner::poller::SharedSink;
use runwarden_scheduler::{build_adapter, HostCommandRunner, JobState};
use runwarden_test_utils::{FakeScheduler, FakeWorkflowEngine, ScriptedJob, TestContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn app_context(ctx: &TestContext) -> AppContext {
    AppContext::new(ctx.config(), CancellationToken::new())
        .with_sink(Arc::new(SharedSink::default()))
}

fn run_args(ctx: &TestContext) -> RunArgs {
    let workflow = ctx.work_dir.join("main.wdl");
    std::fs::write(&workflow, "workflow main {}\n").unwrap();
    RunArgs {
        server: ServerArgs { server_url: None },
        cache_dir: ctx.cache_dir.join("pipeline"),
        workflow,
        inputs: None,
        options: None,
        imports: None,
        try_reattach: false,
        execution_root: None,
    }
}

fn retry_args(cwd: &Path) -> RetryRunArgs {
    RetryRunArgs {
        cwd: cwd.to_path_buf(),
        container_cwd: PathBuf::from("/cromwell_root"),
        image: "/images/tool.sif".into(),
        job_name: "align".into(),
        env_setup: Some("module load singularity".into()),
        memory_gb: 8,
        walltime: "4:00".into(),
        cores: 2,
        attempts: None,
        multiplier: None,
        bind_mounts: vec!["/refs".into()],
        scheduler_args: None,
        kill_hung_jobs: false,
        max_memory_gb: None,
        scheduler: None,
    }
}

fn submit_args(cwd: &str) -> SubmitCommandArgs {
    SubmitCommandArgs {
        cwd: PathBuf::from(cwd),
        container_cwd: PathBuf::from("/cromwell_root"),
        image: "/images/tool.sif".into(),
        job_name: "align".into(),
        memory_gb: 8,
        walltime: "4:00".into(),
        cores: 2,
        multiplier: None,
        stdout: PathBuf::from("/data/out"),
        stderr: PathBuf::from("/data/err"),
        shell: "/bin/bash".into(),
        script: PathBuf::from("/cromwell_root/execution/script"),
        max_memory_gb: None,
        max_walltime_hours: 720,
        bind_mounts: vec![],
        scheduler_args: None,
        scheduler: None,
    }
}

#[tokio::test]
async fn test_run_records_run_and_releases_lock() {
    let ctx = TestContext::new();
    let context = app_context(&ctx);
    let args = run_args(&ctx);
    let engine = Arc::new(FakeWorkflowEngine::new(
        "run-42",
        vec![RunStatus::Running, RunStatus::Succeeded],
    ));

    let status = run_workflow(engine.clone(), &args, &context).await.unwrap();

    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(engine.submissions().len(), 1);
    assert_eq!(
        RunDataCache::latest(&args.cache_dir).unwrap(),
        Some("run-42".to_string())
    );
    assert!(!ExecutionLock::is_locked(&args.cache_dir));
}

#[tokio::test]
async fn test_run_refuses_locked_cache_dir() {
    let ctx = TestContext::new();
    let context = app_context(&ctx);
    let args = run_args(&ctx);
    std::fs::create_dir_all(&args.cache_dir).unwrap();
    let _held = ExecutionLock::acquire(&args.cache_dir).unwrap();
    let engine = Arc::new(FakeWorkflowEngine::new("run-42", vec![]));

    let err = run_workflow(engine.clone(), &args, &context)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CliError::Domain(DomainError::AlreadyLocked(_))
    ));
    assert!(engine.submissions().is_empty());
}

#[tokio::test]
async fn test_failed_run_carries_error_digest_and_releases_lock() {
    let ctx = TestContext::new();
    let context = app_context(&ctx);
    let root = ctx.work_dir.join("executions");
    ctx.execution_step(&root, "main", "run-42", "align", Some("1"), "fatal: bad input\n");
    ctx.execution_step(&root, "main", "run-42", "index", Some("0"), "all good\n");
    let mut args = run_args(&ctx);
    args.execution_root = Some(root);
    let engine = Arc::new(FakeWorkflowEngine::new("run-42", vec![RunStatus::Failed]));

    let err = run_workflow(engine, &args, &context).await.unwrap_err();

    match err {
        CliError::RunFailed {
            run_id,
            status,
            digest,
        } => {
            assert_eq!(run_id, "run-42");
            assert_eq!(status, RunStatus::Failed);
            let text = digest.to_string();
            assert!(text.contains("call-align"));
            assert!(text.contains("fatal: bad input"));
            assert!(!text.contains("call-index"));
        }
        other => panic!("expected RunFailed, got {:?}", other),
    }
    assert!(!ExecutionLock::is_locked(&args.cache_dir));
}

#[tokio::test]
async fn test_try_reattach_follows_active_cached_run() {
    let ctx = TestContext::new();
    let context = app_context(&ctx);
    let mut args = run_args(&ctx);
    args.try_reattach = true;
    std::fs::create_dir_all(&args.cache_dir).unwrap();
    RunDataCache::record(&args.cache_dir, "run-old").unwrap();
    let engine = Arc::new(FakeWorkflowEngine::new(
        "run-new",
        vec![RunStatus::Running, RunStatus::Succeeded],
    ));

    run_workflow(engine.clone(), &args, &context).await.unwrap();

    assert!(engine.submissions().is_empty());
    assert!(engine.queried().iter().all(|id| id == "run-old"));
}

#[tokio::test]
async fn test_try_reattach_submits_when_cached_run_is_over() {
    let ctx = TestContext::new();
    let context = app_context(&ctx);
    let mut args = run_args(&ctx);
    args.try_reattach = true;
    std::fs::create_dir_all(&args.cache_dir).unwrap();
    RunDataCache::record(&args.cache_dir, "run-old").unwrap();
    let engine = Arc::new(FakeWorkflowEngine::new(
        "run-new",
        vec![RunStatus::Failed, RunStatus::Running, RunStatus::Succeeded],
    ));

    run_workflow(engine.clone(), &args, &context).await.unwrap();

    assert_eq!(engine.submissions().len(), 1);
    assert_eq!(
        RunDataCache::latest(&args.cache_dir).unwrap(),
        Some("run-new".to_string())
    );
}

#[tokio::test]
async fn test_reattach_without_cached_run_fails() {
    let ctx = TestContext::new();
    let context = app_context(&ctx);
    let args = ReattachArgs {
        server: ServerArgs { server_url: None },
        cache_dir: ctx.cache_dir.join("empty"),
        run_id: None,
        options: None,
        execution_root: None,
    };
    let engine = Arc::new(FakeWorkflowEngine::new("unused", vec![]));

    let err = reattach(engine, &args, &context).await.unwrap_err();
    assert!(matches!(
        err,
        CliError::Domain(DomainError::RunIdNotCached(_))
    ));
}

#[tokio::test]
async fn test_reattach_follows_latest_cached_run() {
    let ctx = TestContext::new();
    let context = app_context(&ctx);
    let cache_dir = ctx.cache_dir.join("pipeline");
    std::fs::create_dir_all(&cache_dir).unwrap();
    RunDataCache::record(&cache_dir, "run-1").unwrap();
    RunDataCache::record(&cache_dir, "run-2").unwrap();
    let args = ReattachArgs {
        server: ServerArgs { server_url: None },
        cache_dir,
        run_id: None,
        options: None,
        execution_root: None,
    };
    let engine = Arc::new(FakeWorkflowEngine::new("unused", vec![RunStatus::Succeeded]));

    let status = reattach(engine.clone(), &args, &context).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(engine.queried(), vec!["run-2".to_string()]);
}

#[tokio::test]
async fn test_abort_by_cache_dir_uses_latest_run() {
    let ctx = TestContext::new();
    let cache_dir = ctx.cache_dir.join("pipeline");
    std::fs::create_dir_all(&cache_dir).unwrap();
    RunDataCache::record(&cache_dir, "run-9").unwrap();
    let engine = FakeWorkflowEngine::new("unused", vec![]);
    let args = AbortArgs {
        server: ServerArgs { server_url: None },
        run_id: None,
        cache_dir: Some(cache_dir),
    };

    let aborted = abort(&engine, &args).await.unwrap();
    assert_eq!(aborted, "run-9");
    assert_eq!(engine.aborted(), vec!["run-9".to_string()]);
}

#[tokio::test]
async fn test_abort_rejects_both_selectors() {
    let engine = FakeWorkflowEngine::new("unused", vec![]);
    let args = AbortArgs {
        server: ServerArgs { server_url: None },
        run_id: Some("run-1".into()),
        cache_dir: Some(PathBuf::from("/tmp/cache")),
    };

    assert!(abort(&engine, &args).await.is_err());
    assert!(engine.aborted().is_empty());
}

#[tokio::test]
async fn test_retry_run_publishes_rc_on_success() {
    let ctx = TestContext::new();
    let context = app_context(&ctx);
    let cwd = ctx.job_dir("call-align");
    let execution = cwd.join("execution");
    std::fs::write(execution.join("rc.tmp"), "0\n").unwrap();
    let scheduler = Arc::new(FakeScheduler::new(vec![ScriptedJob::succeeding()]));

    let record = retry_run(scheduler.clone(), &retry_args(&cwd), &context)
        .await
        .unwrap();

    assert_eq!(record.attempt_number, 1);
    assert_eq!(read_rc(&execution).unwrap(), Some("0".to_string()));
    assert!(!execution.join("rc.tmp").exists());

    let updated = std::fs::read_to_string(execution.join("updated_script")).unwrap();
    assert!(!updated.contains("rc.tmp"));
    let run_script = std::fs::read_to_string(execution.join("run_script.sh")).unwrap();
    assert!(run_script.starts_with("#!/bin/bash\nmodule load singularity\n"));
    assert!(run_script.contains("--bind /refs"));
    assert!(run_script.contains("/cromwell_root/execution/updated_script"));
    assert_eq!(scheduler.submissions()[0].script, execution.join("run_script.sh"));
}

#[tokio::test]
async fn test_retry_run_writes_failed_rc_when_exhausted() {
    let ctx = TestContext::new();
    let context = app_context(&ctx);
    let cwd = ctx.job_dir("call-align");
    let scheduler = Arc::new(FakeScheduler::new(vec![
        ScriptedJob::failing(FailureReason::WalltimeExceeded),
        ScriptedJob::failing(FailureReason::WalltimeExceeded),
    ]));
    let mut args = retry_args(&cwd);
    args.attempts = Some(2);

    let err = retry_run(scheduler.clone(), &args, &context)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CliError::Controller(ControllerError::Exhausted { attempts: 2, .. })
    ));
    assert_eq!(scheduler.submission_count(), 2);
    assert_eq!(
        read_rc(&cwd.join("execution")).unwrap(),
        Some("-1".to_string())
    );
}

#[tokio::test]
async fn test_retry_run_requires_execution_dir() {
    let ctx = TestContext::new();
    let context = app_context(&ctx);
    let scheduler = Arc::new(FakeScheduler::new(vec![]));

    let result = retry_run(scheduler.clone(), &retry_args(&ctx.work_dir.join("nope")), &context).await;
    assert!(result.is_err());
    assert_eq!(scheduler.submission_count(), 0);
}

fn scheduler_with_execution_dir(ctx: &TestContext) -> (FakeScheduler, PathBuf) {
    let cwd = ctx.job_dir("call-align");
    (
        FakeScheduler::new(vec![]).with_working_dir(cwd.clone()),
        cwd.join("execution"),
    )
}

#[tokio::test]
async fn test_check_alive_reports_running_job() {
    let ctx = TestContext::new();
    let (scheduler, execution) = scheduler_with_execution_dir(&ctx);
    scheduler.adopt("7", ScriptedJob::succeeding().with_states(vec![JobState::Running]));

    let liveness = check_alive(
        &scheduler,
        &SchedulerJobId("7".into()),
        false,
        HangDetector::default(),
    )
    .await
    .unwrap();

    assert_eq!(liveness, Liveness::Alive("RUNNING".to_string()));
    assert_eq!(read_rc(&execution).unwrap(), None);
}

#[tokio::test]
async fn test_check_alive_writes_failed_rc_for_abnormal_exit() {
    let ctx = TestContext::new();
    let (scheduler, execution) = scheduler_with_execution_dir(&ctx);
    scheduler.adopt(
        "8",
        ScriptedJob::failing(FailureReason::MemoryLimitExceeded)
            .with_states(vec![JobState::Finished]),
    );

    let liveness = check_alive(
        &scheduler,
        &SchedulerJobId("8".into()),
        false,
        HangDetector::default(),
    )
    .await
    .unwrap();

    assert_eq!(liveness, Liveness::Failed);
    assert_eq!(read_rc(&execution).unwrap(), Some("-1".to_string()));
}

#[tokio::test]
async fn test_check_alive_kills_hung_job() {
    let ctx = TestContext::new();
    let (scheduler, execution) = scheduler_with_execution_dir(&ctx);
    let scheduler = scheduler.with_requested_memory(32.0);
    scheduler.adopt(
        "9",
        ScriptedJob::succeeding()
            .with_states(vec![JobState::Running])
            .with_memory(MemoryTelemetry::Sampled(MemorySample {
                max_gb: 32.0,
                avg_gb: 31.5,
            })),
    );

    let liveness = check_alive(
        &scheduler,
        &SchedulerJobId("9".into()),
        true,
        HangDetector::default(),
    )
    .await
    .unwrap();

    assert_eq!(liveness, Liveness::KilledHung);
    assert_eq!(scheduler.kills(), vec![SchedulerJobId("9".into())]);
    assert_eq!(read_rc(&execution).unwrap(), Some("-1".to_string()));
}

#[test]
fn test_attempt_number_from_engine_path() {
    assert_eq!(attempt_from_path(Path::new("/data/run/call-a")).unwrap(), 1);
    assert_eq!(
        attempt_from_path(Path::new("/data/run/call-a/attempt-3")).unwrap(),
        3
    );
    assert!(attempt_from_path(Path::new("/data/attempt-2/call-a/attempt-3")).is_err());
    assert!(attempt_from_path(Path::new("/data/run/call-a/attempt-x")).is_err());
}

#[test]
fn test_submit_command_escalates_for_later_attempts() {
    let ctx = TestContext::new();
    let context = app_context(&ctx);
    let adapter = build_adapter(SchedulerKind::Lsf, Arc::new(HostCommandRunner::new(None)));

    let first = render_submit_command(adapter.as_ref(), &submit_args("/data/run/call-a"), &context)
        .unwrap();
    assert!(first.starts_with("bsub -n 2 -W 4:00 -R 'rusage[mem=8]span[ptile=2]' -J align"));

    let second = render_submit_command(
        adapter.as_ref(),
        &submit_args("/data/run/call-a/attempt-2"),
        &context,
    )
    .unwrap();
    assert!(second.contains("-W 8:00 -R 'rusage[mem=16]span[ptile=2]'"));
    assert!(second.contains(
        "--wrap 'singularity exec --containall --bind /data/run/call-a/attempt-2:/cromwell_root \
         /images/tool.sif /bin/bash /cromwell_root/execution/script'"
    ));
}

#[test]
fn test_submit_command_clamps_memory_to_ceiling() {
    let ctx = TestContext::new();
    let context = app_context(&ctx);
    let adapter = build_adapter(SchedulerKind::Lsf, Arc::new(HostCommandRunner::new(None)));
    let mut args = submit_args("/data/run/call-a");
    args.memory_gb = 300;
    args.max_memory_gb = Some(400);

    let rendered = render_submit_command(adapter.as_ref(), &args, &context).unwrap();
    assert!(rendered.contains("rusage[mem=200]"));
}
