use async_trait::async_trait;
use runwarden_core::model::{RunHandle, RunStatus};
use runwarden_runner::engine::{EngineError, WorkflowEngine, WorkflowSubmission};
use runwarden_runner::poller::{PollError, PollSettings, SharedSink, WorkflowPoller};
use runwarden_test_utils::{EngineReply, FakeWorkflowEngine};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn settings() -> PollSettings {
    PollSettings {
        interval: Duration::from_secs(30),
        status_retries: 4,
        status_retry_wait: Duration::from_secs(20),
        backoff_base: Duration::from_secs(10),
        max_interruptions: 5,
        max_backoff_total: Duration::from_secs(600),
    }
}

fn handle() -> RunHandle {
    RunHandle::submitted("run-1".into(), PathBuf::from("/tmp"))
}

#[tokio::test(start_paused = true)]
async fn test_wait_returns_terminal_status() {
    let engine = Arc::new(FakeWorkflowEngine::new(
        "run-1",
        vec![RunStatus::Submitted, RunStatus::Running, RunStatus::Failed],
    ));
    let poller = WorkflowPoller::new(engine.clone(), settings(), CancellationToken::new());
    let mut handle = handle();

    let status = poller.wait(&mut handle, None).await.unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(handle.status(), RunStatus::Failed);
    assert_eq!(engine.queried().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_answers_are_retried() {
    let engine = Arc::new(FakeWorkflowEngine::scripted(
        "run-1",
        vec![
            EngineReply::Malformed,
            EngineReply::Malformed,
            EngineReply::Status(RunStatus::Running),
            EngineReply::Status(RunStatus::Succeeded),
        ],
    ));
    let poller = WorkflowPoller::new(engine.clone(), settings(), CancellationToken::new());

    let status = poller.wait(&mut handle(), None).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(engine.queried().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_engine_restart_does_not_stop_monitoring() {
    let engine = Arc::new(FakeWorkflowEngine::scripted(
        "run-1",
        vec![
            EngineReply::Status(RunStatus::Running),
            EngineReply::Rejected(503),
            EngineReply::Status(RunStatus::Running),
            EngineReply::Status(RunStatus::Succeeded),
        ],
    ));
    let poller = WorkflowPoller::new(engine.clone(), settings(), CancellationToken::new());

    let status = poller.wait(&mut handle(), None).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(engine.queried().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_client_rejection_is_fatal() {
    let engine = Arc::new(FakeWorkflowEngine::scripted(
        "run-1",
        vec![
            EngineReply::Status(RunStatus::Running),
            EngineReply::Rejected(404),
        ],
    ));
    let poller = WorkflowPoller::new(engine.clone(), settings(), CancellationToken::new());

    let err = poller.wait(&mut handle(), None).await.unwrap_err();
    assert!(matches!(
        err,
        PollError::Engine(EngineError::Rejected { status: 404, .. })
    ));
    assert_eq!(engine.queried().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_status_regression_is_ignored() {
    let engine = Arc::new(FakeWorkflowEngine::new(
        "run-1",
        vec![
            RunStatus::Running,
            RunStatus::Submitted,
            RunStatus::Running,
            RunStatus::Succeeded,
        ],
    ));
    let poller = WorkflowPoller::new(engine, settings(), CancellationToken::new());
    let mut handle = handle();

    let status = poller.wait(&mut handle, None).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_bounded_interruptions() {
    let engine = Arc::new(FakeWorkflowEngine::scripted(
        "run-1",
        vec![EngineReply::Malformed],
    ));
    let poller = WorkflowPoller::new(engine.clone(), settings(), CancellationToken::new());

    let err = poller.wait(&mut handle(), None).await.unwrap_err();
    match err {
        PollError::GaveUp { interruptions, .. } => assert_eq!(interruptions, 5),
        other => panic!("expected GaveUp, got {:?}", other),
    }
    // Five rounds of one query plus four status retries.
    assert_eq!(engine.queried().len(), 25);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_polling() {
    let engine = Arc::new(FakeWorkflowEngine::new("run-1", vec![RunStatus::Running]));
    let cancel = CancellationToken::new();
    let poller = WorkflowPoller::new(engine.clone(), settings(), cancel.clone());
    cancel.cancel();

    let err = poller.wait(&mut handle(), None).await.unwrap_err();
    assert!(matches!(err, PollError::Cancelled));
    assert!(engine.queried().is_empty());
}

/// Appends one line to the workflow log every time the status is queried.
struct ChattyEngine {
    log: PathBuf,
    statuses: Mutex<Vec<RunStatus>>,
}

#[async_trait]
impl WorkflowEngine for ChattyEngine {
    async fn submit(&self, _submission: &WorkflowSubmission) -> Result<String, EngineError> {
        Ok("run-1".into())
    }

    async fn status(&self, _run_id: &str) -> Result<RunStatus, EngineError> {
        let mut statuses = self.statuses.lock().unwrap();
        let status = if statuses.len() > 1 {
            statuses.remove(0)
        } else {
            statuses[0]
        };
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.log)
            .unwrap();
        writeln!(file, "status is {}", status).unwrap();
        Ok(status)
    }

    async fn abort(&self, _run_id: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_workflow_log_lines_reach_the_sink() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("workflow.run-1.log");
    std::fs::write(&log, "old line from an earlier session\n").unwrap();

    let engine = Arc::new(ChattyEngine {
        log: log.clone(),
        statuses: Mutex::new(vec![RunStatus::Running, RunStatus::Succeeded]),
    });
    let sink = SharedSink::default();
    let poller = WorkflowPoller::new(engine, settings(), CancellationToken::new())
        .with_sink(Arc::new(sink.clone()));

    poller.wait(&mut handle(), Some(&log)).await.unwrap();

    assert_eq!(
        sink.lines(),
        vec!["status is running".to_string(), "status is succeeded".to_string()]
    );
}
