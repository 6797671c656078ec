use runwarden_core::digest::ErrorDigest;
use runwarden_core::model::RunStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] runwarden_core::errors::ConfigError),

    #[error(transparent)]
    Domain(#[from] runwarden_core::errors::DomainError),

    #[error(transparent)]
    Scheduler(#[from] runwarden_scheduler::SchedulerError),

    #[error(transparent)]
    Controller(#[from] crate::controller::ControllerError),

    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),

    #[error(transparent)]
    Poll(#[from] crate::poller::PollError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("No workflow engine URL given. Pass --server-url or set [server] url in config.toml.")]
    MissingServerUrl,

    #[error("Run {run_id} finished as {status}\n{digest}")]
    RunFailed {
        run_id: String,
        status: RunStatus,
        digest: ErrorDigest,
    },
}
