use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] runwarden_core::errors::ConfigError),

    #[error(transparent)]
    Domain(#[from] runwarden_core::errors::DomainError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to execute command '{command}': {source}")]
    CommandFailed {
        command: String,
        source: std::io::Error,
    },

    #[error("Command '{command}' exited with {code}.\n--- STDERR ---\n{stderr}")]
    CommandExited {
        command: String,
        code: String,
        stderr: String,
    },

    #[error("Job submission failed: {0}")]
    Submission(String),

    #[error("Scheduler query failed: {0}")]
    Transient(String),

    #[error("Prepared job script is invalid: {0}")]
    InvalidScript(String),
}

impl SchedulerError {
    /// Whether a later retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedulerError::Transient(_) | SchedulerError::CommandExited { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
