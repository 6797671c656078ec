use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Error walking directory: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Invalid configuration: {0}")]
    General(String),

    #[error("Could not determine HOME directory.")]
    HomeDirectoryNotFound,
}

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Working directory '{}' is already locked by another runwarden process. Remove it to override.", .0.display())]
    AlreadyLocked(PathBuf),

    #[error("Failed to create lock marker '{}': {source}", .path.display())]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid walltime '{0}'. Expected 'H:MM'.")]
    InvalidWalltime(String),

    #[error("Invalid resource envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Invalid run status '{0}'. Valid values are: submitted, running, succeeded, failed, aborted")]
    InvalidRunStatus(String),

    #[error("Run status cannot move from '{from}' to '{to}'.")]
    StatusRegression {
        from: crate::model::RunStatus,
        to: crate::model::RunStatus,
    },

    #[error("No run id cached in '{}'. Pass --run-id explicitly.", .0.display())]
    RunIdNotCached(PathBuf),

    #[error("Run '{run_id}' not found under execution root '{}'.", .root.display())]
    RunDirNotFound { run_id: String, root: PathBuf },
}
