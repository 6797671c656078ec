pub mod adapter;
pub mod container;
pub mod error;
pub mod lsf;
pub mod runner;
pub mod slurm;

pub use adapter::{
    build_adapter, parse_memory_gb, JobExit, JobState, JobStatus, SchedulerAdapter, SubmitRequest,
};
pub use container::{shell_quote, shell_word, ContainerInvocation};
pub use error::{Result, SchedulerError};
pub use runner::{CommandRunner, HostCommandRunner};
