use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Supervises cluster batch jobs and workflow-engine runs.",
    long_about = "Submits workflows to a workflow engine and follows them to completion, and runs individual scheduler jobs with resource-escalating retries."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, action = clap::ArgAction::Count, global = true, help = "Increase verbosity level (-v for debug, -vv for trace)")]
    pub verbose: u8,

    #[arg(
        long,
        global = true,
        help = "Path to a config.toml overriding the default location"
    )]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Submit a workflow and wait for it to finish")]
    Run(RunArgs),

    #[command(about = "Follow a previously submitted workflow run")]
    Reattach(ReattachArgs),

    #[command(about = "Abort a workflow run")]
    Abort(AbortArgs),

    #[command(about = "Run one job script on the scheduler, retrying with more resources on failure")]
    RetryRun(RetryRunArgs),

    #[command(about = "Report whether a scheduler job is still alive")]
    CheckAlive(CheckAliveArgs),

    #[command(about = "Print the scheduler submission command for a job directory")]
    SubmitCommand(SubmitCommandArgs),
}

impl Commands {
    /// Commands whose stdout is read by a workflow engine rather than a person.
    pub fn is_machine_facing(&self) -> bool {
        matches!(self, Commands::CheckAlive(_) | Commands::SubmitCommand(_))
    }
}

#[derive(Args, Clone)]
pub struct ServerArgs {
    #[arg(
        long,
        help = "Workflow engine URL, e.g. localhost:8000 (defaults to [server] url in config.toml)"
    )]
    pub server_url: Option<String>,
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    #[arg(long, help = "Directory holding the lock and the cached run ids")]
    pub cache_dir: PathBuf,

    #[arg(long, help = "Workflow source file")]
    pub workflow: PathBuf,

    #[arg(long, help = "Workflow inputs JSON")]
    pub inputs: Option<PathBuf>,

    #[arg(long, help = "Workflow options JSON")]
    pub options: Option<PathBuf>,

    #[arg(long, help = "Zip of workflow imports")]
    pub imports: Option<PathBuf>,

    #[arg(
        long,
        help = "Reuse the cached run if the engine still reports it as active"
    )]
    pub try_reattach: bool,

    #[arg(long, help = "Execution root used to build the error digest on failure")]
    pub execution_root: Option<PathBuf>,
}

#[derive(Args)]
pub struct ReattachArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    #[arg(long, help = "Directory holding the cached run ids")]
    pub cache_dir: PathBuf,

    #[arg(long, help = "Run to follow (defaults to the latest cached run)")]
    pub run_id: Option<String>,

    #[arg(long, help = "Workflow options JSON, used to locate the workflow log")]
    pub options: Option<PathBuf>,

    #[arg(long, help = "Execution root used to build the error digest on failure")]
    pub execution_root: Option<PathBuf>,
}

#[derive(Args)]
pub struct AbortArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    #[arg(long, conflicts_with = "cache_dir", required_unless_present = "cache_dir")]
    pub run_id: Option<String>,

    #[arg(long, help = "Abort the latest run cached in this directory")]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct RetryRunArgs {
    #[arg(long, help = "Job working directory on the host")]
    pub cwd: PathBuf,

    #[arg(long, help = "Job working directory inside the container")]
    pub container_cwd: PathBuf,

    #[arg(long, help = "Container image")]
    pub image: String,

    #[arg(long)]
    pub job_name: String,

    #[arg(long, help = "Shell line to run before the container, e.g. 'module load singularity'")]
    pub env_setup: Option<String>,

    #[arg(long, help = "Memory per cpu in GB")]
    pub memory_gb: u64,

    #[arg(long, help = "Walltime as H:MM")]
    pub walltime: String,

    #[arg(long, default_value_t = 1)]
    pub cores: u32,

    #[arg(long, help = "Total submissions allowed (defaults to [retry] attempts)")]
    pub attempts: Option<u32>,

    #[arg(long)]
    pub multiplier: Option<u32>,

    #[arg(long = "bind-mount", help = "Extra container bind mount. Can be repeated.")]
    pub bind_mounts: Vec<String>,

    #[arg(long, help = "Extra raw arguments passed to the scheduler", allow_hyphen_values = true)]
    pub scheduler_args: Option<String>,

    #[arg(long)]
    pub kill_hung_jobs: bool,

    #[arg(long, help = "Ceiling on memory_gb * cores")]
    pub max_memory_gb: Option<u64>,

    #[arg(long, help = "Scheduler to submit to: 'lsf' or 'slurm'")]
    pub scheduler: Option<String>,
}

#[derive(Args)]
pub struct CheckAliveArgs {
    #[arg(long)]
    pub job_id: String,

    #[arg(long)]
    pub kill_hung_jobs: bool,

    #[arg(long, help = "Scheduler to query: 'lsf' or 'slurm'")]
    pub scheduler: Option<String>,
}

#[derive(Args)]
pub struct SubmitCommandArgs {
    #[arg(long, help = "Job working directory; an 'attempt-N' component selects the attempt")]
    pub cwd: PathBuf,

    #[arg(long)]
    pub container_cwd: PathBuf,

    #[arg(long)]
    pub image: String,

    #[arg(long)]
    pub job_name: String,

    #[arg(long)]
    pub memory_gb: u64,

    #[arg(long, help = "Walltime as H:MM")]
    pub walltime: String,

    #[arg(long, default_value_t = 1)]
    pub cores: u32,

    #[arg(long)]
    pub multiplier: Option<u32>,

    #[arg(long)]
    pub stdout: PathBuf,

    #[arg(long)]
    pub stderr: PathBuf,

    #[arg(long, default_value = "/bin/bash")]
    pub shell: String,

    #[arg(long, help = "Job script path inside the container")]
    pub script: PathBuf,

    #[arg(long)]
    pub max_memory_gb: Option<u64>,

    #[arg(long, default_value_t = 720)]
    pub max_walltime_hours: u64,

    #[arg(long = "bind-mount", help = "Extra container bind mount. Can be repeated.")]
    pub bind_mounts: Vec<String>,

    #[arg(long, allow_hyphen_values = true)]
    pub scheduler_args: Option<String>,

    #[arg(long)]
    pub scheduler: Option<String>,
}
