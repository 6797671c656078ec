use crate::error::{Result, SchedulerError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command as TokioCommand;

/// Runs a scheduler binary and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_command(&self, command: &str, args: &[String]) -> Result<String>;
}

pub struct HostCommandRunner {
    tools_dir: Option<PathBuf>,
}

impl HostCommandRunner {
    pub fn new(tools_dir: Option<PathBuf>) -> Self {
        Self { tools_dir }
    }

    /// Prefers the binary in `tools_dir`, falling back to `PATH` lookup.
    pub fn tool(&self, name: &str) -> PathBuf {
        if let Some(dir) = &self.tools_dir {
            let candidate = dir.join(name);
            if candidate.exists() {
                return candidate;
            }
        }
        PathBuf::from(name)
    }

    pub fn tools_dir(&self) -> Option<&Path> {
        self.tools_dir.as_deref()
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run_command(&self, command: &str, args: &[String]) -> Result<String> {
        let mut cmd = TokioCommand::new(self.tool(command));
        cmd.args(args);
        cmd.kill_on_drop(true);

        runwarden_core::logging::log_and_print_command(cmd.as_std());

        let output = cmd
            .output()
            .await
            .map_err(|source| SchedulerError::CommandFailed {
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(SchedulerError::CommandExited {
                command: command.to_string(),
                code: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
