use crate::error::{Result, SchedulerError};
use runwarden_core::constants::{dirs, files};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Quotes `s` only when the shell would otherwise split or expand it.
pub fn shell_word(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c));
    if plain {
        s.to_string()
    } else {
        shell_quote(s)
    }
}

/// A `<runtime> exec` invocation of a job script inside an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInvocation {
    pub runtime: String,
    pub image: String,
    pub host_cwd: PathBuf,
    pub container_cwd: PathBuf,
    pub bind_mounts: Vec<String>,
    pub shell: String,
    pub script: PathBuf,
}

impl ContainerInvocation {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.runtime.clone(),
            "exec".to_string(),
            "--containall".to_string(),
            "--bind".to_string(),
            format!(
                "{}:{}",
                self.host_cwd.display(),
                self.container_cwd.display()
            ),
        ];
        for mount in &self.bind_mounts {
            args.push("--bind".to_string());
            args.push(mount.clone());
        }
        args.push(self.image.clone());
        args.push(self.shell.clone());
        args.push(self.script.display().to_string());
        args
    }

    pub fn to_shell_line(&self) -> String {
        self.args()
            .iter()
            .map(|a| shell_word(a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Copies the engine-generated `execution/script` to
/// `execution/updated_script` without its trailing `mv rc.tmp rc` line.
/// Returns the script's path as seen from inside the container.
pub fn prepare_job_script(host_cwd: &Path, container_cwd: &Path) -> Result<PathBuf> {
    let execution = host_cwd.join(dirs::EXECUTION);
    let source = execution.join(files::JOB_SCRIPT);
    let content = fs_err::read_to_string(&source)?;

    let mut lines: Vec<&str> = content.lines().collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    let last = lines.pop().ok_or_else(|| {
        SchedulerError::InvalidScript(format!("'{}' is empty", source.display()))
    })?;
    let last = last.trim();
    if !(last.starts_with("mv") && last.ends_with(files::RC)) {
        return Err(SchedulerError::InvalidScript(format!(
            "'{}' does not end with the rc move, found '{}'",
            source.display(),
            last
        )));
    }

    let mut updated = lines.join("\n");
    updated.push('\n');
    fs_err::write(execution.join(files::UPDATED_JOB_SCRIPT), updated)?;

    Ok(container_cwd
        .join(dirs::EXECUTION)
        .join(files::UPDATED_JOB_SCRIPT))
}

/// Writes the executable `execution/run_script.sh` that the scheduler runs.
pub fn write_run_script(
    host_cwd: &Path,
    env_setup: Option<&str>,
    invocation: &ContainerInvocation,
) -> Result<PathBuf> {
    let path = host_cwd.join(dirs::EXECUTION).join(files::RUN_SCRIPT);
    let mut content = String::from("#!/bin/bash\n");
    if let Some(setup) = env_setup.filter(|s| !s.trim().is_empty()) {
        content.push_str(setup.trim_end());
        content.push('\n');
    }
    content.push_str(&invocation.to_shell_line());
    content.push('\n');

    fs_err::write(&path, content)?;
    fs_err::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    tracing::info!("Wrote runner script to {}", path.display());
    Ok(path)
}
