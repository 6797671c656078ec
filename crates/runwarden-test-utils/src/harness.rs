use runwarden_core::config::{self, Config};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const FAKE_BSUB: &str = r#"#!/bin/bash
export PATH="/usr/bin:/bin:$PATH"
STATE="__STATE__"
echo "bsub $*" >> "$STATE/calls.log"
if [ -f "$STATE/bsub_fail" ]; then
  cat "$STATE/bsub_fail" >&2
  exit 255
fi
COUNT=$(cat "$STATE/submitted" 2>/dev/null || echo 0)
COUNT=$((COUNT + 1))
echo "$COUNT" > "$STATE/submitted"
echo "Job <$((4240 + COUNT))> is submitted to queue <normal>."
"#;

const FAKE_BJOBS: &str = r#"#!/bin/bash
export PATH="/usr/bin:/bin:$PATH"
STATE="__STATE__"
echo "bjobs $*" >> "$STATE/calls.log"
read_or() {
  if [ -f "$STATE/$1" ]; then cat "$STATE/$1"; else printf '%s' "$2"; fi
}
next_stat() {
  local f="$STATE/stat"
  if [ ! -f "$f" ]; then printf 'DONE'; return; fi
  local first
  first=$(head -n 1 "$f")
  if [ "$(wc -l < "$f")" -gt 1 ]; then
    tail -n +2 "$f" > "$f.tmp" && mv "$f.tmp" "$f"
  fi
  printf '%s' "$first"
}
case "$2" in
  STAT*) REC="\"STAT\":\"$(next_stat)\"" ;;
  EXIT_CODE*) REC="\"EXIT_CODE\":\"$(read_or exit_code '')\",\"EXIT_REASON\":\"$(read_or exit_reason '')\"" ;;
  AVG_MEM*) REC="\"AVG_MEM\":\"$(read_or avg_mem '')\",\"MAX_MEM\":\"$(read_or max_mem '')\"" ;;
  MEMLIMIT*) REC="\"MEMLIMIT\":\"$(read_or memlimit '')\",\"SLOTS\":\"$(read_or slots '')\"" ;;
  EXEC_CWD*) REC="\"EXEC_CWD\":\"$(read_or exec_cwd '')\"" ;;
  *) REC="\"ERROR\":\"unsupported fields $2\"" ;;
esac
printf '{"COMMAND":"bjobs","JOBS":1,"RECORDS":[{%s}]}\n' "$REC"
"#;

const FAKE_BKILL: &str = r#"#!/bin/bash
export PATH="/usr/bin:/bin:$PATH"
STATE="__STATE__"
echo "bkill $*" >> "$STATE/calls.log"
echo "Job <$1> is being terminated"
"#;

/// A throwaway home for one test: config, cache and work directories plus a
/// `bin/` of fake LSF tools whose answers are read from `state/`.
pub struct TestContext {
    pub _temp_dir: tempfile::TempDir,
    pub test_root: PathBuf,
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub work_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_server_url(None)
    }

    pub fn with_server_url(server_url: Option<&str>) -> Self {
        let temp_dir = tempfile::Builder::new()
            .prefix("runwarden-test-")
            .tempdir()
            .expect("Failed to create temp dir");
        let test_root = temp_dir.path().to_path_buf();

        let config_dir = test_root.join("config");
        let cache_dir = test_root.join("cache");
        let work_dir = test_root.join("work");
        let bin_dir = test_root.join("bin");
        let state_dir = test_root.join("state");
        for dir in [&config_dir, &cache_dir, &work_dir, &bin_dir, &state_dir] {
            fs::create_dir_all(dir).expect("Failed to create test dir");
        }

        let harness = Self {
            _temp_dir: temp_dir,
            test_root,
            config_dir,
            cache_dir,
            work_dir,
            bin_dir,
            state_dir,
        };
        harness.install_fake_tools();
        harness.write_config(server_url, "");
        harness
    }

    fn install_fake_tools(&self) {
        let state = self.state_dir.display().to_string();
        for (name, body) in [("bsub", FAKE_BSUB), ("bjobs", FAKE_BJOBS), ("bkill", FAKE_BKILL)] {
            let path = self.bin_dir.join(name);
            fs::write(&path, body.replace("__STATE__", &state)).expect("Failed to write fake tool");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .expect("Failed to chmod fake tool");
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("runwarden").join(config::CONFIG_FILE)
    }

    /// Writes a config with all sleeps set to zero. `extra` is appended verbatim.
    pub fn write_config(&self, server_url: Option<&str>, extra: &str) {
        let server = server_url
            .map(|url| format!("[server]\nurl = \"{}\"\n", url))
            .unwrap_or_default();
        let content = format!(
            r#"{server}
[scheduler]
kind = "lsf"
tools_dir = "{bin}"

[retry]
min_poll_secs = 0
max_poll_secs = 0
pending_poll_secs = 0
hang_check_interval_mins = 0

[poll]
interval_secs = 0
status_retry_secs = 0
backoff_base_secs = 0

{extra}
"#,
            server = server,
            bin = self.bin_dir.display(),
            extra = extra
        );
        let path = self.config_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create config subdir");
        }
        fs::write(&path, content).expect("Failed to write temp config");
    }

    pub fn config(&self) -> Config {
        config::load_config_from(&self.config_file()).expect("Failed to load test config")
    }

    /// Sets the answer a fake LSF tool gives for `key`, e.g. `stat` or `exit_code`.
    pub fn set_state(&self, key: &str, value: &str) {
        fs::write(self.state_dir.join(key), value).expect("Failed to write fake state");
    }

    /// Every fake tool invocation so far, one per line.
    pub fn calls(&self) -> String {
        fs::read_to_string(self.state_dir.join("calls.log")).unwrap_or_default()
    }

    /// Creates `<work>/<name>/execution/script` ending in the engine's rc move.
    pub fn job_dir(&self, name: &str) -> PathBuf {
        let dir = self.work_dir.join(name);
        let execution = dir.join("execution");
        fs::create_dir_all(&execution).expect("Failed to create execution dir");
        fs::write(
            execution.join("script"),
            "#!/bin/bash\necho running\nmv /container/execution/rc.tmp /container/execution/rc\n",
        )
        .expect("Failed to write job script");
        dir
    }

    /// Lays out `<root>/<workflow>/<run_id>/call-<step>/execution` with the
    /// given rc and stderr.
    pub fn execution_step(
        &self,
        root: &Path,
        workflow: &str,
        run_id: &str,
        step: &str,
        rc: Option<&str>,
        stderr: &str,
    ) -> PathBuf {
        let execution = root
            .join(workflow)
            .join(run_id)
            .join(format!("call-{}", step))
            .join("execution");
        fs::create_dir_all(&execution).expect("Failed to create step dir");
        if let Some(rc) = rc {
            fs::write(execution.join("rc"), rc).expect("Failed to write rc");
        }
        fs::write(execution.join("stderr"), stderr).expect("Failed to write stderr");
        execution
    }
}
