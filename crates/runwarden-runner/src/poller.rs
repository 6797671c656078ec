use crate::engine::{EngineError, WorkflowEngine};
use runwarden_core::config::PollConfig;
use runwarden_core::model::{RunHandle, RunStatus};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum PollError {
    #[error("Polling was cancelled")]
    Cancelled,

    #[error("Gave up polling after {interruptions} interruption(s): {source}")]
    GaveUp {
        interruptions: u32,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub status_retries: u32,
    pub status_retry_wait: Duration,
    pub backoff_base: Duration,
    pub max_interruptions: u32,
    pub max_backoff_total: Duration,
}

impl From<&PollConfig> for PollSettings {
    fn from(config: &PollConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            status_retries: config.status_retries,
            status_retry_wait: Duration::from_secs(config.status_retry_secs),
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            max_interruptions: config.max_interruptions,
            max_backoff_total: Duration::from_secs(config.max_backoff_total_secs),
        }
    }
}

/// Receives lines tailed from a workflow log.
pub trait LineSink: Send + Sync {
    fn line(&self, line: &str);
}

pub struct TracingSink;

impl LineSink for TracingSink {
    fn line(&self, line: &str) {
        tracing::info!("{}", line);
    }
}

/// Echoes lines to stdout and records them in the session log.
pub struct StdoutSink;

impl LineSink for StdoutSink {
    fn line(&self, line: &str) {
        println!("{}", line);
        tracing::debug!("workflow log: {}", line);
    }
}

/// Collects lines in memory.
#[derive(Clone, Default)]
pub struct SharedSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl SharedSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

impl LineSink for SharedSink {
    fn line(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// Follows a growing file, emitting only lines written after it was opened.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    offset: u64,
    partial: String,
}

impl LogTailer {
    /// Starts at the current end of `path`, or at zero if it does not exist yet.
    pub fn new(path: &Path) -> Self {
        let offset = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        Self {
            path: path.to_path_buf(),
            offset,
            partial: String::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Emits every complete line appended since the last call.
    pub fn poll(&mut self, sink: &dyn LineSink) -> std::io::Result<usize> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        if len < self.offset {
            tracing::debug!("'{}' was truncated, rewinding", self.path.display());
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(0);
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        let read = file.read_to_end(&mut buf)?;
        self.offset += read as u64;
        self.partial.push_str(&String::from_utf8_lossy(&buf));

        let mut emitted = 0;
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            sink.line(line.trim_end());
            emitted += 1;
        }
        Ok(emitted)
    }
}

/// Exponential delays between recoveries from poll interruptions.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    max_total: Duration,
    attempt: u32,
    waited: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32, max_total: Duration) -> Self {
        Self {
            base,
            max_attempts,
            max_total,
            attempt: 0,
            waited: Duration::ZERO,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// `base * 2^n` plus up to a second of jitter, or `None` once the
    /// attempt or total-wait budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt + 1 >= self.max_attempts {
            return None;
        }
        let remaining = self.max_total.saturating_sub(self.waited);
        if remaining.is_zero() {
            return None;
        }
        let exp = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        let jitter = Duration::from_secs_f64(rand::random_range(0.0..1.0));
        let delay = (exp + jitter).min(remaining);

        self.attempt += 1;
        self.waited += delay;
        Some(delay)
    }
}

pub struct WorkflowPoller {
    engine: Arc<dyn WorkflowEngine>,
    settings: PollSettings,
    sink: Arc<dyn LineSink>,
    cancel: CancellationToken,
}

impl WorkflowPoller {
    pub fn new(
        engine: Arc<dyn WorkflowEngine>,
        settings: PollSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            settings,
            sink: Arc::new(TracingSink),
            cancel,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn LineSink>) -> Self {
        self.sink = sink;
        self
    }

    async fn sleep(&self, duration: Duration) -> Result<(), PollError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PollError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Queries the engine, re-asking after a pause while the answer is
    /// unusable.
    pub async fn query_status(&self, run_id: &str) -> Result<RunStatus, PollError> {
        let mut retries = 0;
        loop {
            match self.engine.status(run_id).await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_retryable() && retries < self.settings.status_retries => {
                    retries += 1;
                    tracing::warn!(
                        "Status query for {} failed ({}/{}): {}",
                        run_id,
                        retries,
                        self.settings.status_retries,
                        e
                    );
                    self.sleep(self.settings.status_retry_wait).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Blocks until the run leaves the submitted/running states and returns
    /// its final status.
    pub async fn wait(
        &self,
        handle: &mut RunHandle,
        log_file: Option<&Path>,
    ) -> Result<RunStatus, PollError> {
        let mut tailer = log_file.map(LogTailer::new);
        if let Some(t) = &tailer {
            tracing::info!("Following workflow log {}", t.path().display());
        }
        let mut backoff = Backoff::new(
            self.settings.backoff_base,
            self.settings.max_interruptions,
            self.settings.max_backoff_total,
        );

        loop {
            match self.poll_until_settled(handle, tailer.as_mut()).await {
                Ok(status) => return Ok(status),
                Err(PollError::Engine(e)) if e.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::info!(
                            "Polling interrupted ({}), retrying after {:.1} seconds",
                            e,
                            delay.as_secs_f64()
                        );
                        self.sleep(delay).await?;
                    }
                    None => {
                        return Err(PollError::GaveUp {
                            interruptions: backoff.attempts() + 1,
                            source: e,
                        })
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn poll_until_settled(
        &self,
        handle: &mut RunHandle,
        mut tailer: Option<&mut LogTailer>,
    ) -> Result<RunStatus, PollError> {
        loop {
            self.sleep(self.settings.interval).await?;

            if let Some(t) = tailer.as_deref_mut() {
                if let Err(e) = t.poll(self.sink.as_ref()) {
                    tracing::warn!("Could not read '{}': {}", t.path().display(), e);
                }
            }

            let reported = self.query_status(&handle.run_id).await?;
            match handle.advance(reported) {
                Ok(true) => tracing::info!("Run {} is {}", handle.run_id, reported),
                Ok(false) => {}
                Err(e) => tracing::warn!("Ignoring status report for {}: {}", handle.run_id, e),
            }

            if handle.status().is_terminal() {
                if let Some(t) = tailer.as_deref_mut() {
                    let _ = t.poll(self.sink.as_ref());
                }
                return Ok(handle.status());
            }
        }
    }
}
