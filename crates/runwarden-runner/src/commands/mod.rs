use crate::cli::ServerArgs;
use crate::error::CliError;
use crate::poller::{LineSink, StdoutSink};
use runwarden_core::config::{Config, SchedulerKind};
use runwarden_scheduler::{build_adapter, HostCommandRunner, SchedulerAdapter};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Runtime as TokioRuntime;
use tokio_util::sync::CancellationToken;

pub mod abort;
pub mod check_alive;
pub mod reattach;
pub mod retry_run;
pub mod run;
pub mod submit_command;

pub struct AppContext {
    pub config: Config,
    pub cancel: CancellationToken,
    /// Where tailed workflow log lines go.
    pub sink: Arc<dyn LineSink>,
}

impl AppContext {
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        Self {
            config,
            cancel,
            sink: Arc::new(StdoutSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn LineSink>) -> Self {
        self.sink = sink;
        self
    }

    pub(crate) fn server_url(&self, args: &ServerArgs) -> Result<String, CliError> {
        args.server_url
            .clone()
            .or_else(|| self.config.server.url.clone())
            .ok_or(CliError::MissingServerUrl)
    }

    pub(crate) fn scheduler_kind(&self, flag: Option<&str>) -> Result<SchedulerKind, CliError> {
        match flag {
            Some(name) => Ok(name.parse::<SchedulerKind>()?),
            None => Ok(self.config.scheduler.kind),
        }
    }

    pub(crate) fn scheduler(&self, kind: SchedulerKind) -> Arc<dyn SchedulerAdapter> {
        let runner = Arc::new(HostCommandRunner::new(self.config.scheduler.tools_dir.clone()));
        build_adapter(kind, runner)
    }
}

pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output, CliError> {
    let rt = TokioRuntime::new()?;
    Ok(rt.block_on(future))
}
