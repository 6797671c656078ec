use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use runwarden_core::errors::ConfigError;
use runwarden_core::model::RunStatus;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const API_PREFIX: &str = "api/workflows/v1";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Request to workflow engine failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Workflow engine answered {status} for {url}: {body}")]
    Rejected {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Malformed workflow engine response: {0}")]
    Malformed(String),
}

impl EngineError {
    /// Errors worth another attempt after a pause. Server-side failures and
    /// throttling count, other rejections do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport(_) | EngineError::Malformed(_) => true,
            EngineError::Rejected { status, .. } => *status >= 500 || *status == 429,
            EngineError::Config(_) => false,
        }
    }
}

/// Files making up one workflow submission.
#[derive(Debug, Clone, Default)]
pub struct WorkflowSubmission {
    pub workflow_source: PathBuf,
    pub inputs: Option<PathBuf>,
    pub options: Option<PathBuf>,
    pub dependencies: Option<PathBuf>,
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn submit(&self, submission: &WorkflowSubmission) -> Result<String, EngineError>;

    async fn status(&self, run_id: &str) -> Result<RunStatus, EngineError>;

    async fn abort(&self, run_id: &str) -> Result<(), EngineError>;
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

/// Maps an engine status string onto the lifecycle. Transitional states
/// collapse into their nearest stable neighbour.
pub fn parse_engine_status(raw: &str) -> Result<RunStatus, EngineError> {
    match raw.trim().to_lowercase().as_str() {
        "on hold" => Ok(RunStatus::Submitted),
        "aborting" => Ok(RunStatus::Running),
        other => other
            .parse::<RunStatus>()
            .map_err(|_| EngineError::Malformed(format!("unknown workflow status '{}'", raw))),
    }
}

/// Extracts the single status out of a `{"results": [{"status": ..}]}` query body.
pub fn parse_query_response(body: &Value) -> Result<RunStatus, EngineError> {
    let results = body
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::Malformed(format!("expected results in response, got {}", body)))?;
    if results.len() != 1 {
        return Err(EngineError::Malformed(format!(
            "expected 1 result, got {}",
            results.len()
        )));
    }
    let status = results[0]
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Malformed("result has no status".to_string()))?;
    parse_engine_status(status)
}

pub fn normalize_server_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Reads `final_workflow_log_dir` out of a workflow options file.
pub fn workflow_log_dir(options_json: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let content = fs_err::read_to_string(options_json)?;
    let options: Value = serde_json::from_str(&content)?;
    Ok(options
        .get("final_workflow_log_dir")
        .and_then(Value::as_str)
        .map(PathBuf::from))
}

pub fn workflow_log_file(log_dir: &Path, run_id: &str) -> PathBuf {
    log_dir.join(format!("workflow.{}.log", run_id))
}

pub struct HttpWorkflowEngine {
    base_url: String,
    client: reqwest::Client,
}

impl HttpWorkflowEngine {
    pub fn new(server_url: &str) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: normalize_server_url(server_url),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, tail: &str) -> String {
        if tail.is_empty() {
            format!("{}/{}", self.base_url, API_PREFIX)
        } else {
            format!("{}/{}/{}", self.base_url, API_PREFIX, tail)
        }
    }

    fn file_part(path: &Path) -> Result<Part, EngineError> {
        let bytes = fs_err::read(path).map_err(ConfigError::Io)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Part::bytes(bytes).file_name(name))
    }

    async fn checked(
        url: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(EngineError::Rejected {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl WorkflowEngine for HttpWorkflowEngine {
    async fn submit(&self, submission: &WorkflowSubmission) -> Result<String, EngineError> {
        let mut form = Form::new().part(
            "workflowSource",
            Self::file_part(&submission.workflow_source)?,
        );
        let optional = [
            ("workflowInputs", &submission.inputs),
            ("workflowOptions", &submission.options),
            ("workflowDependencies", &submission.dependencies),
        ];
        for (field, path) in optional {
            if let Some(path) = path {
                form = form.part(field, Self::file_part(path)?);
            }
        }

        let url = self.endpoint("");
        tracing::info!(
            "Submitting workflow '{}' to {}",
            submission.workflow_source.display(),
            url
        );
        let response = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .multipart(form)
            .send()
            .await?;
        let response = Self::checked(&url, response).await?;
        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Malformed(format!("no run id in submission response: {}", e)))?;
        tracing::info!("run_id: {}", body.id);
        Ok(body.id)
    }

    async fn status(&self, run_id: &str) -> Result<RunStatus, EngineError> {
        let url = self.endpoint("query");
        let response = self
            .client
            .get(&url)
            .query(&[("id", run_id)])
            .send()
            .await?;
        let response = Self::checked(&url, response).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Malformed(e.to_string()))?;
        parse_query_response(&body)
    }

    async fn abort(&self, run_id: &str) -> Result<(), EngineError> {
        let url = self.endpoint(&format!("{}/abort", run_id));
        tracing::info!("Aborting run {}", run_id);
        let response = self.client.post(&url).send().await?;
        let response = Self::checked(&url, response).await?;
        let body = response.text().await.unwrap_or_default();
        tracing::debug!("Abort response for {}: {}", run_id, body.trim());
        Ok(())
    }
}
