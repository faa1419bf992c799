//! Sandbox gateway — remote client for the isolated execution service.
//!
//! Every call is remote and may fail or time out. Every response is
//! deserialized into a typed struct and then `validate()`d before being
//! trusted; an invalid or unparseable response is treated identically to a
//! network failure and never accepted as data.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::SandboxConfig;
use crate::errors::SandboxError;
use crate::session::state::TemplateDetails;

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxFile {
    pub path: String,
    pub contents: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Compact diagnostic line for retry prompts.
    pub fn diagnostic(&self) -> String {
        format!(
            "`{}` exited {}{}: {}",
            self.command,
            self.exit_code,
            if self.timed_out { " (timed out)" } else { "" },
            self.stderr.trim()
        )
    }
}

/// Runtime error observed inside a running instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeErrorReport {
    pub message: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

/// One static-analysis finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisFinding {
    pub file_path: String,
    pub message: String,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub rule: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResult {
    pub preview_url: String,
    #[serde(default)]
    pub tunnel_url: Option<String>,
}

// ── Gateway trait ────────────────────────────────────────────────────

#[async_trait]
pub trait SandboxGateway: Send + Sync {
    async fn list_templates(&self) -> Result<Vec<TemplateInfo>, SandboxError>;
    async fn template_details(&self, name: &str) -> Result<TemplateDetails, SandboxError>;
    async fn create_instance(&self, template: &str) -> Result<String, SandboxError>;
    async fn write_files(
        &self,
        instance_id: &str,
        files: &[SandboxFile],
    ) -> Result<(), SandboxError>;
    /// Execute shell commands under the given timeout. A timed-out command
    /// is reported failed, never left hanging.
    async fn execute_commands(
        &self,
        instance_id: &str,
        commands: &[String],
        timeout: Duration,
    ) -> Result<Vec<CommandResult>, SandboxError>;
    async fn instance_errors(
        &self,
        instance_id: &str,
    ) -> Result<Vec<RuntimeErrorReport>, SandboxError>;
    async fn run_static_analysis(
        &self,
        instance_id: &str,
        files: &[String],
    ) -> Result<Vec<AnalysisFinding>, SandboxError>;
    async fn deploy(&self, instance_id: &str) -> Result<DeployResult, SandboxError>;
    async fn shutdown(&self, instance_id: &str) -> Result<(), SandboxError>;
}

// ── Response envelopes + validation ──────────────────────────────────

trait Validated {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize)]
struct TemplateListResponse {
    templates: Vec<TemplateInfo>,
}

impl Validated for TemplateListResponse {
    fn validate(&self) -> Result<(), String> {
        if self.templates.iter().any(|t| t.name.trim().is_empty()) {
            return Err("template with empty name".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TemplateDetailsResponse {
    template: TemplateDetails,
}

impl Validated for TemplateDetailsResponse {
    fn validate(&self) -> Result<(), String> {
        if self.template.name.trim().is_empty() {
            return Err("template details with empty name".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CreateInstanceResponse {
    instance_id: String,
}

impl Validated for CreateInstanceResponse {
    fn validate(&self) -> Result<(), String> {
        if self.instance_id.trim().is_empty() {
            return Err("empty instance_id".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct WriteFilesResponse {
    written: Vec<String>,
}

impl Validated for WriteFilesResponse {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    results: Vec<CommandResult>,
}

impl Validated for ExecuteResponse {
    fn validate(&self) -> Result<(), String> {
        if self.results.iter().any(|r| r.command.trim().is_empty()) {
            return Err("command result with empty command".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct InstanceErrorsResponse {
    errors: Vec<RuntimeErrorReport>,
}

impl Validated for InstanceErrorsResponse {
    fn validate(&self) -> Result<(), String> {
        if self.errors.iter().any(|e| e.message.trim().is_empty()) {
            return Err("runtime error with empty message".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    findings: Vec<AnalysisFinding>,
}

impl Validated for AnalysisResponse {
    fn validate(&self) -> Result<(), String> {
        if self.findings.iter().any(|f| f.file_path.trim().is_empty()) {
            return Err("analysis finding with empty file path".into());
        }
        Ok(())
    }
}

impl Validated for DeployResult {
    fn validate(&self) -> Result<(), String> {
        if !self.preview_url.starts_with("http") {
            return Err(format!("preview_url '{}' is not a URL", self.preview_url));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    #[serde(default)]
    ok: bool,
}

impl Validated for AckResponse {
    fn validate(&self) -> Result<(), String> {
        if !self.ok {
            return Err("operation not acknowledged".into());
        }
        Ok(())
    }
}

fn parse_validated<T: DeserializeOwned + Validated>(body: &str) -> Result<T, SandboxError> {
    let parsed: T =
        serde_json::from_str(body).map_err(|e| SandboxError::InvalidResponse(e.to_string()))?;
    parsed.validate().map_err(SandboxError::InvalidResponse)?;
    Ok(parsed)
}

// ── HTTP client ──────────────────────────────────────────────────────

pub struct SandboxHttpClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl SandboxHttpClient {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    async fn call<B: Serialize, T: DeserializeOwned + Validated>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T, SandboxError> {
        let url = format!("{}{}", self.base_url, path);
        let exchange = async {
            let response = self.http.post(&url).json(body).send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        // The timeout spans the whole exchange; a gateway that returns
        // headers and then stalls the body still times out.
        let (status, text) = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| SandboxError::Timeout {
                seconds: timeout.as_secs(),
            })??;

        if !status.is_success() {
            return Err(SandboxError::BadStatus {
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            });
        }
        parse_validated(&text)
    }
}

#[derive(Serialize)]
struct InstanceRequest<'a> {
    instance_id: &'a str,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    template: &'a str,
}

#[derive(Serialize)]
struct WriteRequest<'a> {
    instance_id: &'a str,
    files: &'a [SandboxFile],
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    instance_id: &'a str,
    commands: &'a [String],
    timeout_secs: u64,
}

#[derive(Serialize)]
struct AnalysisRequest<'a> {
    instance_id: &'a str,
    files: &'a [String],
}

#[derive(Serialize)]
struct TemplateRequest<'a> {
    name: &'a str,
}

#[async_trait]
impl SandboxGateway for SandboxHttpClient {
    async fn list_templates(&self) -> Result<Vec<TemplateInfo>, SandboxError> {
        let resp: TemplateListResponse = self
            .call("/templates/list", &serde_json::json!({}), self.request_timeout)
            .await?;
        Ok(resp.templates)
    }

    async fn template_details(&self, name: &str) -> Result<TemplateDetails, SandboxError> {
        let resp: TemplateDetailsResponse = self
            .call("/templates/details", &TemplateRequest { name }, self.request_timeout)
            .await?;
        Ok(resp.template)
    }

    async fn create_instance(&self, template: &str) -> Result<String, SandboxError> {
        let resp: CreateInstanceResponse = self
            .call(
                "/instances/create",
                &CreateRequest { template },
                self.request_timeout,
            )
            .await?;
        Ok(resp.instance_id)
    }

    async fn write_files(
        &self,
        instance_id: &str,
        files: &[SandboxFile],
    ) -> Result<(), SandboxError> {
        let _resp: WriteFilesResponse = self
            .call(
                "/instances/write-files",
                &WriteRequest { instance_id, files },
                self.request_timeout,
            )
            .await?;
        Ok(())
    }

    async fn execute_commands(
        &self,
        instance_id: &str,
        commands: &[String],
        timeout: Duration,
    ) -> Result<Vec<CommandResult>, SandboxError> {
        // The remote enforces timeout_secs per command; the local guard adds
        // headroom so a wedged gateway still cannot hang the caller.
        let local_timeout = timeout + Duration::from_secs(15);
        let resp: ExecuteResponse = self
            .call(
                "/instances/execute",
                &ExecuteRequest {
                    instance_id,
                    commands,
                    timeout_secs: timeout.as_secs(),
                },
                local_timeout,
            )
            .await?;
        Ok(resp.results)
    }

    async fn instance_errors(
        &self,
        instance_id: &str,
    ) -> Result<Vec<RuntimeErrorReport>, SandboxError> {
        let resp: InstanceErrorsResponse = self
            .call(
                "/instances/errors",
                &InstanceRequest { instance_id },
                self.request_timeout,
            )
            .await?;
        Ok(resp.errors)
    }

    async fn run_static_analysis(
        &self,
        instance_id: &str,
        files: &[String],
    ) -> Result<Vec<AnalysisFinding>, SandboxError> {
        let resp: AnalysisResponse = self
            .call(
                "/instances/analyze",
                &AnalysisRequest { instance_id, files },
                self.request_timeout,
            )
            .await?;
        Ok(resp.findings)
    }

    async fn deploy(&self, instance_id: &str) -> Result<DeployResult, SandboxError> {
        self.call(
            "/instances/deploy",
            &InstanceRequest { instance_id },
            self.request_timeout,
        )
        .await
    }

    async fn shutdown(&self, instance_id: &str) -> Result<(), SandboxError> {
        let _resp: AckResponse = self
            .call(
                "/instances/shutdown",
                &InstanceRequest { instance_id },
                self.request_timeout,
            )
            .await?;
        Ok(())
    }
}
