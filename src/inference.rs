//! Inference gateway boundary.
//!
//! The orchestration core never talks to a concrete model backend; it goes
//! through [`InferenceClient`], which accepts a structured prompt and
//! returns raw text. [`infer_json`] layers schema validation on top so that
//! malformed output fails closed instead of polluting session state.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::InferenceConfig;
use crate::errors::InferenceError;

/// Sampling/output knobs for one inference call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSettings {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ModelSettings {
    /// Default settings for incremental phase generation.
    pub fn standard() -> Self {
        Self {
            max_tokens: 8192,
            temperature: 0.4,
        }
    }

    /// Large-context, low-temperature settings for phase 0, which lays down
    /// the whole project skeleton.
    pub fn high_fidelity() -> Self {
        Self {
            max_tokens: 32768,
            temperature: 0.1,
        }
    }

    /// Tight settings tuned for fast, targeted patches in the fix loop.
    pub fn fast_patch() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub system: String,
    pub user: String,
    pub settings: ModelSettings,
}

impl InferenceRequest {
    pub fn new(system: &str, user: String, settings: ModelSettings) -> Self {
        Self {
            system: system.to_string(),
            user,
            settings,
        }
    }
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Run one completion and return the raw text output.
    async fn complete(&self, req: InferenceRequest) -> Result<String, InferenceError>;
}

/// Strip any prose/markdown wrapping and return the outermost JSON object.
/// Model output is frequently fenced or prefixed with commentary.
pub fn extract_json(raw: &str) -> &str {
    if let Some(start) = raw.find('{') {
        if let Some(end) = raw.rfind('}') {
            if end >= start {
                return &raw[start..=end];
            }
        }
    }
    raw
}

/// Run one completion and parse the output into `T`. An empty response or a
/// parse failure is an [`InferenceError`], never partial data.
pub async fn infer_json<T: DeserializeOwned>(
    client: &dyn InferenceClient,
    req: InferenceRequest,
) -> Result<T, InferenceError> {
    let raw = client.complete(req).await?;
    if raw.trim().is_empty() {
        return Err(InferenceError::Empty);
    }
    let cleaned = extract_json(&raw);
    serde_json::from_str(cleaned).map_err(|e| {
        InferenceError::Malformed(format!(
            "{} (first 200 chars: {})",
            e,
            cleaned.chars().take(200).collect::<String>()
        ))
    })
}

// ── HTTP implementation ──────────────────────────────────────────────

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Chat-completions style HTTP client for the inference service.
pub struct HttpInferenceClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        }
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn complete(&self, req: InferenceRequest) -> Result<String, InferenceError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &req.system,
                },
                ChatMessage {
                    role: "user",
                    content: &req.user,
                },
            ],
            max_tokens: req.settings.max_tokens,
            temperature: req.settings.temperature,
        };

        let mut request = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::BadStatus {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(InferenceError::Empty)?;
        Ok(content)
    }
}
