//! Typed error hierarchy for the loom orchestration core.
//!
//! Five top-level enums cover the external boundaries and the pipeline:
//! - `InferenceError` — inference gateway transport/schema failures
//! - `PlannerError` — template selection and blueprint generation (fatal)
//! - `SandboxError` — remote sandbox gateway failures (uniformly recoverable)
//! - `SessionError` — session actor and registry operations
//! - `PhaseError` — phase generation and the bounded fix loop

use thiserror::Error;

/// Errors from the inference gateway boundary.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Inference request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Inference service returned status {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("Inference response failed schema validation: {0}")]
    Malformed(String),

    #[error("Inference response was empty")]
    Empty,
}

/// Errors from the planning stage. No partial state is committed when these
/// surface.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("No templates available for selection")]
    NoTemplates,

    #[error("Selected template '{name}' is not in the candidate set")]
    TemplateNotInCandidates { name: String },

    #[error("Blueprint failed validation: {0}")]
    InvalidBlueprint(String),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Errors from the remote sandbox gateway. A malformed response is treated
/// identically to a network failure — it is never accepted as data.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Sandbox call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Sandbox returned status {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("Sandbox response failed validation: {0}")]
    InvalidResponse(String),

    #[error("Sandbox instance {id} not found")]
    InstanceNotFound { id: String },
}

/// Errors from session actor and registry operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {id} not found")]
    NotFound { id: String },

    #[error("Session {id} is not initialized")]
    NotInitialized { id: String },

    #[error("Session {id} is already initialized")]
    AlreadyInitialized { id: String },

    #[error("Generation already in flight for session {id}")]
    GenerationInFlight { id: String },

    #[error("Session has no bound sandbox instance")]
    NoSandboxInstance,

    #[error("Session store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl SessionError {
    /// A second "start" against an in-flight session is rejected but may be
    /// retried once the current generation settles.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GenerationInFlight { .. })
    }
}

/// Errors from phase generation and the recovery loop.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Phase {phase} cannot start: phase {blocking} is not implemented")]
    OutOfOrder { phase: usize, blocking: usize },

    #[error("Phase {phase} produced no usable files")]
    EmptyOutput { phase: usize },

    #[error("Phase {phase} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        phase: usize,
        attempts: u32,
        message: String,
    },

    #[error("Fix attempts exhausted for error signature {signature}")]
    FixExhausted { signature: String },

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}
