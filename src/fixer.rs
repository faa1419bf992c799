//! Bounded error-recovery loop.
//!
//! Every error signal is reduced to a stable signature; the fixer tracks how
//! many patch attempts each signature has consumed and refuses further work
//! once the budget is spent, so one persistent error can never spin the
//! pipeline forever. Patches are constrained to the implicated files; a
//! patch that names anything else is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::errors::PhaseError;
use crate::inference::{infer_json, InferenceClient, InferenceRequest, ModelSettings};
use crate::session::state::SessionState;

const FIX_SYSTEM_PROMPT: &str = r#"You are a code-repair assistant. You receive a runtime or build error from a generated web application together with the source of the implicated files. Produce corrected versions of only those files.

Respond with valid JSON only, matching this schema:
{"files": [{"path": "src/relative/path.ts", "contents": "full corrected file contents"}]}

Rules:
- Only include files that actually need to change.
- Every file you return must be one of the implicated files provided.
- Return complete file contents, never diffs or fragments.
"#;

/// One error observation entering the recovery loop, regardless of source
/// (sandbox runtime errors, static analysis, client reports).
#[derive(Debug, Clone)]
pub struct ErrorSignal {
    pub message: String,
    pub file_paths: Vec<String>,
    pub screenshot: Option<String>,
}

/// Stable identity for an error signal: same message and implicated files
/// hash to the same signature across repeated observations.
pub fn signature(signal: &ErrorSignal) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signal.message.as_bytes());
    let mut paths = signal.file_paths.clone();
    paths.sort();
    for path in &paths {
        hasher.update(b"\0");
        hasher.update(path.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilePatch {
    pub path: String,
    pub contents: String,
}

#[derive(Debug, Deserialize)]
struct FixResponse {
    files: Vec<FilePatch>,
}

#[derive(Debug)]
pub enum FixOutcome {
    /// Corrected file contents, restricted to the implicated files.
    Patched { files: Vec<FilePatch> },
    /// The attempt budget for this signature is spent.
    Exhausted { signature: String },
    /// The signal implicates no file the session knows about.
    NoTarget,
}

pub struct CodeFixer {
    inference: Arc<dyn InferenceClient>,
    max_attempts: u32,
    attempts: HashMap<String, u32>,
}

impl CodeFixer {
    pub fn new(inference: Arc<dyn InferenceClient>, max_attempts: u32) -> Self {
        Self {
            inference,
            max_attempts,
            attempts: HashMap::new(),
        }
    }

    pub fn attempts_for(&self, sig: &str) -> u32 {
        self.attempts.get(sig).copied().unwrap_or(0)
    }

    /// Run one patch attempt against the signal. Consumes one unit of the
    /// signature's budget only when an inference call is actually made.
    pub async fn attempt_fix(
        &mut self,
        signal: &ErrorSignal,
        state: &SessionState,
    ) -> Result<FixOutcome, PhaseError> {
        let sig = signature(signal);
        if self.attempts_for(&sig) >= self.max_attempts {
            info!("fix budget exhausted for signature {}", sig);
            return Ok(FixOutcome::Exhausted { signature: sig });
        }

        // Only files the session actually owns can be patched.
        let implicated: Vec<&str> = signal
            .file_paths
            .iter()
            .filter(|p| state.files.contains_key(*p))
            .map(String::as_str)
            .collect();
        if implicated.is_empty() {
            debug!("error signal implicates no known file: {}", signal.message);
            return Ok(FixOutcome::NoTarget);
        }

        *self.attempts.entry(sig.clone()).or_insert(0) += 1;

        let mut sources = String::new();
        for path in &implicated {
            let file = &state.files[*path];
            sources.push_str(&format!("### {}\n```\n{}\n```\n\n", path, file.contents));
        }
        let screenshot_note = match &signal.screenshot {
            Some(_) => "\nA client screenshot of the failure was captured.",
            None => "",
        };
        let user = format!(
            "## Error\n{}\n\n## Implicated files\n{}{}\nRespond with JSON only.",
            signal.message, sources, screenshot_note
        );

        let response: FixResponse = infer_json(
            self.inference.as_ref(),
            InferenceRequest::new(FIX_SYSTEM_PROMPT, user, ModelSettings::fast_patch()),
        )
        .await?;

        let (kept, dropped): (Vec<FilePatch>, Vec<FilePatch>) = response
            .files
            .into_iter()
            .partition(|f| implicated.contains(&f.path.as_str()));
        for patch in &dropped {
            warn!(
                "dropping patch for non-implicated file {} (signature {})",
                patch.path, sig
            );
        }
        if kept.is_empty() {
            return Ok(FixOutcome::NoTarget);
        }

        info!(
            "patch attempt {}/{} for signature {} produced {} file(s)",
            self.attempts_for(&sig),
            self.max_attempts,
            sig,
            kept.len()
        );
        Ok(FixOutcome::Patched { files: kept })
    }
}
