//! Durable state model for one generated-app session.
//!
//! A `SessionState` is the snapshot the actor persists after every mutation
//! and hands to the surrounding persistence layer; outer layers read it but
//! never mutate it directly.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Phase lifecycle ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Planned,
    Generating,
    Implemented,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Generating => "generating",
            Self::Implemented => "implemented",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "generating" => Ok(Self::Generating),
            "implemented" => Ok(Self::Implemented),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

/// One ordered step of the blueprint's file plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub index: usize,
    pub description: String,
    pub file_paths: Vec<String>,
    pub status: PhaseStatus,
    /// Generation attempts consumed so far; exhaustion is observable here.
    pub attempts: u32,
}

impl Phase {
    pub fn from_plan(index: usize, plan: &PhasePlan) -> Self {
        Self {
            index,
            description: plan.description.clone(),
            file_paths: plan.files.iter().map(|f| f.path.clone()).collect(),
            status: PhaseStatus::Planned,
            attempts: 0,
        }
    }
}

// ── Blueprint ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedFile {
    pub path: String,
    pub purpose: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasePlan {
    pub name: String,
    pub description: String,
    pub files: Vec<PlannedFile>,
}

/// The structured plan produced before code generation begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    pub title: String,
    pub description: String,
    pub phases: Vec<PhasePlan>,
}

/// Details of the sandbox template a session starts from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDetails {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
}

// ── Generated files ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub contents: String,
    pub purpose: String,
    pub language: String,
    #[serde(default)]
    pub is_generating: bool,
    #[serde(default)]
    pub needs_fixing: bool,
    #[serde(default)]
    pub has_errors: bool,
    #[serde(default)]
    pub revision: u32,
}

impl GeneratedFile {
    pub fn new(path: &str, contents: &str, purpose: &str) -> Self {
        Self {
            path: path.to_string(),
            contents: contents.to_string(),
            purpose: purpose.to_string(),
            language: detect_language(path).to_string(),
            is_generating: false,
            needs_fixing: false,
            has_errors: false,
            revision: 0,
        }
    }
}

/// Map a file extension to a display language.
pub fn detect_language(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "rs" => "rust",
        "py" => "python",
        "html" => "html",
        "css" => "css",
        "json" => "json",
        "md" => "markdown",
        "toml" => "toml",
        "yml" | "yaml" => "yaml",
        "sql" => "sql",
        "sh" => "shell",
        _ => "plaintext",
    }
}

// ── Conversation log ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Append-only audit/replay log entry; `seq` is the append order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub seq: u64,
}

// ── Ancillary records ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUserInput {
    pub id: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientReportedError {
    pub message: String,
    #[serde(default)]
    pub file_paths: Vec<String>,
    #[serde(default)]
    pub screenshot: Option<String>,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Pipeline runs end to end without pausing for user input.
    Autonomous,
    /// Pipeline may park questions in `pending_inputs` between phases.
    Assisted,
}

impl Default for SessionMode {
    fn default() -> Self {
        Self::Autonomous
    }
}

// ── Dev-state cursor ─────────────────────────────────────────────────

/// Where the phase orchestrator currently stands for this session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DevState {
    Uninitialized,
    TemplateSelected,
    BlueprintReady,
    SettingUp,
    PhaseGenerating { phase: usize },
    PhaseImplementing { phase: usize },
    PhaseComplete { phase: usize },
    AwaitingDeployment,
    Monitoring,
    FixingCode,
    Completed,
    Failed,
}

// ── Session snapshot ─────────────────────────────────────────────────

/// The durable unit of state for one user's in-progress or completed
/// generated application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub query: String,
    pub blueprint: Option<Blueprint>,
    pub template: Option<TemplateDetails>,
    pub phases: Vec<Phase>,
    /// Keyed by path; overwritten in place, never deleted mid-session.
    pub files: BTreeMap<String, GeneratedFile>,
    pub conversation: Vec<ConversationMessage>,
    pub pending_inputs: Vec<PendingUserInput>,
    pub dev_state: DevState,
    pub generation_in_flight: bool,
    pub sandbox_instance_id: Option<String>,
    pub preview_url: Option<String>,
    pub client_errors: Vec<ClientReportedError>,
    /// Bumped on every mutating operation, observable via the control channel.
    pub version: u64,
    pub owner_id: Option<String>,
    pub hostname: Option<String>,
    #[serde(default)]
    pub mode: SessionMode,
    pub created_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(id: &str, query: &str) -> Self {
        Self {
            id: id.to_string(),
            query: query.to_string(),
            blueprint: None,
            template: None,
            phases: Vec::new(),
            files: BTreeMap::new(),
            conversation: Vec::new(),
            pending_inputs: Vec::new(),
            dev_state: DevState::Uninitialized,
            generation_in_flight: false,
            sandbox_instance_id: None,
            preview_url: None,
            client_errors: Vec::new(),
            version: 0,
            owner_id: None,
            hostname: None,
            mode: SessionMode::Autonomous,
            created_at: Utc::now(),
        }
    }

    /// Initialized means the blueprint is committed; template selection
    /// alone is still pre-initialization.
    pub fn is_initialized(&self) -> bool {
        !matches!(
            self.dev_state,
            DevState::Uninitialized | DevState::TemplateSelected
        )
    }

    /// Phase i+1 may not enter `generating` until phase i is `implemented`.
    pub fn can_generate_phase(&self, index: usize) -> bool {
        if index >= self.phases.len() {
            return false;
        }
        if index == 0 {
            return true;
        }
        self.phases[index - 1].status == PhaseStatus::Implemented
    }

    /// Append to the conversation log, assigning the next sequence number.
    pub fn push_message(&mut self, role: MessageRole, content: &str) {
        let seq = self.conversation.len() as u64;
        self.conversation.push(ConversationMessage {
            role,
            content: content.to_string(),
            seq,
        });
    }

    /// Insert or overwrite a generated file, bumping its revision when the
    /// path already exists.
    pub fn record_file(&mut self, mut file: GeneratedFile) {
        if let Some(existing) = self.files.get(&file.path) {
            file.revision = existing.revision + 1;
        }
        self.files.insert(file.path.clone(), file);
    }

    /// Copy for a fork: same blueprint/phases/files/conversation, but a new
    /// identity and cleared ephemeral fields so two sessions never race on
    /// one sandbox instance.
    pub fn clone_for_fork(&self, new_id: &str) -> Self {
        let mut forked = self.clone();
        forked.id = new_id.to_string();
        forked.sandbox_instance_id = None;
        forked.preview_url = None;
        forked.pending_inputs.clear();
        forked.client_errors.clear();
        forked.generation_in_flight = false;
        forked.version = 0;
        forked.created_at = Utc::now();
        forked
    }

    pub fn progress(&self) -> SessionProgress {
        SessionProgress {
            session_id: self.id.clone(),
            dev_state: self.dev_state,
            phases_total: self.phases.len(),
            phases_implemented: self
                .phases
                .iter()
                .filter(|p| p.status == PhaseStatus::Implemented)
                .count(),
            files_generated: self.files.len(),
            preview_url: self.preview_url.clone(),
            version: self.version,
        }
    }

    /// Trimmed read-only view served by `getState`.
    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            query: self.query.clone(),
            title: self.blueprint.as_ref().map(|b| b.title.clone()),
            template: self.template.as_ref().map(|t| t.name.clone()),
            dev_state: self.dev_state,
            phases: self.phases.clone(),
            preview_url: self.preview_url.clone(),
            generation_in_flight: self.generation_in_flight,
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProgress {
    pub session_id: String,
    pub dev_state: DevState,
    pub phases_total: usize,
    pub phases_implemented: usize,
    pub files_generated: usize,
    pub preview_url: Option<String>,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub id: String,
    pub query: String,
    pub title: Option<String>,
    pub template: Option<String>,
    pub dev_state: DevState,
    pub phases: Vec<Phase>,
    pub preview_url: Option<String>,
    pub generation_in_flight: bool,
    pub version: u64,
}
