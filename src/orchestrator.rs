//! Phase orchestrator — drives one session from raw query to deployed app.
//!
//! The pipeline is: plan (template + blueprint), provision a sandbox, run
//! environment setup, generate each phase in order, deploy, then monitor and
//! fix. The orchestrator never holds the session's write lock across a
//! remote call; every transition goes through the actor's serialized update
//! path. `run` guarantees the in-flight flag is cleared and an error event
//! is emitted on every exit path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::{Limits, LoomConfig};
use crate::errors::PhaseError;
use crate::fixer::{CodeFixer, ErrorSignal, FilePatch, FixOutcome};
use crate::inference::{infer_json, InferenceClient, InferenceRequest, ModelSettings};
use crate::planner::{is_disallowed_artifact, Planner};
use crate::sandbox::{SandboxFile, SandboxGateway};
use crate::session::actor::{InitializeSession, SessionActor};
use crate::session::state::{
    DevState, GeneratedFile, MessageRole, PendingUserInput, PhaseStatus, SessionMode,
    SessionState,
};
use crate::ws::SessionEvent;

const SETUP_SYSTEM_PROMPT: &str = r#"You are a build engineer. Given a starter template for a web application, produce the shell commands needed to prepare its environment (dependency install, code generation, etc.).

Respond with valid JSON only, matching this schema:
{"commands": ["npm install"]}

Rules:
- Commands run sequentially in the project root.
- Return an empty list if the template needs no setup.
- Never include commands that start servers or watch processes.
"#;

const PHASE_SYSTEM_PROMPT: &str = r#"You are an expert application developer. You receive a product request, an implementation blueprint, and one phase of that blueprint to implement. Produce the complete contents of every file this phase requires.

Respond with valid JSON only, matching this schema:
{"files": [{"path": "src/relative/path.ts", "purpose": "what it does", "contents": "full file contents"}]}

Rules:
- Implement the planned files for this phase; you may add small supporting files when strictly necessary.
- Return complete file contents, never diffs or placeholders.
- Only source/text files; never binary assets.
"#;

#[derive(Debug, Deserialize)]
struct SetupCommandsResponse {
    commands: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PhaseFilesResponse {
    files: Vec<PhaseFileOut>,
}

#[derive(Debug, Deserialize)]
struct PhaseFileOut {
    path: String,
    #[serde(default)]
    purpose: String,
    contents: String,
}

pub struct Orchestrator {
    actor: Arc<SessionActor>,
    inference: Arc<dyn InferenceClient>,
    sandbox: Arc<dyn SandboxGateway>,
    limits: Limits,
    command_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        actor: Arc<SessionActor>,
        inference: Arc<dyn InferenceClient>,
        sandbox: Arc<dyn SandboxGateway>,
        config: &LoomConfig,
    ) -> Self {
        Self {
            actor,
            inference,
            sandbox,
            limits: config.limits,
            command_timeout: Duration::from_secs(config.sandbox.command_timeout_secs),
        }
    }

    /// Claim the session's in-flight flag and run the pipeline. A second
    /// concurrent call fails fast with `GenerationInFlight`.
    pub async fn run(&self) -> Result<()> {
        self.actor.begin_generation().await?;
        self.run_claimed().await
    }

    /// Run the pipeline for an already-claimed session. Clears the in-flight
    /// flag on every exit path and surfaces failures as error events.
    pub async fn run_claimed(&self) -> Result<()> {
        let result = self.drive().await;
        if let Err(e) = &result {
            error!("pipeline failed for session {}: {:#}", self.actor.id(), e);
            let _ = self
                .actor
                .update(|s| s.dev_state = DevState::Failed)
                .await;
            self.actor.emit(SessionEvent::Error {
                error: format!("{:#}", e),
            });
        }
        self.actor.finish_generation().await;
        self.actor.emit(SessionEvent::Terminate);
        result
    }

    async fn drive(&self) -> Result<()> {
        if !self.actor.is_initialized().await {
            self.plan().await?;
        }

        let instance_id = self.ensure_instance().await?;
        self.run_setup(&instance_id).await;
        self.generate_phases(&instance_id).await?;

        self.actor
            .update(|s| s.dev_state = DevState::AwaitingDeployment)
            .await?;
        self.actor.deploy_to_sandbox(self.sandbox.as_ref()).await?;

        self.monitor_and_fix(&instance_id).await?;

        self.actor
            .update(|s| {
                s.dev_state = DevState::Completed;
                s.push_message(
                    MessageRole::Assistant,
                    "All phases implemented and the app is deployed.",
                );
            })
            .await?;
        info!("session {} completed", self.actor.id());
        Ok(())
    }

    // ── Planning ─────────────────────────────────────────────────────

    async fn plan(&self) -> Result<()> {
        let snapshot = self.actor.full_state().await;
        let query = snapshot.query.clone();

        let templates = self.sandbox.list_templates().await?;
        let planner = Planner::new(Arc::clone(&self.inference));
        let name = planner.select_template(&query, &templates).await?;
        self.actor
            .update(|s| s.dev_state = DevState::TemplateSelected)
            .await?;
        info!("session {} selected template {}", self.actor.id(), name);

        let template = self.sandbox.template_details(&name).await?;
        let blueprint = planner.generate_blueprint(&query, &template).await?;
        self.actor
            .initialize(InitializeSession {
                query,
                blueprint,
                template,
                hostname: snapshot.hostname,
                owner_id: snapshot.owner_id,
                mode: snapshot.mode,
            })
            .await?;
        Ok(())
    }

    // ── Sandbox provisioning + setup ─────────────────────────────────

    async fn ensure_instance(&self) -> Result<String> {
        let snapshot = self.actor.full_state().await;
        if let Some(id) = snapshot.sandbox_instance_id {
            return Ok(id);
        }
        let template = snapshot
            .template
            .ok_or(crate::errors::SessionError::NotInitialized {
                id: self.actor.id().to_string(),
            })?;

        let instance_id = self.sandbox.create_instance(&template.name).await?;
        let bound = instance_id.clone();
        self.actor
            .update(move |s| s.sandbox_instance_id = Some(bound))
            .await?;
        info!(
            "session {} bound to sandbox instance {}",
            self.actor.id(),
            instance_id
        );
        Ok(instance_id)
    }

    /// Environment setup with one diagnostic-informed retry. Setup failure
    /// is not fatal to generation; later phases may still succeed.
    async fn run_setup(&self, instance_id: &str) {
        let snapshot = self.actor.full_state().await;
        let Some(template) = snapshot.template else {
            return;
        };
        if self
            .actor
            .update(|s| s.dev_state = DevState::SettingUp)
            .await
            .is_err()
        {
            return;
        }

        let mut diagnostic: Option<String> = None;
        for attempt in 0..=self.limits.setup_retries {
            let commands = match self.setup_commands(&template, diagnostic.as_deref()).await {
                Ok(commands) => commands,
                Err(e) => {
                    warn!("setup command generation failed: {}", e);
                    return;
                }
            };
            if commands.is_empty() {
                return;
            }

            match self
                .sandbox
                .execute_commands(instance_id, &commands, self.command_timeout)
                .await
            {
                Ok(results) => match results.iter().find(|r| !r.success()) {
                    None => return,
                    Some(failed) => {
                        warn!(
                            "setup attempt {} failed for session {}: {}",
                            attempt + 1,
                            self.actor.id(),
                            failed.diagnostic()
                        );
                        diagnostic = Some(failed.diagnostic());
                    }
                },
                Err(e) => {
                    warn!("setup execution failed: {}", e);
                    return;
                }
            }
        }

        let _ = self
            .actor
            .update(|s| {
                s.push_message(
                    MessageRole::Assistant,
                    "Environment setup did not fully succeed; continuing with generation.",
                )
            })
            .await;
    }

    async fn setup_commands(
        &self,
        template: &crate::session::state::TemplateDetails,
        diagnostic: Option<&str>,
    ) -> Result<Vec<String>, PhaseError> {
        let mut user = format!(
            "## Template\n{} — {}\n\nTemplate files:\n{}\n",
            template.name,
            template.description,
            template.files.join("\n"),
        );
        if let Some(diag) = diagnostic {
            user.push_str(&format!("\n## Previous failure\n{}\n", diag));
        }
        user.push_str("\nRespond with JSON only.");

        let response: SetupCommandsResponse = infer_json(
            self.inference.as_ref(),
            InferenceRequest::new(SETUP_SYSTEM_PROMPT, user, ModelSettings::standard()),
        )
        .await?;
        Ok(response.commands)
    }

    // ── Phase generation ─────────────────────────────────────────────

    async fn generate_phases(&self, instance_id: &str) -> Result<()> {
        let total = self.actor.full_state().await.phases.len();
        for index in 0..total {
            let snapshot = self.actor.full_state().await;
            if snapshot.blueprint.is_none() {
                return Err(crate::errors::SessionError::NotInitialized {
                    id: self.actor.id().to_string(),
                }
                .into());
            }
            if snapshot.phases[index].status == PhaseStatus::Implemented {
                continue;
            }
            if !snapshot.can_generate_phase(index) {
                return Err(PhaseError::OutOfOrder {
                    phase: index,
                    blocking: index.saturating_sub(1),
                }
                .into());
            }

            self.generate_phase(&snapshot, index, instance_id).await?;

            if snapshot.mode == SessionMode::Assisted && index + 1 < total {
                // Assisted sessions park a review question; the pipeline
                // does not block on the answer.
                self.actor
                    .update(move |s| {
                        s.pending_inputs.push(PendingUserInput {
                            id: uuid::Uuid::new_v4().to_string(),
                            prompt: format!(
                                "Phase {} is implemented. Any adjustments before phase {}?",
                                index,
                                index + 1
                            ),
                            created_at: chrono::Utc::now(),
                        });
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn generate_phase(
        &self,
        snapshot: &SessionState,
        index: usize,
        instance_id: &str,
    ) -> Result<()> {
        self.actor
            .update(move |s| {
                s.phases[index].status = PhaseStatus::Generating;
                s.dev_state = DevState::PhaseGenerating { phase: index };
            })
            .await?;
        self.emit_phase_update(index).await;

        let mut last_error = String::from("no attempts made");
        for attempt in 1..=self.limits.phase_retries {
            self.actor
                .update(move |s| s.phases[index].attempts += 1)
                .await?;

            match self
                .generate_phase_files(snapshot, index, &last_error, attempt)
                .await
            {
                Ok(files) if !files.is_empty() => {
                    self.apply_phase_files(index, files, instance_id).await?;
                    return Ok(());
                }
                Ok(_) => {
                    last_error = PhaseError::EmptyOutput { phase: index }.to_string();
                    warn!(
                        "phase {} attempt {} produced no usable files",
                        index, attempt
                    );
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!("phase {} attempt {} failed: {}", index, attempt, e);
                }
            }
        }

        self.actor
            .update(move |s| s.phases[index].status = PhaseStatus::Failed)
            .await?;
        self.emit_phase_update(index).await;
        Err(PhaseError::RetriesExhausted {
            phase: index,
            attempts: self.limits.phase_retries,
            message: last_error,
        }
        .into())
    }

    async fn generate_phase_files(
        &self,
        snapshot: &SessionState,
        index: usize,
        last_error: &str,
        attempt: u32,
    ) -> Result<Vec<PhaseFileOut>, PhaseError> {
        // Presence is checked once per phase in `generate_phases`.
        let Some(blueprint) = snapshot.blueprint.as_ref() else {
            return Err(PhaseError::EmptyOutput { phase: index });
        };
        let plan = &blueprint.phases[index];

        let planned = plan
            .files
            .iter()
            .map(|f| format!("- {}: {}", f.path, f.purpose))
            .collect::<Vec<_>>()
            .join("\n");
        let existing = snapshot
            .files
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        let mut user = format!(
            "## Product request\n{}\n\n## Blueprint\n{} — {}\n\n## Phase {}: {}\n{}\n\nPlanned files:\n{}\n\nAlready generated files:\n{}\n",
            snapshot.query,
            blueprint.title,
            blueprint.description,
            index,
            plan.name,
            plan.description,
            planned,
            if existing.is_empty() { "(none)" } else { &existing },
        );
        if attempt > 1 {
            user.push_str(&format!("\n## Previous attempt failed\n{}\n", last_error));
        }
        user.push_str("\nRespond with JSON only.");

        // Phase 0 lays down the whole skeleton and gets the large-output,
        // low-temperature profile.
        let settings = if index == 0 {
            ModelSettings::high_fidelity()
        } else {
            ModelSettings::standard()
        };

        let response: PhaseFilesResponse = infer_json(
            self.inference.as_ref(),
            InferenceRequest::new(PHASE_SYSTEM_PROMPT, user, settings),
        )
        .await?;

        Ok(response
            .files
            .into_iter()
            .filter(|f| {
                !f.path.trim().is_empty()
                    && !f.contents.is_empty()
                    && !is_disallowed_artifact(&f.path)
            })
            .collect())
    }

    async fn apply_phase_files(
        &self,
        index: usize,
        files: Vec<PhaseFileOut>,
        instance_id: &str,
    ) -> Result<()> {
        let sandbox_files: Vec<SandboxFile> = files
            .iter()
            .map(|f| SandboxFile {
                path: f.path.clone(),
                contents: f.contents.clone(),
            })
            .collect();

        self.actor
            .update(move |s| {
                s.dev_state = DevState::PhaseImplementing { phase: index };
                for f in &files {
                    s.record_file(GeneratedFile::new(&f.path, &f.contents, &f.purpose));
                }
            })
            .await?;

        self.sandbox.write_files(instance_id, &sandbox_files).await?;

        self.actor
            .update(move |s| {
                s.phases[index].status = PhaseStatus::Implemented;
                s.dev_state = DevState::PhaseComplete { phase: index };
                let note = format!(
                    "Phase {} implemented: {}",
                    index, s.phases[index].description
                );
                s.push_message(MessageRole::Assistant, &note);
            })
            .await?;
        self.emit_phase_update(index).await;
        info!("session {} implemented phase {}", self.actor.id(), index);
        Ok(())
    }

    async fn emit_phase_update(&self, index: usize) {
        let snapshot = self.actor.full_state().await;
        if let Some(phase) = snapshot.phases.get(index) {
            self.actor.emit(SessionEvent::PhaseUpdate {
                phase: phase.clone(),
            });
        }
    }

    // ── Monitoring + fix loop ────────────────────────────────────────

    async fn monitor_and_fix(&self, instance_id: &str) -> Result<()> {
        self.actor
            .update(|s| s.dev_state = DevState::Monitoring)
            .await?;

        let mut fixer = CodeFixer::new(Arc::clone(&self.inference), self.limits.fix_attempts);
        // Repeated identical errors exhaust their per-signature budget; the
        // round cap guards against an endless stream of novel errors.
        let max_rounds = self.limits.fix_attempts.saturating_mul(2).max(1);

        for _round in 0..max_rounds {
            let signals = self.collect_signals(instance_id).await?;
            if signals.is_empty() {
                return Ok(());
            }

            self.actor
                .update(|s| s.dev_state = DevState::FixingCode)
                .await?;
            let state = self.actor.full_state().await;

            let mut patches: Vec<FilePatch> = Vec::new();
            for signal in &signals {
                match fixer.attempt_fix(signal, &state).await? {
                    FixOutcome::Patched { files } => patches.extend(files),
                    FixOutcome::Exhausted { signature } => {
                        return Err(PhaseError::FixExhausted { signature }.into());
                    }
                    FixOutcome::NoTarget => {}
                }
            }

            // Client reports were consumed this round either way.
            self.actor.update(|s| s.client_errors.clear()).await?;

            if patches.is_empty() {
                break;
            }
            self.apply_patches(patches, instance_id).await?;
            self.actor
                .update(|s| s.dev_state = DevState::Monitoring)
                .await?;
        }

        // Errors are still outstanding; the channel hears about it instead
        // of observing a silent clean completion.
        let message = format!(
            "Monitoring ended with unresolved errors after {} fix rounds",
            max_rounds
        );
        warn!("session {}: {}", self.actor.id(), message);
        self.actor.emit(SessionEvent::Error { error: message });
        Ok(())
    }

    async fn collect_signals(&self, instance_id: &str) -> Result<Vec<ErrorSignal>> {
        let mut signals = Vec::new();

        for report in self.sandbox.instance_errors(instance_id).await? {
            signals.push(ErrorSignal {
                message: report.message,
                file_paths: report.file_path.into_iter().collect(),
                screenshot: None,
            });
        }

        let snapshot = self.actor.full_state().await;
        let paths: Vec<String> = snapshot.files.keys().cloned().collect();
        if !paths.is_empty() {
            for finding in self
                .sandbox
                .run_static_analysis(instance_id, &paths)
                .await?
            {
                let message = match &finding.rule {
                    Some(rule) => format!("[{}] {}", rule, finding.message),
                    None => finding.message.clone(),
                };
                signals.push(ErrorSignal {
                    message,
                    file_paths: vec![finding.file_path],
                    screenshot: None,
                });
            }
        }

        for report in &snapshot.client_errors {
            signals.push(ErrorSignal {
                message: report.message.clone(),
                file_paths: report.file_paths.clone(),
                screenshot: report.screenshot.clone(),
            });
        }

        Ok(signals)
    }

    async fn apply_patches(&self, patches: Vec<FilePatch>, instance_id: &str) -> Result<()> {
        let sandbox_files: Vec<SandboxFile> = patches
            .iter()
            .map(|p| SandboxFile {
                path: p.path.clone(),
                contents: p.contents.clone(),
            })
            .collect();

        self.actor
            .update(move |s| {
                for patch in &patches {
                    let purpose = s
                        .files
                        .get(&patch.path)
                        .map(|f| f.purpose.clone())
                        .unwrap_or_default();
                    s.record_file(GeneratedFile::new(&patch.path, &patch.contents, &purpose));
                }
            })
            .await?;

        self.sandbox.write_files(instance_id, &sandbox_files).await?;
        let deployed = self.sandbox.deploy(instance_id).await?;
        let url = deployed.preview_url.clone();
        self.actor
            .update(move |s| s.preview_url = Some(url))
            .await?;
        self.actor.emit(SessionEvent::Preview {
            preview_url: deployed.preview_url,
            tunnel_url: deployed.tunnel_url,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::errors::{InferenceError, SandboxError};
    use crate::sandbox::{
        AnalysisFinding, CommandResult, DeployResult, RuntimeErrorReport, TemplateInfo,
    };
    use crate::session::state::TemplateDetails;
    use crate::session::store::SessionStore;

    /// Pops one canned response per completion call.
    struct ScriptedClient {
        responses: Mutex<VecDeque<String>>,
    }

    impl ScriptedClient {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl InferenceClient for ScriptedClient {
        async fn complete(&self, _req: InferenceRequest) -> Result<String, InferenceError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(InferenceError::Empty)
        }
    }

    #[derive(Default)]
    struct StubSandbox {
        written: Mutex<Vec<SandboxFile>>,
        executed: Mutex<Vec<String>>,
        // When set, every poll reports a fresh, never-seen-before error.
        emit_novel_errors: AtomicBool,
        error_counter: AtomicUsize,
    }

    #[async_trait]
    impl SandboxGateway for StubSandbox {
        async fn list_templates(&self) -> Result<Vec<TemplateInfo>, SandboxError> {
            Ok(vec![TemplateInfo {
                name: "vite-react".into(),
                description: "React starter".into(),
            }])
        }
        async fn template_details(&self, name: &str) -> Result<TemplateDetails, SandboxError> {
            Ok(TemplateDetails {
                name: name.into(),
                description: "React starter".into(),
                files: vec!["package.json".into()],
            })
        }
        async fn create_instance(&self, _template: &str) -> Result<String, SandboxError> {
            Ok("inst-1".into())
        }
        async fn write_files(
            &self,
            _instance_id: &str,
            files: &[SandboxFile],
        ) -> Result<(), SandboxError> {
            self.written.lock().unwrap().extend(files.iter().cloned());
            Ok(())
        }
        async fn execute_commands(
            &self,
            _instance_id: &str,
            commands: &[String],
            _timeout: Duration,
        ) -> Result<Vec<CommandResult>, SandboxError> {
            self.executed.lock().unwrap().extend(commands.iter().cloned());
            Ok(commands
                .iter()
                .map(|c| CommandResult {
                    command: c.clone(),
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: false,
                })
                .collect())
        }
        async fn instance_errors(
            &self,
            _instance_id: &str,
        ) -> Result<Vec<RuntimeErrorReport>, SandboxError> {
            if self.emit_novel_errors.load(Ordering::SeqCst) {
                let n = self.error_counter.fetch_add(1, Ordering::SeqCst);
                return Ok(vec![RuntimeErrorReport {
                    message: format!("ReferenceError: widget{} is not defined", n),
                    file_path: Some("src/App.tsx".into()),
                    line: None,
                }]);
            }
            Ok(vec![])
        }
        async fn run_static_analysis(
            &self,
            _instance_id: &str,
            _files: &[String],
        ) -> Result<Vec<AnalysisFinding>, SandboxError> {
            Ok(vec![])
        }
        async fn deploy(&self, _instance_id: &str) -> Result<DeployResult, SandboxError> {
            Ok(DeployResult {
                preview_url: "https://app-1.preview.example".into(),
                tunnel_url: None,
            })
        }
        async fn shutdown(&self, _instance_id: &str) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    fn actor() -> Arc<SessionActor> {
        SessionActor::new(
            SessionState::new("s1", "a todo app"),
            SessionStore::in_memory().unwrap(),
        )
    }

    const TEMPLATE_CHOICE: &str = r#"{"template": "vite-react"}"#;
    const BLUEPRINT: &str = r#"{
        "title": "Todo App",
        "description": "Simple todo tracker",
        "phases": [
            {"name": "skeleton", "description": "Project skeleton",
             "files": [{"path": "src/App.tsx", "purpose": "root component"}]},
            {"name": "storage", "description": "Persistence",
             "files": [{"path": "src/store.ts", "purpose": "state store"}]}
        ]
    }"#;
    const SETUP: &str = r#"{"commands": ["npm install"]}"#;
    const PHASE0: &str = r#"{"files": [{"path": "src/App.tsx", "purpose": "root", "contents": "export const App = 1"}]}"#;
    const PHASE1: &str = r#"{"files": [{"path": "src/store.ts", "purpose": "store", "contents": "export const store = 1"}]}"#;

    #[tokio::test]
    async fn test_happy_path_runs_to_completed() {
        let actor = actor();
        let inference = ScriptedClient::new(&[TEMPLATE_CHOICE, BLUEPRINT, SETUP, PHASE0, PHASE1]);
        let sandbox = Arc::new(StubSandbox::default());
        let orchestrator = Orchestrator::new(
            Arc::clone(&actor),
            inference,
            Arc::clone(&sandbox) as Arc<dyn SandboxGateway>,
            &LoomConfig::default(),
        );

        orchestrator.run().await.unwrap();

        let state = actor.full_state().await;
        assert_eq!(state.dev_state, DevState::Completed);
        assert!(!state.generation_in_flight);
        assert_eq!(state.sandbox_instance_id.as_deref(), Some("inst-1"));
        assert_eq!(
            state.preview_url.as_deref(),
            Some("https://app-1.preview.example")
        );
        assert!(state
            .phases
            .iter()
            .all(|p| p.status == PhaseStatus::Implemented));
        assert!(state.files.contains_key("src/App.tsx"));
        assert!(state.files.contains_key("src/store.ts"));

        assert_eq!(sandbox.executed.lock().unwrap().as_slice(), ["npm install"]);
        assert_eq!(sandbox.written.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_novel_error_stream_surfaces_error_event_at_round_cap() {
        let actor = actor();
        actor
            .update(|s| {
                s.record_file(GeneratedFile::new("src/App.tsx", "old", "root"));
            })
            .await
            .unwrap();

        let patch = r#"{"files": [{"path": "src/App.tsx", "contents": "patched"}]}"#;
        // Every round produces a fresh signature, so the per-signature
        // budget never trips; only the round cap can end the loop.
        let inference = ScriptedClient::new(&[patch; 6]);
        let sandbox = Arc::new(StubSandbox::default());
        sandbox.emit_novel_errors.store(true, Ordering::SeqCst);
        let orchestrator = Orchestrator::new(
            Arc::clone(&actor),
            inference,
            Arc::clone(&sandbox) as Arc<dyn SandboxGateway>,
            &LoomConfig::default(),
        );

        let mut rx = actor.subscribe();
        orchestrator.monitor_and_fix("inst-1").await.unwrap();

        let mut unresolved_error = None;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Error { error } = event {
                unresolved_error = Some(error);
            }
        }
        let error = unresolved_error.expect("round-cap exit must emit an error event");
        assert!(error.contains("unresolved errors"));
    }

    #[tokio::test]
    async fn test_assisted_mode_parks_review_question_between_phases() {
        let actor = actor();
        actor
            .update(|s| s.mode = SessionMode::Assisted)
            .await
            .unwrap();
        let inference = ScriptedClient::new(&[TEMPLATE_CHOICE, BLUEPRINT, SETUP, PHASE0, PHASE1]);
        let sandbox = Arc::new(StubSandbox::default());
        let orchestrator = Orchestrator::new(
            Arc::clone(&actor),
            inference,
            sandbox as Arc<dyn SandboxGateway>,
            &LoomConfig::default(),
        );

        orchestrator.run().await.unwrap();

        let state = actor.full_state().await;
        assert_eq!(state.dev_state, DevState::Completed);
        // One question per phase boundary; none after the last phase.
        assert_eq!(state.pending_inputs.len(), 1);
        assert!(state.pending_inputs[0].prompt.contains("Phase 0"));
        assert!(!state.pending_inputs[0].id.is_empty());
    }

    #[tokio::test]
    async fn test_phase_retries_exhausted_marks_failed() {
        let actor = actor();
        // Planning succeeds; every phase-0 attempt returns unusable output.
        let inference = ScriptedClient::new(&[
            TEMPLATE_CHOICE,
            BLUEPRINT,
            SETUP,
            "not json",
            "still not json",
            "nope",
        ]);
        let sandbox = Arc::new(StubSandbox::default());
        let orchestrator = Orchestrator::new(
            Arc::clone(&actor),
            inference,
            sandbox as Arc<dyn SandboxGateway>,
            &LoomConfig::default(),
        );

        let err = orchestrator.run().await.unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));

        let state = actor.full_state().await;
        assert_eq!(state.dev_state, DevState::Failed);
        assert!(!state.generation_in_flight);
        assert_eq!(state.phases[0].status, PhaseStatus::Failed);
        assert_eq!(state.phases[0].attempts, 3);
        // Phase 1 never started
        assert_eq!(state.phases[1].status, PhaseStatus::Planned);
    }

    #[tokio::test]
    async fn test_retry_after_empty_attempt_succeeds() {
        let actor = actor();
        let inference = ScriptedClient::new(&[
            TEMPLATE_CHOICE,
            BLUEPRINT,
            SETUP,
            r#"{"files": []}"#,
            PHASE0,
            PHASE1,
        ]);
        let sandbox = Arc::new(StubSandbox::default());
        let orchestrator = Orchestrator::new(
            Arc::clone(&actor),
            inference,
            sandbox as Arc<dyn SandboxGateway>,
            &LoomConfig::default(),
        );

        orchestrator.run().await.unwrap();

        let state = actor.full_state().await;
        assert_eq!(state.dev_state, DevState::Completed);
        assert_eq!(state.phases[0].attempts, 2);
        assert_eq!(state.phases[1].attempts, 1);
    }

    #[tokio::test]
    async fn test_disallowed_artifacts_filtered_from_phase_output() {
        let actor = actor();
        let phase0_with_binary = r#"{"files": [
            {"path": "src/App.tsx", "purpose": "root", "contents": "export const App = 1"},
            {"path": "public/logo.png", "purpose": "logo", "contents": "xxxx"}
        ]}"#;
        let inference = ScriptedClient::new(&[
            TEMPLATE_CHOICE,
            BLUEPRINT,
            SETUP,
            phase0_with_binary,
            PHASE1,
        ]);
        let sandbox = Arc::new(StubSandbox::default());
        let orchestrator = Orchestrator::new(
            Arc::clone(&actor),
            inference,
            Arc::clone(&sandbox) as Arc<dyn SandboxGateway>,
            &LoomConfig::default(),
        );

        orchestrator.run().await.unwrap();

        let state = actor.full_state().await;
        assert!(state.files.contains_key("src/App.tsx"));
        assert!(!state.files.contains_key("public/logo.png"));
    }

    #[tokio::test]
    async fn test_second_run_rejected_while_first_claimed() {
        let actor = actor();
        actor.begin_generation().await.unwrap();

        let inference = ScriptedClient::new(&[]);
        let sandbox = Arc::new(StubSandbox::default());
        let orchestrator = Orchestrator::new(
            Arc::clone(&actor),
            inference,
            sandbox as Arc<dyn SandboxGateway>,
            &LoomConfig::default(),
        );

        let err = orchestrator.run().await.unwrap_err();
        assert!(err.to_string().contains("already in flight"));
        // The rejected run must not clear the owner's flag
        assert!(actor.full_state().await.generation_in_flight);
    }

    #[tokio::test]
    async fn test_events_emitted_in_pipeline_order() {
        let actor = actor();
        let mut rx = actor.subscribe();

        let inference = ScriptedClient::new(&[TEMPLATE_CHOICE, BLUEPRINT, SETUP, PHASE0, PHASE1]);
        let sandbox = Arc::new(StubSandbox::default());
        let orchestrator = Orchestrator::new(
            Arc::clone(&actor),
            inference,
            sandbox as Arc<dyn SandboxGateway>,
            &LoomConfig::default(),
        );
        orchestrator.run().await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                SessionEvent::State { .. } => "state",
                SessionEvent::PhaseUpdate { .. } => "phase_update",
                SessionEvent::Preview { .. } => "preview",
                SessionEvent::Error { .. } => "error",
                SessionEvent::Terminate => "terminate",
            });
        }
        // Two phases, each announced when generation starts and when it
        // completes, then the preview, then terminate.
        assert_eq!(
            kinds,
            vec![
                "phase_update",
                "phase_update",
                "phase_update",
                "phase_update",
                "preview",
                "terminate"
            ]
        );
    }
}
