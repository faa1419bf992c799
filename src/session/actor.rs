//! The session actor — addressable, durable, single-writer owner of one
//! project's lifecycle.
//!
//! All mutating operations funnel through [`SessionActor::update`] /
//! [`SessionActor::try_update`], which hold the write lock while the bumped
//! snapshot is persisted, making write serialization explicit. Reads take
//! the read lock only and are never blocked by in-flight generation: the
//! orchestrator never holds the lock across a remote call. Compound
//! operations (deploy, push) additionally serialize on `ops` so two of them
//! cannot interleave their lock/call/lock sequences.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::info;

use crate::errors::SessionError;
use crate::export::{self, ExportRequest};
use crate::sandbox::{DeployResult, SandboxFile, SandboxGateway};
use crate::ws::{emit_event, SessionEvent};

use super::state::{
    Blueprint, ClientReportedError, DevState, MessageRole, Phase, SessionMode, SessionProgress,
    SessionState, SessionView, TemplateDetails,
};
use super::store::SessionStore;

/// Capacity of the per-session event bus.
const EVENT_BUS_CAPACITY: usize = 256;

/// Everything needed for the one-time transition out of `Uninitialized`.
#[derive(Debug, Clone)]
pub struct InitializeSession {
    pub query: String,
    pub blueprint: Blueprint,
    pub template: TemplateDetails,
    pub hostname: Option<String>,
    pub owner_id: Option<String>,
    pub mode: SessionMode,
}

#[derive(Debug)]
pub struct SessionActor {
    id: String,
    state: RwLock<SessionState>,
    store: SessionStore,
    events: broadcast::Sender<SessionEvent>,
    /// Serializes compound mutating operations (deploy, push).
    ops: Mutex<()>,
    controlling_client: std::sync::Mutex<Option<String>>,
}

impl SessionActor {
    pub fn new(state: SessionState, store: SessionStore) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Arc::new(Self {
            id: state.id.clone(),
            state: RwLock::new(state),
            store,
            events,
            ops: Mutex::new(()),
            controlling_client: std::sync::Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ── Event bus ────────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        emit_event(&self.events, event);
    }

    // ── Control-client arbitration ───────────────────────────────────

    /// First client to claim becomes the controlling client; later claims
    /// attach read-only. Returns whether `client_id` is controlling.
    pub fn claim_control(&self, client_id: &str) -> bool {
        let mut guard = self.controlling_client.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_deref() {
            None => {
                *guard = Some(client_id.to_string());
                true
            }
            Some(current) => current == client_id,
        }
    }

    pub fn is_controlling(&self, client_id: &str) -> bool {
        let guard = self.controlling_client.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_deref() == Some(client_id)
    }

    /// Release control on disconnect so the next attaching client can take
    /// over. In-flight generation is unaffected — it is owned by the
    /// session, not the connection.
    pub fn release_control(&self, client_id: &str) {
        let mut guard = self.controlling_client.lock().unwrap_or_else(|e| e.into_inner());
        if guard.as_deref() == Some(client_id) {
            *guard = None;
        }
    }

    // ── Serialized mutation ──────────────────────────────────────────

    /// Apply a mutation, bump the version counter, and persist the snapshot
    /// while still holding the write lock. Returns the new version.
    pub async fn update<F>(&self, f: F) -> Result<u64, SessionError>
    where
        F: FnOnce(&mut SessionState),
    {
        self.try_update(|state| {
            f(state);
            Ok(())
        })
        .await?;
        Ok(self.state.read().await.version)
    }

    /// Like [`Self::update`] but the mutation may reject, in which case no
    /// version bump and no persistence happen.
    pub async fn try_update<F, T>(&self, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(&mut SessionState) -> Result<T, SessionError>,
    {
        let mut guard = self.state.write().await;
        let out = f(&mut guard)?;
        guard.version += 1;
        let snapshot = guard.clone();
        self.store
            .save(snapshot)
            .await
            .map_err(SessionError::Store)?;
        Ok(out)
    }

    // ── Reads (never reject, never blocked by generation) ────────────

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.is_initialized()
    }

    pub async fn full_state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn view(&self) -> SessionView {
        self.state.read().await.view()
    }

    pub async fn progress(&self) -> SessionProgress {
        self.state.read().await.progress()
    }

    // ── Operations ───────────────────────────────────────────────────

    /// One-time transition out of `Uninitialized`. Builds the phase list
    /// from the blueprint and seeds the conversation log.
    pub async fn initialize(&self, init: InitializeSession) -> Result<(), SessionError> {
        let id = self.id.clone();
        self.try_update(move |state| {
            if state.is_initialized() {
                return Err(SessionError::AlreadyInitialized { id });
            }
            state.query = init.query.clone();
            state.phases = init
                .blueprint
                .phases
                .iter()
                .enumerate()
                .map(|(i, plan)| Phase::from_plan(i, plan))
                .collect();
            state.push_message(MessageRole::User, &init.query);
            state.push_message(
                MessageRole::Assistant,
                &format!(
                    "Blueprint '{}': {} phases planned from template '{}'",
                    init.blueprint.title,
                    init.blueprint.phases.len(),
                    init.template.name
                ),
            );
            state.blueprint = Some(init.blueprint);
            state.template = Some(init.template);
            state.hostname = init.hostname;
            state.owner_id = init.owner_id;
            state.mode = init.mode;
            state.dev_state = DevState::BlueprintReady;
            Ok(())
        })
        .await?;
        info!("session {} initialized", self.id);
        Ok(())
    }

    /// Claim the in-flight flag. A second "start" while generation is in
    /// flight is rejected as retryable — it never produces a second
    /// independent pipeline.
    pub async fn begin_generation(&self) -> Result<(), SessionError> {
        let id = self.id.clone();
        self.try_update(move |state| {
            if state.generation_in_flight {
                return Err(SessionError::GenerationInFlight { id });
            }
            state.generation_in_flight = true;
            Ok(())
        })
        .await
    }

    /// Clear the in-flight flag. Called on every generation exit path,
    /// success or failure.
    pub async fn finish_generation(&self) {
        // Best effort: a store failure here must not mask the original
        // generation outcome.
        let _ = self
            .update(|state| {
                state.generation_in_flight = false;
            })
            .await;
    }

    pub async fn record_client_error(&self, error: ClientReportedError) -> Result<u64, SessionError> {
        self.update(move |state| {
            // Implicated files carry the flags until a patch overwrites them.
            for path in &error.file_paths {
                if let Some(file) = state.files.get_mut(path) {
                    file.has_errors = true;
                    file.needs_fixing = true;
                }
            }
            state.client_errors.push(error);
        })
        .await
    }

    /// Idempotent: returns the existing live preview or provisions one.
    /// A fork starts unbound, so this may rebuild the sandbox from the
    /// session's file map without losing any session state.
    pub async fn deploy_to_sandbox(&self, sandbox: &dyn SandboxGateway) -> Result<DeployResult> {
        let _op = self.ops.lock().await;

        let snapshot = self.full_state().await;
        if !snapshot.is_initialized() {
            return Err(SessionError::NotInitialized { id: self.id.clone() }.into());
        }
        if let Some(url) = snapshot.preview_url {
            return Ok(DeployResult {
                preview_url: url,
                tunnel_url: None,
            });
        }

        let instance_id = match snapshot.sandbox_instance_id {
            Some(id) => id,
            None => {
                let template = snapshot
                    .template
                    .as_ref()
                    .ok_or(SessionError::NoSandboxInstance)?;
                let instance_id = sandbox
                    .create_instance(&template.name)
                    .await
                    .context("Failed to provision sandbox instance")?;
                let files: Vec<SandboxFile> = snapshot
                    .files
                    .values()
                    .map(|f| SandboxFile {
                        path: f.path.clone(),
                        contents: f.contents.clone(),
                    })
                    .collect();
                if !files.is_empty() {
                    sandbox
                        .write_files(&instance_id, &files)
                        .await
                        .context("Failed to seed sandbox instance")?;
                }
                let bound = instance_id.clone();
                self.update(move |state| {
                    state.sandbox_instance_id = Some(bound);
                })
                .await?;
                instance_id
            }
        };

        let deployed = sandbox
            .deploy(&instance_id)
            .await
            .context("Failed to deploy sandbox instance")?;
        let url = deployed.preview_url.clone();
        self.update(move |state| {
            state.preview_url = Some(url);
        })
        .await?;
        self.emit(SessionEvent::Preview {
            preview_url: deployed.preview_url.clone(),
            tunnel_url: deployed.tunnel_url.clone(),
        });
        info!("session {} deployed at {}", self.id, deployed.preview_url);
        Ok(deployed)
    }

    /// Best-effort export of the generated app to an external repository,
    /// independent of generation state. Failure surfaces to the caller but
    /// never corrupts session state.
    pub async fn push_to_external_repo(
        &self,
        request: ExportRequest,
        sandbox: &dyn SandboxGateway,
    ) -> Result<String> {
        let _op = self.ops.lock().await;

        let snapshot = self.full_state().await;
        let instance_id = snapshot
            .sandbox_instance_id
            .clone()
            .ok_or(SessionError::NoSandboxInstance)?;

        let summary = export::push_to_repo(sandbox, &instance_id, &request).await?;
        // Record the export in the conversation log only after it succeeded.
        self.update(|state| {
            state.push_message(MessageRole::Assistant, &summary);
        })
        .await?;
        Ok(summary)
    }
}
