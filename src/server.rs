//! HTTP API and server wiring.
//!
//! Thin handlers over the registry and session actors. Generation runs in a
//! spawned task; the create/generate endpoints claim the in-flight flag
//! before spawning so a concurrent start is rejected synchronously with 409.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::LoomConfig;
use crate::errors::SessionError;
use crate::export::ExportRequest;
use crate::inference::{HttpInferenceClient, InferenceClient};
use crate::orchestrator::Orchestrator;
use crate::sandbox::{SandboxGateway, SandboxHttpClient};
use crate::session::actor::SessionActor;
use crate::session::registry::{HttpLocator, SessionLocator, SessionRegistry};
use crate::session::state::{ClientReportedError, SessionMode};
use crate::session::store::SessionStore;

pub struct AppState {
    pub registry: SessionRegistry,
    pub inference: Arc<dyn InferenceClient>,
    pub sandbox: Arc<dyn SandboxGateway>,
    pub config: LoomConfig,
}

pub type SharedState = Arc<AppState>;

// ── Error mapping ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Session(SessionError),
    Internal(anyhow::Error),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self::Session(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        // Session errors keep their status mapping even when they arrive
        // wrapped in an operation's error chain.
        match err.downcast::<SessionError>() {
            Ok(session) => Self::Session(session),
            Err(other) => Self::Internal(other),
        }
    }
}

impl From<crate::errors::SandboxError> for ApiError {
    fn from(err: crate::errors::SandboxError) -> Self {
        Self::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Session(err) => {
                let status = match &err {
                    SessionError::NotFound { .. } => StatusCode::NOT_FOUND,
                    SessionError::GenerationInFlight { .. }
                    | SessionError::AlreadyInitialized { .. }
                    | SessionError::NotInitialized { .. }
                    | SessionError::NoSandboxInstance => StatusCode::CONFLICT,
                    SessionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
            Self::Internal(err) => {
                error!("internal error: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err))
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ── Request/response shapes ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAppRequest {
    query: String,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default)]
    mode: Option<SessionMode>,
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    #[serde(default)]
    search_regions: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportErrorRequest {
    error: String,
    #[serde(default)]
    file_paths: Vec<String>,
    #[serde(default)]
    screenshot: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_templates(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let templates = state.sandbox.list_templates().await?;
    Ok(Json(templates).into_response())
}

async fn list_apps(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let ids = state.registry.list_ids().await?;
    Ok(Json(serde_json::json!({ "ids": ids })).into_response())
}

async fn create_app(
    State(state): State<SharedState>,
    Json(req): Json<CreateAppRequest>,
) -> Result<Response, ApiError> {
    if req.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".into()));
    }

    let actor = state.registry.create(&req.query).await?;
    actor
        .update(move |s| {
            s.hostname = req.hostname;
            s.owner_id = req.owner_id;
            if let Some(mode) = req.mode {
                s.mode = mode;
            }
        })
        .await?;

    actor.begin_generation().await?;
    spawn_pipeline(&state, &actor);

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": actor.id() })),
    )
        .into_response())
}

/// Start (or resume) generation on an existing session. Returns 409 while a
/// pipeline is already in flight.
async fn generate_app(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let actor = state.registry.resolve(&id, false).await?;
    actor.begin_generation().await?;
    spawn_pipeline(&state, &actor);
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "id": actor.id() })),
    )
        .into_response())
}

async fn get_app(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<ResolveQuery>,
) -> Result<Response, ApiError> {
    let actor = state.registry.resolve(&id, query.search_regions).await?;
    Ok(Json(actor.view().await).into_response())
}

async fn get_app_full(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let actor = state.registry.resolve(&id, false).await?;
    Ok(Json(actor.full_state().await).into_response())
}

async fn get_app_progress(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let actor = state.registry.resolve(&id, false).await?;
    Ok(Json(actor.progress().await).into_response())
}

async fn deploy_app(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let actor = state.registry.resolve(&id, false).await?;
    let deployed = actor.deploy_to_sandbox(state.sandbox.as_ref()).await?;
    Ok(Json(deployed).into_response())
}

async fn push_app(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ExportRequest>,
) -> Result<Response, ApiError> {
    let actor = state.registry.resolve(&id, false).await?;
    let summary = actor
        .push_to_external_repo(req, state.sandbox.as_ref())
        .await?;
    Ok(Json(serde_json::json!({ "message": summary })).into_response())
}

async fn clone_app(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let fork = state.registry.clone_session(&id).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": fork.id() })),
    )
        .into_response())
}

async fn report_error(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ReportErrorRequest>,
) -> Result<Response, ApiError> {
    if req.error.trim().is_empty() {
        return Err(ApiError::BadRequest("error must not be empty".into()));
    }
    let actor = state.registry.resolve(&id, false).await?;
    actor
        .record_client_error(ClientReportedError {
            message: req.error,
            file_paths: req.file_paths,
            screenshot: req.screenshot,
            reported_at: chrono::Utc::now(),
        })
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Remove a session, shutting its sandbox instance down first. Sandbox
/// teardown is best-effort; the session is removed either way.
async fn delete_app(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let actor = state.registry.resolve(&id, false).await?;
    if let Some(instance_id) = actor.full_state().await.sandbox_instance_id {
        if let Err(e) = state.sandbox.shutdown(&instance_id).await {
            warn!("sandbox shutdown failed for instance {}: {}", instance_id, e);
        }
    }
    state.registry.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn spawn_pipeline(state: &SharedState, actor: &Arc<SessionActor>) {
    let orchestrator = Orchestrator::new(
        Arc::clone(actor),
        Arc::clone(&state.inference),
        Arc::clone(&state.sandbox),
        &state.config,
    );
    let id = actor.id().to_string();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.run_claimed().await {
            error!("generation for session {} failed: {:#}", id, e);
        }
    });
}

// ── Router + server ──────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    let dev_mode = state.config.server.dev_mode;
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/templates", get(list_templates))
        .route("/api/apps", get(list_apps).post(create_app))
        .route("/api/apps/{id}", get(get_app).delete(delete_app))
        .route("/api/apps/{id}/full", get(get_app_full))
        .route("/api/apps/{id}/progress", get(get_app_progress))
        .route("/api/apps/{id}/generate", post(generate_app))
        .route("/api/apps/{id}/deploy", post(deploy_app))
        .route("/api/apps/{id}/push", post(push_app))
        .route("/api/apps/{id}/clone", post(clone_app))
        .route("/api/apps/{id}/errors", post(report_error))
        .route("/api/apps/{id}/ws", get(crate::ws::session_ws_handler))
        .with_state(state);

    if dev_mode {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

pub async fn start_server(config: LoomConfig) -> Result<()> {
    let store = SessionStore::open(&config.server.db_path)?;
    let locators: Vec<Arc<dyn SessionLocator>> = config
        .region_order()
        .into_iter()
        .map(|(name, url)| Arc::new(HttpLocator::new(&name, &url)) as Arc<dyn SessionLocator>)
        .collect();
    let registry = SessionRegistry::new(store).with_locators(locators);

    let inference: Arc<dyn InferenceClient> = Arc::new(HttpInferenceClient::new(
        &config.inference,
        config.inference_api_key(),
    ));
    let sandbox: Arc<dyn SandboxGateway> = Arc::new(SandboxHttpClient::new(&config.sandbox));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let state: SharedState = Arc::new(AppState {
        registry,
        inference,
        sandbox,
        config,
    });
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
