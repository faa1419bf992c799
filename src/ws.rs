//! Control channel gateway — one upgraded duplex connection per
//! client–session pairing.
//!
//! The session actor is the single writer on its event bus; this module
//! subscribes a WebSocket to that bus, replays the full state snapshot on
//! connect, then forwards live events in emission order. Multiple clients
//! may attach read-only; only the controlling client's commands are acted
//! on.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::server::SharedState;
use crate::session::actor::SessionActor;
use crate::session::state::{Phase, SessionState};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Event types ──────────────────────────────────────────────────────

/// Events emitted by a session actor and delivered over the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Full snapshot, replayed first on every (re)connect.
    State { state: Box<SessionState> },
    PhaseUpdate {
        phase: Phase,
    },
    Preview {
        #[serde(rename = "previewURL")]
        preview_url: String,
        #[serde(rename = "tunnelURL", skip_serializing_if = "Option::is_none")]
        tunnel_url: Option<String>,
    },
    Error {
        error: String,
    },
    Terminate,
}

/// Commands accepted from the controlling client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Preview {
        #[serde(rename = "agentId")]
        agent_id: String,
    },
}

/// Publish an event on a session's bus. Returns silently when no clients
/// are attached.
pub fn emit_event(tx: &broadcast::Sender<SessionEvent>, event: SessionEvent) {
    let _ = tx.send(event);
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn session_ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let actor = match state.registry.resolve(&id, false).await {
            Ok(actor) => actor,
            Err(e) => {
                warn!("control channel rejected for session {}: {}", id, e);
                let mut socket = socket;
                let msg = serde_json::to_string(&SessionEvent::Error {
                    error: e.to_string(),
                })
                .unwrap_or_default();
                let _ = socket.send(Message::Text(msg.into())).await;
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        };
        handle_socket(socket, actor, state).await;
    })
}

async fn handle_socket(socket: WebSocket, actor: Arc<SessionActor>, state: SharedState) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let controlling = actor.claim_control(&client_id);
    debug!(
        "client {} attached to session {} (controlling: {})",
        client_id,
        actor.id(),
        controlling
    );

    let (mut sender, receiver) = socket.split();

    // Subscribe before reading the snapshot: an event emitted between the
    // two shows up in the stream (worst case duplicating snapshot content)
    // instead of falling into the gap and being lost.
    let rx = actor.subscribe();
    let snapshot = actor.full_state().await;
    let snapshot_msg = serde_json::to_string(&SessionEvent::State {
        state: Box::new(snapshot),
    });
    match snapshot_msg {
        Ok(msg) => {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                actor.release_control(&client_id);
                return;
            }
        }
        Err(e) => {
            warn!("failed to serialize snapshot for session {}: {}", actor.id(), e);
        }
    }

    run_socket_loop(sender, receiver, rx, &actor, &state, &client_id).await;
    actor.release_control(&client_id);
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines event forwarding, client command handling, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection is
/// considered dead and the loop exits. A disconnect never cancels in-flight
/// generation — that work is owned by the session, not the connection.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<SessionEvent>,
    actor: &Arc<SessionActor>,
    state: &SharedState,
    client_id: &str,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Event forwarding ────────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let terminal = matches!(event, SessionEvent::Terminate);
                        match serde_json::to_string(&event) {
                            Ok(msg) => {
                                if sender.send(Message::Text(msg.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("failed to serialize session event: {}", e);
                            }
                        }
                        if terminal {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed some events; continue receiving
                        continue;
                    }
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_client_command(&text, actor, state, client_id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore Binary and Ping frames from the client
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

async fn handle_client_command(
    text: &str,
    actor: &Arc<SessionActor>,
    state: &SharedState,
    client_id: &str,
) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(cmd) => cmd,
        Err(e) => {
            debug!("ignoring unparseable client command: {}", e);
            return;
        }
    };

    if !actor.is_controlling(client_id) {
        debug!(
            "ignoring command from non-controlling client {} on session {}",
            client_id,
            actor.id()
        );
        return;
    }

    match command {
        ClientCommand::Preview { agent_id } => {
            debug!("preview requested by agent {} for session {}", agent_id, actor.id());
            let actor = Arc::clone(actor);
            let sandbox = Arc::clone(&state.sandbox);
            tokio::spawn(async move {
                if let Err(e) = actor.deploy_to_sandbox(sandbox.as_ref()).await {
                    actor.emit(SessionEvent::Error {
                        error: format!("deploy failed: {:#}", e),
                    });
                }
            });
        }
    }
}
