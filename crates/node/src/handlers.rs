//! HTTP surface of the orchestrator.
//!
//! | Route                       | Role     | Effect                             |
//! |-----------------------------|----------|------------------------------------|
//! | `POST /apps/hashes/check`   | operator | manual hash-sync pass              |
//! | `POST /apps/:name/remove`   | operator | uninstall under the removal flag   |
//! | `POST /dos/clear`           | operator | reset the DOS score after repair   |
//! | `GET  /health`              | none     | [`NodeHealth`] report              |
//! | `POST /peer/message`        | peer     | gossip inbox                       |
//! | `GET  /syncthing/deviceid`  | none     | storage device id for peers        |
//!
//! Every route except `/health` answers with an [`ApiEnvelope`].

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use tracing::{info, warn};

use skyfleet_proto::{ApiEnvelope, PeerMessage};

use crate::error::OrchestratorError;
use crate::hash_sync::HashSync;
use crate::health::NodeHealth;
use crate::inbox::{InboxOutcome, PeerInbox};
use crate::lifecycle::AppLifecycle;
use crate::now_ms;
use crate::replication::syncthing::StorageDaemon;
use crate::state::OrchestratorState;
use crate::store::AppDatabase;
use crate::transport::{PeerTransport, PEER_HEADER};

/// Header carrying the operator token.
pub const OPERATOR_HEADER: &str = "x-skyfleet-operator";

// ════════════════════════════════════════════════════════════════════════════
// ROLES
// ════════════════════════════════════════════════════════════════════════════

pub trait RoleVerifier: Send + Sync {
    fn is_operator(&self, headers: &HeaderMap) -> bool;
}

/// Operator role by shared token. Without a configured token nobody is
/// an operator.
pub struct TokenRoleVerifier {
    token: Option<String>,
}

impl TokenRoleVerifier {
    pub fn new(token: Option<String>) -> Self {
        Self { token: token.filter(|t| !t.is_empty()) }
    }
}

impl RoleVerifier for TokenRoleVerifier {
    fn is_operator(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.token else { return false };
        headers
            .get(OPERATOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == expected)
            .unwrap_or(false)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// APP STATE
// ════════════════════════════════════════════════════════════════════════════

pub struct NodeAppState {
    pub state: Arc<OrchestratorState>,
    pub db: Arc<dyn AppDatabase>,
    pub inbox: Arc<PeerInbox>,
    pub hash_sync: Arc<HashSync>,
    pub lifecycle: Arc<dyn AppLifecycle>,
    pub transport: Arc<dyn PeerTransport>,
    pub daemon: Option<Arc<dyn StorageDaemon>>,
    pub verifier: Arc<dyn RoleVerifier>,
    pub min_peers: usize,
}

type Reply = (StatusCode, Json<ApiEnvelope>);

fn reply(envelope: ApiEnvelope) -> Reply {
    let status = StatusCode::from_u16(envelope.data.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(envelope))
}

fn error_reply(error: &OrchestratorError) -> Reply {
    let (code, name) = match error {
        OrchestratorError::Busy(_) => (409, "Busy"),
        OrchestratorError::NotInstalled(_) => (404, "NotFound"),
        e if e.is_validation() => (422, "ValidationError"),
        _ => (500, "InternalError"),
    };
    reply(ApiEnvelope::error(code, name, error.to_string()))
}

// ════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ════════════════════════════════════════════════════════════════════════════

/// POST /apps/hashes/check
pub async fn check_hashes_handler(State(app): State<Arc<NodeAppState>>, headers: HeaderMap) -> Reply {
    if !app.verifier.is_operator(&headers) {
        return reply(ApiEnvelope::unauthorized());
    }
    match app.hash_sync.trigger().await {
        Ok(outcome) => reply(ApiEnvelope::success(format!("{:?}", outcome))),
        Err(e) => error_reply(&e),
    }
}

/// POST /apps/:name/remove
pub async fn remove_app_handler(
    State(app): State<Arc<NodeAppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Reply {
    if !app.verifier.is_operator(&headers) {
        return reply(ApiEnvelope::unauthorized());
    }
    if app.state.installation_in_progress() {
        return error_reply(&OrchestratorError::Busy("installation in progress"));
    }
    let Some(_guard) = app.state.try_begin_removal() else {
        return error_reply(&OrchestratorError::Busy("removal in progress"));
    };
    match app.lifecycle.uninstall(&name, "operator request").await {
        Ok(()) => {
            info!(app = %name, "removed on operator request");
            reply(ApiEnvelope::success(format!("Application {} removed", name)))
        }
        Err(e) => error_reply(&e),
    }
}

/// POST /dos/clear
pub async fn clear_dos_handler(State(app): State<Arc<NodeAppState>>, headers: HeaderMap) -> Reply {
    if !app.verifier.is_operator(&headers) {
        return reply(ApiEnvelope::unauthorized());
    }
    let before = app.state.with_dos(|dos| {
        let before = dos.dos_state();
        dos.clear();
        before
    });
    info!(before, "DOS state cleared by operator");
    reply(ApiEnvelope::success(format!("DOS state {} cleared", before)))
}

/// GET /health
pub async fn health_handler(State(app): State<Arc<NodeAppState>>) -> (StatusCode, Json<NodeHealth>) {
    let installed = match app.db.local_apps().await {
        Ok(apps) => apps.len(),
        Err(e) => {
            warn!(error = %e, "local apps unavailable for health");
            0
        }
    };
    let health = NodeHealth::check(&app.state, installed, app.min_peers);
    let status = if health.is_healthy() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(health))
}

/// POST /peer/message
pub async fn peer_message_handler(
    State(app): State<Arc<NodeAppState>>,
    headers: HeaderMap,
    Json(message): Json<PeerMessage>,
) -> Reply {
    let Some(from) = headers.get(PEER_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string) else {
        return reply(ApiEnvelope::error(400, "BadRequest", format!("missing {} header", PEER_HEADER)));
    };
    app.transport.note_incoming(&from);
    match app.inbox.handle(&from, message, now_ms()).await {
        Ok(InboxOutcome::Rejected(reason)) => reply(ApiEnvelope::error(422, "Rejected", reason)),
        Ok(outcome) => reply(ApiEnvelope::success(format!("{:?}", outcome))),
        Err(e) => error_reply(&e),
    }
}

/// GET /syncthing/deviceid
pub async fn device_id_handler(State(app): State<Arc<NodeAppState>>) -> Reply {
    let Some(daemon) = &app.daemon else {
        return reply(ApiEnvelope::error(503, "Unavailable", "replicated storage disabled"));
    };
    match daemon.device_id().await {
        Ok(id) => reply(ApiEnvelope::success(id)),
        Err(e) => error_reply(&OrchestratorError::Daemon(e)),
    }
}

pub fn build_router(app_state: Arc<NodeAppState>) -> Router {
    Router::new()
        // Operator
        .route("/apps/hashes/check", post(check_hashes_handler))
        .route("/apps/:name/remove", post(remove_app_handler))
        .route("/dos/clear", post(clear_dos_handler))
        // Read-only
        .route("/health", get(health_handler))
        .route("/syncthing/deviceid", get(device_id_handler))
        // Peers
        .route("/peer/message", post(peer_message_handler))
        .with_state(app_state)
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
