// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP/WebSocket surface of the front-end tier that the core owns: the
//! `/ws` relay endpoint and a health probe. HTTPS termination, cookies, and
//! the user database live outside the core; this router only needs the
//! validated token and a session→socket mapping.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::relay;

/// Where a session's bridge can be reached.
#[derive(Debug, Clone)]
pub struct SessionRoute {
    pub socket_path: PathBuf,
}

/// Shared server state.
pub struct ServerState {
    pub auth_token: Option<String>,
    sessions: parking_lot::RwLock<HashMap<String, SessionRoute>>,
}

impl ServerState {
    pub fn new(auth_token: Option<String>) -> Arc<Self> {
        Arc::new(Self { auth_token, sessions: parking_lot::RwLock::new(HashMap::new()) })
    }

    /// Make a session reachable via `/ws?session=<id>`.
    pub fn register_session(&self, session_id: &str, socket_path: PathBuf) {
        self.sessions.write().insert(session_id.to_owned(), SessionRoute { socket_path });
    }

    pub fn remove_session(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }

    pub fn resolve(&self, session_id: &str) -> Option<SessionRoute> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.session_count(),
    }))
}

/// Query parameters for the relay WebSocket.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Auth token (required when the server was started with one).
    pub token: Option<String>,
    /// Session id assigned at login.
    pub session: Option<String>,
}

/// WebSocket upgrade: validate the token, resolve the session's bridge
/// socket, then hand the connection to the relay.
async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if crate::auth::validate_token(query.token.as_deref(), state.auth_token.as_deref()).is_err() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "unauthorized"})),
        )
            .into_response();
    }

    let Some(route) = query.session.as_deref().and_then(|id| state.resolve(id)) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "unknown session"})),
        )
            .into_response();
    };

    ws.on_upgrade(move |socket| async move {
        match tokio::net::UnixStream::connect(&route.socket_path).await {
            Ok(bridge_io) => relay::run_relay(socket, bridge_io).await,
            Err(e) => {
                warn!(
                    socket = %route.socket_path.display(),
                    error = %e,
                    "bridge socket unreachable"
                );
            }
        }
    })
    .into_response()
}
