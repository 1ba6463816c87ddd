//! HTTP server and WebSocket router
//!
//! One listener, four WebSocket upgrade paths (`/ssh`, `/monitor`,
//! `/monitor-client`, `/ai`) and the AI test-connection endpoint. Upgrades
//! authenticate with a Bearer JWT from the `Authorization` header or, since
//! browsers cannot set headers on WebSocket construction, a `?token=`
//! query parameter. Everything else 404s.

pub mod connection;
pub mod watchdog;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::ai::pipeline::{TestConnectionParams, TestConnectionResult};
use crate::ai::{AiService, SecretCipher};
use crate::auth::{Authenticator, Claims};
use crate::config::ServerConfig;
use crate::monitor::MonitorHub;
use crate::ssh::SessionRegistry;
use connection::{next_session_id, SocketActivity};
use watchdog::SocketTable;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub auth: Authenticator,
    pub registry: Arc<SessionRegistry>,
    pub monitor: Arc<MonitorHub>,
    pub ai: Arc<AiService>,
    pub sockets: Arc<SocketTable>,
    /// Pass-through cipher for SSH credentials the external CRUD stored
    /// encrypted (`ENCRYPTION_KEY`)
    pub ssh_cipher: Option<Arc<SecretCipher>>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let auth = Authenticator::new(&config.jwt_secret);
        let ai = Arc::new(AiService::new(
            config.ai_encryption_key.as_deref(),
            Arc::new(crate::ai::MemorySettingsStore::default()),
        ));
        let ssh_cipher = config
            .encryption_key
            .as_deref()
            .map(|material| Arc::new(SecretCipher::new(material)));
        Self {
            config: Arc::new(config),
            auth,
            registry: Arc::new(SessionRegistry::default()),
            monitor: Arc::new(MonitorHub::new()),
            ai,
            sockets: Arc::new(SocketTable::new()),
            ssh_cipher,
        }
    }
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ssh", get(ws_ssh))
        .route("/monitor", get(ws_monitor))
        .route("/monitor-client", get(ws_monitor_client))
        .route("/ai", get(ws_ai))
        .route("/api/ai/test-connection", post(test_connection))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Claims, Response> {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    state
        .auth
        .verify_request(authorization, query.get("token").map(String::as_str))
        .map_err(|e| {
            debug!("Rejected upgrade: {}", e);
            (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
        })
}

async fn ws_ssh(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let claims = match authenticate(&state, &headers, &query) {
        Ok(claims) => claims,
        Err(rejection) => return rejection,
    };

    let session_id = next_session_id();
    let activity = SocketActivity::new();
    state.sockets.register(session_id, activity.clone());

    ws.on_upgrade(move |socket| async move {
        crate::ssh::handler::run(socket, state.clone(), claims.sub, session_id, activity).await;
        state.sockets.unregister(session_id);
    })
}

async fn ws_monitor(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(rejection) = authenticate(&state, &headers, &query) {
        return rejection;
    }

    let session_id = next_session_id();
    let activity = SocketActivity::new();
    state.sockets.register(session_id, activity.clone());

    ws.on_upgrade(move |socket| async move {
        crate::monitor::handler::run_subscriber(socket, state.clone(), session_id, activity).await;
        state.sockets.unregister(session_id);
    })
}

async fn ws_monitor_client(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    // Agent ingest path: a token is honored when present but not required;
    // agents often run where no user session exists. Samples are validated
    // by shape before they reach the cache.
    let has_credentials = headers.contains_key(axum::http::header::AUTHORIZATION)
        || query.contains_key("token");
    if has_credentials {
        if let Err(rejection) = authenticate(&state, &headers, &query) {
            return rejection;
        }
    } else {
        warn!("Monitor agent connected without credentials");
    }

    let session_id = next_session_id();
    let activity = SocketActivity::new();
    state.sockets.register(session_id, activity.clone());

    ws.on_upgrade(move |socket| async move {
        crate::monitor::handler::run_agent(socket, state.clone(), session_id, activity).await;
        state.sockets.unregister(session_id);
    })
}

async fn ws_ai(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let claims = match authenticate(&state, &headers, &query) {
        Ok(claims) => claims,
        Err(rejection) => return rejection,
    };

    let session_id = next_session_id();
    let activity = SocketActivity::new();
    state.sockets.register(session_id, activity.clone());

    ws.on_upgrade(move |socket| async move {
        crate::ai::handler::run(socket, state.clone(), claims.sub, session_id, activity).await;
        state.sockets.unregister(session_id);
    })
}

async fn test_connection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<TestConnectionParams>,
) -> Result<Json<TestConnectionResult>, Response> {
    let empty = HashMap::new();
    authenticate(&state, &headers, &empty)?;
    Ok(Json(state.ai.test_connection(&params).await))
}
