//! HTTP façade over the session lifecycle manager.
//!
//! Open routes (`/`, `/health*`, `/ready*`, `/qr*`, `/debug*`) need no
//! credentials. Everything else requires an `x-api-key` header matching the
//! configured key. The façade never touches the transport directly; every
//! call goes through [`LifecycleManager`].

mod error;
pub mod qr;

pub use error::AppError;

use crate::health;
use crate::lifecycle::LifecycleManager;
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;

pub const SERVICE_NAME: &str = "wa-relay";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const COMPONENT: &str = "gateway";

const READY_HINT: &str = "Open /qr, scan the WhatsApp QR code, then wait for ready.";

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: LifecycleManager,
    pub api_key: Arc<str>,
    pub debug_event_limit: usize,
    pub body_limit_bytes: usize,
}

impl AppState {
    pub fn new(manager: LifecycleManager, api_key: impl Into<Arc<str>>) -> Self {
        Self {
            manager,
            api_key: api_key.into(),
            debug_event_limit: 50,
            body_limit_bytes: 64 * 1024,
        }
    }
}

/// Build the axum router with every route and the API-key guard.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.body_limit_bytes;
    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/healthz", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/qr", get(handle_qr))
        .route("/debug", get(handle_debug))
        .route("/me", get(handle_me))
        .route("/groups", get(handle_groups))
        .route("/send", post(handle_send))
        .fallback(handle_not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("Listener has no local address")?;
    tracing::info!(%addr, "HTTP gateway listening");
    health::mark_component_ok(COMPONENT);

    let result = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP gateway failed");

    if let Err(e) = &result {
        health::mark_component_error(COMPONENT, format!("{e:#}"));
    }
    result
}

/// Paths reachable without an API key, matched by prefix.
pub fn is_open_path(path: &str) -> bool {
    path == "/"
        || path.starts_with("/health")
        || path.starts_with("/ready")
        || path.starts_with("/qr")
        || path.starts_with("/debug")
}

fn key_matches(provided: &str, expected: &str) -> bool {
    !provided.is_empty() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if is_open_path(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !key_matches(provided, &state.api_key) {
        tracing::debug!(path = %request.uri().path(), "Rejected request without valid API key");
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}

// ── Open routes ──────────────────────────────────────────────────

async fn handle_root() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "service": SERVICE_NAME }))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "uptime": health::uptime_seconds() }))
}

async fn handle_ready(State(state): State<AppState>) -> Response {
    if state.manager.status().ready {
        return Json(json!({ "ok": true })).into_response();
    }
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "ok": false, "error": "not_ready", "hint": READY_HINT })),
    )
        .into_response()
}

async fn handle_qr(State(state): State<AppState>) -> Response {
    let status = state.manager.status();
    if status.ready || status.authenticated {
        return Html(qr::already_authenticated_page()).into_response();
    }
    let Some(payload) = status.pending_challenge else {
        return Html(qr::waiting_page()).into_response();
    };
    match qr::challenge_page(&payload) {
        Ok(page) => Html(page).into_response(),
        Err(e) => {
            tracing::error!("QR render failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "QR error").into_response()
        }
    }
}

async fn handle_debug(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.manager.snapshot();
    let events = state.manager.events().recent(state.debug_event_limit);
    Json(json!({
        "ok": true,
        "state": snapshot.state,
        "isAuthenticated": snapshot.is_authenticated,
        "isReady": snapshot.is_ready,
        "initAttempt": snapshot.init_attempt,
        "restartPending": snapshot.restart_pending,
        "restartCount": snapshot.restart_count,
        "events": events,
        "health": health::snapshot_json(),
    }))
}

// ── Protected routes ─────────────────────────────────────────────

async fn handle_me(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let me = state.manager.who_am_i().await?;
    Ok(Json(json!({ "ok": true, "me": me })))
}

async fn handle_groups(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let groups = state.manager.list_groups().await?;
    Ok(Json(json!({ "ok": true, "count": groups.len(), "groups": groups })))
}

#[derive(Debug, Default, Deserialize)]
struct SendRequest {
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl SendRequest {
    /// Unparseable bodies count as empty so validation reports the
    /// missing fields.
    fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }

    fn fields(&self) -> Option<(&str, &str)> {
        let to = self.to.as_deref().filter(|s| !s.is_empty())?;
        let message = self.message.as_deref().filter(|s| !s.is_empty())?;
        Some((to, message))
    }
}

async fn handle_send(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    // Readiness is reported before body validation.
    if !state.manager.status().ready {
        return Err(AppError::NotReady);
    }

    let request = SendRequest::parse(&body);
    let (to, message) = request
        .fields()
        .ok_or(AppError::BadRequest("to_and_message_required"))?;

    state.manager.send_message(to, message).await?;
    tracing::info!(to, "Message sent");
    Ok(Json(json!({ "ok": true })))
}

async fn handle_not_found() -> AppError {
    AppError::NotFound
}
