// Local HTTP surface for the ceremony pages and operator controls
//
// Handlers only translate between JSON and the authenticator, registry and
// poller; they hold no rules of their own.

mod error;

use anyhow::{Context, Result};
use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

pub use error::ApiError;

use crate::agent::Poller;
use crate::auth::{
    AuthenticationCredential, Authenticator, CreationOptions, RegistrationCredential,
    RequestOptions, Session,
};
use crate::modules::{ModuleDescriptor, ModuleRegistry};

/// Shared handler state
#[derive(Clone)]
pub struct WebState {
    /// The only browser origin allowed to change agent state
    pub allowed_origin: String,
    pub auth: Arc<Authenticator>,
    pub registry: Arc<ModuleRegistry>,
    pub poller: Arc<Poller>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterBeginRequest {
    pub user_id: String,
    pub community_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterFinishRequest {
    pub user_id: String,
    pub credential: RegistrationCredential,
}

#[derive(Debug, Deserialize)]
pub struct LoginBeginRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginFinishRequest {
    pub user_id: String,
    pub credential: AuthenticationCredential,
}

#[derive(Debug, Deserialize)]
pub struct PollIntervalRequest {
    pub seconds: u64,
}

/// Session as shown to the local UI; the bearer token is never exposed
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionView {
    pub id: String,
    pub user_id: String,
    pub community_id: String,
    pub credential_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<Session> for SessionView {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            user_id: session.user_id,
            community_id: session.community_id,
            credential_id: session.credential_id,
            issued_at: session.issued_at,
            expires_at: session.expires_at,
        }
    }
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/webauthn/register/begin", post(register_begin))
        .route("/api/webauthn/register/finish", post(register_finish))
        .route("/api/webauthn/login/begin", post(login_begin))
        .route("/api/webauthn/login/finish", post(login_finish))
        .route("/api/session", get(current_session).delete(revoke_session))
        .route("/api/sessions", get(active_sessions))
        .route("/api/modules", get(modules))
        .route("/api/modules/:name", get(module_info).delete(unload_module))
        .route("/api/modules/:name/enable", post(enable_module))
        .route("/api/modules/:name/disable", post(disable_module))
        .route("/api/stats", get(stats))
        .route("/api/agent/poll-interval", put(update_poll_interval))
        .layer(middleware::from_fn_with_state(state.clone(), require_local_origin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Refuse state-changing requests sent by pages from another origin
///
/// Browsers attach `Origin` to every cross-site POST, PUT and DELETE, including
/// "simple" requests that skip the CORS preflight. Requests without the header
/// come from non-browser clients on this machine and are let through.
async fn require_local_origin(State(state): State<WebState>, request: Request, next: Next) -> Response {
    if request.method().is_safe() {
        return next.run(request).await;
    }

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .map(|v| v.to_str().unwrap_or_default().trim_end_matches('/').to_string());

    match origin {
        Some(origin) if origin != state.allowed_origin.trim_end_matches('/') => {
            tracing::warn!(
                %origin,
                method = %request.method(),
                path = %request.uri().path(),
                "Rejected cross-origin request"
            );
            (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": format!("Origin {origin} is not allowed") })),
            )
                .into_response()
        }
        _ => next.run(request).await,
    }
}

/// Serve the local API on `host:port` until `shutdown` turns true
pub async fn serve(host: String, port: u16, state: WebState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind local web server to {host}:{port}"))?;
    tracing::info!("Local web server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("Local web server failed")
}

async fn health(State(state): State<WebState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "authenticated": state.auth.get_current_session().await.is_ok(),
    }))
}

async fn register_begin(
    State(state): State<WebState>,
    Json(request): Json<RegisterBeginRequest>,
) -> Result<Json<CreationOptions>, ApiError> {
    let options = state
        .auth
        .start_registration(&request.user_id, &request.community_id)
        .await?;
    Ok(Json(options))
}

async fn register_finish(
    State(state): State<WebState>,
    Json(request): Json<RegisterFinishRequest>,
) -> Result<Json<SessionView>, ApiError> {
    let session = state
        .auth
        .complete_registration(&request.user_id, &request.credential)
        .await?;
    Ok(Json(session.into()))
}

async fn login_begin(
    State(state): State<WebState>,
    Json(request): Json<LoginBeginRequest>,
) -> Result<Json<RequestOptions>, ApiError> {
    Ok(Json(state.auth.start_authentication(&request.user_id).await?))
}

async fn login_finish(
    State(state): State<WebState>,
    Json(request): Json<LoginFinishRequest>,
) -> Result<Json<SessionView>, ApiError> {
    let session = state
        .auth
        .complete_authentication(&request.user_id, &request.credential)
        .await?;
    Ok(Json(session.into()))
}

async fn current_session(State(state): State<WebState>) -> Result<Json<SessionView>, ApiError> {
    Ok(Json(state.auth.get_current_session().await?.into()))
}

async fn revoke_session(State(state): State<WebState>) -> Result<Json<Value>, ApiError> {
    let session = state.auth.get_current_session().await?;
    state.auth.revoke_session(&session.id).await?;
    Ok(Json(json!({ "revoked": session.id })))
}

async fn active_sessions(State(state): State<WebState>) -> Result<Json<Vec<SessionView>>, ApiError> {
    let sessions = state.auth.get_active_sessions().await?;
    Ok(Json(sessions.into_iter().map(SessionView::from).collect()))
}

async fn modules(State(state): State<WebState>) -> Json<Vec<ModuleDescriptor>> {
    Json(state.registry.get_module_infos().await)
}

async fn module_info(
    State(state): State<WebState>,
    Path(name): Path<String>,
) -> Result<Json<ModuleDescriptor>, ApiError> {
    Ok(Json(state.registry.get_module_info(&name).await?))
}

async fn enable_module(
    State(state): State<WebState>,
    Path(name): Path<String>,
) -> Result<Json<ModuleDescriptor>, ApiError> {
    state.registry.enable_module(&name).await?;
    Ok(Json(state.registry.get_module_info(&name).await?))
}

async fn disable_module(
    State(state): State<WebState>,
    Path(name): Path<String>,
) -> Result<Json<ModuleDescriptor>, ApiError> {
    state.registry.disable_module(&name).await?;
    Ok(Json(state.registry.get_module_info(&name).await?))
}

async fn unload_module(
    State(state): State<WebState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.registry.unload_module(&name).await?;
    Ok(Json(json!({ "unloaded": name })))
}

async fn stats(State(state): State<WebState>) -> Result<Json<Value>, ApiError> {
    let auth = state.auth.get_stats().await?;
    Ok(Json(json!({
        "auth": auth,
        "modules": state.registry.get_stats().await,
        "agent": state.poller.state().await,
        "poll_interval": state.poller.poll_interval().as_secs(),
    })))
}

async fn update_poll_interval(
    State(state): State<WebState>,
    Json(request): Json<PollIntervalRequest>,
) -> Json<Value> {
    let effective = state.poller.update_poll_interval(request.seconds);
    Json(json!({ "poll_interval": effective }))
}
