//! HTTP control surface.
//!
//! Thin: every route delegates to the session engine or the stores, and the
//! engine's idempotence means a double-POSTed advance is harmless.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{HttpConfig, RecoveryConfig};
use crate::error::SessionError;
use crate::session::machine::SessionEngine;
use crate::session::SessionConfig;
use crate::store::{DraftStore, SessionStore, TaskStore};

pub struct AppState<S> {
    pub engine: Arc<SessionEngine<S>>,
    pub recovery: RecoveryConfig,
}

/// SessionError mapped onto a status code and a json body.
struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::InvalidTransition { .. } => StatusCode::CONFLICT,
            SessionError::Task(crate::error::TaskError::Validation { .. }) => {
                StatusCode::BAD_REQUEST
            }
            SessionError::UnknownPhase(_) | SessionError::Strategy(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SessionError::Database(_) | SessionError::Task(_) => {
                error!(error = %self.0, "request failed on the database");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    theme: String,
    #[serde(default)]
    style: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Serialize)]
struct AcceptedSession {
    id: Uuid,
    status: String,
}

pub fn router<S>(state: Arc<AppState<S>>) -> Router
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session::<S>))
        .route("/sessions/{id}", get(get_session::<S>))
        .route("/sessions/{id}/advance", post(advance_session::<S>))
        .route("/sessions/{id}/health", get(session_health::<S>))
        .route("/sessions/{id}/pause", post(pause_session::<S>))
        .route("/sessions/{id}/resume", post(resume_session::<S>))
        .route("/sessions/{id}/retry", post(retry_session::<S>))
        .route("/sessions/{id}/drafts", get(session_drafts::<S>))
        .route("/stats", get(stats::<S>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve<S>(config: &HttpConfig, state: Arc<AppState<S>>) -> anyhow::Result<()>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(addr = %config.bind, "http server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_session<S>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<AcceptedSession>), ApiError>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    let config = SessionConfig {
        theme: req.theme,
        style: req.style,
        platform: req.platform.unwrap_or_else(|| "twitter".to_string()),
        model: req.model,
    };
    let session = state.engine.create(config).await?;
    // Kick the first phase off out of band; the response returns as soon as
    // the row exists.
    let engine = state.engine.clone();
    let id = session.id;
    tokio::spawn(async move {
        if let Err(e) = engine.advance(id).await {
            // Already recorded against the session's retry budget.
            tracing::warn!(session_id = %id, error = %e, "initial advance failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedSession {
            id: session.id,
            status: session.status.to_string(),
        }),
    ))
}

async fn get_session<S>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    let session = state
        .engine
        .store()
        .get_session(id)
        .await
        .map_err(SessionError::from)?
        .ok_or(SessionError::NotFound(id))?;
    let phases = state
        .engine
        .store()
        .list_phases(id)
        .await
        .map_err(SessionError::from)?;
    Ok(Json(serde_json::json!({
        "session": session,
        "phases": phases,
    })))
}

async fn advance_session<S>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    let session = state.engine.advance(id).await?;
    Ok(Json(serde_json::json!({
        "id": session.id,
        "status": session.status,
        "current_phase": session.current_phase,
        "current_step": session.current_step,
    })))
}

async fn session_health<S>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    let report = state.engine.health(id, &state.recovery).await?;
    Ok(Json(serde_json::to_value(report).unwrap_or_default()))
}

async fn pause_session<S>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    state.engine.pause(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_session<S>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    state.engine.resume(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn retry_session<S>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    state.engine.retry(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn session_drafts<S>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    let drafts = state
        .engine
        .store()
        .list_drafts(id)
        .await
        .map_err(SessionError::from)?;
    Ok(Json(serde_json::json!({ "drafts": drafts })))
}

async fn stats<S>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    let stats = state
        .engine
        .store()
        .queue_stats(Duration::from_secs(3600))
        .await
        .map_err(SessionError::from)?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}
