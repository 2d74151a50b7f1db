use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use ptyhub_terminal::{PtyManager, StopOutcome, TerminalError};
use ptyhub_types::{StartConfig, TerminalKind};

use crate::resolver::{CredentialResolver, SessionResolver};

/// Application state shared across routes and connections
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PtyManager>,
    pub sessions: Arc<dyn SessionResolver>,
    pub credentials: Arc<dyn CredentialResolver>,
    /// Cancelled when the server is shutting down
    pub shutdown: CancellationToken,
}

/// Create the HTTP control router
pub fn control_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions/:id/:terminal/start", post(start_terminal))
        .route("/sessions/:id/:terminal/stop", post(stop_terminal))
        .route("/sessions/:id/:terminal/status", get(terminal_status))
        // `:terminal` also carries the legacy action names and `terminals`
        .route(
            "/sessions/:id/:terminal",
            get(session_query)
                .post(legacy_action)
                .delete(remove_terminal),
        )
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StartRequest {
    working_directory: Option<PathBuf>,
    config: StartConfig,
    initiator_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StopRequest {
    force: bool,
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "processes": state.manager.process_count(),
        "running": state.manager.running_count(),
    }))
}

/// POST /sessions/:id/:terminal/start
async fn start_terminal(
    State(state): State<AppState>,
    Path((session_id, terminal)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let kind = configured_kind(&state.manager, &terminal)?;
    start(&state, &session_id, &kind, parse_body(&body)?).await
}

/// POST /sessions/:id/:terminal/stop
async fn stop_terminal(
    State(state): State<AppState>,
    Path((session_id, terminal)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let kind = configured_kind(&state.manager, &terminal)?;
    stop(&state, &session_id, &kind, parse_body(&body)?).await
}

/// GET /sessions/:id/:terminal/status
async fn terminal_status(
    State(state): State<AppState>,
    Path((session_id, terminal)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let kind = configured_kind(&state.manager, &terminal)?;
    status(&state, &session_id, &kind)
}

/// DELETE /sessions/:id/:terminal - stop if needed and forget immediately
async fn remove_terminal(
    State(state): State<AppState>,
    Path((session_id, terminal)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let kind = configured_kind(&state.manager, &terminal)?;
    let removed = state.manager.remove(&session_id, &kind).await?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}

/// GET /sessions/:id/terminals and the legacy GET /sessions/:id/status
async fn session_query(
    State(state): State<AppState>,
    Path((session_id, name)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    match name.as_str() {
        "terminals" => Ok(Json(json!({ "terminals": state.manager.list(&session_id) }))),
        "status" => {
            let kind = state.manager.kinds().primary().clone();
            status(&state, &session_id, &kind)
        }
        _ => Err(AppError::NotFound(format!("no route for '{}'", name))),
    }
}

/// Legacy POST /sessions/:id/start and /sessions/:id/stop, acting on the
/// primary kind
async fn legacy_action(
    State(state): State<AppState>,
    Path((session_id, action)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let kind = state.manager.kinds().primary().clone();
    match action.as_str() {
        "start" => start(&state, &session_id, &kind, parse_body(&body)?).await,
        "stop" => stop(&state, &session_id, &kind, parse_body(&body)?).await,
        _ => Err(AppError::NotFound(format!("no route for '{}'", action))),
    }
}

async fn start(
    state: &AppState,
    session_id: &str,
    kind: &TerminalKind,
    request: StartRequest,
) -> Result<Json<Value>, AppError> {
    let working_directory = match request.working_directory {
        Some(dir) => dir,
        None => state
            .sessions
            .resolve(session_id)
            .await?
            .map(|metadata| metadata.working_directory)
            .ok_or_else(|| AppError::Validation("workingDirectory is required".to_string()))?,
    };

    let mut config = request.config;
    if let Some(initiator) = request.initiator_id.as_deref() {
        // Request-supplied variables take precedence over stored credentials
        for (key, value) in state.credentials.resolve(initiator).await? {
            config.env.entry(key).or_insert(value);
        }
    }

    let started = state
        .manager
        .start_session(
            session_id,
            kind,
            &working_directory,
            config,
            request.initiator_id.as_deref(),
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "pid": started.pid,
        "reused": started.reused,
    })))
}

async fn stop(
    state: &AppState,
    session_id: &str,
    kind: &TerminalKind,
    request: StopRequest,
) -> Result<Json<Value>, AppError> {
    let outcome = state
        .manager
        .stop_session(session_id, kind, request.force)
        .await?;
    let (outcome, forced) = match outcome {
        StopOutcome::NotRunning => ("not_running", false),
        StopOutcome::AlreadyExited => ("already_exited", false),
        StopOutcome::Stopped { forced } => ("stopped", forced),
    };
    Ok(Json(json!({
        "success": true,
        "outcome": outcome,
        "forced": forced,
    })))
}

fn status(state: &AppState, session_id: &str, kind: &TerminalKind) -> Result<Json<Value>, AppError> {
    match state.manager.get_status(session_id, kind) {
        Some(status) => Ok(Json(serde_json::to_value(status)?)),
        None => Ok(Json(json!({
            "sessionId": session_id,
            "terminal": kind,
            "running": false,
            "status": null,
            "pid": null,
        }))),
    }
}

fn configured_kind(manager: &PtyManager, name: &str) -> Result<TerminalKind, AppError> {
    let kind = TerminalKind::new(name).map_err(|e| AppError::Validation(e.to_string()))?;
    if !manager.kinds().contains(&kind) {
        return Err(AppError::Validation(format!("unknown terminal kind '{}'", kind)));
    }
    Ok(kind)
}

/// Bodies are optional; an empty body means all defaults
fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| AppError::Validation(format!("invalid request body: {}", e)))
}

/// Error handling
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Terminal(TerminalError::Validation(_)) | AppError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Terminal(TerminalError::NotFound(_)) | AppError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            AppError::Terminal(TerminalError::AlreadyRunning { .. }) => StatusCode::CONFLICT,
            AppError::Terminal(_) | AppError::Internal(_) | AppError::SerdeJson(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Terminal(err) => err.code(),
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Internal(_) | AppError::SerdeJson(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "control request failed");
        } else {
            tracing::debug!(error = %self, code = self.code(), "control request rejected");
        }

        let body = Json(json!({
            "success": false,
            "error": self.code(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}
