//! HTTP trigger and control surface for the pipeline.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use eip_core::{ControlFlags, RunAudit, RunStatus};
use eip_storage::StorageError;
use eip_sync::{apply_control, ControlAction, Pipeline, TriggerOutcome};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "eip-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub auth_token: Option<String>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let auth_token = pipeline.config().scheduler_auth_token.clone();
        Self {
            pipeline,
            auth_token,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("pipeline is paused")]
    Paused(ControlFlags),
    #[error("unknown control action {0:?}")]
    UnknownAction(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                Json(json!({ "error": message })),
            )
                .into_response(),
            ApiError::Paused(flags) => (
                StatusCode::LOCKED,
                Json(json!({ "status": "paused", "control": flags })),
            )
                .into_response(),
            ApiError::UnknownAction(action) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": message,
                    "action": action,
                    "allowed": ControlAction::ALL.map(ControlAction::as_str),
                })),
            )
                .into_response(),
            ApiError::Storage(err) => {
                error!(error = %err, "request failed on storage");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": message })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ControlQuery {
    reason: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/run-pipeline", post(run_pipeline_handler))
        .route("/status", get(status_handler))
        .route("/control/{action}", post(control_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    let port = pipeline.config().web_port;
    let state = AppState::new(pipeline);
    if state.auth_token.is_none() {
        warn!("SCHEDULER_AUTH_TOKEN is not set; trigger and control endpoints are open");
    }
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "service": "eip" }))
}

async fn run_pipeline_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    match state.pipeline.trigger().await? {
        TriggerOutcome::Paused(flags) => Err(ApiError::Paused(flags)),
        TriggerOutcome::Completed(audit) => {
            Ok((run_status_code(audit.status), Json(run_summary(&audit))).into_response())
        }
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let status = state.pipeline.status().await?;
    Ok(Json(status).into_response())
}

async fn control_handler(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
    Query(query): Query<ControlQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    let parsed = ControlAction::parse(&action).ok_or(ApiError::UnknownAction(action))?;
    let flags = apply_control(
        state.pipeline.db(),
        parsed,
        query.reason.as_deref(),
        Utc::now(),
    )
    .await?;
    Ok(Json(json!({ "action": parsed.as_str(), "control": flags })).into_response())
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.auth_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if presented == Some(expected) {
        Ok(())
    } else {
        warn!("rejected request with missing or invalid bearer token");
        Err(ApiError::Unauthorized)
    }
}

pub fn run_status_code(status: RunStatus) -> StatusCode {
    match status {
        RunStatus::Success => StatusCode::OK,
        RunStatus::Partial => StatusCode::MULTI_STATUS,
        RunStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn run_summary(audit: &RunAudit) -> serde_json::Value {
    json!({
        "run_id": audit.run_id,
        "status": audit.status,
        "stage": audit.final_stage,
        "failed_stage": audit.failed_stage,
        "counts": audit.counts,
        "insight": audit.insight,
        "indicator_failures": audit.indicator_failures,
        "warnings": audit.warnings,
        "error": audit.error_message,
        "duration_seconds": audit.duration_seconds,
    })
}
