use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{ApiError, ErrorKind};
use crate::metrics;
use crate::model::{BuildTask, Session};
use crate::state::AppState;
use crate::sweeper::SweepReport;
use crate::teardown::{TeardownOutcome, TeardownReason};

mod terminal;

#[derive(Serialize)]
struct IndexResponse {
    service: &'static str,
    version: &'static str,
    endpoints: Vec<&'static str>,
}

async fn index() -> Json<IndexResponse> {
    Json(IndexResponse {
        service: "sandcastle: ephemeral repository sandboxes with a browser terminal",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: vec![
            "GET /health",
            "GET /metrics",
            "POST /api/submit",
            "GET /api/status/:task_id",
            "GET /api/sessions",
            "GET /api/sessions/:session_id",
            "DELETE /api/sessions/:session_id",
            "POST /api/cleanup",
            "POST /api/runtime/reset",
            "GET /api/terminal/:session_id (websocket)",
        ],
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    store_backend: &'static str,
    store: String,
    runtime: String,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store = match state.sessions().ping().await {
        Ok(()) => Ok(()),
        Err(err) => Err(err.to_string()),
    };
    let runtime = match state.runtime().get().await {
        Ok(runtime) => runtime.ping().await.map_err(|err| err.to_string()),
        Err(err) => Err(match state.runtime().failure() {
            Some(reason) => format!("{reason} (cached; POST /api/runtime/reset to retry)"),
            None => err.to_string(),
        }),
    };
    let healthy = store.is_ok() && runtime.is_ok();
    let describe = |probe: Result<(), String>| match probe {
        Ok(()) => "ok".to_string(),
        Err(reason) => reason,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            uptime_secs: state.uptime_secs(),
            store_backend: state.store_backend(),
            store: describe(store),
            runtime: describe(runtime),
        }),
    )
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

#[derive(Deserialize)]
struct SubmitRequest {
    repo_url: String,
}

#[derive(Serialize)]
struct SubmitResponse {
    task_id: String,
    status: crate::model::BuildStatus,
    message: &'static str,
}

async fn submit(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(body) =
        body.map_err(|rejection| ApiError::new(ErrorKind::InvalidInput, rejection.body_text()))?;
    let task = state.coordinator().submit(&body.repo_url).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            task_id: task.task_id,
            status: task.status,
            message: "build queued; poll /api/status/{task_id} for progress",
        }),
    ))
}

async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<BuildTask>, ApiError> {
    Ok(Json(state.coordinator().status(&task_id).await?))
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.sessions().list().await?))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.sessions().get(&session_id).await?))
}

#[derive(Serialize)]
struct TerminateResponse {
    session_id: String,
    outcome: TeardownOutcome,
}

async fn terminate_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<TerminateResponse>, ApiError> {
    let outcome = state
        .teardown()
        .terminate(&session_id, TeardownReason::Stopped)
        .await?;
    info!(session_id = %session_id, ?outcome, "session termination requested");
    Ok(Json(TerminateResponse {
        session_id,
        outcome,
    }))
}

async fn cleanup(State(state): State<AppState>) -> Json<SweepReport> {
    Json(state.sweeper().sweep_once(Utc::now()).await)
}

#[derive(Serialize)]
struct RuntimeResetResponse {
    ready: bool,
    error: Option<String>,
}

/// Drops a cached runtime construction failure and tries again.
async fn runtime_reset(State(state): State<AppState>) -> (StatusCode, Json<RuntimeResetResponse>) {
    state.runtime().reset();
    match state.runtime().get().await {
        Ok(_) => (
            StatusCode::OK,
            Json(RuntimeResetResponse {
                ready: true,
                error: None,
            }),
        ),
        Err(err) => {
            warn!(error = %err, "runtime still unavailable after reset");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(RuntimeResetResponse {
                    ready: false,
                    error: Some(err.to_string()),
                }),
            )
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/api/submit", post(submit))
        .route("/api/status/:task_id", get(task_status))
        .route("/api/sessions", get(list_sessions))
        .route(
            "/api/sessions/:session_id",
            get(get_session).delete(terminate_session),
        )
        .route("/api/cleanup", post(cleanup))
        .route("/api/runtime/reset", post(runtime_reset))
        .route("/api/terminal/:session_id", get(terminal::terminal))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
