//! HTTP control API over the [`Scheduler`].
//!
//! ## Endpoints
//!
//! | Method | Path                              | Description                          |
//! |--------|-----------------------------------|--------------------------------------|
//! | GET    | `/health`                         | Liveness of this service             |
//! | GET    | `/ready`                          | 200 once any model is running        |
//! | GET    | `/v1/models/status`               | Status snapshot of every model       |
//! | POST   | `/v1/models/switch?target_model=` | Make a model resident, evicting      |
//! | POST   | `/v1/models/{name}/start`         | Start a model without evicting       |
//! | POST   | `/v1/models/{name}/stop`          | Stop a model                         |
//! | POST   | `/v1/models/{name}/restart`       | Stop then start a model              |

use crate::classifier::LifecycleState;
use crate::coordinator::{ControlOutcome, Scheduler, SwitchStatus};
use crate::errors::SchedulerError;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

pub fn control_router(scheduler: Scheduler) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/v1/models/status", get(get_status))
        .route("/v1/models/switch", post(switch_model))
        .route("/v1/models/{name}/start", post(start_model))
        .route("/v1/models/{name}/stop", post(stop_model))
        .route("/v1/models/{name}/restart", post(restart_model))
        .with_state(scheduler)
}

#[derive(Deserialize)]
struct SwitchQuery {
    target_model: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    models: Vec<String>,
}

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            SchedulerError::UnknownModel(_) => (StatusCode::NOT_FOUND, "model_not_found"),
            SchedulerError::ResourceBusy => (StatusCode::CONFLICT, "resource_busy"),
            SchedulerError::InsufficientMemory { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "insufficient_memory")
            }
            SchedulerError::ProcessControl { .. } => (StatusCode::BAD_GATEWAY, "process_control_error"),
            SchedulerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": kind,
            }
        });
        (status, Json(body)).into_response()
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn ready(State(scheduler): State<Scheduler>) -> impl IntoResponse {
    let snapshot = scheduler.status_snapshot().await;
    let models: Vec<String> = snapshot
        .models
        .into_iter()
        .filter(|(_, status)| status.state == LifecycleState::Running)
        .map(|(name, _)| name)
        .collect();

    if models.is_empty() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not_ready",
                models,
            }),
        )
    } else {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                models,
            }),
        )
    }
}

async fn get_status(State(scheduler): State<Scheduler>) -> impl IntoResponse {
    Json(scheduler.status_snapshot().await)
}

async fn switch_model(
    State(scheduler): State<Scheduler>,
    Query(query): Query<SwitchQuery>,
) -> Result<Response, SchedulerError> {
    debug!(target_model = %query.target_model, "Switch requested");
    let result = scheduler.switch_to(&query.target_model).await?;
    let status = match result.status {
        SwitchStatus::AlreadySatisfied | SwitchStatus::Success => StatusCode::OK,
        SwitchStatus::InsufficientMemory => StatusCode::SERVICE_UNAVAILABLE,
        SwitchStatus::ProcessControlError => StatusCode::BAD_GATEWAY,
    };
    Ok((status, Json(result)).into_response())
}

async fn start_model(
    State(scheduler): State<Scheduler>,
    Path(name): Path<String>,
) -> Result<Json<ControlOutcome>, SchedulerError> {
    scheduler.start(&name).await.map(Json)
}

async fn stop_model(
    State(scheduler): State<Scheduler>,
    Path(name): Path<String>,
) -> Result<Json<ControlOutcome>, SchedulerError> {
    scheduler.stop(&name).await.map(Json)
}

async fn restart_model(
    State(scheduler): State<Scheduler>,
    Path(name): Path<String>,
) -> Result<Json<ControlOutcome>, SchedulerError> {
    scheduler.restart(&name).await.map(Json)
}
