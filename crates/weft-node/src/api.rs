//! Submission and health API
//!
//! A thin transport veneer over the engine: topology errors surface as 422,
//! terminal-state conflicts as 409, capacity refusals as 503. Authentication
//! is an external collaborator and not handled here.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use weft_core::model::TaskSpec;
use weft_engine::{EngineError, WorkflowEngine};

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<WorkflowEngine>,
}

pub fn router(engine: Arc<WorkflowEngine>) -> Router {
    Router::new()
        .route("/workflows", post(create_workflow))
        .route("/workflows/:id", get(get_workflow))
        .route("/workflows/:id/execute", post(execute_workflow))
        .route("/workflows/:id/cancel", post(cancel_workflow))
        .route("/workflows/:id/pause", post(pause_workflow))
        .route("/workflows/:id/resume", post(resume_workflow))
        .route("/health", get(health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(ApiState { engine })
}

/// Engine error mapped onto an HTTP response
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidTopology(_) | EngineError::UnknownTaskType(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::AlreadyTerminal { .. }
            | EngineError::InvalidTransition(_)
            | EngineError::ClaimHeld(_) => StatusCode::CONFLICT,
            EngineError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Store(_) | EngineError::Coordination(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CreateWorkflowRequest {
    name: String,
    tasks: Vec<TaskSpec>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

async fn create_workflow(
    State(state): State<ApiState>,
    Json(request): Json<CreateWorkflowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow_id = state
        .engine
        .create(request.name, request.tasks, request.metadata)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "workflow_id": workflow_id })),
    ))
}

async fn execute_workflow(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.execute(id).await?;
    Ok(Json(json!({ "status": "accepted", "workflow_id": id })))
}

async fn get_workflow(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow = state.engine.status(id).await?;
    Ok(Json(workflow))
}

async fn cancel_workflow(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.cancel(id).await?;
    Ok(Json(json!({ "status": "cancelled" })))
}

async fn pause_workflow(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.pause(id).await?;
    Ok(Json(json!({ "status": "paused" })))
}

async fn resume_workflow(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.resume(id).await?;
    Ok(Json(json!({ "status": "running" })))
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.engine.health();
    Json(json!({
        "status": "ok",
        "node_role": snapshot.node_role.to_string(),
        "active_workflows": snapshot.active_workflows,
        "queue_depth": snapshot.queue_depth,
        "dropped_events": snapshot.dropped_events,
    }))
}
