//! HTTP request handlers for the REST API.
//!
//! Handlers stay thin: they deserialize, call into the sandbox facade or the
//! exec registry, and map errors onto status codes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use sbxapi::{CreateSandboxRequest, DeleteSandboxResponse, ErrorResponse, ExecRequest};

use crate::{management::sandbox_namespace, SbxdError};

use super::state::ServerState;

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for GET /healthz
pub async fn health_handler() -> impl IntoResponse {
    "ok"
}

/// Handler for GET /metrics
pub async fn metrics_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.get_metrics().render())
}

/// Handler for POST /sandboxes
pub async fn create_sandbox_handler(
    State(state): State<ServerState>,
    Json(req): Json<CreateSandboxRequest>,
) -> impl IntoResponse {
    match state.get_manager().create(req).await {
        Result::Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Handler for GET /sandboxes
pub async fn list_sandboxes_handler(State(state): State<ServerState>) -> impl IntoResponse {
    match state.get_manager().list().await {
        Result::Ok(statuses) => (StatusCode::OK, Json(statuses)).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Handler for GET /sandboxes/{id}
pub async fn get_sandbox_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.get_manager().status(&id).await {
        Result::Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Handler for DELETE /sandboxes/{id}
pub async fn delete_sandbox_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.get_manager().delete(&id).await {
        Result::Ok(()) => (
            StatusCode::OK,
            Json(DeleteSandboxResponse {
                status: "deleted".to_string(),
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// Handler for POST /sandboxes/{id}/exec
pub async fn exec_sandbox_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> impl IntoResponse {
    match state.get_manager().exec(&id, req).await {
        Result::Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Handler for GET /sandboxes/{id}/exec/{exec_id}
pub async fn exec_status_handler(
    State(state): State<ServerState>,
    Path((id, exec_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let namespace = sandbox_namespace(&id);
    match state.get_registry().get(&namespace, &exec_id) {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => error_response(&SbxdError::NotFound("exec not found".to_string())),
    }
}

/// Handler for POST /sandboxes/{id}/exec/{exec_id}/cancel
pub async fn cancel_exec_handler(
    State(state): State<ServerState>,
    Path((id, exec_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let namespace = sandbox_namespace(&id);
    match state.get_registry().request_cancel(&namespace, &exec_id) {
        Some((snapshot, _)) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => error_response(&SbxdError::NotFound("exec not found".to_string())),
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn error_response(err: &SbxdError) -> axum::response::Response {
    (
        error_status(err),
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn error_status(err: &SbxdError) -> StatusCode {
    match err {
        SbxdError::Validation(_) => StatusCode::BAD_REQUEST,
        SbxdError::NotReady(_) => StatusCode::CONFLICT,
        SbxdError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::orchestrator::OrchestratorError;

    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&SbxdError::Validation("bad id".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&SbxdError::NotReady("pending".to_string())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&SbxdError::NotFound("nope".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&SbxdError::Orchestrator(OrchestratorError::Transient(
                "api".to_string()
            ))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
