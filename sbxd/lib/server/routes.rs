//! Route definitions for the HTTP server.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use super::{handlers, request_logger, state::ServerState, ws};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates the router with every API endpoint configured.
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route(
            "/sandboxes",
            post(handlers::create_sandbox_handler).get(handlers::list_sandboxes_handler),
        )
        .route(
            "/sandboxes/{id}",
            get(handlers::get_sandbox_handler).delete(handlers::delete_sandbox_handler),
        )
        .route("/sandboxes/{id}/exec", post(handlers::exec_sandbox_handler))
        .route(
            "/sandboxes/{id}/exec/{exec_id}",
            get(handlers::exec_status_handler),
        )
        .route(
            "/sandboxes/{id}/exec/{exec_id}/cancel",
            post(handlers::cancel_exec_handler),
        )
        .route("/sandboxes/{id}/stream", get(ws::stream_handler))
        .route("/sandboxes/{id}/ingest", get(ws::ingest_handler))
        .layer(middleware::from_fn(request_logger))
        .with_state(state)
}
