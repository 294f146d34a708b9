//! The HTTP/WebSocket surface of the control plane.

use std::net::SocketAddr;

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tokio::net::TcpListener;

use crate::SbxdResult;

mod handlers;
mod routes;
mod state;
mod ws;

pub use routes::*;
pub use state::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The control-plane API server.
pub struct ApiServer {
    addr: SocketAddr,
    state: ServerState,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ApiServer {
    /// Creates a server bound to `addr` once served.
    pub fn new(addr: SocketAddr, state: ServerState) -> Self {
        Self { addr, state }
    }

    /// Binds and serves until the process exits.
    pub async fn serve(&self) -> SbxdResult<()> {
        let app = create_router(self.state.clone());
        tracing::info!("control plane listening on {}", self.addr);
        axum::serve(TcpListener::bind(self.addr).await?, app).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Middleware
//--------------------------------------------------------------------------------------------------

/// Tags every request with an `X-Request-Id` (generating one when absent)
/// and logs method, path, status and duration.
pub(crate) async fn request_logger(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(new_request_id);
    if let Result::Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(REQUEST_ID_HEADER.clone(), value);
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = std::time::Instant::now();

    let mut response = next.run(req).await;

    if let Result::Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER.clone(), value);
    }
    tracing::info!(
        "req_id={} method={} path={} status={} duration={:?}",
        request_id,
        method,
        path,
        response.status().as_u16(),
        start.elapsed()
    );
    response
}

fn new_request_id() -> String {
    format!("{:x}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}
