//! HTTP server implementation.

use std::net::SocketAddr;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::{middleware, Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::admission::{admission, AdmissionState};
use crate::error::{Result, TollgateError};

/// Put the admission gate in front of every route of `downstream`.
///
/// Routes added to the returned router afterwards are not gated.
pub fn gate(downstream: Router, state: AdmissionState) -> Router {
    downstream.layer(middleware::from_fn_with_state(state, admission))
}

/// Build the service router: a gated welcome route and an ungated health check.
pub fn router(state: AdmissionState) -> Router {
    let downstream = Router::new().route("/", get(welcome_handler));

    gate(downstream, state).route("/health", get(health_handler))
}

async fn welcome_handler() -> &'static str {
    "Welcome!"
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// HTTP server for the admission-gated service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Admission state shared by all requests
    state: AdmissionState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: AdmissionState) -> Self {
        Self { addr, state }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let app = router(self.state);

        info!(addr = %self.addr, "Starting HTTP server with admission gate");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Http(e.to_string())
        })
    }
}
