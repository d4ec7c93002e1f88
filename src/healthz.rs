//! Liveness endpoint for the kubelet.
//!
//! `GET /healthz` answers 200 for as long as the process is up. It says
//! nothing about the relay or the API server.

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub fn router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
}

/// `GET /healthz`: liveness probe.
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Serve the liveness endpoint on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
    axum::serve(listener, router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
