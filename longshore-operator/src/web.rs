use std::net::SocketAddr;

use axum::{Router, routing::get};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Liveness endpoint for the operator pod.
pub async fn run_http_server(addr: SocketAddr) -> anyhow::Result<()> {
    // Expose both /health (preferred) and /healthz (legacy) for probes
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/healthz", get(|| async { "ok" }))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    info!("operator HTTP listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
