//! HTTP liveness probe

use axum::routing::get;
use axum::Router;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

fn router() -> Router {
    Router::new().route("/healthz", get(|| async { "ok" }))
}

/// Bind the probe on all interfaces and serve it on its own task
///
/// Binding happens before returning so a taken port fails startup.
pub async fn spawn(port: u16) -> std::io::Result<JoinHandle<std::io::Result<()>>> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Serving liveness probe");
    Ok(tokio::spawn(async move { axum::serve(listener, router()).await }))
}
