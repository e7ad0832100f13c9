//! Admin HTTP endpoints.
//!
//! - `GET /metrics`: the default Prometheus registry as text
//! - `GET /health`: liveness with service name and version
//!
//! Served on `QUORRA_METRICS_PORT`; port 0 turns the server off.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use quorra_telemetry::{gather_metrics, TelemetryConfig};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4";

/// Running admin server
pub struct AdminServer {
    pub addr: SocketAddr,
    handle: JoinHandle<std::io::Result<()>>,
}

impl AdminServer {
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

/// Build the admin router for `service`.
pub fn admin_router(service: String) -> Router {
    Router::new()
        .route(
            "/health",
            get(move || {
                let service = service.clone();
                async move {
                    Json(serde_json::json!({
                        "status": "healthy",
                        "service": service,
                        "version": env!("CARGO_PKG_VERSION"),
                    }))
                }
            }),
        )
        .route("/metrics", get(metrics))
}

async fn metrics() -> Response {
    match gather_metrics() {
        Ok(text) => (StatusCode::OK, [(header::CONTENT_TYPE, PROMETHEUS_TEXT)], text).into_response(),
        Err(err) => {
            warn!(error = %err, "Failed to gather metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Serve the admin router on an already bound listener.
pub fn serve_admin(listener: TcpListener, service: String) -> Result<AdminServer> {
    let addr = listener.local_addr().context("Admin listener has no address")?;
    let router = admin_router(service);
    let handle = tokio::spawn(async move { axum::serve(listener, router).await });
    Ok(AdminServer { addr, handle })
}

/// Bind `metrics_port` on all interfaces and start serving, unless the port is 0.
pub async fn start_admin_server(config: &TelemetryConfig) -> Result<Option<AdminServer>> {
    if config.metrics_port == 0 {
        info!("Admin server disabled");
        return Ok(None);
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind admin server on {addr}"))?;
    let server = serve_admin(listener, config.service_name.clone())?;
    info!(addr = %server.addr, "Starting Admin server");
    Ok(Some(server))
}
