use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::bind_addr;
use crate::engine::Engine;

/// HTTP surface over a running engine: Prometheus metrics, liveness,
/// dashboard snapshots and window control.
pub struct Server {
    addr: String,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl Server {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            shutdown: Mutex::new(None),
        }
    }

    /// Binds the listener and serves in the background. Returns the bound
    /// address.
    pub async fn start(&self, engine: Arc<Engine>) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };
        let bind_addr = bind_addr(addr);

        let app = router(engine);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "http server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "http server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Builds the routes served for `engine`.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/window/:size", post(window_handler))
        .with_state(engine)
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(engine): State<Arc<Engine>>) -> Response {
    match engine.health().encode() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response()
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /snapshot - Current series, accumulators and readouts as JSON.
async fn snapshot_handler(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.snapshot())
}

#[derive(Serialize)]
struct WindowResponse {
    window_size: usize,
}

/// POST /window/:size - Changes the moving average window.
async fn window_handler(
    State(engine): State<Arc<Engine>>,
    Path(size): Path<usize>,
) -> Response {
    match engine.set_window_size(size) {
        Ok(()) => (StatusCode::OK, Json(WindowResponse { window_size: size })).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}
