//! HTTP surface of the relay and worker processes.
//!
//! # Endpoints
//!
//! - `GET /ws/courses/{course_id}` - websocket receiving new questions of a course
//! - `GET /ws/questions/{question_id}` - websocket receiving new answers to a question
//! - `GET /metrics` - Prometheus text format
//! - `GET /health` - Returns 200 if the server is running

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use super::connection::{run_connection, RelayConfig};
use super::registry::SubscriptionRegistry;
use crate::events::Parent;
use crate::metrics::metrics_handler;

/// Errors from running an HTTP server.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state of the relay's HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Arc<SubscriptionRegistry>,
    config: RelayConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(registry: Arc<SubscriptionRegistry>, config: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                config,
                shutdown_tx,
            }),
        }
    }

    /// Closes every open subscriber connection.
    pub fn close_connections(&self) {
        // No receivers simply means no open connections
        let _ = self.inner.shutdown_tx.send(());
    }

    fn upgrade(&self, ws: WebSocketUpgrade, parent: Parent) -> impl IntoResponse {
        let registry = Arc::clone(&self.inner.registry);
        let config = self.inner.config.clone();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        ws.on_upgrade(move |socket| run_connection(socket, parent, registry, config, shutdown_rx))
    }
}

async fn course_socket(
    ws: WebSocketUpgrade,
    Path(course_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    state.upgrade(ws, Parent::course(&course_id))
}

async fn question_socket(
    ws: WebSocketUpgrade,
    Path(question_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    state.upgrade(ws, Parent::question(&question_id))
}

/// Health check handler.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Routes shared by every process: `/metrics` and `/health`.
pub fn build_ops_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
}

/// Builds the relay router: subscriber websockets plus the operational routes.
pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/ws/courses/{course_id}", get(course_socket))
        .route("/ws/questions/{question_id}", get(question_socket))
        .with_state(app_state)
        .merge(build_ops_router())
}

/// Binds `addr` and serves `router` until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, router: Router, shutdown: F) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
