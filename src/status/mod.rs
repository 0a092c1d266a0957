//! Read-only HTTP status endpoint
//!
//! | Route           | Purpose                                  |
//! |-----------------|------------------------------------------|
//! | `/health/live`  | liveness probe                           |
//! | `/health/ready` | registered and working                   |
//! | `/metrics`      | Prometheus text format                   |
//! | `/node`         | JSON snapshot of the node context        |

pub mod health;

use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::cluster::NodeContext;
use crate::config::ServerConfig;

/// Shared handler state
#[derive(Clone)]
pub struct StatusState {
    pub context: Arc<NodeContext>,
    pub start_time: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

pub struct StatusServer {
    config: ServerConfig,
    state: StatusState,
}

impl StatusServer {
    pub fn new(config: ServerConfig, context: Arc<NodeContext>) -> Self {
        Self {
            config,
            state: StatusState {
                context,
                start_time: Instant::now(),
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health/live", get(health::liveness_probe))
            .route("/health/ready", get(health::readiness_probe))
            .route("/metrics", get(health::metrics_handler))
            .route("/node", get(health::node_snapshot))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` resolves
    pub async fn serve(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let addr = self.config.bind_address;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        tracing::info!(%addr, "Status server listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!("Status server stopped");
        Ok(())
    }
}
