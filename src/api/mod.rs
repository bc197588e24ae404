//! HTTP surface.
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | POST | `/submissions` | submit; 202 with the id, or a synchronous rejection |
//! | GET | `/submissions/{id}` | poll; result fields only once terminal |
//! | DELETE | `/submissions/{id}` | cancel |
//! | POST | `/submissions/{id}/ack` | acknowledge a terminal result |
//! | GET | `/results/stream` | terminal results as server-sent events |
//! | GET | `/health` | daemon reachability and readiness |
//! | GET | `/metrics` | Prometheus text format |

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::broker::ExecutionBroker;
use crate::health::HealthMonitor;
use crate::metrics::metrics_handler;

pub use handlers::{ApiError, ErrorBody, PollResponse, ResultFields, SubmitResponse};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub broker: ExecutionBroker,
    pub health: Arc<HealthMonitor>,
}

impl AppState {
    pub fn new(broker: ExecutionBroker, health: Arc<HealthMonitor>) -> Self {
        Self { broker, health }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/submissions", post(handlers::submit))
        .route(
            "/submissions/{id}",
            get(handlers::poll).delete(handlers::cancel),
        )
        .route("/submissions/{id}/ack", post(handlers::acknowledge))
        .route("/results/stream", get(handlers::results_stream))
        .route("/health", get(handlers::health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serves the API on `addr` until Ctrl-C.
pub async fn serve(state: AppState, addr: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    // An error here means no handler could be installed; serve until killed.
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown requested");
    } else {
        std::future::pending::<()>().await;
    }
}
