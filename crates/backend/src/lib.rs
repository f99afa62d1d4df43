//! The central HTTP backend: pairs Telegram identities with agents, queues
//! commands, stores results, and projects outcomes into a per-user project
//! view.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        routing::{get, post},
    },
    tokio_util::sync::CancellationToken,
    tower_http::trace::TraceLayer,
    tracing::info,
};

mod error;
mod projection;
mod routes;
mod state;

pub use {
    error::ApiError,
    state::{BackendState, CommandMeta},
};

/// Build the `/v1` router over shared state.
pub fn router(state: Arc<BackendState>) -> Router {
    Router::new()
        .route("/healthz", get(routes::healthz))
        .route("/v1/pair/start", post(routes::pair_start))
        .route("/v1/pair/claim", post(routes::pair_claim))
        .route("/v1/command", post(routes::command))
        .route("/v1/poll", get(routes::poll))
        .route("/v1/result", post(routes::result))
        .route("/v1/projects", get(routes::projects))
        .route("/v1/result/status", get(routes::result_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the token is cancelled.
pub async fn serve(
    state: Arc<BackendState>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "backend listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
