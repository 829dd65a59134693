//! The HTTP surface.
//!
//! Thin request decoding and dispatch over the sandbox manager and snapshot
//! store:
//! - `POST /create` - restore a sandbox from the golden snapshot
//! - `POST /exec` - run a command in a sandbox via the agent RPC
//! - `POST /destroy` - tear a sandbox down
//! - `POST /snapshot/create` / `POST /snapshot/restore` - user snapshots
//! - `GET /snapshot/list` / `POST /snapshot/delete` - bundle management
//! - `GET /healthz` - liveness

mod handlers;
mod preflight;
mod routes;
mod state;
mod types;

use tokio::signal::unix::{signal, SignalKind};

use crate::MantaResult;

//-------------------------------------------------------------------------------------------------
// Exports
//-------------------------------------------------------------------------------------------------

pub use handlers::*;
pub use preflight::*;
pub use routes::*;
pub use state::*;
pub use types::*;

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Serves the API until SIGINT/SIGTERM, then destroys all live sandboxes and
/// tears the netns pool down.
///
/// Per-sandbox teardown is bounded, so a wedged VMM cannot stall shutdown
/// indefinitely.
pub async fn serve(state: ServerState) -> MantaResult<()> {
    let listener = tokio::net::TcpListener::bind(&state.cfg.listen_addr).await?;
    tracing::info!(addr = %state.cfg.listen_addr, "server listening");

    let manager = state.manager.clone();
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown signal received, cleaning up");
    manager.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(err) => {
            tracing::error!(%err, "install SIGINT handler");
            return std::future::pending().await;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            tracing::error!(%err, "install SIGTERM handler");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}
