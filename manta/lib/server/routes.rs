//! Route definitions for the HTTP API.

use axum::{
    routing::{get, post},
    Router,
};

use super::{handlers, state::ServerState};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Builds the router with every API endpoint.
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/create", post(handlers::create_handler))
        .route("/exec", post(handlers::exec_handler))
        .route("/destroy", post(handlers::destroy_handler))
        .route("/snapshot/create", post(handlers::snapshot_create_handler))
        .route("/snapshot/restore", post(handlers::snapshot_restore_handler))
        .route("/snapshot/list", get(handlers::snapshot_list_handler))
        .route("/snapshot/delete", post(handlers::snapshot_delete_handler))
        .route("/healthz", get(handlers::healthz_handler))
        .with_state(state)
}
