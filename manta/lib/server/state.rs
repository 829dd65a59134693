//! Shared state for the HTTP server.

use std::sync::Arc;

use crate::{config::Config, sandbox::SandboxManager};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// State shared across all request handlers.
#[derive(Clone)]
pub struct ServerState {
    /// Server configuration.
    pub cfg: Arc<Config>,

    /// Live-sandbox state and bring-up pipelines.
    pub manager: Arc<SandboxManager>,
}

//-------------------------------------------------------------------------------------------------
// Methods
//-------------------------------------------------------------------------------------------------

impl ServerState {
    /// Builds the state, initializing the sandbox manager (and with it the
    /// netns pool).
    pub async fn new(cfg: Arc<Config>) -> crate::MantaResult<Self> {
        let manager = Arc::new(SandboxManager::init(cfg.clone()).await?);
        Ok(Self { cfg, manager })
    }
}
