use std::{collections::HashMap, sync::Arc, sync::Mutex};

use crate::sandbox::Sandbox;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The set of live sandboxes, keyed by ID.
///
/// Operations on the map are mutually exclusive and short; anything slow
/// (teardown, RPCs) happens outside the lock against the `Arc` handed out.
#[derive(Debug, Default)]
pub struct SandboxRegistry {
    inner: Mutex<HashMap<String, Arc<Sandbox>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a sandbox.
    pub fn insert(&self, sandbox: Arc<Sandbox>) {
        self.lock().insert(sandbox.id.clone(), sandbox);
    }

    /// Looks a sandbox up by ID.
    pub fn get(&self, sandbox_id: &str) -> Option<Arc<Sandbox>> {
        self.lock().get(sandbox_id).cloned()
    }

    /// Removes and returns a sandbox, unpublishing it atomically so no new
    /// request can resolve it while destroy runs.
    pub fn remove(&self, sandbox_id: &str) -> Option<Arc<Sandbox>> {
        self.lock().remove(sandbox_id)
    }

    /// Removes and returns every live sandbox (shutdown path).
    pub fn drain(&self) -> Vec<Arc<Sandbox>> {
        self.lock().drain().map(|(_, sb)| sb).collect()
    }

    /// Number of live sandboxes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no sandbox is live.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Sandbox>>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
