use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{
    config::{Config, CGROUP_REMOVE_RETRY_TIMEOUT, EXEC_DRAIN_TIMEOUT, VMM_EXIT_WAIT_TIMEOUT},
    net::NetnsManager,
    sandbox::{cgroup, Sandbox, SandboxRegistry},
    MantaError, MantaResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Owner of all live-sandbox state: the registry, the netns manager, and the
/// monotonic ID counters.
///
/// Creation pipelines live in the `restore` half of this type's impl; this
/// file carries identity, lookup, and the destroy path.
#[derive(Debug)]
pub struct SandboxManager {
    pub(crate) cfg: Arc<Config>,
    pub(crate) netns: NetnsManager,
    registry: SandboxRegistry,
    next_sandbox_id: AtomicU64,
    next_snapshot_id: AtomicU64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxManager {
    /// Builds the manager and pre-provisions the netns pool.
    pub async fn init(cfg: Arc<Config>) -> MantaResult<Self> {
        let netns = NetnsManager::init(cfg.netns_pool_size).await?;

        Ok(Self {
            cfg,
            netns,
            registry: SandboxRegistry::new(),
            next_sandbox_id: AtomicU64::new(0),
            next_snapshot_id: AtomicU64::new(0),
        })
    }

    /// The server configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.cfg
    }

    /// Allocates the next sandbox ID, `sb-N`.
    pub fn next_sandbox_id(&self) -> String {
        format!("sb-{}", self.next_sandbox_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Allocates the next user-snapshot ID, `us-N`.
    pub fn next_snapshot_id(&self) -> String {
        format!(
            "us-{}",
            self.next_snapshot_id.fetch_add(1, Ordering::SeqCst) + 1
        )
    }

    /// Looks a live sandbox up.
    pub fn get(&self, sandbox_id: &str) -> Option<Arc<Sandbox>> {
        self.registry.get(sandbox_id)
    }

    /// Publishes a sandbox that finished bring-up.
    pub(crate) fn register(&self, sandbox: Arc<Sandbox>) {
        self.registry.insert(sandbox);
    }

    /// Number of live sandboxes.
    pub fn live_count(&self) -> usize {
        self.registry.len()
    }

    /// Destroys a sandbox: unpublish, drain in-flight execs, then release
    /// every resource in reverse order of acquisition.
    pub async fn destroy(&self, sandbox_id: &str) -> MantaResult<()> {
        let sandbox = self
            .registry
            .remove(sandbox_id)
            .ok_or(MantaError::SandboxNotFound)?;

        if !sandbox.begin_destroy() {
            // A concurrent destroy won the transition; the sandbox is no
            // longer addressable either way.
            return Err(MantaError::SandboxNotFound);
        }

        if !sandbox.wait_for_exec_drain(EXEC_DRAIN_TIMEOUT).await {
            tracing::warn!(
                sandbox_id,
                in_flight = sandbox.in_flight_exec(),
                "destroy proceeding with execs still in flight after drain timeout"
            );
        }

        let result = self.teardown_resources(&sandbox).await;
        sandbox.finish_destroy();
        result
    }

    /// Destroys every live sandbox (graceful shutdown).
    pub async fn destroy_all(&self) {
        for sandbox in self.registry.drain() {
            if !sandbox.begin_destroy() {
                continue;
            }
            if !sandbox.wait_for_exec_drain(EXEC_DRAIN_TIMEOUT).await {
                tracing::warn!(sandbox_id = %sandbox.id, "shutdown drain timeout");
            }
            if let Err(err) = self.teardown_resources(&sandbox).await {
                tracing::warn!(sandbox_id = %sandbox.id, %err, "sandbox cleanup failed");
            }
            sandbox.finish_destroy();
        }
    }

    /// Shuts down the netns pool after all sandboxes are gone.
    pub async fn shutdown(&self) {
        self.destroy_all().await;
        self.netns.destroy().await;
    }

    /// Releases a sandbox's resources in reverse order of acquisition:
    /// agent connection, cgroup kill, VMM process group, cgroup dir, netns
    /// slot, jail directory. Cleanup errors are aggregated; every step runs.
    async fn teardown_resources(&self, sandbox: &Sandbox) -> MantaResult<()> {
        let mut errs: Vec<String> = Vec::new();

        drop(sandbox.agent.lock().await.take());

        // Kill everything in the cgroup first; the dir itself usually can't
        // be removed until the processes fully exit.
        if let Some(cgroup_path) = &sandbox.cgroup_path {
            if let Err(err) = cgroup::kill_cgroup(cgroup_path).await {
                errs.push(format!("kill cgroup: {}", err));
            }
        }

        if let Some(mut vmm) = sandbox.vmm.lock().await.take() {
            vmm.kill_group();
            if !vmm.wait_exit(VMM_EXIT_WAIT_TIMEOUT).await {
                errs.push("timed out waiting for firecracker process exit".to_string());
            }
        }

        if let Some(cgroup_path) = &sandbox.cgroup_path {
            // Racy right after the kill; non-fatal since startup scavenges
            // leftovers.
            if let Err(err) =
                cgroup::remove_cgroup_dir(cgroup_path, CGROUP_REMOVE_RETRY_TIMEOUT).await
            {
                tracing::warn!(
                    cgroup = %cgroup_path.display(),
                    %err,
                    "remove cgroup failed (non-fatal)"
                );
            }
        }

        let slot = sandbox
            .netns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(slot) = slot {
            self.netns.release(slot).await;
        }

        if let Err(err) = tokio::fs::remove_dir_all(&sandbox.dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                errs.push(format!("remove sandbox dir: {}", err));
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(MantaError::provisioning(errs.join("; ")))
        }
    }
}
