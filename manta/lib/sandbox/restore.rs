use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use manta_rpc::{NetRequest, Request, RpcError};

use crate::{
    agent::{wait_for_agent_ready, AgentConn},
    config::{
        API_SOCKET_FILENAME, API_SOCKET_POLL_INTERVAL, API_SOCKET_READY_TIMEOUT,
        CGROUP_REMOVE_RETRY_TIMEOUT, GUEST_DNS, GUEST_IFACE, GUEST_NET_TIMEOUT,
        RESTORED_GUEST_CID, ROOTFS_FILENAME, SNAPSHOT_LOAD_RETRY_INTERVAL,
        SNAPSHOT_LOAD_RETRY_TIMEOUT, VMM_EXIT_WAIT_TIMEOUT, VMM_LOG_FILENAME, VM_CONFIG_FILENAME,
        VSOCK_FILENAME,
    },
    hypervisor::{is_transient_uds_error, HypervisorClient, VmConfig, VmmHandle},
    net::NetnsSlot,
    sandbox::{cgroup, Sandbox, SandboxManager},
    snapshot::{ensure_golden_bundle, materialize_rootfs, UserSnapshotMeta},
    MantaError, MantaResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Wall-clock durations of each bring-up stage.
///
/// This is the authoritative metric set for tail-latency work; `prep_overlap`
/// measures the parallel section as experienced by the request, not the sum
/// of its two halves.
#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreTimings {
    /// Cloning the source disk into the jail.
    pub disk_materialize: Duration,

    /// Acquiring a netns slot (pool pop or on-demand build).
    pub netns_acquire: Duration,

    /// Wall time across the parallel prep section.
    pub prep_overlap: Duration,

    /// Waiting for the VMM API socket to accept.
    pub socket_ready: Duration,

    /// The snapshot-load call, including transient-error retries.
    pub snapshot_load: Duration,

    /// Dial-and-ping until the in-guest agent answers.
    pub agent_ready: Duration,

    /// The guest `net` RPC.
    pub guest_net: Duration,

    /// Create request to published sandbox.
    pub total: Duration,
}

/// How the VMM reaches a running guest.
#[derive(Clone, Copy)]
enum BootMode<'a> {
    /// Spawn idle, wait for the API socket, load the snapshot.
    Restore {
        state_file: &'a Path,
        mem_file: &'a Path,
    },

    /// Boot from the generated `vm-config.json`.
    ColdBoot,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxManager {
    /// Creates a sandbox for `/create`: golden-snapshot restore when
    /// snapshots are enabled, cold boot otherwise. The sandbox is published
    /// in the registry before this returns.
    pub async fn create_sandbox(self: &Arc<Self>) -> MantaResult<Arc<Sandbox>> {
        let id = self.next_sandbox_id();
        let start = Instant::now();

        let (sandbox, timings) = if self.cfg.enable_snapshots {
            let layout = ensure_golden_bundle(&self.cfg).await?;
            self.build_sandbox(
                &id,
                start,
                &layout.base_disk,
                "clone snapshot base disk",
                BootMode::Restore {
                    state_file: &layout.state_file,
                    mem_file: &layout.mem_file,
                },
            )
            .await?
        } else {
            let base_rootfs = self.cfg.base_rootfs_path.clone();
            self.build_sandbox(&id, start, &base_rootfs, "copy rootfs", BootMode::ColdBoot)
                .await?
        };

        self.log_stage_timings("create", None, &id, &timings);
        self.register(sandbox.clone());
        Ok(sandbox)
    }

    /// Creates a sandbox from a user snapshot bundle. Lineage has already
    /// been checked by the caller.
    pub async fn restore_user_snapshot(
        self: &Arc<Self>,
        meta: &UserSnapshotMeta,
    ) -> MantaResult<Arc<Sandbox>> {
        for artifact in [&meta.state_file, &meta.mem_file, &meta.disk_file] {
            if !artifact.exists() {
                return Err(MantaError::provisioning(format!(
                    "snapshot artifact missing: {}",
                    artifact.display()
                )));
            }
        }

        let id = self.next_sandbox_id();
        let start = Instant::now();

        let (sandbox, timings) = self
            .build_sandbox(
                &id,
                start,
                &meta.disk_file,
                "clone user snapshot disk",
                BootMode::Restore {
                    state_file: &meta.state_file,
                    mem_file: &meta.mem_file,
                },
            )
            .await?;

        self.log_stage_timings("snapshot restore", Some(&meta.snapshot_id), &id, &timings);
        self.register(sandbox.clone());
        Ok(sandbox)
    }

    /// The full bring-up: jail prep, parallel disk+netns prep, VMM spawn,
    /// readiness gates, guest network config.
    ///
    /// On failure everything acquired so far is released in reverse order;
    /// the jail directory survives only under the debug keep flag.
    async fn build_sandbox(
        self: &Arc<Self>,
        id: &str,
        start: Instant,
        disk_src: &Path,
        clone_err_label: &str,
        mode: BootMode<'_>,
    ) -> MantaResult<(Arc<Sandbox>, RestoreTimings)> {
        let sb_dir = self.cfg.sandbox_dir(id);
        tokio::fs::create_dir_all(&sb_dir)
            .await
            .map_err(|e| MantaError::provisioning(format!("create sandbox dir: {}", e)))?;

        let result = self
            .build_in_jail(id, start, &sb_dir, disk_src, clone_err_label, mode)
            .await;

        if result.is_err() {
            if self.cfg.keep_failed_sandboxes {
                tracing::info!(sandbox_id = id, dir = %sb_dir.display(), "debug keep failed sandbox dir");
            } else {
                let _ = tokio::fs::remove_dir_all(&sb_dir).await;
            }
        }

        result
    }

    async fn build_in_jail(
        self: &Arc<Self>,
        id: &str,
        start: Instant,
        sb_dir: &Path,
        disk_src: &Path,
        clone_err_label: &str,
        mode: BootMode<'_>,
    ) -> MantaResult<(Arc<Sandbox>, RestoreTimings)> {
        let mut timings = RestoreTimings::default();

        let slot = self
            .parallel_prep(id, start, sb_dir, disk_src, clone_err_label, &mut timings)
            .await?;

        match self.bring_up(id, sb_dir, &slot, mode, &mut timings).await {
            Ok(sandbox) => {
                timings.total = start.elapsed();
                Ok((sandbox, timings))
            }
            Err(err) => {
                self.netns.release(slot).await;
                Err(err)
            }
        }
    }

    /// Disk clone and netns acquisition are independent; overlapping them
    /// collapses the create critical path to the slower of the two.
    async fn parallel_prep(
        self: &Arc<Self>,
        id: &str,
        start: Instant,
        sb_dir: &Path,
        disk_src: &Path,
        clone_err_label: &str,
        timings: &mut RestoreTimings,
    ) -> MantaResult<NetnsSlot> {
        let rootfs_copy = sb_dir.join(ROOTFS_FILENAME);
        let clone_mode = self.cfg.rootfs_clone_mode;
        let disk_src = disk_src.to_path_buf();
        let label = clone_err_label.to_string();
        let disk_task = tokio::spawn(async move {
            let clone_start = Instant::now();
            let result = materialize_rootfs(clone_mode, disk_src, rootfs_copy)
                .await
                .map_err(|e| MantaError::provisioning(format!("{}: {}", label, e)));
            (result, clone_start.elapsed())
        });

        let manager = Arc::clone(self);
        let tag = id.to_string();
        let netns_task = tokio::spawn(async move {
            let acquire_start = Instant::now();
            (manager.netns.acquire(&tag).await, acquire_start.elapsed())
        });

        let (disk_joined, netns_joined) = tokio::join!(disk_task, netns_task);
        let (disk_result, disk_dur) = disk_joined
            .map_err(|e| MantaError::provisioning(format!("disk prep task: {}", e)))?;
        let (netns_result, netns_dur) = netns_joined
            .map_err(|e| MantaError::provisioning(format!("netns prep task: {}", e)))?;

        timings.disk_materialize = disk_dur;
        timings.netns_acquire = netns_dur;
        timings.prep_overlap = start.elapsed();

        match (disk_result, netns_result) {
            (Ok(()), Ok(slot)) => Ok(slot),
            (Err(disk_err), Ok(slot)) => {
                self.netns.release(slot).await;
                Err(disk_err)
            }
            (Ok(()), Err(netns_err)) => Err(netns_err),
            (Err(disk_err), Err(netns_err)) => {
                tracing::debug!(%netns_err, "netns prep also failed");
                Err(disk_err)
            }
        }
    }

    async fn bring_up(
        self: &Arc<Self>,
        id: &str,
        sb_dir: &Path,
        slot: &NetnsSlot,
        mode: BootMode<'_>,
        timings: &mut RestoreTimings,
    ) -> MantaResult<Arc<Sandbox>> {
        let api_socket_path = sb_dir.join(API_SOCKET_FILENAME);
        let vsock_path = sb_dir.join(VSOCK_FILENAME);
        let log_path = sb_dir.join(VMM_LOG_FILENAME);

        // Stale sockets from a previous run under the debug keep flag.
        let _ = tokio::fs::remove_file(&api_socket_path).await;
        let _ = tokio::fs::remove_file(&vsock_path).await;

        let guest_cid = match mode {
            BootMode::Restore { .. } => RESTORED_GUEST_CID,
            BootMode::ColdBoot => 1000 + slot.subnet,
        };

        if matches!(mode, BootMode::ColdBoot) {
            VmConfig::new(
                &self.cfg,
                &slot.tap_name,
                ROOTFS_FILENAME,
                slot.subnet,
                VSOCK_FILENAME,
                guest_cid,
            )
            .write(sb_dir.join(VM_CONFIG_FILENAME))
            .await
            .map_err(|e| MantaError::provisioning(format!("write vm config: {}", e)))?;
        }

        let mut cgroup_path = if self.cfg.enable_cgroups {
            cgroup::create_sandbox_cgroup(&self.cfg.cgroup_root, id).await
        } else {
            None
        };

        let mut vmm = match VmmHandle::spawn(
            &self.cfg,
            sb_dir,
            &slot.netns_path(),
            &log_path,
            matches!(mode, BootMode::ColdBoot),
        )
        .await
        {
            Ok(vmm) => vmm,
            Err(err) => {
                if let Some(cg) = &cgroup_path {
                    let _ = tokio::fs::remove_dir(cg).await;
                }
                return Err(err);
            }
        };

        let setup = self
            .post_spawn_setup(
                mode,
                slot,
                &api_socket_path,
                &vsock_path,
                vmm.pid(),
                &mut cgroup_path,
                timings,
            )
            .await;

        match setup {
            Ok(agent) => Ok(Arc::new(Sandbox::new(
                id,
                slot.clone(),
                sb_dir,
                guest_cid,
                cgroup_path,
                vmm,
                agent,
            ))),
            Err(err) => {
                vmm.kill_group();
                let _ = vmm.wait_exit(VMM_EXIT_WAIT_TIMEOUT).await;
                if let Some(cg) = &cgroup_path {
                    let _ = cgroup::kill_cgroup(cg).await;
                    let _ = cgroup::remove_cgroup_dir(cg, CGROUP_REMOVE_RETRY_TIMEOUT).await;
                }
                Err(err)
            }
        }
    }

    /// Everything between VMM spawn and a configured guest: API-socket gate,
    /// cgroup attach, snapshot load, agent readiness, guest networking.
    #[allow(clippy::too_many_arguments)]
    async fn post_spawn_setup(
        &self,
        mode: BootMode<'_>,
        slot: &NetnsSlot,
        api_socket_path: &Path,
        vsock_path: &Path,
        vmm_pid: u32,
        cgroup_path: &mut Option<PathBuf>,
        timings: &mut RestoreTimings,
    ) -> MantaResult<AgentConn> {
        if matches!(mode, BootMode::Restore { .. }) {
            // Gate snapshot-load on the API socket accepting; without it the
            // load races the VMM's startup into ENOENT/ECONNREFUSED.
            let stage = Instant::now();
            wait_for_api_socket(api_socket_path, API_SOCKET_READY_TIMEOUT).await?;
            timings.socket_ready = stage.elapsed();
        }

        // Attach after spawn; children inherit the group. Failure downgrades
        // to no isolation rather than failing the create.
        if let Some(cg) = cgroup_path.clone() {
            if let Err(err) = cgroup::attach_pid(&cg, vmm_pid).await {
                tracing::warn!(pid = vmm_pid, cgroup = %cg.display(), %err, "move firecracker pid to cgroup failed");
                let _ = tokio::fs::remove_dir(&cg).await;
                *cgroup_path = None;
            }
        }

        if let BootMode::Restore {
            state_file,
            mem_file,
        } = mode
        {
            let stage = Instant::now();
            let fc = HypervisorClient::new(api_socket_path, None);
            load_snapshot_with_retry(&fc, state_file, mem_file, true, SNAPSHOT_LOAD_RETRY_TIMEOUT)
                .await
                .map_err(|e| MantaError::Hypervisor(format!("load snapshot: {}", e)))?;
            timings.snapshot_load = stage.elapsed();
        }

        let stage = Instant::now();
        let mut agent = wait_for_agent_ready(
            vsock_path,
            self.cfg.agent_port,
            self.cfg.agent_wait_timeout,
            self.cfg.agent_dial_timeout,
        )
        .await?;
        timings.agent_ready = stage.elapsed();

        // Per-sandbox guest addressing lands via vsock, so bring-up never
        // depends on guest-disk mutation or an in-guest DHCP.
        let stage = Instant::now();
        let net_request = Request::net(NetRequest {
            interface: Some(GUEST_IFACE.to_string()),
            address: format!("{}/{}", slot.guest_ip, slot.subnet_cidr.prefix()),
            gateway: slot.host_ip.to_string(),
            dns: Some(GUEST_DNS.to_string()),
        });
        agent
            .call(&net_request, GUEST_NET_TIMEOUT)
            .await
            .map_err(|err| match err {
                MantaError::AgentRpc(RpcError::Io(ref io))
                    if io.kind() == std::io::ErrorKind::TimedOut =>
                {
                    MantaError::ReadinessTimeout(format!("guest network config: {}", io))
                }
                other => MantaError::AgentRpc(RpcError::Remote(format!(
                    "agent network config failed: {}",
                    other
                ))),
            })?;
        timings.guest_net = stage.elapsed();

        Ok(agent)
    }

    fn log_stage_timings(
        &self,
        kind: &str,
        snapshot_id: Option<&str>,
        sandbox_id: &str,
        timings: &RestoreTimings,
    ) {
        if !self.cfg.enable_stage_timing_logs {
            return;
        }
        tracing::info!(
            kind,
            snapshot_id,
            sandbox_id,
            disk_materialize = ?timings.disk_materialize,
            netns_acquire = ?timings.netns_acquire,
            prep_overlap = ?timings.prep_overlap,
            socket_ready = ?timings.socket_ready,
            snapshot_load = ?timings.snapshot_load,
            agent_ready = ?timings.agent_ready,
            guest_net = ?timings.guest_net,
            total = ?timings.total,
            "stage timings"
        );
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Polls until the VMM API socket exists and accepts a connection.
///
/// The interval is deliberately tight; at restore latencies a sloppy poll
/// here dominates the tail.
pub async fn wait_for_api_socket(socket_path: &Path, timeout: Duration) -> MantaResult<()> {
    let deadline = Instant::now() + timeout;
    let mut last_err: Option<std::io::Error> = None;

    while Instant::now() < deadline {
        match tokio::time::timeout(
            Duration::from_millis(50),
            tokio::net::UnixStream::connect(socket_path),
        )
        .await
        {
            Ok(Ok(_stream)) => return Ok(()),
            Ok(Err(err)) => last_err = Some(err),
            Err(_) => {
                last_err = Some(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect attempt timed out",
                ))
            }
        }
        tokio::time::sleep(API_SOCKET_POLL_INTERVAL).await;
    }

    match last_err {
        Some(err) => Err(MantaError::ReadinessTimeout(format!(
            "firecracker api socket {} not ready after {:?}: {}",
            socket_path.display(),
            timeout,
            err
        ))),
        None => Err(MantaError::ReadinessTimeout(format!(
            "firecracker api socket {} not ready after {:?}",
            socket_path.display(),
            timeout
        ))),
    }
}

/// Calls snapshot-load, retrying transient unix-socket races within the
/// restore window.
pub async fn load_snapshot_with_retry(
    fc: &HypervisorClient,
    state_file: &Path,
    mem_file: &Path,
    resume: bool,
    timeout: Duration,
) -> MantaResult<()> {
    let deadline = Instant::now() + timeout;
    let state = state_file.display().to_string();
    let mem = mem_file.display().to_string();

    loop {
        match fc.load_snapshot(&state, &mem, resume).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                if !is_transient_uds_error(&err) || Instant::now() >= deadline {
                    return Err(err);
                }
                tokio::time::sleep(SNAPSHOT_LOAD_RETRY_INTERVAL).await;
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_api_socket_wait_succeeds_on_listening_socket() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sock = dir.path().join("firecracker.sock");
        let _listener = tokio::net::UnixListener::bind(&sock)?;

        wait_for_api_socket(&sock, Duration::from_millis(500)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_api_socket_wait_times_out_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sock = dir.path().join("firecracker.sock");

        let start = Instant::now();
        let result = wait_for_api_socket(&sock, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(MantaError::ReadinessTimeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_api_socket_wait_catches_late_listener() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sock = dir.path().join("firecracker.sock");

        let sock_for_task = sock.clone();
        let binder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tokio::net::UnixListener::bind(&sock_for_task).expect("bind")
        });

        wait_for_api_socket(&sock, Duration::from_secs(1)).await?;
        let _listener = binder.await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_load_retry_gives_up_on_persistent_race() {
        // No VMM ever appears, so every attempt hits ENOENT; the retry loop
        // must stop at the deadline instead of spinning forever.
        let fc = HypervisorClient::new("/nonexistent/manta-test/firecracker.sock", None);

        let start = Instant::now();
        let result = load_snapshot_with_retry(
            &fc,
            Path::new("/s/state.snap"),
            Path::new("/s/mem.snap"),
            true,
            Duration::from_millis(60),
        )
        .await;

        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(60));
    }
}
