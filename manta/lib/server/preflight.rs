//! Startup preflight and diagnostics.
//!
//! Everything here runs once before the listener opens: binary/artifact
//! checks, host networking that must never be touched on the request path,
//! cgroup scavenging, and the golden bundle.

use crate::{
    config::Config,
    hypervisor::resolve_binary,
    net,
    sandbox::cgroup,
    snapshot::{ensure_golden_bundle, probe_reflink_support},
    MantaError, MantaResult,
};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Validates the host and prepares everything bring-up depends on.
pub async fn ensure_preflight(cfg: &Config) -> MantaResult<()> {
    if resolve_binary(&cfg.firecracker_bin).is_none() {
        return Err(MantaError::Config(format!(
            "firecracker binary not found: {}",
            cfg.firecracker_bin.display()
        )));
    }

    for required in [&cfg.kernel_path, &cfg.base_rootfs_path] {
        if !required.exists() {
            return Err(MantaError::Config(format!(
                "required file {} missing",
                required.display()
            )));
        }
    }

    if !std::path::Path::new("/dev/kvm").exists() {
        return Err(MantaError::Config("/dev/kvm unavailable".to_string()));
    }

    tokio::fs::create_dir_all(cfg.sandboxes_dir())
        .await
        .map_err(|e| MantaError::Config(format!("create work dir: {}", e)))?;

    net::enable_ip_forwarding().await?;

    // NAT is configured once, broadly, so sandbox creation never churns
    // iptables.
    net::ensure_global_masquerade(&cfg.host_nat_iface).await?;

    if cfg.enable_cgroups {
        match cgroup::ensure_cgroup_root(&cfg.cgroup_root).await {
            Ok(()) => cgroup::scavenge_cgroups(&cfg.cgroup_root).await,
            Err(err) => {
                tracing::warn!(%err, "cgroups disabled (falling back to process groups only)");
            }
        }
    }

    if cfg.enable_snapshots {
        ensure_golden_bundle(cfg)
            .await
            .map_err(|e| MantaError::Config(format!("ensure snapshot: {}", e)))?;
    }

    Ok(())
}

/// Logs the startup diagnostics block, including the reflink probe.
pub async fn log_startup_diagnostics(cfg: &Config) {
    tracing::info!(
        listen_addr = %cfg.listen_addr,
        host_iface = %cfg.host_nat_iface,
        work_dir = %cfg.work_dir.display(),
        snapshots_enabled = cfg.enable_snapshots,
        netns_pool_size = cfg.netns_pool_size,
        cgroups_enabled = cfg.enable_cgroups,
        rootfs_clone_mode = ?cfg.rootfs_clone_mode,
        stage_timing_logs = cfg.enable_stage_timing_logs,
        "startup diagnostics"
    );

    match probe_reflink_support(&cfg.work_dir).await {
        Err(err) => tracing::warn!(%err, "reflink probe failed to run"),
        Ok(supported) => {
            tracing::info!(reflink_supported = supported, "storage diagnostics");
            if cfg.enable_snapshots && !supported {
                tracing::warn!(
                    "work dir does not support reflink; snapshot disk materialization will fall \
                     back to full copies unless MANTA_ROOTFS_CLONE_MODE=reflink-required"
                );
            }
        }
    }
}
