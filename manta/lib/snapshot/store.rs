use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    agent,
    config::{
        Config, API_SOCKET_FILENAME, MEM_SNAP_FILENAME, META_FILENAME, RESTORED_GUEST_CID,
        ROOTFS_FILENAME, SNAPSHOT_BASE_SUBDIR, SNAPSHOT_SUBDIR, STATE_SNAP_FILENAME,
        VMM_EXIT_WAIT_TIMEOUT, VMM_LOG_FILENAME, VM_CONFIG_FILENAME, VSOCK_FILENAME,
    },
    hypervisor::{HypervisorClient, VmConfig, VmmHandle},
    net::{self, SNAPSHOT_NETNS_TAG, SNAPSHOT_SUBNET_INDEX},
    snapshot::materialize_rootfs,
    MantaError, MantaResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The golden-bundle metadata schema version this build reads and writes.
pub const GOLDEN_META_VERSION: u32 = 1;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// On-disk locations of the golden snapshot bundle.
#[derive(Debug, Clone)]
pub struct GoldenLayout {
    /// `<work_dir>/snapshot`.
    pub dir: PathBuf,

    /// `<work_dir>/snapshot/base`, holding the immutable base disk and the
    /// golden VM's scratch files.
    pub base_dir: PathBuf,

    /// The immutable base disk every restore clones from.
    pub base_disk: PathBuf,

    /// VMM state file.
    pub state_file: PathBuf,

    /// Guest memory file.
    pub mem_file: PathBuf,

    /// Bundle metadata.
    pub meta_file: PathBuf,
}

/// Golden-bundle metadata persisted alongside the snapshot artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoldenMeta {
    /// Schema version; anything but [`GOLDEN_META_VERSION`] forces a rebuild.
    pub version: u32,

    /// SHA-256 of the base rootfs the bundle was built from.
    pub lineage_id: String,

    /// The base rootfs path at build time, for operator forensics.
    pub base_rootfs_path: String,

    /// RFC 3339 build timestamp.
    pub created_at: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GoldenLayout {
    /// Derives the bundle layout under `work_dir`.
    pub fn new(work_dir: impl AsRef<Path>) -> Self {
        let dir = work_dir.as_ref().join(SNAPSHOT_SUBDIR);
        let base_dir = dir.join(SNAPSHOT_BASE_SUBDIR);
        Self {
            base_disk: base_dir.join(ROOTFS_FILENAME),
            state_file: dir.join(STATE_SNAP_FILENAME),
            mem_file: dir.join(MEM_SNAP_FILENAME),
            meta_file: dir.join(META_FILENAME),
            base_dir,
            dir,
        }
    }

    /// Whether all three snapshot artifacts are present.
    pub fn artifacts_exist(&self) -> bool {
        self.state_file.exists() && self.mem_file.exists() && self.base_disk.exists()
    }

    /// Removes the bundle directory and recreates an empty base dir.
    pub async fn reset(&self) -> MantaResult<()> {
        tokio::fs::remove_dir_all(&self.dir)
            .await
            .map_err(|e| MantaError::provisioning(format!("remove old snapshot dir: {}", e)))?;
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| MantaError::provisioning(format!("recreate snapshot dir: {}", e)))?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Ensures a valid golden bundle exists, building (or rebuilding) it when
/// missing or when its lineage no longer matches the configured base rootfs.
///
/// The fast path is one small metadata read, so calling this per create is
/// fine. A rebuild boots a golden VM on reserved resource names, waits for
/// the in-guest agent, pauses, snapshots, and kills the VM; the resulting
/// state/memory/base-disk files are immutable and shared read-only across
/// every subsequent restore.
pub async fn ensure_golden_bundle(cfg: &Config) -> MantaResult<GoldenLayout> {
    let layout = GoldenLayout::new(&cfg.work_dir);

    if layout.artifacts_exist() {
        match validate_golden_meta(&layout, cfg).await {
            Ok(()) => return Ok(layout),
            Err(err) => {
                tracing::warn!(%err, "snapshot metadata mismatch; rebuilding snapshot");
                layout.reset().await?;
            }
        }
    }

    tokio::fs::create_dir_all(&layout.base_dir)
        .await
        .map_err(|e| MantaError::provisioning(format!("create snapshot dir: {}", e)))?;

    // The base disk feeds both the snapshot and every per-sandbox clone; it
    // must stay immutable once the snapshot exists.
    materialize_rootfs(
        cfg.rootfs_clone_mode,
        &cfg.base_rootfs_path,
        &layout.base_disk,
    )
    .await
    .map_err(|e| MantaError::provisioning(format!("copy base disk for snapshot: {}", e)))?;

    // Boot the golden VM on stable resource names so the captured state can
    // be restored inside any per-sandbox netns and jail.
    let slot = net::provision(SNAPSHOT_NETNS_TAG, SNAPSHOT_SUBNET_INDEX)
        .await
        .map_err(|e| MantaError::provisioning(format!("setup snapshot netns: {}", e)))?;

    let build_result = build_golden_bundle(cfg, &layout, &slot).await;

    if let Err(err) = net::teardown(&slot).await {
        tracing::warn!(%err, "snapshot netns teardown failed");
    }
    build_result?;

    tracing::info!(
        state = %layout.state_file.display(),
        mem = %layout.mem_file.display(),
        base_disk = %layout.base_disk.display(),
        "snapshot ready"
    );
    Ok(layout)
}

async fn build_golden_bundle(
    cfg: &Config,
    layout: &GoldenLayout,
    slot: &net::NetnsSlot,
) -> MantaResult<()> {
    let config_path = layout.base_dir.join(VM_CONFIG_FILENAME);
    VmConfig::new(
        cfg,
        &slot.tap_name,
        ROOTFS_FILENAME,
        slot.subnet,
        VSOCK_FILENAME,
        RESTORED_GUEST_CID,
    )
    .write(&config_path)
    .await
    .map_err(|e| MantaError::provisioning(format!("write snapshot vm config: {}", e)))?;

    // Stale sockets from a crashed attempt would wedge the spawn.
    let _ = tokio::fs::remove_file(layout.base_dir.join(API_SOCKET_FILENAME)).await;
    let _ = tokio::fs::remove_file(layout.base_dir.join(VSOCK_FILENAME)).await;

    let log_path = layout.base_dir.join(VMM_LOG_FILENAME);
    let mut vmm = VmmHandle::spawn(cfg, &layout.base_dir, &slot.netns_path(), &log_path, true)
        .await
        .map_err(|e| MantaError::Hypervisor(format!("start snapshot firecracker: {}", e)))?;

    let result = snapshot_booted_vm(cfg, layout).await;

    // Kill the golden VM regardless; only the base disk and snapshot files
    // survive it.
    vmm.kill_group();
    if !vmm.wait_exit(VMM_EXIT_WAIT_TIMEOUT).await {
        tracing::warn!("timed out waiting for golden vm exit");
    }
    result?;

    write_golden_meta(layout, cfg).await
}

async fn snapshot_booted_vm(cfg: &Config, layout: &GoldenLayout) -> MantaResult<()> {
    let vsock_path = layout.base_dir.join(VSOCK_FILENAME);
    let conn = agent::wait_for_agent_ready(
        &vsock_path,
        cfg.agent_port,
        cfg.agent_wait_timeout,
        cfg.agent_dial_timeout,
    )
    .await
    .map_err(|e| MantaError::ReadinessTimeout(format!("wait for snapshot agent: {}", e)))?;
    // No host connection may be captured in the snapshot.
    drop(conn);

    let fc = HypervisorClient::new(layout.base_dir.join(API_SOCKET_FILENAME), None);
    fc.pause()
        .await
        .map_err(|e| MantaError::Hypervisor(format!("pause snapshot vm: {}", e)))?;

    let _ = tokio::fs::remove_file(&layout.state_file).await;
    let _ = tokio::fs::remove_file(&layout.mem_file).await;

    fc.create_full_snapshot(
        &layout.state_file.display().to_string(),
        &layout.mem_file.display().to_string(),
    )
    .await
    .map_err(|e| MantaError::Hypervisor(format!("create snapshot: {}", e)))
}

/// Validates bundle metadata: schema version and lineage against the current
/// base rootfs.
pub async fn validate_golden_meta(layout: &GoldenLayout, cfg: &Config) -> MantaResult<()> {
    let raw = tokio::fs::read(&layout.meta_file)
        .await
        .map_err(|e| MantaError::provisioning(format!("read snapshot meta: {}", e)))?;
    let meta: GoldenMeta = serde_json::from_slice(&raw)
        .map_err(|e| MantaError::provisioning(format!("decode snapshot meta: {}", e)))?;

    if meta.version != GOLDEN_META_VERSION {
        return Err(MantaError::provisioning(format!(
            "unsupported snapshot meta version {}",
            meta.version
        )));
    }

    if cfg.base_rootfs_lineage_id.trim().is_empty() {
        return Ok(());
    }
    if meta.lineage_id.trim().is_empty() {
        return Err(MantaError::provisioning("snapshot meta missing lineage id"));
    }
    if meta.lineage_id != cfg.base_rootfs_lineage_id {
        return Err(MantaError::provisioning(format!(
            "snapshot lineage mismatch (meta={} current={})",
            meta.lineage_id, cfg.base_rootfs_lineage_id
        )));
    }

    Ok(())
}

async fn write_golden_meta(layout: &GoldenLayout, cfg: &Config) -> MantaResult<()> {
    let meta = GoldenMeta {
        version: GOLDEN_META_VERSION,
        lineage_id: cfg.base_rootfs_lineage_id.clone(),
        base_rootfs_path: cfg.base_rootfs_path.display().to_string(),
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
    };

    write_json_atomic(&layout.meta_file, &meta).await
}

/// Writes `value` as pretty JSON via temp-file-and-rename so readers never
/// observe a torn metadata file.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> MantaResult<()> {
    let mut raw = serde_json::to_vec_pretty(value)?;
    raw.push(b'\n');

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &raw)
        .await
        .map_err(|e| MantaError::provisioning(format!("write snapshot meta: {}", e)))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| MantaError::provisioning(format!("persist snapshot meta: {}", e)))?;

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn layout_with_meta(dir: &Path, meta: &serde_json::Value) -> GoldenLayout {
        let layout = GoldenLayout::new(dir);
        tokio::fs::create_dir_all(&layout.base_dir).await.unwrap();
        tokio::fs::write(&layout.meta_file, serde_json::to_vec(meta).unwrap())
            .await
            .unwrap();
        layout
    }

    #[tokio::test]
    async fn test_meta_round_trip_and_validation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = GoldenLayout::new(dir.path());
        tokio::fs::create_dir_all(&layout.base_dir).await?;

        let mut cfg = Config::for_tests(dir.path());
        cfg.base_rootfs_lineage_id = "abc123".into();

        write_golden_meta(&layout, &cfg).await?;
        validate_golden_meta(&layout, &cfg).await?;

        // A different current lineage must invalidate the bundle.
        cfg.base_rootfs_lineage_id = "def456".into();
        assert!(validate_golden_meta(&layout, &cfg).await.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_meta_wrong_version_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = layout_with_meta(
            dir.path(),
            &serde_json::json!({
                "version": 2,
                "lineage_id": "abc",
                "base_rootfs_path": "/x",
                "created_at": "2026-01-01T00:00:00Z",
            }),
        )
        .await;

        let cfg = Config::for_tests(dir.path());
        assert!(validate_golden_meta(&layout, &cfg).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_meta_missing_fields_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = layout_with_meta(dir.path(), &serde_json::json!({"version": 1})).await;

        let cfg = Config::for_tests(dir.path());
        assert!(validate_golden_meta(&layout, &cfg).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_meta_empty_current_lineage_accepts_any_bundle() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = layout_with_meta(
            dir.path(),
            &serde_json::json!({
                "version": 1,
                "lineage_id": "whatever",
                "base_rootfs_path": "/x",
                "created_at": "2026-01-01T00:00:00Z",
            }),
        )
        .await;

        // Lineage checks are skipped while the control plane has no lineage
        // of its own (snapshots disabled at hash time).
        let cfg = Config::for_tests(dir.path());
        validate_golden_meta(&layout, &cfg).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_atomic_write_leaves_no_temp_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("meta.json");

        write_json_atomic(&path, &serde_json::json!({"version": 1})).await?;

        assert!(path.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "meta.json")
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }
}
