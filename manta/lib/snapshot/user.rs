use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    config::{Config, DISK_FILENAME, MEM_SNAP_FILENAME, META_FILENAME, STATE_SNAP_FILENAME, USER_SNAPSHOTS_SUBDIR},
    hypervisor::HypervisorClient,
    sandbox::Sandbox,
    snapshot::{materialize_rootfs, write_json_atomic},
    MantaError, MantaResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Snapshot IDs are used as directory names; the pattern forbids traversal
/// and anything else surprising on a filesystem.
static SNAPSHOT_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("valid pattern"));

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Metadata persisted with a user snapshot bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserSnapshotMeta {
    /// The snapshot's ID, `us-N` for server-assigned ones.
    pub snapshot_id: String,

    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// RFC 3339 creation timestamp.
    pub created_at: String,

    /// VMM state file path.
    pub state_file: PathBuf,

    /// Guest memory file path.
    pub mem_file: PathBuf,

    /// Persisted disk artifact path.
    pub disk_file: PathBuf,

    /// Base-rootfs lineage the snapshot depends on.
    pub lineage_id: String,

    /// The sandbox this snapshot was captured from.
    pub source_sandbox_id: String,

    /// That sandbox's writable disk path at capture time.
    pub source_rootfs_path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Validates a client-supplied snapshot ID against the allowed pattern.
pub fn validate_snapshot_id(snapshot_id: &str) -> MantaResult<()> {
    if SNAPSHOT_ID_PATTERN.is_match(snapshot_id) {
        Ok(())
    } else {
        Err(MantaError::validation("invalid snapshot_id"))
    }
}

/// `<work_dir>/user-snapshots`.
pub fn user_snapshots_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(USER_SNAPSHOTS_SUBDIR)
}

/// A user bundle's directory.
pub fn user_snapshot_dir(work_dir: &Path, snapshot_id: &str) -> PathBuf {
    user_snapshots_dir(work_dir).join(snapshot_id)
}

/// Captures a user snapshot from a running sandbox.
///
/// The sandbox's persistent agent connection is closed first: a captured
/// host↔guest vsock session goes stale in the snapshot and measurably delays
/// agent re-readiness after restore. The VM is paused around the snapshot and
/// resumed on both the success and failure paths.
pub async fn create_user_snapshot(
    cfg: &Config,
    sandbox: &Sandbox,
    snapshot_id: &str,
    name: Option<String>,
) -> MantaResult<UserSnapshotMeta> {
    {
        let mut agent = sandbox.agent.lock().await;
        if agent.take().is_some() {
            tracing::debug!(sandbox_id = %sandbox.id, "closed persistent agent connection before snapshot");
        }
    }

    let bundle_dir = user_snapshot_dir(&cfg.work_dir, snapshot_id);
    tokio::fs::create_dir_all(&bundle_dir)
        .await
        .map_err(|e| MantaError::provisioning(format!("create snapshot dir: {}", e)))?;

    let fc = HypervisorClient::new(&sandbox.api_socket_path, None);
    fc.pause()
        .await
        .map_err(|e| MantaError::Hypervisor(format!("pause vm: {}", e)))?;

    let result = snapshot_paused_sandbox(cfg, sandbox, snapshot_id, name, &bundle_dir).await;

    match result {
        Ok(meta) => {
            fc.resume()
                .await
                .map_err(|e| MantaError::Hypervisor(format!("resume vm after snapshot: {}", e)))?;
            Ok(meta)
        }
        Err(err) => {
            if let Err(resume_err) = fc.resume().await {
                tracing::warn!(sandbox_id = %sandbox.id, %resume_err, "resume after failed snapshot");
            }
            Err(err)
        }
    }
}

async fn snapshot_paused_sandbox(
    cfg: &Config,
    sandbox: &Sandbox,
    snapshot_id: &str,
    name: Option<String>,
    bundle_dir: &Path,
) -> MantaResult<UserSnapshotMeta> {
    let state_file = bundle_dir.join(STATE_SNAP_FILENAME);
    let mem_file = bundle_dir.join(MEM_SNAP_FILENAME);
    let disk_file = bundle_dir.join(DISK_FILENAME);

    for stale in [&state_file, &mem_file, &disk_file] {
        let _ = tokio::fs::remove_file(stale).await;
    }

    let fc = HypervisorClient::new(&sandbox.api_socket_path, None);
    fc.create_full_snapshot(
        &state_file.display().to_string(),
        &mem_file.display().to_string(),
    )
    .await
    .map_err(|e| MantaError::Hypervisor(format!("create user snapshot: {}", e)))?;

    materialize_rootfs(cfg.rootfs_clone_mode, &sandbox.rootfs_path, &disk_file)
        .await
        .map_err(|e| MantaError::provisioning(format!("persist snapshot disk: {}", e)))?;

    let meta = UserSnapshotMeta {
        snapshot_id: snapshot_id.to_string(),
        name: name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        state_file,
        mem_file,
        disk_file,
        lineage_id: cfg.base_rootfs_lineage_id.clone(),
        source_sandbox_id: sandbox.id.clone(),
        source_rootfs_path: sandbox.rootfs_path.clone(),
    };

    write_json_atomic(&user_snapshot_dir(&cfg.work_dir, snapshot_id).join(META_FILENAME), &meta)
        .await?;

    Ok(meta)
}

/// Loads a user bundle's metadata; an unreadable bundle is "not found".
pub async fn load_user_snapshot_meta(
    work_dir: &Path,
    snapshot_id: &str,
) -> MantaResult<UserSnapshotMeta> {
    let meta_path = user_snapshot_dir(work_dir, snapshot_id).join(META_FILENAME);

    let raw = tokio::fs::read(&meta_path).await.map_err(|e| {
        MantaError::SnapshotNotFound(format!("read snapshot metadata: {}", e))
    })?;
    let mut meta: UserSnapshotMeta = serde_json::from_slice(&raw).map_err(|e| {
        MantaError::SnapshotNotFound(format!("decode snapshot metadata: {}", e))
    })?;

    if meta.snapshot_id.trim().is_empty() {
        meta.snapshot_id = snapshot_id.to_string();
    }

    Ok(meta)
}

/// Refuses a restore whose recorded lineage disagrees with the current base.
pub fn ensure_lineage_matches(cfg: &Config, meta: &UserSnapshotMeta) -> MantaResult<()> {
    let current = cfg.base_rootfs_lineage_id.trim();
    let recorded = meta.lineage_id.trim();

    if !current.is_empty() && !recorded.is_empty() && recorded != current {
        return Err(MantaError::LineageMismatch {
            snapshot: recorded.to_string(),
            current: current.to_string(),
        });
    }

    Ok(())
}

/// Enumerates user bundles, newest first.
///
/// Unreadable bundles are skipped rather than failing the listing.
pub async fn list_user_snapshots(work_dir: &Path) -> MantaResult<Vec<UserSnapshotMeta>> {
    let root = user_snapshots_dir(work_dir);

    let mut entries = match tokio::fs::read_dir(&root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(MantaError::provisioning(format!(
                "read snapshot directory: {}",
                err
            )))
        }
    };

    let mut out = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| MantaError::provisioning(format!("read snapshot directory: {}", e)))?
    {
        if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let id = entry.file_name().to_string_lossy().to_string();
        match load_user_snapshot_meta(work_dir, &id).await {
            Ok(meta) => out.push(meta),
            Err(err) => {
                tracing::debug!(snapshot_id = %id, %err, "skipping unreadable snapshot bundle")
            }
        }
    }

    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(out)
}

/// Removes a user bundle. Missing bundles delete cleanly.
pub async fn delete_user_snapshot(work_dir: &Path, snapshot_id: &str) -> MantaResult<()> {
    match tokio::fs::remove_dir_all(user_snapshot_dir(work_dir, snapshot_id)).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(MantaError::provisioning(format!(
            "delete snapshot: {}",
            err
        ))),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta(id: &str, created_at: &str) -> UserSnapshotMeta {
        UserSnapshotMeta {
            snapshot_id: id.to_string(),
            name: None,
            created_at: created_at.to_string(),
            state_file: PathBuf::from("/s/state.snap"),
            mem_file: PathBuf::from("/s/mem.snap"),
            disk_file: PathBuf::from("/s/disk.ext4"),
            lineage_id: "abc".to_string(),
            source_sandbox_id: "sb-1".to_string(),
            source_rootfs_path: PathBuf::from("/s/rootfs.ext4"),
        }
    }

    #[test]
    fn test_snapshot_id_pattern() {
        assert!(validate_snapshot_id("us-1").is_ok());
        assert!(validate_snapshot_id("my.snapshot_v2").is_ok());
        assert!(validate_snapshot_id(&"a".repeat(128)).is_ok());

        assert!(validate_snapshot_id("").is_err());
        assert!(validate_snapshot_id("../etc").is_err());
        assert!(validate_snapshot_id(".hidden").is_err());
        assert!(validate_snapshot_id("-dash-first").is_err());
        assert!(validate_snapshot_id("has space").is_err());
        assert!(validate_snapshot_id("has/slash").is_err());
        assert!(validate_snapshot_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_lineage_matching_rules() {
        let mut cfg = Config::for_tests(std::env::temp_dir());
        let mut meta = sample_meta("us-1", "2026-01-01T00:00:00Z");

        // Both lineages set and equal.
        cfg.base_rootfs_lineage_id = "abc".into();
        assert!(ensure_lineage_matches(&cfg, &meta).is_ok());

        // Mismatch refuses the restore.
        meta.lineage_id = "zzz".into();
        assert!(matches!(
            ensure_lineage_matches(&cfg, &meta),
            Err(MantaError::LineageMismatch { .. })
        ));

        // Either side empty skips the check.
        meta.lineage_id = String::new();
        assert!(ensure_lineage_matches(&cfg, &meta).is_ok());
        cfg.base_rootfs_lineage_id = String::new();
        meta.lineage_id = "zzz".into();
        assert!(ensure_lineage_matches(&cfg, &meta).is_ok());
    }

    #[tokio::test]
    async fn test_list_sorts_newest_first_and_skips_garbage() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        for (id, created) in [
            ("us-1", "2026-01-01T00:00:00Z"),
            ("us-2", "2026-03-01T00:00:00Z"),
            ("us-3", "2026-02-01T00:00:00Z"),
        ] {
            let bundle = user_snapshot_dir(dir.path(), id);
            tokio::fs::create_dir_all(&bundle).await?;
            write_json_atomic(&bundle.join(META_FILENAME), &sample_meta(id, created)).await?;
        }

        // A bundle with corrupt metadata must not break the listing.
        let garbage = user_snapshot_dir(dir.path(), "us-bad");
        tokio::fs::create_dir_all(&garbage).await?;
        tokio::fs::write(garbage.join(META_FILENAME), b"not json").await?;

        let listed = list_user_snapshots(dir.path()).await?;
        let ids: Vec<_> = listed.iter().map(|m| m.snapshot_id.as_str()).collect();
        assert_eq!(ids, vec!["us-2", "us-3", "us-1"]);

        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        let bundle = user_snapshot_dir(dir.path(), "us-1");
        tokio::fs::create_dir_all(&bundle).await?;
        delete_user_snapshot(dir.path(), "us-1").await?;
        assert!(!bundle.exists());

        // Deleting a missing bundle is not an error.
        delete_user_snapshot(dir.path(), "us-1").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_load_missing_meta_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = load_user_snapshot_meta(dir.path(), "us-404").await;
        assert!(matches!(result, Err(MantaError::SnapshotNotFound(_))));
    }
}
