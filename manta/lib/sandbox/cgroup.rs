use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crate::{MantaError, MantaResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const CGROUP_V2_MARKER: &str = "/sys/fs/cgroup/cgroup.controllers";
const REMOVE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Verifies cgroup v2 is mounted and creates the manta cgroup root.
pub async fn ensure_cgroup_root(root: &Path) -> MantaResult<()> {
    if !Path::new(CGROUP_V2_MARKER).exists() {
        return Err(MantaError::provisioning(format!(
            "cgroup v2 not available at /sys/fs/cgroup (missing {})",
            CGROUP_V2_MARKER
        )));
    }
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| MantaError::provisioning(format!("create cgroup root {}: {}", root.display(), e)))?;
    Ok(())
}

/// Kills and removes per-sandbox cgroups left behind by a crashed run.
pub async fn scavenge_cgroups(root: &Path) {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(root = %root.display(), %err, "scavenge cgroups: read root");
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let path = entry.path();
        let _ = kill_cgroup(&path).await;
        if let Err(err) = remove_cgroup_dir(&path, Duration::from_millis(1500)).await {
            tracing::warn!(cgroup = %path.display(), %err, "scavenge cgroups: remove");
        }
    }
}

/// Creates the per-sandbox cgroup; `None` (with a log line) when creation
/// fails, since isolation is best-effort.
pub async fn create_sandbox_cgroup(root: &Path, sandbox_id: &str) -> Option<PathBuf> {
    let path = root.join(sandbox_id);
    match tokio::fs::create_dir(&path).await {
        Ok(()) => Some(path),
        Err(err) => {
            tracing::warn!(
                cgroup = %path.display(),
                %err,
                "create cgroup failed, continuing without cgroups"
            );
            None
        }
    }
}

/// Moves a PID into the cgroup. Children spawned afterwards inherit it.
pub async fn attach_pid(cgroup_path: &Path, pid: u32) -> MantaResult<()> {
    let procs_file = cgroup_path.join("cgroup.procs");
    if !procs_file.exists() {
        return Err(MantaError::provisioning(format!(
            "cgroup.procs missing for {}",
            cgroup_path.display()
        )));
    }
    tokio::fs::write(&procs_file, format!("{}\n", pid))
        .await
        .map_err(|e| {
            MantaError::provisioning(format!(
                "write cgroup.procs for {}: {}",
                cgroup_path.display(),
                e
            ))
        })
}

/// Kills every process in the cgroup via `cgroup.kill`.
pub async fn kill_cgroup(cgroup_path: &Path) -> MantaResult<()> {
    let kill_file = cgroup_path.join("cgroup.kill");
    if !kill_file.exists() {
        return Err(MantaError::provisioning(format!(
            "cgroup.kill missing for {}",
            cgroup_path.display()
        )));
    }
    tokio::fs::write(&kill_file, b"1\n").await.map_err(|e| {
        MantaError::provisioning(format!(
            "write cgroup.kill for {}: {}",
            cgroup_path.display(),
            e
        ))
    })
}

/// Removes the cgroup directory, retrying briefly: the kernel reports
/// `EBUSY`/`ENOTEMPTY` while tasks are still tearing down right after a kill.
pub async fn remove_cgroup_dir(cgroup_path: &Path, timeout: Duration) -> MantaResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::fs::remove_dir(cgroup_path).await {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::EBUSY) | Some(libc::ENOTEMPTY)
                ) =>
            {
                if Instant::now() >= deadline {
                    return Err(MantaError::Io(err));
                }
                tokio::time::sleep(REMOVE_RETRY_INTERVAL).await;
            }
            Err(err) => return Err(MantaError::Io(err)),
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
    async fn test_attach_pid_requires_cgroup_procs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = attach_pid(dir.path(), 1234).await;
        assert!(matches!(result, Err(MantaError::Provisioning(_))));
    }

    #[tokio::test]
    async fn test_kill_cgroup_requires_kill_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = kill_cgroup(dir.path()).await;
        assert!(matches!(result, Err(MantaError::Provisioning(_))));
    }

    #[tokio::test]
    async fn test_remove_cgroup_dir_missing_is_ok() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        remove_cgroup_dir(&dir.path().join("gone"), Duration::from_millis(10)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_cgroup_dir_removes_empty_dir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cg = dir.path().join("sb-1");
        tokio::fs::create_dir(&cg).await?;

        remove_cgroup_dir(&cg, Duration::from_millis(10)).await?;
        assert!(!cg.exists());
        Ok(())
    }
}
