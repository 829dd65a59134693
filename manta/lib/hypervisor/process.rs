use std::{
    os::fd::{AsRawFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use nix::{
    sched::{setns, CloneFlags},
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::process::{Child, Command};

use crate::{
    config::{Config, API_SOCKET_FILENAME, VM_CONFIG_FILENAME},
    MantaError, MantaResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A running Firecracker process bound to one sandbox.
#[derive(Debug)]
pub struct VmmHandle {
    child: Child,
    pid: Pid,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmmHandle {
    /// Spawns Firecracker inside the sandbox's network namespace with its
    /// working directory set to the jail.
    ///
    /// The child enters the netns via `setns` between fork and exec, so the
    /// control plane's own threads never change namespace. It is also placed
    /// in its own process group so teardown can signal the whole group.
    ///
    /// With `boot_from_config` the VMM boots immediately from
    /// `vm-config.json`; otherwise it idles on the API socket awaiting a
    /// snapshot load.
    pub async fn spawn(
        cfg: &Config,
        jail_dir: &Path,
        netns_path: &Path,
        log_path: &Path,
        boot_from_config: bool,
    ) -> MantaResult<Self> {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(log_path)
            .map_err(|e| {
                MantaError::Hypervisor(format!(
                    "open firecracker log file {}: {}",
                    log_path.display(),
                    e
                ))
            })?;
        let log_stdout = log_file.try_clone().map_err(MantaError::Io)?;

        let netns_fd: OwnedFd = std::fs::File::open(netns_path)
            .map_err(|e| {
                MantaError::Hypervisor(format!("open netns {}: {}", netns_path.display(), e))
            })?
            .into();

        let mut command = Command::new(&cfg.firecracker_bin);
        command
            .arg("--api-sock")
            .arg(API_SOCKET_FILENAME)
            .current_dir(jail_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_stdout))
            .stderr(Stdio::from(log_file));
        if boot_from_config {
            command.arg("--config-file").arg(VM_CONFIG_FILENAME);
        }

        let raw_netns = netns_fd.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                // Runs in the forked child: join the sandbox netns and start a
                // fresh process group (pgid == pid) before exec.
                let fd = BorrowedFd::borrow_raw(raw_netns);
                setns(fd, CloneFlags::CLONE_NEWNET).map_err(std::io::Error::from)?;
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let child = command
            .spawn()
            .map_err(|e| MantaError::Hypervisor(format!("start firecracker: {}", e)))?;
        // Keep the parent's copy of the netns fd alive until after spawn.
        drop(netns_fd);

        let pid = child
            .id()
            .ok_or_else(|| MantaError::Hypervisor("firecracker exited during spawn".into()))?;

        Ok(Self {
            child,
            pid: Pid::from_raw(pid as i32),
        })
    }

    /// The VMM's process ID.
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// SIGKILLs the VMM's whole process group.
    pub fn kill_group(&self) {
        // pgid == pid because the child called setpgid(0, 0).
        match killpg(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(err) => {
                tracing::warn!(pid = self.pid.as_raw(), %err, "killpg failed, killing leader only");
                let _ = nix::sys::signal::kill(self.pid, Signal::SIGKILL);
            }
        }
    }

    /// Waits for the VMM to exit, bounded by `timeout`.
    ///
    /// Returns false when the wait timed out; the caller reports it and moves
    /// on so a wedged VMM can't block teardown forever.
    pub async fn wait_exit(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.child.wait()).await.is_ok()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves a binary the way the shell would: absolute/relative paths are
/// used as-is, bare names are searched on PATH.
pub fn resolve_binary(bin: &Path) -> Option<PathBuf> {
    if bin.components().count() > 1 {
        return bin.exists().then(|| bin.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.is_file())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_binary_on_path() {
        // `sh` exists on every platform we run on.
        assert!(resolve_binary(Path::new("sh")).is_some());
        assert!(resolve_binary(Path::new("definitely-not-a-real-binary-xyz")).is_none());
    }

    #[test]
    fn test_resolve_binary_explicit_path() {
        assert_eq!(
            resolve_binary(Path::new("/bin/sh")),
            Some(PathBuf::from("/bin/sh"))
        );
        assert!(resolve_binary(Path::new("/bin/definitely-not-real")).is_none());
    }
}
