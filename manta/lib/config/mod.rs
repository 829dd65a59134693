//! Configuration surface for the manta control plane.
//!
//! Everything is driven by `MANTA_*` environment variables with sensible
//! defaults, the way the daemon is deployed in practice. Paths are resolved to
//! absolute form at load time because the VMM runs with its working directory
//! set to a per-sandbox jail, and the base-rootfs lineage is computed once so
//! snapshot compatibility checks never re-hash on the request path.

mod defaults;

use std::{
    env,
    io::Read,
    path::{Path, PathBuf},
    time::Duration,
};

use sha2::{Digest, Sha256};

use crate::{MantaError, MantaResult};

pub use defaults::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How per-sandbox disks are materialized from a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    /// Attempt a copy-on-write clone, fall back to a full copy if the
    /// filesystem can't reflink.
    Auto,

    /// Require a copy-on-write clone; fail loudly instead of silently eating
    /// a full-copy latency cliff.
    ReflinkRequired,
}

/// How `/exec` reaches into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecTransport {
    /// The framed vsock RPC served by the in-guest agent.
    Agent,
}

/// Runtime configuration for the control plane.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on.
    pub listen_addr: String,

    /// Guest kernel image (cold boots only).
    pub kernel_path: PathBuf,

    /// The canonical base rootfs image.
    pub base_rootfs_path: PathBuf,

    /// SHA-256 of the base rootfs; empty when snapshots are disabled.
    pub base_rootfs_lineage_id: String,

    /// Disk materialization mode.
    pub rootfs_clone_mode: CloneMode,

    /// Firecracker binary, resolved on PATH.
    pub firecracker_bin: PathBuf,

    /// Host egress interface for the global NAT rule; auto-detected when not
    /// configured.
    pub host_nat_iface: String,

    /// Root of all on-disk state (jails, snapshot bundles).
    pub work_dir: PathBuf,

    /// cgroup v2 root for per-sandbox resource groups.
    pub cgroup_root: PathBuf,

    /// Whether to place VMMs into per-sandbox cgroups.
    pub enable_cgroups: bool,

    /// Number of pre-provisioned netns slots.
    pub netns_pool_size: usize,

    /// Whether `/create` restores from the golden snapshot instead of cold
    /// booting.
    pub enable_snapshots: bool,

    /// Keep jail dirs of failed bring-ups for debugging.
    pub keep_failed_sandboxes: bool,

    /// Log per-stage restore timings after each create/restore.
    pub enable_stage_timing_logs: bool,

    /// Transport used by `/exec`.
    pub exec_transport: ExecTransport,

    /// vsock port the in-guest agent listens on.
    pub agent_port: u32,

    /// Deadline for the agent to become ready after boot/restore.
    pub agent_wait_timeout: Duration,

    /// Per-attempt dial timeout for the agent socket.
    pub agent_dial_timeout: Duration,

    /// Per-call deadline on an established agent connection.
    pub agent_call_timeout: Duration,

    /// Per-stream cap on exec output.
    pub agent_max_output_bytes: i64,

    /// Default exec timeout when the request doesn't carry one.
    pub exec_timeout: Duration,

    /// Kernel boot arguments for cold boots.
    pub boot_args: String,

    /// Guest memory size in MiB.
    pub default_mem_mib: u32,

    /// Guest vCPU count.
    pub default_vcpus: u8,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Config {
    /// Loads configuration from the environment.
    ///
    /// `host_nat_iface` is left empty when `MANTA_HOST_IFACE` is unset; the
    /// daemon fills it in via default-route detection before preflight.
    pub fn from_env() -> MantaResult<Self> {
        let mut cfg = Self {
            listen_addr: env_or("MANTA_LISTEN_ADDR", DEFAULT_LISTEN_ADDR),
            kernel_path: PathBuf::from(env_or("MANTA_KERNEL_PATH", DEFAULT_KERNEL_PATH)),
            base_rootfs_path: PathBuf::from(env_or("MANTA_ROOTFS_PATH", DEFAULT_ROOTFS_PATH)),
            base_rootfs_lineage_id: String::new(),
            rootfs_clone_mode: parse_clone_mode(&env_or("MANTA_ROOTFS_CLONE_MODE", "auto"))?,
            firecracker_bin: PathBuf::from(env_or(
                "MANTA_FIRECRACKER_BIN",
                DEFAULT_FIRECRACKER_BIN,
            )),
            host_nat_iface: env_or("MANTA_HOST_IFACE", ""),
            work_dir: PathBuf::from(env_or("MANTA_WORK_DIR", DEFAULT_WORK_DIR)),
            cgroup_root: PathBuf::from(env_or("MANTA_CGROUP_ROOT", DEFAULT_CGROUP_ROOT)),
            enable_cgroups: flag_or("MANTA_ENABLE_CGROUPS", true),
            netns_pool_size: int_or("MANTA_NETNS_POOL_SIZE", DEFAULT_NETNS_POOL_SIZE as i64)
                as usize,
            enable_snapshots: flag_or("MANTA_ENABLE_SNAPSHOTS", true),
            keep_failed_sandboxes: flag_or("MANTA_DEBUG_KEEP_FAILED_SANDBOX", false),
            enable_stage_timing_logs: flag_or("MANTA_ENABLE_STAGE_TIMINGS", false),
            exec_transport: parse_exec_transport(&env_or("MANTA_EXEC_TRANSPORT", "agent"))?,
            agent_port: int_or("MANTA_AGENT_PORT", manta_rpc::DEFAULT_AGENT_PORT as i64) as u32,
            agent_wait_timeout: duration_ms_or(
                "MANTA_AGENT_WAIT_TIMEOUT_MS",
                DEFAULT_AGENT_WAIT_TIMEOUT,
            ),
            agent_dial_timeout: duration_ms_or(
                "MANTA_AGENT_DIAL_TIMEOUT_MS",
                DEFAULT_AGENT_DIAL_TIMEOUT,
            ),
            agent_call_timeout: duration_ms_or(
                "MANTA_AGENT_CALL_TIMEOUT_MS",
                DEFAULT_AGENT_CALL_TIMEOUT,
            ),
            agent_max_output_bytes: int_or(
                "MANTA_AGENT_MAX_OUTPUT_BYTES",
                DEFAULT_AGENT_MAX_OUTPUT_BYTES,
            ),
            exec_timeout: duration_ms_or("MANTA_EXEC_TIMEOUT_MS", DEFAULT_EXEC_TIMEOUT),
            boot_args: env_or("MANTA_BOOT_ARGS", DEFAULT_BOOT_ARGS),
            default_mem_mib: int_or("MANTA_VM_MEM_MIB", DEFAULT_VM_MEM_MIB as i64) as u32,
            default_vcpus: int_or("MANTA_VM_VCPU", DEFAULT_VM_VCPUS as i64) as u8,
        };

        // The VMM runs with its cwd inside a per-sandbox jail; resolve
        // artifact paths now so they stay valid regardless of cwd.
        for path in [
            &mut cfg.kernel_path,
            &mut cfg.base_rootfs_path,
            &mut cfg.work_dir,
        ] {
            let abs = absolutize(path)?;
            *path = abs;
        }

        if cfg.enable_snapshots {
            cfg.base_rootfs_lineage_id = compute_file_sha256(&cfg.base_rootfs_path)?;
        }

        Ok(cfg)
    }

    /// The directory holding per-sandbox jails.
    pub fn sandboxes_dir(&self) -> PathBuf {
        self.work_dir.join(SANDBOXES_SUBDIR)
    }

    /// The jail directory for a sandbox ID.
    pub fn sandbox_dir(&self, sandbox_id: &str) -> PathBuf {
        self.sandboxes_dir().join(sandbox_id)
    }
}

#[cfg(test)]
impl Config {
    /// A config pointing at a throwaway work dir, for unit tests.
    pub(crate) fn for_tests(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.into(),
            kernel_path: "/artifacts/vmlinux".into(),
            base_rootfs_path: "/artifacts/rootfs.ext4".into(),
            base_rootfs_lineage_id: String::new(),
            rootfs_clone_mode: CloneMode::Auto,
            firecracker_bin: DEFAULT_FIRECRACKER_BIN.into(),
            host_nat_iface: "eth0".into(),
            work_dir: work_dir.into(),
            cgroup_root: DEFAULT_CGROUP_ROOT.into(),
            enable_cgroups: false,
            netns_pool_size: 0,
            enable_snapshots: false,
            keep_failed_sandboxes: false,
            enable_stage_timing_logs: false,
            exec_transport: ExecTransport::Agent,
            agent_port: manta_rpc::DEFAULT_AGENT_PORT,
            agent_wait_timeout: DEFAULT_AGENT_WAIT_TIMEOUT,
            agent_dial_timeout: DEFAULT_AGENT_DIAL_TIMEOUT,
            agent_call_timeout: DEFAULT_AGENT_CALL_TIMEOUT,
            agent_max_output_bytes: DEFAULT_AGENT_MAX_OUTPUT_BYTES,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            boot_args: DEFAULT_BOOT_ARGS.into(),
            default_mem_mib: DEFAULT_VM_MEM_MIB,
            default_vcpus: DEFAULT_VM_VCPUS,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// SHA-256 of a file's contents, hex-encoded. This is the lineage ID of a
/// rootfs image.
pub fn compute_file_sha256(path: impl AsRef<Path>) -> MantaResult<String> {
    let mut file = std::fs::File::open(path.as_ref()).map_err(|e| {
        MantaError::Config(format!(
            "open {} for lineage hash: {}",
            path.as_ref().display(),
            e
        ))
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

fn parse_clone_mode(raw: &str) -> MantaResult<CloneMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "auto" => Ok(CloneMode::Auto),
        "reflink-required" => Ok(CloneMode::ReflinkRequired),
        other => Err(MantaError::Config(format!(
            "invalid MANTA_ROOTFS_CLONE_MODE {:?} (expected auto or reflink-required)",
            other
        ))),
    }
}

fn parse_exec_transport(raw: &str) -> MantaResult<ExecTransport> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "agent" | "" => Ok(ExecTransport::Agent),
        other => Err(MantaError::Config(format!(
            "unknown exec transport {:?}",
            other
        ))),
    }
}

fn absolutize(path: &Path) -> MantaResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir()?;
    Ok(cwd.join(path))
}

fn env_or(name: &str, fallback: &str) -> String {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn int_or(name: &str, fallback: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}

fn flag_or(name: &str, fallback: bool) -> bool {
    match env::var(name) {
        Ok(v) => match v.trim() {
            "" => fallback,
            v => v != "0",
        },
        Err(_) => fallback,
    }
}

fn duration_ms_or(name: &str, fallback: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_clone_mode() {
        assert_eq!(parse_clone_mode("auto").unwrap(), CloneMode::Auto);
        assert_eq!(
            parse_clone_mode("Reflink-Required").unwrap(),
            CloneMode::ReflinkRequired
        );
        assert!(parse_clone_mode("always").is_err());
    }

    #[test]
    fn test_parse_exec_transport() {
        assert_eq!(
            parse_exec_transport("agent").unwrap(),
            ExecTransport::Agent
        );
        assert!(parse_exec_transport("ssh").is_err());
        assert!(parse_exec_transport("telnet").is_err());
    }

    #[test]
    fn test_compute_file_sha256_matches_known_digest() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"probe\n")?;

        let digest = compute_file_sha256(file.path())?;
        // sha256("probe\n")
        assert_eq!(
            digest,
            "25be323556dad377abb57fe7ec8c4b99a6527f488dda28d0c9b686528659c909"
        );

        Ok(())
    }

    #[test]
    fn test_lineage_changes_with_content() -> anyhow::Result<()> {
        let mut a = tempfile::NamedTempFile::new()?;
        a.write_all(b"rootfs v1")?;
        let mut b = tempfile::NamedTempFile::new()?;
        b.write_all(b"rootfs v2")?;

        assert_ne!(
            compute_file_sha256(a.path())?,
            compute_file_sha256(b.path())?
        );

        Ok(())
    }
}
