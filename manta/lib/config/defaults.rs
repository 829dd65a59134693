use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Constants: Runtime defaults
//--------------------------------------------------------------------------------------------------

/// The default address the HTTP API listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// The default guest kernel image path.
pub const DEFAULT_KERNEL_PATH: &str = "./guest-artifacts/vmlinux";

/// The default base rootfs image path.
pub const DEFAULT_ROOTFS_PATH: &str = "./guest-artifacts/rootfs.ext4";

/// The default Firecracker binary name, resolved on PATH.
pub const DEFAULT_FIRECRACKER_BIN: &str = "firecracker";

/// The default work directory. Kept relative so local benchmarking lands on a
/// reflink-capable filesystem; canonical production location is
/// `/var/lib/manta`.
pub const DEFAULT_WORK_DIR: &str = ".manta-work";

/// The default cgroup v2 root for per-sandbox resource groups.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/manta";

/// The default number of pre-provisioned netns slots.
pub const DEFAULT_NETNS_POOL_SIZE: usize = 64;

/// The default guest boot arguments for cold-booted VMs.
pub const DEFAULT_BOOT_ARGS: &str =
    "console=ttyS0 reboot=k panic=1 pci=off root=/dev/vda rw init=/sbin/init";

/// The default guest memory size in MiB.
pub const DEFAULT_VM_MEM_MIB: u32 = 512;

/// The default guest vCPU count.
pub const DEFAULT_VM_VCPUS: u8 = 1;

/// The default wall-clock budget for an exec request.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(20);

/// How long to keep dialing the agent after boot or snapshot resume.
pub const DEFAULT_AGENT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-attempt dial timeout for the agent vsock UDS.
pub const DEFAULT_AGENT_DIAL_TIMEOUT: Duration = Duration::from_millis(250);

/// Per-call deadline on an established agent connection.
pub const DEFAULT_AGENT_CALL_TIMEOUT: Duration = Duration::from_secs(20);

/// Per-stream cap on exec output captured by the agent.
pub const DEFAULT_AGENT_MAX_OUTPUT_BYTES: i64 = 1 << 20;

//--------------------------------------------------------------------------------------------------
// Constants: Pipeline timings
//--------------------------------------------------------------------------------------------------

/// Poll interval while waiting for the VMM API socket to accept connections.
pub const API_SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Deadline for the VMM API socket to become connectable after spawn.
pub const API_SOCKET_READY_TIMEOUT: Duration = Duration::from_millis(1500);

/// Retry interval for snapshot-load calls that hit transient UDS errors.
pub const SNAPSHOT_LOAD_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Deadline across snapshot-load retries.
pub const SNAPSHOT_LOAD_RETRY_TIMEOUT: Duration = Duration::from_millis(1500);

/// Dial interval while waiting for the in-guest agent to answer a ping.
pub const AGENT_READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Deadline for the guest `net` RPC during bring-up.
pub const GUEST_NET_TIMEOUT: Duration = Duration::from_secs(5);

/// How long create waits for a pooled netns slot before falling back to
/// on-demand provisioning.
pub const NETNS_POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(10);

/// How long destroy waits for in-flight execs to drain.
pub const EXEC_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval for the exec-drain loop.
pub const EXEC_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long teardown waits for the VMM process to exit after SIGKILL.
pub const VMM_EXIT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline across cgroup-dir removal retries after teardown.
pub const CGROUP_REMOVE_RETRY_TIMEOUT: Duration = Duration::from_millis(1500);

/// Per-request deadline on the hypervisor control client.
pub const HYPERVISOR_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

//--------------------------------------------------------------------------------------------------
// Constants: Guest conventions
//--------------------------------------------------------------------------------------------------

/// The first (and only) guest NIC name.
pub const GUEST_IFACE: &str = "eth0";

/// The nameserver handed to guests.
pub const GUEST_DNS: &str = "1.1.1.1";

/// The vsock CID baked into the golden snapshot; every restored VM keeps it.
pub const RESTORED_GUEST_CID: u32 = 3;

/// All guest /30 subnets live inside this super-net; the startup NAT rule
/// covers it once.
pub const GUEST_SUPERNET: &str = "172.16.0.0/16";

//--------------------------------------------------------------------------------------------------
// Constants: On-disk layout
//--------------------------------------------------------------------------------------------------

/// Per-sandbox jail directories live under `<work_dir>/sandboxes/<id>`.
pub const SANDBOXES_SUBDIR: &str = "sandboxes";

/// The golden snapshot bundle lives under `<work_dir>/snapshot`.
pub const SNAPSHOT_SUBDIR: &str = "snapshot";

/// User snapshot bundles live under `<work_dir>/user-snapshots/<id>`.
pub const USER_SNAPSHOTS_SUBDIR: &str = "user-snapshots";

/// The immutable golden base disk directory inside the snapshot bundle.
pub const SNAPSHOT_BASE_SUBDIR: &str = "base";

/// The per-sandbox writable disk image.
pub const ROOTFS_FILENAME: &str = "rootfs.ext4";

/// The VMM API unix socket inside the jail.
pub const API_SOCKET_FILENAME: &str = "firecracker.sock";

/// The vsock unix socket inside the jail.
pub const VSOCK_FILENAME: &str = "vsock.sock";

/// The generated VMM configuration file for cold boots.
pub const VM_CONFIG_FILENAME: &str = "vm-config.json";

/// The VMM's combined stdout/stderr log inside the jail.
pub const VMM_LOG_FILENAME: &str = "firecracker.log";

/// VMM state file inside a snapshot bundle.
pub const STATE_SNAP_FILENAME: &str = "state.snap";

/// Guest memory file inside a snapshot bundle.
pub const MEM_SNAP_FILENAME: &str = "mem.snap";

/// Persisted disk artifact inside a user snapshot bundle.
pub const DISK_FILENAME: &str = "disk.ext4";

/// Bundle metadata file name.
pub const META_FILENAME: &str = "meta.json";
