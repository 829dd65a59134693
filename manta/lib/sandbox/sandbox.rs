use std::{
    net::Ipv4Addr,
    path::PathBuf,
    sync::Mutex as StdMutex,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use crate::{
    agent::AgentConn,
    config::{
        API_SOCKET_FILENAME, EXEC_DRAIN_POLL_INTERVAL, ROOTFS_FILENAME, VMM_LOG_FILENAME,
        VSOCK_FILENAME,
    },
    hypervisor::VmmHandle,
    net::NetnsSlot,
    MantaError, MantaResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Lifecycle of a sandbox: `Running → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Serving exec requests.
    Running,

    /// Destroy has begun; new execs are refused while in-flight ones drain.
    Closing,

    /// Fully torn down.
    Closed,
}

#[derive(Debug)]
struct Lifecycle {
    state: SandboxState,
    in_flight_exec: u32,
}

/// A live sandbox: one microVM, its network slot, and its jail.
///
/// The lifecycle mutex is deliberately finer-grained than the registry lock;
/// exec admission and destroy coordination never contend with registry
/// lookups for other sandboxes.
#[derive(Debug)]
pub struct Sandbox {
    /// Opaque identity, `sb-N`.
    pub id: String,

    /// The subnet index this sandbox exclusively owns.
    pub subnet: u32,

    /// Tap device name inside the sandbox netns.
    pub tap_device: String,

    /// Host-side guest-subnet endpoint.
    pub host_ip: Ipv4Addr,

    /// The guest's address.
    pub guest_ip: Ipv4Addr,

    /// The guest's vsock context ID.
    pub guest_cid: u32,

    /// Jail directory.
    pub dir: PathBuf,

    /// VMM control API socket.
    pub api_socket_path: PathBuf,

    /// Firecracker vsock unix socket.
    pub vsock_path: PathBuf,

    /// Writable per-sandbox disk.
    pub rootfs_path: PathBuf,

    /// VMM log file.
    pub log_path: PathBuf,

    /// Resource-isolation group, when attached.
    pub cgroup_path: Option<PathBuf>,

    /// The netns slot; taken by destroy for release back to the pool.
    pub netns: StdMutex<Option<NetnsSlot>>,

    /// The VMM process; taken by destroy for kill-and-wait.
    pub vmm: Mutex<Option<VmmHandle>>,

    /// Persistent agent connection; one connection serializes RPCs through
    /// this mutex.
    pub agent: Mutex<Option<AgentConn>>,

    lifecycle: StdMutex<Lifecycle>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Sandbox {
    /// Builds the record for a sandbox that just finished bring-up.
    ///
    /// Jail-relative paths are derived from `dir`; addressing comes from the
    /// netns slot, whose ownership transfers to the record.
    pub fn new(
        id: impl Into<String>,
        slot: NetnsSlot,
        dir: impl Into<PathBuf>,
        guest_cid: u32,
        cgroup_path: Option<PathBuf>,
        vmm: VmmHandle,
        agent: AgentConn,
    ) -> Self {
        let dir = dir.into();
        Self {
            id: id.into(),
            subnet: slot.subnet,
            tap_device: slot.tap_name.clone(),
            host_ip: slot.host_ip,
            guest_ip: slot.guest_ip,
            guest_cid,
            api_socket_path: dir.join(API_SOCKET_FILENAME),
            vsock_path: dir.join(VSOCK_FILENAME),
            rootfs_path: dir.join(ROOTFS_FILENAME),
            log_path: dir.join(VMM_LOG_FILENAME),
            dir,
            cgroup_path,
            netns: StdMutex::new(Some(slot)),
            vmm: Mutex::new(Some(vmm)),
            agent: Mutex::new(Some(agent)),
            lifecycle: StdMutex::new(Lifecycle {
                state: SandboxState::Running,
                in_flight_exec: 0,
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SandboxState {
        self.lifecycle().state
    }

    /// Number of execs currently in flight.
    pub fn in_flight_exec(&self) -> u32 {
        self.lifecycle().in_flight_exec
    }

    /// Admits an exec; refused unless the sandbox is `Running`.
    pub fn try_start_exec(&self) -> MantaResult<()> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != SandboxState::Running {
            return Err(MantaError::SandboxClosing);
        }
        lifecycle.in_flight_exec += 1;
        Ok(())
    }

    /// Marks an admitted exec finished.
    pub fn finish_exec(&self) {
        let mut lifecycle = self.lifecycle();
        lifecycle.in_flight_exec = lifecycle.in_flight_exec.saturating_sub(1);
    }

    /// Atomically transitions `Running → Closing`; false when the sandbox
    /// was already closing or closed.
    pub fn begin_destroy(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != SandboxState::Running {
            return false;
        }
        lifecycle.state = SandboxState::Closing;
        true
    }

    /// Polls the in-flight counter to zero; false when `timeout` expired
    /// with execs still running.
    pub async fn wait_for_exec_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight_exec() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXEC_DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Marks teardown complete.
    pub fn finish_destroy(&self) {
        self.lifecycle().state = SandboxState::Closed;
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_lifecycle() -> StdMutex<Lifecycle> {
        StdMutex::new(Lifecycle {
            state: SandboxState::Running,
            in_flight_exec: 0,
        })
    }

    /// A record with only the lifecycle half populated; bring-up resources
    /// aren't needed to exercise the state machine.
    fn lifecycle_only() -> Sandbox {
        Sandbox {
            id: "sb-1".into(),
            subnet: 1,
            tap_device: "tap0".into(),
            host_ip: Ipv4Addr::new(172, 16, 1, 1),
            guest_ip: Ipv4Addr::new(172, 16, 1, 2),
            guest_cid: 3,
            dir: PathBuf::from("/tmp/sb-1"),
            api_socket_path: PathBuf::from("/tmp/sb-1/firecracker.sock"),
            vsock_path: PathBuf::from("/tmp/sb-1/vsock.sock"),
            rootfs_path: PathBuf::from("/tmp/sb-1/rootfs.ext4"),
            log_path: PathBuf::from("/tmp/sb-1/firecracker.log"),
            cgroup_path: None,
            netns: StdMutex::new(None),
            vmm: Mutex::new(None),
            agent: Mutex::new(None),
            lifecycle: bare_lifecycle(),
        }
    }

    #[test]
    fn test_exec_admission_only_while_running() {
        let sb = lifecycle_only();

        sb.try_start_exec().expect("running sandbox admits exec");
        assert_eq!(sb.in_flight_exec(), 1);

        assert!(sb.begin_destroy());
        assert_eq!(sb.state(), SandboxState::Closing);
        assert!(matches!(
            sb.try_start_exec(),
            Err(MantaError::SandboxClosing)
        ));

        // The in-flight exec finishes normally even while closing.
        sb.finish_exec();
        assert_eq!(sb.in_flight_exec(), 0);
    }

    #[test]
    fn test_begin_destroy_is_exclusive() {
        let sb = lifecycle_only();

        assert!(sb.begin_destroy());
        assert!(!sb.begin_destroy());

        sb.finish_destroy();
        assert_eq!(sb.state(), SandboxState::Closed);
        assert!(!sb.begin_destroy());
    }

    #[tokio::test]
    async fn test_exec_drain_waits_and_times_out() {
        let sb = std::sync::Arc::new(lifecycle_only());

        sb.try_start_exec().unwrap();
        assert!(
            !sb.wait_for_exec_drain(Duration::from_millis(30)).await,
            "drain must time out with an exec in flight"
        );

        let finisher = {
            let sb = sb.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                sb.finish_exec();
            })
        };

        assert!(sb.wait_for_exec_drain(Duration::from_secs(1)).await);
        finisher.await.unwrap();
    }

    #[test]
    fn test_finish_exec_never_underflows() {
        let sb = lifecycle_only();
        sb.finish_exec();
        assert_eq!(sb.in_flight_exec(), 0);
    }
}
