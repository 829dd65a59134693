use std::{
    net::{IpAddr, Ipv4Addr},
    os::fd::{AsFd, AsRawFd, OwnedFd},
    path::{Path, PathBuf},
    sync::Mutex,
};

use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use nix::{
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::{setns, unshare, CloneFlags},
};
use rtnetlink::{Handle, IpVersion};

use crate::{MantaError, MantaResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Where named network namespaces are bind-mounted, iproute2-compatible.
pub const NETNS_DIR: &str = "/run/netns";

/// Prefix for every namespace this control plane owns.
pub const NETNS_PREFIX: &str = "manta-";

/// Highest subnet index usable for sandboxes; the index is the third octet of
/// both the 10.200.<i>.0/30 uplink and the 172.16.<i>.0/30 guest subnet.
pub const MAX_SUBNET_INDEX: u32 = 249;

/// Subnet index reserved for the golden-snapshot VM, outside the general
/// range so pool and on-demand allocation can never collide with it.
pub const SNAPSHOT_SUBNET_INDEX: u32 = 250;

/// Namespace tag of the golden-snapshot VM.
pub const SNAPSHOT_NETNS_TAG: &str = "snapshot";

// netns names double as filenames under /run/netns; keep them short.
const NETNS_NAME_MAX: usize = 63;

// Stable names inside each namespace so snapshot state can refer to them.
const VETH_NS_NAME: &str = "veth0";
const TAP_NAME: &str = "tap0";

// TUN/TAP ioctls from <linux/if_tun.h>.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETPERSIST: libc::c_ulong = 0x4004_54cb;

// Firecracker expects a TAP backend with NO_PI and VNET_HDR; keep it
// single-queue, queueing is controlled by the VMM config.
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_ONE_QUEUE: libc::c_short = 0x2000;
const IFF_VNET_HDR: libc::c_short = 0x4000;

/// Serializes the root-namespace phase of provisioning: the veth peer is
/// briefly named `veth0` in the root namespace before moving into its netns,
/// so two concurrent provisions would collide on it.
static PROVISION_LOCK: Mutex<()> = Mutex::new(());

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A fully provisioned network-namespace slot keyed by its subnet index.
///
/// Names and addresses are a pure function of the index (plus the namespace
/// tag), which makes slots idempotently recreatable after a crashed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetnsSlot {
    /// The named namespace, `manta-<tag>`.
    pub netns_name: String,

    /// The subnet index this slot exclusively owns.
    pub subnet: u32,

    /// Whether the slot belongs to the warm pool (released back) or is
    /// on-demand (destroyed on release).
    pub pooled: bool,

    /// Root-side veth name, `veth<i>`.
    pub veth_host: String,

    /// Namespace-side veth name.
    pub veth_ns: String,

    /// Point-to-point uplink 10.200.<i>.0/30, disjoint from guest subnets.
    pub veth_cidr: Ipv4Network,

    /// Root-side uplink endpoint, 10.200.<i>.1.
    pub veth_host_ip: Ipv4Addr,

    /// Namespace-side uplink endpoint, 10.200.<i>.2.
    pub veth_ns_ip: Ipv4Addr,

    /// TAP device name inside the namespace.
    pub tap_name: String,

    /// Guest subnet 172.16.<i>.0/30.
    pub subnet_cidr: Ipv4Network,

    /// Host-side guest-subnet endpoint on the tap, 172.16.<i>.1.
    pub host_ip: Ipv4Addr,

    /// The guest's address, 172.16.<i>.2.
    pub guest_ip: Ipv4Addr,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetnsSlot {
    /// Derives the slot layout for a subnet index.
    pub fn for_subnet(tag: &str, subnet: u32) -> MantaResult<Self> {
        if subnet == 0 || subnet > SNAPSHOT_SUBNET_INDEX {
            return Err(MantaError::provisioning(format!(
                "subnet index {} outside usable range 1..={}",
                subnet, SNAPSHOT_SUBNET_INDEX
            )));
        }

        let veth_cidr = Ipv4Network::new(Ipv4Addr::new(10, 200, subnet as u8, 0), 30)
            .map_err(|e| MantaError::provisioning(format!("uplink cidr: {}", e)))?;
        let subnet_cidr = Ipv4Network::new(Ipv4Addr::new(172, 16, subnet as u8, 0), 30)
            .map_err(|e| MantaError::provisioning(format!("guest cidr: {}", e)))?;

        Ok(Self {
            netns_name: netns_name_for_tag(tag),
            subnet,
            pooled: false,
            veth_host: format!("veth{:03}", subnet),
            veth_ns: VETH_NS_NAME.to_string(),
            veth_cidr,
            veth_host_ip: Ipv4Addr::new(10, 200, subnet as u8, 1),
            veth_ns_ip: Ipv4Addr::new(10, 200, subnet as u8, 2),
            tap_name: TAP_NAME.to_string(),
            subnet_cidr,
            host_ip: Ipv4Addr::new(172, 16, subnet as u8, 1),
            guest_ip: Ipv4Addr::new(172, 16, subnet as u8, 2),
        })
    }

    /// Filesystem path of the named namespace.
    pub fn netns_path(&self) -> PathBuf {
        PathBuf::from(NETNS_DIR).join(&self.netns_name)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Namespace name for a sandbox or pool tag.
pub fn netns_name_for_tag(tag: &str) -> String {
    let tag = tag.trim();
    let name = if tag.is_empty() {
        format!("{}unknown", NETNS_PREFIX)
    } else {
        format!("{}{}", NETNS_PREFIX, tag)
    };
    match name.char_indices().nth(NETNS_NAME_MAX) {
        Some((idx, _)) => name[..idx].to_string(),
        None => name,
    }
}

/// Provisions the slot for `(tag, subnet)`: named netns, veth uplink, guest
/// addressing, forwarding, routes, and the tap device.
///
/// Either the slot comes back fully built or all partial state has been torn
/// down before the error returns.
pub async fn provision(tag: &str, subnet: u32) -> MantaResult<NetnsSlot> {
    let slot = NetnsSlot::for_subnet(tag, subnet)?;
    let work = slot.clone();
    run_on_netns_thread(move || provision_blocking(&work)).await?;
    Ok(slot)
}

/// Tears the slot down: root-side route and veth, then the namespace itself.
///
/// Order matters: deleting the namespace last lets its removal cascade over
/// any links still inside (the tap in particular). Errors are aggregated, and
/// every step still runs.
pub async fn teardown(slot: &NetnsSlot) -> MantaResult<()> {
    let work = slot.clone();
    run_on_netns_thread(move || teardown_blocking(&work)).await
}

/// Runs namespace-touching work on a dedicated, throwaway OS thread.
///
/// `setns` changes the calling thread's namespace, and a thread that fails to
/// restore the original namespace would poison whatever picked it up next.
/// A dedicated thread ends right after the closure, so even a failed restore
/// can't leak into the control plane's networking view.
async fn run_on_netns_thread<T, F>(work: F) -> MantaResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> MantaResult<T> + Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("manta-netns".to_string())
        .spawn(move || {
            let _ = tx.send(work());
        })
        .map_err(|e| MantaError::provisioning(format!("spawn netns worker: {}", e)))?;

    rx.await
        .map_err(|_| MantaError::provisioning("netns worker thread panicked"))?
}

fn provision_blocking(slot: &NetnsSlot) -> MantaResult<()> {
    let _guard = PROVISION_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let ns_fd = create_named_netns(&slot.netns_name)?;

    if let Err(err) = provision_links(slot, &ns_fd) {
        if let Err(cleanup_err) = teardown_blocking(slot) {
            tracing::warn!(netns = %slot.netns_name, %cleanup_err, "partial netns cleanup failed");
        }
        return Err(err);
    }

    Ok(())
}

fn provision_links(slot: &NetnsSlot, ns_fd: &OwnedFd) -> MantaResult<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    // Root-namespace phase: veth pair, peer moved into the netns, host-side
    // addressing, and (after the in-ns phase) the guest-subnet route.
    let (root_handle, host_index) = rt.block_on(async {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        handle
            .link()
            .add()
            .veth(slot.veth_host.clone(), slot.veth_ns.clone())
            .execute()
            .await
            .map_err(|e| MantaError::provisioning(format!("create veth pair: {}", e)))?;

        let peer_index = link_index(&handle, &slot.veth_ns).await?;
        handle
            .link()
            .set(peer_index)
            .setns_by_fd(ns_fd.as_raw_fd())
            .execute()
            .await
            .map_err(|e| MantaError::provisioning(format!("move veth peer into netns: {}", e)))?;

        let host_index = link_index(&handle, &slot.veth_host).await?;
        allow_exists(
            handle
                .address()
                .add(host_index, IpAddr::V4(slot.veth_host_ip), 30)
                .execute()
                .await,
        )
        .map_err(|e| MantaError::provisioning(format!("assign veth host ip: {}", e)))?;
        handle
            .link()
            .set(host_index)
            .up()
            .execute()
            .await
            .map_err(|e| MantaError::provisioning(format!("set veth host up: {}", e)))?;

        Ok::<_, MantaError>((handle, host_index))
    })?;

    // In-namespace phase: peer addressing, forwarding, default route, tap.
    with_netns(ns_fd, || {
        rt.block_on(async {
            let (conn, handle, _) = rtnetlink::new_connection()?;
            tokio::spawn(conn);

            let peer_index = link_index(&handle, &slot.veth_ns).await?;
            allow_exists(
                handle
                    .address()
                    .add(peer_index, IpAddr::V4(slot.veth_ns_ip), 30)
                    .execute()
                    .await,
            )
            .map_err(|e| MantaError::provisioning(format!("assign veth ns ip: {}", e)))?;
            handle
                .link()
                .set(peer_index)
                .up()
                .execute()
                .await
                .map_err(|e| MantaError::provisioning(format!("set veth ns up: {}", e)))?;

            // Per-netns toggle; /proc/sys/net resolves against this thread's
            // namespace while entered.
            std::fs::write("/proc/sys/net/ipv4/ip_forward", b"1\n")
                .map_err(|e| MantaError::provisioning(format!("enable ip_forward in netns: {}", e)))?;

            handle
                .route()
                .add()
                .v4()
                .replace()
                .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
                .gateway(slot.veth_host_ip)
                .output_interface(peer_index)
                .execute()
                .await
                .map_err(|e| MantaError::provisioning(format!("set netns default route: {}", e)))?;

            // TUN ioctls bind to the current thread's namespace, which is why
            // tap creation must happen inside this block.
            create_persistent_tap(&slot.tap_name)?;

            let tap_index = link_index(&handle, &slot.tap_name).await?;
            allow_exists(
                handle
                    .address()
                    .add(tap_index, IpAddr::V4(slot.host_ip), 30)
                    .execute()
                    .await,
            )
            .map_err(|e| MantaError::provisioning(format!("assign tap ip: {}", e)))?;
            handle
                .link()
                .set(tap_index)
                .up()
                .execute()
                .await
                .map_err(|e| MantaError::provisioning(format!("set tap up: {}", e)))?;

            Ok::<_, MantaError>(())
        })
    })?;

    // Root-namespace again: route the guest /30 into the namespace.
    rt.block_on(async {
        root_handle
            .route()
            .add()
            .v4()
            .replace()
            .destination_prefix(slot.subnet_cidr.network(), slot.subnet_cidr.prefix())
            .gateway(slot.veth_ns_ip)
            .output_interface(host_index)
            .execute()
            .await
            .map_err(|e| MantaError::provisioning(format!("add route to guest subnet: {}", e)))
    })?;

    Ok(())
}

fn teardown_blocking(slot: &NetnsSlot) -> MantaResult<()> {
    let mut errs: Vec<String> = Vec::new();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let (conn, handle, _) = match rtnetlink::new_connection() {
            Ok(parts) => parts,
            Err(err) => {
                errs.push(format!("netlink root handle: {}", err));
                return;
            }
        };
        tokio::spawn(conn);

        if let Err(err) = delete_guest_route(&handle, slot).await {
            errs.push(format!("remove guest route: {}", err));
        }

        // Deleting the root-side veth removes its in-ns peer too.
        if let Ok(index) = link_index(&handle, &slot.veth_host).await {
            if let Err(err) = handle.link().del(index).execute().await {
                errs.push(format!("delete veth {}: {}", slot.veth_host, err));
            }
        }
    });

    // Namespace removal last; it cascades over any remaining in-ns links.
    let ns_path = slot.netns_path();
    if ns_path.exists() {
        if let Err(err) = umount2(&ns_path, MntFlags::MNT_DETACH) {
            if err != nix::errno::Errno::EINVAL && err != nix::errno::Errno::ENOENT {
                errs.push(format!("unmount netns {}: {}", slot.netns_name, err));
            }
        }
        if let Err(err) = std::fs::remove_file(&ns_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                errs.push(format!("remove netns {}: {}", slot.netns_name, err));
            }
        }
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(MantaError::provisioning(errs.join("; ")))
    }
}

async fn delete_guest_route(handle: &Handle, slot: &NetnsSlot) -> MantaResult<()> {
    use netlink_packet_route::route::{RouteAddress, RouteAttribute};

    let mut routes = handle.route().get(IpVersion::V4).execute();
    while let Some(route) = routes
        .try_next()
        .await
        .map_err(|e| MantaError::provisioning(format!("dump routes: {}", e)))?
    {
        let matches_dst = route.header.destination_prefix_length == slot.subnet_cidr.prefix()
            && route.attributes.iter().any(|attr| {
                matches!(
                    attr,
                    RouteAttribute::Destination(RouteAddress::Inet(ip))
                        if *ip == slot.subnet_cidr.network()
                )
            });
        if matches_dst {
            handle
                .route()
                .del(route)
                .execute()
                .await
                .map_err(|e| MantaError::provisioning(format!("delete route: {}", e)))?;
            break;
        }
    }

    Ok(())
}

/// Creates the named namespace and returns an fd onto it.
///
/// The sequence is `unshare(CLONE_NEWNET)` followed by a bind mount of
/// `/proc/self/ns/net` onto `/run/netns/<name>`, with the original namespace
/// restored before returning on every path.
fn create_named_netns(name: &str) -> MantaResult<OwnedFd> {
    std::fs::create_dir_all(NETNS_DIR)?;
    let ns_path = PathBuf::from(NETNS_DIR).join(name);

    // The bind-mount target must exist first.
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&ns_path)
        .map_err(|e| MantaError::provisioning(format!("create netns file {:?}: {}", name, e)))?;

    let orig = std::fs::File::open("/proc/self/ns/net")?;

    if let Err(err) = unshare(CloneFlags::CLONE_NEWNET) {
        let _ = std::fs::remove_file(&ns_path);
        return Err(MantaError::provisioning(format!(
            "unshare netns {:?}: {}",
            name, err
        )));
    }

    let mount_result = mount(
        Some(Path::new("/proc/self/ns/net")),
        &ns_path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    );

    let restore_result = setns(orig.as_fd(), CloneFlags::CLONE_NEWNET);

    if let Err(err) = mount_result {
        let _ = std::fs::remove_file(&ns_path);
        restore_result.map_err(|e| {
            MantaError::provisioning(format!("restore netns after failed mount: {}", e))
        })?;
        return Err(MantaError::provisioning(format!(
            "bind mount netns {:?}: {}",
            name, err
        )));
    }
    restore_result
        .map_err(|e| MantaError::provisioning(format!("restore original netns: {}", e)))?;

    let fd: OwnedFd = std::fs::File::open(&ns_path)
        .map_err(|e| MantaError::provisioning(format!("open netns {:?}: {}", name, e)))?
        .into();
    Ok(fd)
}

/// Enters `target` on the current thread, runs `work`, and restores the
/// original namespace before returning.
///
/// Must only run on a throwaway thread (see [`run_on_netns_thread`]); a
/// failed restore is reported but the thread must not be reused afterwards.
fn with_netns<T>(target: &OwnedFd, work: impl FnOnce() -> MantaResult<T>) -> MantaResult<T> {
    let orig = std::fs::File::open("/proc/self/ns/net")?;

    setns(target.as_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|e| MantaError::provisioning(format!("enter netns: {}", e)))?;

    let result = work();

    match setns(orig.as_fd(), CloneFlags::CLONE_NEWNET) {
        Ok(()) => result,
        Err(err) => {
            tracing::error!(%err, "failed to restore original netns on worker thread");
            Err(MantaError::provisioning(format!(
                "restore original netns: {}",
                err
            )))
        }
    }
}

/// Creates a persistent TAP device named `name` in the current thread's
/// network namespace.
fn create_persistent_tap(name: &str) -> MantaResult<()> {
    let name_bytes = name.as_bytes();
    if name_bytes.is_empty() || name_bytes.len() >= libc::IFNAMSIZ {
        return Err(MantaError::provisioning(format!(
            "invalid tap name {:?}",
            name
        )));
    }

    let fd = unsafe {
        libc::open(
            c"/dev/net/tun".as_ptr(),
            libc::O_RDWR | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(MantaError::provisioning(format!(
            "open /dev/net/tun: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name_bytes) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_flags = IFF_TAP | IFF_NO_PI | IFF_VNET_HDR | IFF_ONE_QUEUE;

    let result = (|| {
        if unsafe { libc::ioctl(fd, TUNSETIFF as _, &ifr) } < 0 {
            return Err(MantaError::provisioning(format!(
                "create tap {:?}: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }
        if unsafe { libc::ioctl(fd, TUNSETPERSIST as _, 1) } < 0 {
            return Err(MantaError::provisioning(format!(
                "persist tap {:?}: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    })();

    unsafe { libc::close(fd) };
    result
}

async fn link_index(handle: &Handle, name: &str) -> MantaResult<u32> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| MantaError::provisioning(format!("lookup link {:?}: {}", name, e)))?
        .ok_or_else(|| MantaError::provisioning(format!("link {:?} not found", name)))?;
    Ok(link.header.index)
}

fn allow_exists(result: Result<(), rtnetlink::Error>) -> Result<(), rtnetlink::Error> {
    match result {
        Err(rtnetlink::Error::NetlinkError(ref message))
            if message.raw_code() == -libc::EEXIST =>
        {
            Ok(())
        }
        other => other,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netns_name_for_tag() {
        assert_eq!(netns_name_for_tag("sb-1"), "manta-sb-1");
        assert_eq!(netns_name_for_tag("  pool-001  "), "manta-pool-001");
        assert_eq!(netns_name_for_tag(""), "manta-unknown");

        let long = "x".repeat(100);
        assert_eq!(netns_name_for_tag(&long).len(), NETNS_NAME_MAX);
    }

    #[test]
    fn test_slot_layout_is_pure_function_of_index() -> anyhow::Result<()> {
        let slot = NetnsSlot::for_subnet("pool-007", 7)?;
        assert_eq!(slot.netns_name, "manta-pool-007");
        assert_eq!(slot.veth_host, "veth007");
        assert_eq!(slot.veth_ns, "veth0");
        assert_eq!(slot.tap_name, "tap0");
        assert_eq!(slot.veth_host_ip, Ipv4Addr::new(10, 200, 7, 1));
        assert_eq!(slot.veth_ns_ip, Ipv4Addr::new(10, 200, 7, 2));
        assert_eq!(slot.host_ip, Ipv4Addr::new(172, 16, 7, 1));
        assert_eq!(slot.guest_ip, Ipv4Addr::new(172, 16, 7, 2));
        assert_eq!(slot.subnet_cidr.to_string(), "172.16.7.0/30");
        assert_eq!(slot.veth_cidr.to_string(), "10.200.7.0/30");

        // Recreating yields the identical slot.
        assert_eq!(slot, NetnsSlot::for_subnet("pool-007", 7)?);
        Ok(())
    }

    #[test]
    fn test_slot_addressing_disjoint_across_indices() -> anyhow::Result<()> {
        let a = NetnsSlot::for_subnet("sb-1", 1)?;
        let b = NetnsSlot::for_subnet("sb-2", 2)?;

        assert_ne!(a.veth_host, b.veth_host);
        assert_ne!(a.subnet_cidr, b.subnet_cidr);
        assert_ne!(a.veth_cidr, b.veth_cidr);
        assert!(!a.subnet_cidr.overlaps(b.subnet_cidr));
        assert!(!a.veth_cidr.overlaps(b.veth_cidr));

        Ok(())
    }

    #[test]
    fn test_subnet_index_bounds() {
        assert!(NetnsSlot::for_subnet("sb-1", 0).is_err());
        assert!(NetnsSlot::for_subnet("sb-1", SNAPSHOT_SUBNET_INDEX).is_ok());
        assert!(NetnsSlot::for_subnet("sb-1", SNAPSHOT_SUBNET_INDEX + 1).is_err());
    }
}
