use futures::TryStreamExt;
use netlink_packet_route::{
    link::LinkAttribute,
    route::RouteAttribute,
};
use rtnetlink::IpVersion;
use tokio::process::Command;

use crate::{config::GUEST_SUPERNET, MantaError, MantaResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Enables IPv4 forwarding in the root namespace.
pub async fn enable_ip_forwarding() -> MantaResult<()> {
    tokio::fs::write("/proc/sys/net/ipv4/ip_forward", b"1\n")
        .await
        .map_err(|e| MantaError::provisioning(format!("enable ip_forward: {}", e)))
}

/// Installs one broad MASQUERADE rule for the guest super-net on the egress
/// interface so sandbox creation never touches iptables on the hot path.
///
/// The rule is intentionally left installed for the server lifetime; the
/// check-then-add keeps restarts from stacking duplicates.
pub async fn ensure_global_masquerade(host_iface: &str) -> MantaResult<()> {
    if host_iface.trim().is_empty() {
        return Err(MantaError::provisioning("host iface is empty"));
    }

    let rule = [
        "-t",
        "nat",
        "-s",
        GUEST_SUPERNET,
        "-o",
        host_iface,
        "-j",
        "MASQUERADE",
    ];

    // iptables -C exits non-zero when the rule is missing.
    let check = Command::new("iptables")
        .arg("-C")
        .arg("POSTROUTING")
        .args(rule)
        .output()
        .await
        .map_err(|e| MantaError::provisioning(format!("run iptables: {}", e)))?;
    if check.status.success() {
        return Ok(());
    }

    let add = Command::new("iptables")
        .arg("-A")
        .arg("POSTROUTING")
        .args(rule)
        .output()
        .await
        .map_err(|e| MantaError::provisioning(format!("run iptables: {}", e)))?;
    if !add.status.success() {
        return Err(MantaError::provisioning(format!(
            "add global MASQUERADE rule: {}",
            String::from_utf8_lossy(&add.stderr).trim()
        )));
    }

    Ok(())
}

/// Resolves the host's default-route egress interface name.
pub async fn detect_default_interface() -> MantaResult<String> {
    let (conn, handle, _) = rtnetlink::new_connection()
        .map_err(|e| MantaError::provisioning(format!("netlink connection: {}", e)))?;
    tokio::spawn(conn);

    let mut routes = handle.route().get(IpVersion::V4).execute();
    let mut oif: Option<u32> = None;
    while let Some(route) = routes
        .try_next()
        .await
        .map_err(|e| MantaError::provisioning(format!("dump routes: {}", e)))?
    {
        if route.header.destination_prefix_length != 0 {
            continue;
        }
        if let Some(index) = route.attributes.iter().find_map(|attr| match attr {
            RouteAttribute::Oif(index) => Some(*index),
            _ => None,
        }) {
            oif = Some(index);
            break;
        }
    }

    let index =
        oif.ok_or_else(|| MantaError::provisioning("no default route interface found"))?;

    let mut links = handle.link().get().match_index(index).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| MantaError::provisioning(format!("lookup link {}: {}", index, e)))?
        .ok_or_else(|| {
            MantaError::provisioning(format!("default route interface {} not found", index))
        })?;

    link.attributes
        .iter()
        .find_map(|attr| match attr {
            LinkAttribute::IfName(name) => Some(name.clone()),
            _ => None,
        })
        .ok_or_else(|| {
            MantaError::provisioning(format!("default route interface {} has no name", index))
        })
}
