use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use manta_rpc::NetRequest;
use netlink_packet_route::address::AddressAttribute;
use rtnetlink::Handle;

use crate::{AgentError, AgentResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The conventional first guest NIC.
const DEFAULT_IFACE: &str = "eth0";

const RESOLV_CONF: &str = "/etc/resolv.conf";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Applies the per-sandbox network configuration the control plane hands
/// over after boot or snapshot restore.
///
/// Any addresses baked into the base image (or captured in the snapshot) are
/// flushed first; restores land on a different subnet than the snapshot was
/// taken on, so the old address is actively wrong.
pub async fn configure_network(request: &NetRequest) -> AgentResult<()> {
    let iface = request
        .interface
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_IFACE);

    let address = request.address.trim();
    let gateway = request.gateway.trim();
    if address.is_empty() || gateway.is_empty() {
        return Err(AgentError::invalid("address and gateway are required"));
    }

    let (ip, prefix) = parse_cidr(address)?;
    let gateway: Ipv4Addr = gateway
        .parse()
        .map_err(|_| AgentError::invalid(format!("invalid gateway ip {:?}", gateway)))?;

    let (conn, handle, _) = rtnetlink::new_connection()
        .map_err(|e| AgentError::net(format!("netlink connection: {}", e)))?;
    tokio::spawn(conn);

    let link_index = lookup_link(&handle, iface).await?;

    handle
        .link()
        .set(link_index)
        .up()
        .execute()
        .await
        .map_err(|e| AgentError::net(format!("set interface {:?} up: {}", iface, e)))?;

    flush_v4_addresses(&handle, link_index, iface).await?;

    handle
        .address()
        .add(link_index, IpAddr::V4(ip), prefix)
        .execute()
        .await
        .map_err(|e| AgentError::net(format!("assign address {:?} to {:?}: {}", address, iface, e)))?;

    handle
        .route()
        .add()
        .v4()
        .replace()
        .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
        .gateway(gateway)
        .output_interface(link_index)
        .execute()
        .await
        .map_err(|e| {
            AgentError::net(format!(
                "set default route via {} dev {:?}: {}",
                gateway, iface, e
            ))
        })?;

    if let Some(dns) = request.dns.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        // Best-effort; resolv.conf may be a read-only mount in odd images.
        let _ = std::fs::write(RESOLV_CONF, format!("nameserver {}\n", dns));
    }

    Ok(())
}

async fn lookup_link(handle: &Handle, iface: &str) -> AgentResult<u32> {
    let mut links = handle.link().get().match_name(iface.to_string()).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| AgentError::net(format!("lookup interface {:?}: {}", iface, e)))?
        .ok_or_else(|| AgentError::net(format!("interface {:?} not found", iface)))?;
    Ok(link.header.index)
}

async fn flush_v4_addresses(handle: &Handle, link_index: u32, iface: &str) -> AgentResult<()> {
    let mut addresses = handle
        .address()
        .get()
        .set_link_index_filter(link_index)
        .execute();

    let mut to_delete = Vec::new();
    while let Some(message) = addresses
        .try_next()
        .await
        .map_err(|e| AgentError::net(format!("list addresses on {:?}: {}", iface, e)))?
    {
        let is_v4 = message
            .attributes
            .iter()
            .any(|attr| matches!(attr, AddressAttribute::Address(IpAddr::V4(_))));
        if is_v4 {
            to_delete.push(message);
        }
    }

    for message in to_delete {
        handle
            .address()
            .del(message)
            .execute()
            .await
            .map_err(|e| AgentError::net(format!("remove address on {:?}: {}", iface, e)))?;
    }

    Ok(())
}

fn parse_cidr(address: &str) -> AgentResult<(Ipv4Addr, u8)> {
    let (ip, prefix) = address
        .split_once('/')
        .ok_or_else(|| AgentError::invalid(format!("address {:?} must be CIDR form", address)))?;

    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| AgentError::invalid(format!("invalid interface address {:?}", address)))?;
    let prefix: u8 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| AgentError::invalid(format!("invalid prefix length in {:?}", address)))?;

    Ok((ip, prefix))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr() {
        assert_eq!(
            parse_cidr("172.16.5.2/30").unwrap(),
            (Ipv4Addr::new(172, 16, 5, 2), 30)
        );
        assert!(parse_cidr("172.16.5.2").is_err());
        assert!(parse_cidr("172.16.5.2/33").is_err());
        assert!(parse_cidr("not-an-ip/30").is_err());
    }

    #[tokio::test]
    async fn test_configure_rejects_missing_fields() {
        let request = NetRequest {
            interface: None,
            address: "".into(),
            gateway: "172.16.5.1".into(),
            dns: None,
        };
        assert!(matches!(
            configure_network(&request).await,
            Err(AgentError::InvalidRequest(_))
        ));

        let request = NetRequest {
            interface: None,
            address: "172.16.5.2/30".into(),
            gateway: "not an ip".into(),
            dns: None,
        };
        assert!(matches!(
            configure_network(&request).await,
            Err(AgentError::InvalidRequest(_))
        ));
    }
}
