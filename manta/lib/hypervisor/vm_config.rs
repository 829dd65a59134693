use std::path::Path;

use serde::Serialize;

use crate::{config::Config, MantaResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The Firecracker configuration document written into each jail for cold
/// boots and the golden-snapshot VM.
///
/// Paths inside are relative to the jail directory; the VMM is spawned with
/// its working directory set there, which keeps the document identical across
/// sandboxes and lets the snapshot refer to stable resource names.
#[derive(Debug, Serialize)]
pub struct VmConfig {
    #[serde(rename = "boot-source")]
    boot_source: BootSource,

    drives: Vec<Drive>,

    #[serde(rename = "network-interfaces")]
    network_interfaces: Vec<NetworkInterface>,

    #[serde(rename = "machine-config")]
    machine_config: MachineConfig,

    vsock: VsockConfig,
}

#[derive(Debug, Serialize)]
struct BootSource {
    kernel_image_path: String,
    boot_args: String,
}

#[derive(Debug, Serialize)]
struct Drive {
    drive_id: String,
    path_on_host: String,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Serialize)]
struct NetworkInterface {
    iface_id: String,
    guest_mac: String,
    host_dev_name: String,
}

#[derive(Debug, Serialize)]
struct MachineConfig {
    vcpu_count: u8,
    mem_size_mib: u32,
}

#[derive(Debug, Serialize)]
struct VsockConfig {
    guest_cid: u32,
    uds_path: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmConfig {
    /// Builds the config for a VM on the given tap/rootfs/vsock resources.
    pub fn new(
        cfg: &Config,
        tap_device: &str,
        rootfs_path: &str,
        subnet: u32,
        vsock_path: &str,
        guest_cid: u32,
    ) -> Self {
        Self {
            boot_source: BootSource {
                kernel_image_path: cfg.kernel_path.display().to_string(),
                boot_args: cfg.boot_args.clone(),
            },
            drives: vec![Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: rootfs_path.to_string(),
                is_root_device: true,
                is_read_only: false,
            }],
            network_interfaces: vec![NetworkInterface {
                iface_id: crate::config::GUEST_IFACE.to_string(),
                guest_mac: guest_mac_for_subnet(subnet),
                host_dev_name: tap_device.to_string(),
            }],
            machine_config: MachineConfig {
                vcpu_count: cfg.default_vcpus,
                mem_size_mib: cfg.default_mem_mib,
            },
            vsock: VsockConfig {
                guest_cid,
                uds_path: vsock_path.to_string(),
            },
        }
    }

    /// Writes the config document to `path`.
    pub async fn write(&self, path: impl AsRef<Path>) -> MantaResult<()> {
        let mut raw = serde_json::to_vec_pretty(self)?;
        raw.push(b'\n');
        tokio::fs::write(path.as_ref(), raw).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Deterministic guest MAC for a subnet index, under a locally administered
/// OUI so it can never collide with real hardware.
pub fn guest_mac_for_subnet(subnet: u32) -> String {
    format!("06:00:AC:10:{:02X}:{:02X}", (subnet >> 8) & 0xFF, subnet & 0xFF)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_mac_for_subnet() {
        assert_eq!(guest_mac_for_subnet(1), "06:00:AC:10:00:01");
        assert_eq!(guest_mac_for_subnet(250), "06:00:AC:10:00:FA");
        assert_eq!(guest_mac_for_subnet(0x1234), "06:00:AC:10:12:34");
    }

    #[test]
    fn test_vm_config_wire_keys() -> anyhow::Result<()> {
        let cfg = Config::for_tests("/tmp/manta");
        let vm = VmConfig::new(&cfg, "tap0", "rootfs.ext4", 7, "vsock.sock", 1007);
        let value: serde_json::Value = serde_json::from_slice(&serde_json::to_vec(&vm)?)?;

        assert_eq!(value["boot-source"]["kernel_image_path"], "/artifacts/vmlinux");
        assert_eq!(value["drives"][0]["drive_id"], "rootfs");
        assert_eq!(value["drives"][0]["is_root_device"], true);
        assert_eq!(value["network-interfaces"][0]["host_dev_name"], "tap0");
        assert_eq!(value["machine-config"]["mem_size_mib"], 512);
        assert_eq!(value["vsock"]["guest_cid"], 1007);
        assert_eq!(value["vsock"]["uds_path"], "vsock.sock");

        Ok(())
    }
}
