//! Hardware address lookup for the device identity.

use std::path::Path;

use nanda_core::HardwareAddress;
use tracing::warn;

const SYSFS_NET: &str = "/sys/class/net";

/// Locally administered address used when no interface reports one.
const FALLBACK: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

/// Configured override, else the first non-loopback interface (sorted by name), else FALLBACK.
pub fn resolve(override_mac: Option<&str>) -> HardwareAddress {
    if let Some(s) = override_mac {
        match s.parse() {
            Ok(addr) => return addr,
            Err(e) => warn!("{}; ignoring mac override", e),
        }
    }
    if let Some(addr) = first_interface_address(Path::new(SYSFS_NET)) {
        return addr;
    }
    warn!("no hardware address found; using locally administered fallback");
    HardwareAddress::new(FALLBACK)
}

fn first_interface_address(root: &Path) -> Option<HardwareAddress> {
    let mut names: Vec<String> = std::fs::read_dir(root)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n != "lo")
        .collect();
    names.sort();
    names.into_iter().find_map(|name| {
        let text = std::fs::read_to_string(root.join(&name).join("address")).ok()?;
        let addr: HardwareAddress = text.trim().parse().ok()?;
        (!addr.is_zero()).then_some(addr)
    })
}
