//! Device identity: stable identifiers and handle derived from the hardware address.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Prefix of the handle the agent registers under.
pub const HANDLE_PREFIX: &str = "m5stick-";
/// Prefix of the mDNS hostname.
pub const HOSTNAME_PREFIX: &str = "nanda-";
const DISPLAY_PREFIX: &str = "M5Stick ";

/// 6-byte hardware (MAC) address.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        HardwareAddress(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// True for the all-zero address reported by interfaces without a MAC.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Error parsing a textual hardware address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid hardware address: {0}")]
pub struct ParseHardwareAddressError(String);

impl FromStr for HardwareAddress {
    type Err = ParseHardwareAddressError;

    /// Accepts `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseHardwareAddressError(s.to_string());
        let parts: Vec<&str> = s.trim().split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(err());
        }
        let mut out = [0u8; 6];
        for (slot, part) in out.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(err());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        Ok(HardwareAddress(out))
    }
}

/// Identifiers the agent presents to the registry, mDNS and peers.
/// Computed once at startup; the same address always yields the same identity.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DeviceIdentity {
    full_id: String,
    short_id: String,
    handle: String,
    hostname: String,
    display_name: String,
}

impl DeviceIdentity {
    pub fn from_hardware_address(addr: &HardwareAddress) -> Self {
        let b = addr.as_bytes();
        let full_id: String = b.iter().map(|x| format!("{:02x}", x)).collect();
        let short_id = full_id[6..].to_string();
        Self {
            handle: format!("{}{}", HANDLE_PREFIX, short_id),
            hostname: format!("{}{}", HOSTNAME_PREFIX, short_id),
            display_name: format!("{}{}", DISPLAY_PREFIX, short_id),
            full_id,
            short_id,
        }
    }

    /// 12 lowercase hex digits of the full address.
    pub fn full_id(&self) -> &str {
        &self.full_id
    }

    /// 6 lowercase hex digits of the last three address bytes.
    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_lower_hex(s: &str) -> bool {
        s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }

    #[test]
    fn identity_from_known_address() {
        let addr = HardwareAddress::new([0x24, 0x0A, 0xC4, 0xA1, 0xB2, 0xC3]);
        let id = DeviceIdentity::from_hardware_address(&addr);
        assert_eq!(id.full_id(), "240ac4a1b2c3");
        assert_eq!(id.short_id(), "a1b2c3");
        assert_eq!(id.handle(), "m5stick-a1b2c3");
        assert_eq!(id.hostname(), "nanda-a1b2c3");
        assert_eq!(id.display_name(), "M5Stick a1b2c3");
    }

    #[test]
    fn identity_is_deterministic() {
        let addr = HardwareAddress::new([1, 2, 3, 4, 5, 6]);
        assert_eq!(
            DeviceIdentity::from_hardware_address(&addr),
            DeviceIdentity::from_hardware_address(&addr)
        );
    }

    #[test]
    fn handle_shape_over_many_addresses() {
        for seed in 0u16..512 {
            let hi = (seed >> 8) as u8;
            let lo = seed as u8;
            let addr = HardwareAddress::new([0xff, lo, hi, lo ^ 0xa5, hi.wrapping_mul(7), lo]);
            let id = DeviceIdentity::from_hardware_address(&addr);
            let suffix = id.handle().strip_prefix("m5stick-").unwrap();
            assert_eq!(suffix.len(), 6);
            assert!(is_lower_hex(suffix), "{}", id.handle());
            assert_eq!(id.full_id().len(), 12);
            assert!(id.full_id().ends_with(id.short_id()));
        }
    }

    #[test]
    fn parse_accepts_colons_dashes_and_upper_case() {
        let a: HardwareAddress = "AA:bb:0C:dd:EE:0f".parse().unwrap();
        let b: HardwareAddress = "aa-BB-0c-DD-ee-0F".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "aa:bb:0c:dd:ee:0f");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("aa:bb:cc:dd:ee".parse::<HardwareAddress>().is_err());
        assert!("aa:bb:cc:dd:ee:fg".parse::<HardwareAddress>().is_err());
        assert!("aabb:cc:dd:ee:ff:00".parse::<HardwareAddress>().is_err());
        assert!("".parse::<HardwareAddress>().is_err());
    }

    #[test]
    fn zero_address_detected() {
        assert!(HardwareAddress::new([0; 6]).is_zero());
        assert!(!HardwareAddress::new([0, 0, 0, 0, 0, 1]).is_zero());
    }
}
