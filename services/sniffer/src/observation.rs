//! Presence observations and hardware addresses.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of octets in an 802.11 hardware address.
pub const MAC_LEN: usize = 6;

/// Errors parsing a textual hardware address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacParseError {
    #[error("Invalid MAC address length: {0}")]
    InvalidLength(String),

    #[error("Invalid MAC address octet: {0}")]
    InvalidOctet(String),
}

/// A 6-byte hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; MAC_LEN]);

impl MacAddr {
    /// The all-ones broadcast address.
    pub const BROADCAST: MacAddr = MacAddr([0xFF; MAC_LEN]);

    /// Copy an address out of a slice of exactly six bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; MAC_LEN] = bytes.try_into().ok()?;
        Some(Self(octets))
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != MAC_LEN {
            return Err(MacParseError::InvalidLength(s.to_string()));
        }

        let mut octets = [0u8; MAC_LEN];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(MacParseError::InvalidOctet(part.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| MacParseError::InvalidOctet(part.to_string()))?;
        }

        Ok(Self(octets))
    }
}

/// Set of transmitter addresses whose frames are never stored.
///
/// The broadcast address is always rejected by the decoder on its own;
/// this set carries the operator-configured extras.
#[derive(Debug, Clone, Default)]
pub struct MacFilter {
    addresses: HashSet<MacAddr>,
}

impl MacFilter {
    pub fn new(addresses: impl IntoIterator<Item = MacAddr>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
        }
    }

    pub fn contains(&self, mac: &MacAddr) -> bool {
        self.addresses.contains(mac)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// One sighting of a device: who, when, and how loud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Transmitter address as colon-hex
    pub mac: String,
    /// Epoch milliseconds
    pub timestamp_ms: i64,
    /// Received signal strength in dBm
    pub signal: i8,
}

impl Observation {
    pub fn new(mac: MacAddr, timestamp_ms: i64, signal: i8) -> Self {
        Self {
            mac: mac.to_string(),
            timestamp_ms,
            signal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mac() {
        let mac = MacAddr([0xAA, 0xBB, 0xCC, 0x0D, 0xEE, 0x01]);
        assert_eq!(mac.to_string(), "AA:BB:CC:0D:EE:01");
    }

    #[test]
    fn test_parse_mac() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac, MacAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));

        let dashed: MacAddr = "00-11-22-33-44-55".parse().unwrap();
        assert_eq!(dashed.0[5], 0x55);

        assert!(matches!(
            "00:11:22".parse::<MacAddr>(),
            Err(MacParseError::InvalidLength(_))
        ));
        assert!(matches!(
            "00:11:22:33:44:zz".parse::<MacAddr>(),
            Err(MacParseError::InvalidOctet(_))
        ));
    }

    #[test]
    fn test_broadcast() {
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert_eq!(MacAddr::BROADCAST.to_string(), "FF:FF:FF:FF:FF:FF");
        assert!(!MacAddr([0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE]).is_broadcast());
    }

    #[test]
    fn test_mac_filter() {
        let listed = MacAddr([0x02, 0, 0, 0, 0, 1]);
        let filter = MacFilter::new([listed]);
        assert!(filter.contains(&listed));
        assert!(!filter.contains(&MacAddr([0x02, 0, 0, 0, 0, 2])));
        assert!(MacFilter::default().is_empty());
    }
}
