//! IP addresses and networks as 128-bit ranges.
//!
//! IPv4 lives in the IPv4-mapped IPv6 block (`::ffff:0:0/96`) so both
//! families share one ordering. Bounds are stored as 32-digit hex text,
//! whose lexicographic order is the numeric order.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const V4_MAPPED: u128 = 0xffff << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkRange {
    pub lo: u128,
    pub hi: u128,
}

impl NetworkRange {
    /// Parses `addr` or `addr/prefix` for either family. Host bits of a
    /// network are ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let (addr, prefix) = match text.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix.parse::<u32>().ok()?)),
            None => (text, None),
        };
        match addr.parse::<IpAddr>().ok()? {
            IpAddr::V4(v4) => {
                let prefix = prefix.unwrap_or(32);
                if prefix > 32 {
                    return None;
                }
                Some(Self::from_prefix(u128::from(u32::from(v4)) | V4_MAPPED, prefix + 96))
            }
            IpAddr::V6(v6) => {
                let prefix = prefix.unwrap_or(128);
                if prefix > 128 {
                    return None;
                }
                Some(Self::from_prefix(u128::from(v6), prefix))
            }
        }
    }

    fn from_prefix(addr: u128, prefix: u32) -> Self {
        let host_mask = if prefix >= 128 {
            0
        } else {
            u128::MAX >> prefix
        };
        Self {
            lo: addr & !host_mask,
            hi: addr | host_mask,
        }
    }

    /// `other` is equal to or contained within `self`.
    pub fn contains(&self, other: &NetworkRange) -> bool {
        self.lo <= other.lo && self.hi >= other.hi
    }

    pub fn lo_hex(&self) -> String {
        format!("{:032x}", self.lo)
    }

    pub fn hi_hex(&self) -> String {
        format!("{:032x}", self.hi)
    }
}

/// Integer form of an IPv4 address.
pub fn ipv4_to_u32(text: &str) -> Option<u32> {
    text.parse::<Ipv4Addr>().ok().map(u32::from)
}

/// Integer form of an IPv6 address.
pub fn ipv6_to_u128(text: &str) -> Option<u128> {
    text.parse::<Ipv6Addr>().ok().map(u128::from)
}
