//! CIDR allocation ranges

use crate::error::{Error, Result};
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

/// A parsed CIDR block that addresses are drawn from
///
/// The literal is kept as written, host bits included, so it can be
/// persisted back unchanged. All derived values work on the masked network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    cidr: IpNet,
}

impl Range {
    /// Parse a CIDR literal such as `10.2.3.64/28` or `2001:db8::/65`
    pub fn parse(cidr: &str) -> Result<Self> {
        let cidr: IpNet = cidr.trim().parse().map_err(|e| {
            Error::Validation(format!(
                "IP range '{}' is invalid ({}), please check your syntax",
                cidr, e
            ))
        })?;
        Ok(Self { cidr })
    }

    /// Number of bits in an address of this family (32 or 128)
    pub fn address_family_bits(&self) -> u8 {
        self.cidr.max_prefix_len()
    }

    /// Number of bits fixed by the range's own mask
    pub fn prefix_len(&self) -> u8 {
        self.cidr.prefix_len()
    }

    /// Number of bits that vary inside the range
    pub fn host_bits(&self) -> u8 {
        self.address_family_bits() - self.prefix_len()
    }

    /// Base address of the range with host bits cleared
    pub fn network(&self) -> IpAddr {
        self.cidr.network()
    }

    /// The range as a masked network
    pub fn net(&self) -> IpNet {
        self.cidr.trunc()
    }

    #[allow(dead_code)]
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.cidr.contains(addr)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cidr)
    }
}
