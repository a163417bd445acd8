//! IPv4 prefixes and internal address bindings.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 prefix in CIDR notation (e.g. 10.0.0.0/24).
///
/// The stored address is always the network address: host bits are masked
/// off on construction so that `10.0.0.7/24` and `10.0.0.0/24` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Prefix {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Prefix {
    /// Creates a new prefix, masking host bits.
    ///
    /// # Errors
    ///
    /// Returns an error if `prefix_len` exceeds 32.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, ParseError> {
        if prefix_len > 32 {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum 32",
                prefix_len
            )));
        }
        let network = Ipv4Addr::from(u32::from(address) & Self::mask(prefix_len));
        Ok(Ipv4Prefix {
            network,
            prefix_len,
        })
    }

    /// Returns the /32 host prefix for an address.
    pub fn host(address: Ipv4Addr) -> Self {
        Ipv4Prefix {
            network: address,
            prefix_len: 32,
        }
    }

    fn mask(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix_len))
        }
    }

    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub const fn is_host_route(&self) -> bool {
        self.prefix_len == 32
    }

    /// Returns true if `addr` falls inside this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask(self.prefix_len) == u32::from(self.network)
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = match s.rsplit_once('/') {
            Some(parts) => parts,
            None => (s, "32"),
        };

        let address: Ipv4Addr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        Ipv4Prefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for Ipv4Prefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Prefix> for String {
    fn from(prefix: Ipv4Prefix) -> String {
        prefix.to_string()
    }
}

/// Internal side of an endpoint mapping: either a single host or a whole
/// subnet sharing one external IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalAddress {
    Host(Ipv4Addr),
    Subnet(Ipv4Prefix),
}

impl InternalAddress {
    /// Returns true if the internal host `addr` is covered by this binding.
    pub fn covers(&self, addr: Ipv4Addr) -> bool {
        match self {
            InternalAddress::Host(host) => *host == addr,
            InternalAddress::Subnet(prefix) => prefix.contains(addr),
        }
    }
}

impl fmt::Display for InternalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InternalAddress::Host(addr) => write!(f, "{}/32", addr),
            InternalAddress::Subnet(prefix) => prefix.fmt(f),
        }
    }
}

impl From<Ipv4Prefix> for InternalAddress {
    fn from(prefix: Ipv4Prefix) -> Self {
        if prefix.is_host_route() {
            InternalAddress::Host(prefix.network())
        } else {
            InternalAddress::Subnet(prefix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prefix_parse_masks_host_bits() {
        let prefix: Ipv4Prefix = "10.0.0.7/24".parse().unwrap();
        assert_eq!(prefix.network(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(prefix.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn test_prefix_without_length_is_host() {
        let prefix: Ipv4Prefix = "192.0.2.1".parse().unwrap();
        assert!(prefix.is_host_route());
    }

    #[test]
    fn test_prefix_contains() {
        let prefix: Ipv4Prefix = "10.1.0.0/16".parse().unwrap();
        assert!(prefix.contains(Ipv4Addr::new(10, 1, 200, 3)));
        assert!(!prefix.contains(Ipv4Addr::new(10, 2, 0, 1)));

        let any: Ipv4Prefix = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains(Ipv4Addr::new(203, 0, 113, 9)));
    }

    #[test]
    fn test_invalid_prefix() {
        assert!("10.0.0.0/33".parse::<Ipv4Prefix>().is_err());
        assert!("10.0.0/24".parse::<Ipv4Prefix>().is_err());
        assert!("10.0.0.0/x".parse::<Ipv4Prefix>().is_err());
    }

    #[test]
    fn test_internal_address_from_prefix() {
        let host: InternalAddress = "10.0.0.5/32".parse::<Ipv4Prefix>().unwrap().into();
        assert_eq!(host, InternalAddress::Host(Ipv4Addr::new(10, 0, 0, 5)));

        let subnet: InternalAddress = "10.0.0.0/24".parse::<Ipv4Prefix>().unwrap().into();
        assert!(subnet.covers(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(!host.covers(Ipv4Addr::new(10, 0, 0, 6)));
    }
}
