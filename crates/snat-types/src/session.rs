//! NAPT session tuples.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Transport protocol of a translated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl NatProtocol {
    /// IANA protocol number, used as a flow match field.
    pub const fn ip_proto(&self) -> u8 {
        match self {
            NatProtocol::Tcp => 6,
            NatProtocol::Udp => 17,
            NatProtocol::Icmp => 1,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            NatProtocol::Tcp => "tcp",
            NatProtocol::Udp => "udp",
            NatProtocol::Icmp => "icmp",
        }
    }
}

impl fmt::Display for NatProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NatProtocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "6" => Ok(NatProtocol::Tcp),
            "udp" | "17" => Ok(NatProtocol::Udp),
            "icmp" | "1" => Ok(NatProtocol::Icmp),
            _ => Err(ParseError::InvalidProtocol(s.to_string())),
        }
    }
}

/// Internal (ip, port, protocol) of a live session.
///
/// For ICMP the port carries the echo identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub protocol: NatProtocol,
}

impl SessionKey {
    pub const fn new(ip: Ipv4Addr, port: u16, protocol: NatProtocol) -> Self {
        Self { ip, port, protocol }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.ip, self.port, self.protocol)
    }
}

impl FromStr for SessionKey {
    type Err = ParseError;

    /// Parses `ip:port:proto`, e.g. `10.0.0.5:4000:tcp`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (Some(ip), Some(port), Some(proto), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::InvalidSessionKey(s.to_string()));
        };
        let ip = ip
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(ip.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| ParseError::InvalidSessionKey(s.to_string()))?;
        Ok(SessionKey::new(ip, port, proto.parse()?))
    }
}

/// External (ip, port) a session is translated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalEndpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl ExternalEndpoint {
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for ExternalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_protocol_parse() {
        assert_eq!("TCP".parse::<NatProtocol>().unwrap(), NatProtocol::Tcp);
        assert_eq!("17".parse::<NatProtocol>().unwrap(), NatProtocol::Udp);
        assert!("sctp".parse::<NatProtocol>().is_err());
        assert_eq!(NatProtocol::Icmp.ip_proto(), 1);
    }

    #[test]
    fn test_session_key_round_trip_text() {
        let key: SessionKey = "10.0.0.5:4000:tcp".parse().unwrap();
        assert_eq!(key, SessionKey::new(Ipv4Addr::new(10, 0, 0, 5), 4000, NatProtocol::Tcp));
        assert_eq!(key.to_string(), "10.0.0.5:4000:tcp");
    }

    #[test]
    fn test_session_key_rejects_extra_fields() {
        assert!("10.0.0.5:4000:tcp:x".parse::<SessionKey>().is_err());
        assert!("10.0.0.5:4000".parse::<SessionKey>().is_err());
        assert!("10.0.0.5:70000:udp".parse::<SessionKey>().is_err());
    }
}
