//! Common types for centralized SNAT orchestration.
//!
//! This crate provides type-safe representations of the identifiers and
//! network primitives shared by the SNAT control plane:
//!
//! - [`RouterId`], [`SwitchId`], [`SubnetId`], [`NetworkId`]: entity identifiers
//! - [`VpnId`], [`Label`]: forwarding identifiers and MPLS-style route labels
//! - [`Ipv4Prefix`]: IPv4 network prefixes (CIDR notation)
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`SessionKey`], [`ExternalEndpoint`], [`NatProtocol`]: NAPT session tuples
//! - [`InternalAddress`]: an internal host or subnet mapped to an external IP

mod ids;
mod mac;
mod prefix;
mod session;

pub use ids::{Label, NetworkId, RouterId, SubnetId, SwitchId, VpnId};
pub use mac::MacAddress;
pub use prefix::{InternalAddress, Ipv4Prefix};
pub use session::{ExternalEndpoint, NatProtocol, SessionKey};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IPv4 address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IPv4 prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid switch id: {0}")]
    InvalidSwitchId(String),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("invalid session key: {0}")]
    InvalidSessionKey(String),
}
