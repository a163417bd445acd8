//! Router gateway MAC address.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 48-bit Ethernet MAC address, as carried by a router's external gateway
/// port.
///
/// ```
/// use snat_types::MacAddress;
///
/// let mac: MacAddress = "fa:16:3e:00:00:01".parse().unwrap();
/// assert_eq!(mac.to_string(), "fa:16:3e:00:00:01");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Gateway MACs must be unicast; the group bit lives in the first octet.
    pub const fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in s.split([':', '-']) {
            if count == 6 || part.len() != 2 {
                return Err(ParseError::InvalidMacAddress(s.to_string()));
            }
            bytes[count] = u8::from_str_radix(part, 16)
                .map_err(|_| ParseError::InvalidMacAddress(s.to_string()))?;
            count += 1;
        }
        if count != 6 {
            return Err(ParseError::InvalidMacAddress(s.to_string()));
        }
        Ok(MacAddress(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_and_display() {
        let mac: MacAddress = "FA-16-3E-0A-0B-0C".parse().unwrap();
        assert_eq!(mac.octets(), [0xfa, 0x16, 0x3e, 0x0a, 0x0b, 0x0c]);
        assert_eq!(mac.to_string(), "fa:16:3e:0a:0b:0c");
    }

    #[test]
    fn test_unicast_check() {
        assert!("fa:16:3e:00:00:01".parse::<MacAddress>().unwrap().is_unicast());
        assert!(!"01:00:5e:00:00:01".parse::<MacAddress>().unwrap().is_unicast());
        assert!(MacAddress::ZERO.is_zero());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("fa:16:3e:00:00".parse::<MacAddress>().is_err());
        assert!("fa:16:3e:00:00:01:02".parse::<MacAddress>().is_err());
        assert!("fa:16:3e:00:00:zz".parse::<MacAddress>().is_err());
        assert!("fa:16:3e:0:00:01".parse::<MacAddress>().is_err());
    }
}
