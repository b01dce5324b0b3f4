//! IP prefix type.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An IP network prefix in CIDR notation.
///
/// The stored address is kept as given; [`IpPrefix::contains`] masks both
/// sides, so `10.1.1.1/24` and `10.1.1.0/24` cover the same addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    addr: IpAddr,
    len: u8,
}

impl IpPrefix {
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, ParseError> {
        let max = Self::max_len(&addr);
        if len > max {
            return Err(ParseError::InvalidPrefixLength {
                family: if addr.is_ipv4() { "IPv4" } else { "IPv6" },
                len,
            });
        }
        Ok(Self { addr, len })
    }

    /// Host prefix covering exactly `addr` (/32 for IPv4, /128 for IPv6).
    pub fn host(addr: IpAddr) -> Self {
        Self {
            addr,
            len: Self::max_len(&addr),
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_host(&self) -> bool {
        self.len == Self::max_len(&self.addr)
    }

    /// Returns true if `ip` falls inside this prefix. Addresses of the other
    /// family never match.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.len == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.len))
                };
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.len == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.len))
                };
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }

    const fn max_len(addr: &IpAddr) -> u8 {
        match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidIpPrefix(s.to_string());
        match s.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                let len: u8 = len.parse().map_err(|_| invalid())?;
                IpPrefix::new(addr, len)
            }
            None => s.parse::<IpAddr>().map(IpPrefix::host).map_err(|_| invalid()),
        }
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> String {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_host_prefix() {
        let v4 = IpPrefix::host("1.1.1.3".parse().unwrap());
        assert_eq!(v4.to_string(), "1.1.1.3/32");
        assert!(v4.is_host());

        let v6 = IpPrefix::host("fd00::3".parse().unwrap());
        assert_eq!(v6.len(), 128);
    }

    #[test]
    fn test_contains() {
        let subnet: IpPrefix = "1.1.1.0/24".parse().unwrap();
        assert!(subnet.contains("1.1.1.3".parse().unwrap()));
        assert!(!subnet.contains("1.1.2.3".parse().unwrap()));
        assert!(!subnet.contains("fd00::1".parse().unwrap()));

        let any: IpPrefix = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains("8.8.8.8".parse().unwrap()));

        let v6: IpPrefix = "fd00::/64".parse().unwrap();
        assert!(v6.contains("fd00::1234".parse().unwrap()));
    }

    #[test]
    fn test_parse_errors() {
        assert!("1.1.1.0/33".parse::<IpPrefix>().is_err());
        assert!("1.1.1/24".parse::<IpPrefix>().is_err());
        assert!("1.1.1.0/x".parse::<IpPrefix>().is_err());
    }
}
