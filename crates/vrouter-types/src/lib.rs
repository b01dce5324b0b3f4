//! Common types shared by the virtual-router agent crates.
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC address with a total order
//! - [`IpPrefix`]: address + prefix length, including host prefixes
//! - [`VrfId`], [`InterfaceId`], [`VnId`], [`HealthCheckId`]: object ids
//!   handed out by the agent's operational database

mod ids;
mod ip;
mod mac;

pub use ids::{HealthCheckId, InterfaceId, VnId, VrfId};
pub use ip::IpPrefix;
pub use mac::MacAddress;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("prefix length {len} out of range for {family}")]
    InvalidPrefixLength { family: &'static str, len: u8 },
}
