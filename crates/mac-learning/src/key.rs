//! Keys of the learning tables.

use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use vrouter_types::{MacAddress, VrfId};

/// Keys that live in exactly one VRF.
pub trait VrfScoped {
    fn vrf_id(&self) -> VrfId;
}

/// Identity of a learned MAC: one entry per (VRF, MAC) across all partitions.
///
/// Ordered by VRF first, then MAC, which is the order snapshots page in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LearningKey {
    pub vrf_id: VrfId,
    pub mac: MacAddress,
}

impl LearningKey {
    pub const fn new(vrf_id: VrfId, mac: MacAddress) -> Self {
        Self { vrf_id, mac }
    }
}

impl VrfScoped for LearningKey {
    fn vrf_id(&self) -> VrfId {
        self.vrf_id
    }
}

impl fmt::Display for LearningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vrf_id, self.mac)
    }
}

/// Identity of a learned IP in the Mac-IP table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MacIpKey {
    pub vrf_id: VrfId,
    pub ip: IpAddr,
}

impl MacIpKey {
    pub const fn new(vrf_id: VrfId, ip: IpAddr) -> Self {
        Self { vrf_id, ip }
    }
}

impl VrfScoped for MacIpKey {
    fn vrf_id(&self) -> VrfId {
        self.vrf_id
    }
}

impl fmt::Display for MacIpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vrf_id, self.ip)
    }
}
