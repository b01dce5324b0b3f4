//! Trapped-packet metadata delivered by the packet path.
//!
//! Only the fields the learning subsystem reads are modelled. A trap is
//! produced once per learned source MAC and consumed by exactly one queue.

use std::net::IpAddr;
use vrouter_types::{InterfaceId, MacAddress, VrfId};

/// Provider-backbone encapsulation seen on the trapped frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PbbHeader {
    /// Backbone source MAC of the remote bridge.
    pub bmac: MacAddress,
    pub isid: u32,
}

/// Overlay tunnel the frame arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelInfo {
    /// Underlay source of the tunnel (the remote compute node).
    pub source: IpAddr,
    pub label: u32,
}

/// A packet trapped to the agent for source MAC learning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketTrap {
    pub interface: InterfaceId,
    pub vrf_id: VrfId,
    pub smac: MacAddress,
    pub dmac: MacAddress,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    /// Index of the bridge entry in the datapath.
    pub index: u32,
    pub ethernet_tag: u32,
    pub pbb: Option<PbbHeader>,
    pub tunnel: Option<TunnelInfo>,
}

impl PacketTrap {
    /// A plain local trap: frame with `smac` received on `interface`.
    pub fn new(interface: InterfaceId, vrf_id: VrfId, smac: MacAddress) -> Self {
        Self {
            interface,
            vrf_id,
            smac,
            dmac: MacAddress::BROADCAST,
            src_ip: None,
            dst_ip: None,
            index: 0,
            ethernet_tag: 0,
            pbb: None,
            tunnel: None,
        }
    }

    pub fn with_src_ip(mut self, ip: IpAddr) -> Self {
        self.src_ip = Some(ip);
        self
    }

    pub fn with_dmac(mut self, dmac: MacAddress) -> Self {
        self.dmac = dmac;
        self
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    pub fn with_ethernet_tag(mut self, tag: u32) -> Self {
        self.ethernet_tag = tag;
        self
    }

    pub fn with_pbb(mut self, bmac: MacAddress, isid: u32) -> Self {
        self.pbb = Some(PbbHeader { bmac, isid });
        self
    }

    pub fn with_tunnel(mut self, source: IpAddr, label: u32) -> Self {
        self.tunnel = Some(TunnelInfo { source, label });
        self
    }
}
