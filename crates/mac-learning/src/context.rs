//! Collaborator seams and the context object handed to every component.

use crate::oper_db::{BridgeRouteKey, NextHop, OperDb};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use vrouter_types::{HealthCheckId, InterfaceId, IpPrefix, MacAddress, VrfId};

/// A bridge route pointing at a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRoute {
    pub vrf_id: VrfId,
    pub vrf_name: String,
    pub mac: MacAddress,
    pub ip: Option<IpAddr>,
    pub interface: InterfaceId,
    pub label: u32,
    pub sg_list: Vec<u32>,
    pub ethernet_tag: u32,
}

impl LocalRoute {
    pub fn key(&self) -> BridgeRouteKey {
        BridgeRouteKey::new(self.vrf_name.clone(), self.mac, self.ip)
    }
}

/// A bridge route pointing at a tunnel or backbone next-hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRoute {
    pub vrf_id: VrfId,
    pub vrf_name: String,
    pub mac: MacAddress,
    pub ip: Option<IpAddr>,
    pub nexthop: NextHop,
    pub ethernet_tag: u32,
}

impl RemoteRoute {
    pub fn key(&self) -> BridgeRouteKey {
        BridgeRouteKey::new(self.vrf_name.clone(), self.mac, self.ip)
    }
}

/// An L3 host route (/32 or /128) bound to a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRoute {
    pub vrf_id: VrfId,
    pub vrf_name: String,
    pub prefix: IpPrefix,
    pub mac: MacAddress,
    pub interface: InterfaceId,
    pub label: u32,
}

/// Route-programming requests. Calls enqueue and return immediately;
/// completion is observed through route notifications in the [`OperDb`].
pub trait ForwardingTable: Send + Sync {
    fn add_local_route(&self, route: LocalRoute);
    fn add_remote_route(&self, route: RemoteRoute);
    fn delete_route(&self, key: BridgeRouteKey);
    fn add_host_route(&self, route: HostRoute);
    fn delete_host_route(&self, vrf_name: &str, prefix: IpPrefix);
}

/// Forwarding-plane packet counters for learned bridge entries.
pub trait PacketCounters: Send + Sync {
    /// Packets matched by (vrf, mac) so far, or `None` if unreadable.
    fn packets(&self, vrf_id: VrfId, mac: MacAddress) -> Option<u64>;
}

/// Opaque handle of a running liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeHandle(pub u64);

impl fmt::Display for ProbeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "probe-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub service: HealthCheckId,
    pub vrf_id: VrfId,
    pub interface: InterfaceId,
    pub ip: IpAddr,
    pub gateway: IpAddr,
    pub mac: MacAddress,
}

/// Liveness-probe engine. Unreachable targets are reported back through
/// [`crate::MacIpLearningHandle::entry_unreachable`].
pub trait HealthCheckApi: Send + Sync {
    fn start_probe(&self, request: ProbeRequest) -> ProbeHandle;
    fn stop_probe(&self, handle: ProbeHandle);
}

/// Explicit context passed to every component.
#[derive(Clone)]
pub struct AgentContext {
    pub oper_db: Arc<OperDb>,
    pub forwarding: Arc<dyn ForwardingTable>,
    pub counters: Arc<dyn PacketCounters>,
    pub health_check: Arc<dyn HealthCheckApi>,
}

impl AgentContext {
    pub fn new(
        oper_db: Arc<OperDb>,
        forwarding: Arc<dyn ForwardingTable>,
        counters: Arc<dyn PacketCounters>,
        health_check: Arc<dyn HealthCheckApi>,
    ) -> Self {
        Self {
            oper_db,
            forwarding,
            counters,
            health_check,
        }
    }
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("oper_db", &self.oper_db)
            .finish_non_exhaustive()
    }
}
