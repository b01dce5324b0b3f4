//! In-memory collaborators: a forwarding table that acknowledges through the
//! operational database, settable packet counters and a recording
//! health-check engine. Used by the tests and by `maclearnd --simulate`.

use crate::context::{
    AgentContext, ForwardingTable, HealthCheckApi, HostRoute, LocalRoute, PacketCounters,
    ProbeHandle, ProbeRequest, RemoteRoute,
};
use crate::oper_db::{
    BridgeRoute, BridgeRouteKey, HealthCheckService, InterfaceEntry, InterfaceKind, NextHop,
    OperDb, RouteOrigin, VnEntry, VrfEntry,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vrouter_types::{HealthCheckId, InterfaceId, IpPrefix, MacAddress, VnId, VrfId};

/// A call made on the forwarding table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardingOp {
    AddLocalRoute(LocalRoute),
    AddRemoteRoute(RemoteRoute),
    DeleteRoute(BridgeRouteKey),
    AddHostRoute(HostRoute),
    DeleteHostRoute { vrf_name: String, prefix: IpPrefix },
}

/// Programs bridge routes straight into the database, so each program or
/// withdrawal is acknowledged through the usual route notification.
pub struct SimForwardingTable {
    oper_db: Arc<OperDb>,
    ops: Mutex<Vec<ForwardingOp>>,
    host_routes: Mutex<BTreeMap<(String, IpPrefix), HostRoute>>,
}

impl SimForwardingTable {
    pub fn new(oper_db: Arc<OperDb>) -> Self {
        Self {
            oper_db,
            ops: Mutex::new(Vec::new()),
            host_routes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn ops(&self) -> Vec<ForwardingOp> {
        self.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    pub fn has_host_route(&self, vrf_name: &str, prefix: IpPrefix) -> bool {
        self.host_routes
            .lock()
            .contains_key(&(vrf_name.to_string(), prefix))
    }

    pub fn host_route_count(&self) -> usize {
        self.host_routes.lock().len()
    }
}

impl ForwardingTable for SimForwardingTable {
    fn add_local_route(&self, route: LocalRoute) {
        self.ops.lock().push(ForwardingOp::AddLocalRoute(route.clone()));
        self.oper_db.upsert_route(BridgeRoute {
            key: route.key(),
            vrf_id: route.vrf_id,
            origin: RouteOrigin::MacLearning,
            nexthop: NextHop::Interface {
                interface: route.interface,
                label: route.label,
                sg_list: route.sg_list,
            },
            ethernet_tag: route.ethernet_tag,
        });
    }

    fn add_remote_route(&self, route: RemoteRoute) {
        self.ops.lock().push(ForwardingOp::AddRemoteRoute(route.clone()));
        self.oper_db.upsert_route(BridgeRoute {
            key: route.key(),
            vrf_id: route.vrf_id,
            origin: RouteOrigin::MacLearning,
            nexthop: route.nexthop,
            ethernet_tag: route.ethernet_tag,
        });
    }

    fn delete_route(&self, key: BridgeRouteKey) {
        self.ops.lock().push(ForwardingOp::DeleteRoute(key.clone()));
        self.oper_db.remove_route(&key);
    }

    fn add_host_route(&self, route: HostRoute) {
        self.ops.lock().push(ForwardingOp::AddHostRoute(route.clone()));
        self.host_routes
            .lock()
            .insert((route.vrf_name.clone(), route.prefix), route);
    }

    fn delete_host_route(&self, vrf_name: &str, prefix: IpPrefix) {
        self.ops.lock().push(ForwardingOp::DeleteHostRoute {
            vrf_name: vrf_name.to_string(),
            prefix,
        });
        self.host_routes.lock().remove(&(vrf_name.to_string(), prefix));
    }
}

/// Packet counters set by hand. Unset counters read as unavailable.
#[derive(Debug, Default)]
pub struct SimPacketCounters {
    counters: DashMap<(VrfId, MacAddress), u64>,
}

impl SimPacketCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, vrf_id: VrfId, mac: MacAddress, packets: u64) {
        self.counters.insert((vrf_id, mac), packets);
    }

    /// Adds `delta` packets, as if traffic hit the entry.
    pub fn bump(&self, vrf_id: VrfId, mac: MacAddress, delta: u64) {
        *self.counters.entry((vrf_id, mac)).or_insert(0) += delta;
    }
}

impl PacketCounters for SimPacketCounters {
    fn packets(&self, vrf_id: VrfId, mac: MacAddress) -> Option<u64> {
        self.counters.get(&(vrf_id, mac)).map(|c| *c.value())
    }
}

/// Records running probes.
#[derive(Debug, Default)]
pub struct SimHealthCheck {
    next_handle: AtomicU64,
    probes: Mutex<BTreeMap<ProbeHandle, ProbeRequest>>,
    started: AtomicU64,
}

impl SimHealthCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_probes(&self) -> Vec<ProbeRequest> {
        self.probes.lock().values().cloned().collect()
    }

    pub fn probe_for(&self, ip: std::net::IpAddr) -> Option<(ProbeHandle, ProbeRequest)> {
        self.probes
            .lock()
            .iter()
            .find(|(_, p)| p.ip == ip)
            .map(|(h, p)| (*h, p.clone()))
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

impl HealthCheckApi for SimHealthCheck {
    fn start_probe(&self, request: ProbeRequest) -> ProbeHandle {
        let handle = ProbeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        self.started.fetch_add(1, Ordering::Relaxed);
        self.probes.lock().insert(handle, request);
        handle
    }

    fn stop_probe(&self, handle: ProbeHandle) {
        self.probes.lock().remove(&handle);
    }
}

/// A database plus simulated collaborators, with topology helpers.
pub struct SimEnvironment {
    oper_db: Arc<OperDb>,
    forwarding: Arc<SimForwardingTable>,
    counters: Arc<SimPacketCounters>,
    health_check: Arc<SimHealthCheck>,
}

impl Default for SimEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnvironment {
    pub fn new() -> Self {
        let oper_db = OperDb::new();
        Self {
            forwarding: Arc::new(SimForwardingTable::new(Arc::clone(&oper_db))),
            oper_db,
            counters: Arc::new(SimPacketCounters::new()),
            health_check: Arc::new(SimHealthCheck::new()),
        }
    }

    pub fn ctx(&self) -> AgentContext {
        AgentContext::new(
            self.oper_db.clone(),
            self.forwarding.clone(),
            self.counters.clone(),
            self.health_check.clone(),
        )
    }

    pub fn oper_db(&self) -> &Arc<OperDb> {
        &self.oper_db
    }

    pub fn forwarding(&self) -> &Arc<SimForwardingTable> {
        &self.forwarding
    }

    pub fn counters(&self) -> &Arc<SimPacketCounters> {
        &self.counters
    }

    pub fn health_check(&self) -> &Arc<SimHealthCheck> {
        &self.health_check
    }

    pub fn add_vrf(&self, id: u32, name: &str) {
        self.oper_db.upsert_vrf(VrfEntry::new(VrfId(id), name));
    }

    pub fn set_vrf_aging(&self, id: u32, seconds: u32) {
        if let Some(vrf) = self.oper_db.vrf(VrfId(id)) {
            let mut vrf = vrf.as_ref().clone();
            vrf.mac_aging_time = seconds;
            self.oper_db.upsert_vrf(vrf);
        }
    }

    pub fn add_vn(&self, id: u32, name: &str) {
        self.oper_db.upsert_vn(VnEntry::new(VnId(id), name));
    }

    pub fn set_vn_mac_ip_learning(&self, id: u32, enabled: bool) {
        if let Some(vn) = self.oper_db.vn(VnId(id)) {
            let mut vn = vn.as_ref().clone();
            vn.mac_ip_learning = enabled;
            self.oper_db.upsert_vn(vn);
        }
    }

    pub fn add_vm_interface(&self, id: u32, name: &str, vrf: u32, vn: u32) {
        let mut intf = InterfaceEntry::new(InterfaceId(id), name, InterfaceKind::VmPort);
        intf.vrf = Some(VrfId(vrf));
        intf.vn = Some(VnId(vn));
        intf.label = 16 + id;
        self.oper_db.upsert_interface(intf);
    }

    pub fn add_fabric_interface(&self, id: u32, name: &str) {
        self.oper_db
            .upsert_interface(InterfaceEntry::new(InterfaceId(id), name, InterfaceKind::Fabric));
    }

    pub fn add_pbb_interface(&self, id: u32, name: &str) {
        self.oper_db
            .upsert_interface(InterfaceEntry::new(InterfaceId(id), name, InterfaceKind::PbbTunnel));
    }

    /// Adds or replaces a health-check service monitoring `targets`
    /// (CIDR strings; unparsable ones are skipped).
    pub fn add_health_check(&self, id: u32, name: &str, targets: &[&str]) {
        self.oper_db.upsert_health_check(HealthCheckService {
            id: HealthCheckId(id),
            name: name.to_string(),
            targets: targets.iter().filter_map(|t| t.parse().ok()).collect(),
        });
    }
}
