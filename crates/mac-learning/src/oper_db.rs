//! Operational database: the agent's view of interfaces, VRFs, virtual
//! networks, health-check services and bridge routes.
//!
//! Every mutation is stamped with a monotonically increasing generation and
//! pushed to the registered [`DbListener`]s. Deleted objects leave a
//! tombstone carrying their deletion generation; the tombstone is only
//! cleared by [`OperDb::release_state`] with that same generation, or by the
//! object being re-added.

use crate::error::{LearningError, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vrouter_types::{HealthCheckId, InterfaceId, IpPrefix, MacAddress, VnId, VrfId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    /// Virtual machine port; traps on it learn Local entries.
    VmPort,
    /// Underlay fabric; traps on it carry tunnel data and learn Remote entries.
    Fabric,
    /// Backbone tunnel endpoint; traps on it learn PBB entries.
    PbbTunnel,
    Physical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEntry {
    pub id: InterfaceId,
    pub name: String,
    pub kind: InterfaceKind,
    pub vrf: Option<VrfId>,
    pub vn: Option<VnId>,
    pub label: u32,
    pub sg_list: Vec<u32>,
    pub active: bool,
}

impl InterfaceEntry {
    pub fn new(id: InterfaceId, name: impl Into<String>, kind: InterfaceKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            vrf: None,
            vn: None,
            label: 0,
            sg_list: Vec::new(),
            active: true,
        }
    }
}

/// Backbone association of a service VRF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbbConfig {
    pub isid: u32,
    pub bmac_vrf_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfEntry {
    pub id: VrfId,
    pub name: String,
    pub active: bool,
    /// MAC aging time in seconds; 0 disables aging.
    pub mac_aging_time: u32,
    pub pbb: Option<PbbConfig>,
}

impl VrfEntry {
    pub fn new(id: VrfId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            active: true,
            mac_aging_time: 0,
            pbb: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnSubnet {
    pub prefix: IpPrefix,
    pub gateway: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnEntry {
    pub id: VnId,
    pub name: String,
    pub subnets: Vec<VnSubnet>,
    pub health_check: Option<HealthCheckId>,
    pub mac_ip_learning: bool,
}

impl VnEntry {
    pub fn new(id: VnId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            subnets: Vec::new(),
            health_check: None,
            mac_ip_learning: false,
        }
    }

    /// Gateway of the subnet containing `ip`.
    pub fn gateway_for(&self, ip: IpAddr) -> Option<IpAddr> {
        self.subnets
            .iter()
            .find(|s| s.prefix.contains(ip))
            .map(|s| s.gateway)
    }
}

/// A liveness-probing service attached to a virtual network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckService {
    pub id: HealthCheckId,
    pub name: String,
    /// Addresses the service monitors. An empty list monitors nothing.
    pub targets: Vec<IpPrefix>,
}

impl HealthCheckService {
    pub fn monitors(&self, ip: IpAddr) -> bool {
        self.targets.iter().any(|p| p.contains(ip))
    }
}

/// Identity of a bridge route: (VRF name, MAC[, IP]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BridgeRouteKey {
    pub vrf_name: String,
    pub mac: MacAddress,
    pub ip: Option<IpAddr>,
}

impl BridgeRouteKey {
    pub fn new(vrf_name: impl Into<String>, mac: MacAddress, ip: Option<IpAddr>) -> Self {
        Self {
            vrf_name: vrf_name.into(),
            mac,
            ip,
        }
    }
}

impl fmt::Display for BridgeRouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            Some(ip) => write!(f, "{}:{},{}", self.vrf_name, self.mac, ip),
            None => write!(f, "{}:{}", self.vrf_name, self.mac),
        }
    }
}

/// Who installed a bridge route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOrigin {
    MacLearning,
    Evpn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NextHop {
    Interface {
        interface: InterfaceId,
        label: u32,
        sg_list: Vec<u32>,
    },
    Tunnel {
        dest: IpAddr,
        label: u32,
    },
    Pbb {
        bmac_vrf_name: String,
        bmac: MacAddress,
        isid: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRoute {
    pub key: BridgeRouteKey,
    /// VRF the route was programmed in. Carried so that a withdrawal after
    /// the VRF is gone still resolves to it.
    pub vrf_id: VrfId,
    pub origin: RouteOrigin,
    pub nexthop: NextHop,
    pub ethernet_tag: u32,
}

/// Identity of any object in the database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DbObjectKey {
    Interface(InterfaceId),
    Vrf(VrfId),
    Vn(VnId),
    HealthCheck(HealthCheckId),
    Route(BridgeRouteKey),
}

impl fmt::Display for DbObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbObjectKey::Interface(id) => write!(f, "{id}"),
            DbObjectKey::Vrf(id) => write!(f, "{id}"),
            DbObjectKey::Vn(id) => write!(f, "{id}"),
            DbObjectKey::HealthCheck(id) => write!(f, "{id}"),
            DbObjectKey::Route(key) => write!(f, "route-{key}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbChange {
    Add,
    Change,
    Delete,
}

/// A change notification pushed to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbEvent {
    pub object: DbObjectKey,
    pub change: DbChange,
    pub generation: u64,
    /// Route payload (new value, or the removed value on delete).
    pub route: Option<BridgeRoute>,
    /// VRF id of a route event; `None` for other objects.
    pub vrf_id: Option<VrfId>,
}

/// Receives database change notifications. Implementations must not block.
pub trait DbListener: Send + Sync {
    fn notify(&self, event: DbEvent);
}

/// In-memory operational database.
#[derive(Default)]
pub struct OperDb {
    interfaces: DashMap<InterfaceId, Arc<InterfaceEntry>>,
    vrfs: DashMap<VrfId, Arc<VrfEntry>>,
    vns: DashMap<VnId, Arc<VnEntry>>,
    health_checks: DashMap<HealthCheckId, Arc<HealthCheckService>>,
    routes: DashMap<BridgeRouteKey, BridgeRoute>,
    tombstones: DashMap<DbObjectKey, u64>,
    generation: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn DbListener>>>,
}

impl fmt::Debug for OperDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperDb")
            .field("interfaces", &self.interfaces.len())
            .field("vrfs", &self.vrfs.len())
            .field("vns", &self.vns.len())
            .field("health_checks", &self.health_checks.len())
            .field("routes", &self.routes.len())
            .field("tombstones", &self.tombstones.len())
            .finish()
    }
}

impl OperDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_listener(&self, listener: Arc<dyn DbListener>) {
        self.listeners.write().push(listener);
    }

    /// Generation of the most recent mutation.
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn publish(&self, event: DbEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.notify(event.clone());
        }
    }

    fn published_upsert(&self, object: DbObjectKey, existed: bool) {
        self.tombstones.remove(&object);
        let change = if existed { DbChange::Change } else { DbChange::Add };
        let generation = self.next_generation();
        self.publish(DbEvent {
            object,
            change,
            generation,
            route: None,
            vrf_id: None,
        });
    }

    fn published_remove(&self, object: DbObjectKey) {
        let generation = self.next_generation();
        self.tombstones.insert(object.clone(), generation);
        self.publish(DbEvent {
            object,
            change: DbChange::Delete,
            generation,
            route: None,
            vrf_id: None,
        });
    }

    pub fn upsert_interface(&self, entry: InterfaceEntry) {
        let id = entry.id;
        let existed = self.interfaces.insert(id, Arc::new(entry)).is_some();
        self.published_upsert(DbObjectKey::Interface(id), existed);
    }

    pub fn remove_interface(&self, id: InterfaceId) -> bool {
        if self.interfaces.remove(&id).is_none() {
            return false;
        }
        self.published_remove(DbObjectKey::Interface(id));
        true
    }

    pub fn interface(&self, id: InterfaceId) -> Option<Arc<InterfaceEntry>> {
        self.interfaces.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn upsert_vrf(&self, entry: VrfEntry) {
        let id = entry.id;
        let existed = self.vrfs.insert(id, Arc::new(entry)).is_some();
        self.published_upsert(DbObjectKey::Vrf(id), existed);
    }

    pub fn remove_vrf(&self, id: VrfId) -> bool {
        if self.vrfs.remove(&id).is_none() {
            return false;
        }
        self.published_remove(DbObjectKey::Vrf(id));
        true
    }

    pub fn vrf(&self, id: VrfId) -> Option<Arc<VrfEntry>> {
        self.vrfs.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn vrf_by_name(&self, name: &str) -> Option<Arc<VrfEntry>> {
        self.vrfs
            .iter()
            .find(|e| e.value().name == name)
            .map(|e| Arc::clone(e.value()))
    }

    pub fn upsert_vn(&self, entry: VnEntry) {
        let id = entry.id;
        let existed = self.vns.insert(id, Arc::new(entry)).is_some();
        self.published_upsert(DbObjectKey::Vn(id), existed);
    }

    pub fn remove_vn(&self, id: VnId) -> bool {
        if self.vns.remove(&id).is_none() {
            return false;
        }
        self.published_remove(DbObjectKey::Vn(id));
        true
    }

    pub fn vn(&self, id: VnId) -> Option<Arc<VnEntry>> {
        self.vns.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn upsert_health_check(&self, entry: HealthCheckService) {
        let id = entry.id;
        let existed = self.health_checks.insert(id, Arc::new(entry)).is_some();
        self.published_upsert(DbObjectKey::HealthCheck(id), existed);
    }

    pub fn remove_health_check(&self, id: HealthCheckId) -> bool {
        if self.health_checks.remove(&id).is_none() {
            return false;
        }
        self.published_remove(DbObjectKey::HealthCheck(id));
        true
    }

    pub fn health_check(&self, id: HealthCheckId) -> Option<Arc<HealthCheckService>> {
        self.health_checks.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Installs or replaces a bridge route. Every call is published, so a
    /// re-program of an unchanged route still acknowledges.
    pub fn upsert_route(&self, route: BridgeRoute) {
        let key = route.key.clone();
        let vrf_id = Some(route.vrf_id);
        let existed = self.routes.insert(key.clone(), route.clone()).is_some();
        let object = DbObjectKey::Route(key);
        self.tombstones.remove(&object);
        let generation = self.next_generation();
        self.publish(DbEvent {
            object,
            change: if existed { DbChange::Change } else { DbChange::Add },
            generation,
            route: Some(route),
            vrf_id,
        });
    }

    /// Removes a bridge route; publishes only if it existed.
    pub fn remove_route(&self, key: &BridgeRouteKey) -> bool {
        let Some((key, route)) = self.routes.remove(key) else {
            return false;
        };
        let vrf_id = Some(route.vrf_id);
        let object = DbObjectKey::Route(key);
        let generation = self.next_generation();
        self.tombstones.insert(object.clone(), generation);
        self.publish(DbEvent {
            object,
            change: DbChange::Delete,
            generation,
            route: Some(route),
            vrf_id,
        });
        true
    }

    pub fn route(&self, key: &BridgeRouteKey) -> Option<BridgeRoute> {
        self.routes.get(key).map(|r| r.value().clone())
    }

    pub fn routes(&self) -> Vec<BridgeRoute> {
        let mut routes: Vec<BridgeRoute> = self.routes.iter().map(|r| r.value().clone()).collect();
        routes.sort_by(|a, b| a.key.cmp(&b.key));
        routes
    }

    /// Whether the object currently exists.
    pub fn contains(&self, object: &DbObjectKey) -> bool {
        match object {
            DbObjectKey::Interface(id) => self.interfaces.contains_key(id),
            DbObjectKey::Vrf(id) => self.vrfs.contains_key(id),
            DbObjectKey::Vn(id) => self.vns.contains_key(id),
            DbObjectKey::HealthCheck(id) => self.health_checks.contains_key(id),
            DbObjectKey::Route(key) => self.routes.contains_key(key),
        }
    }

    /// Deletion generation of a removed object whose state is still held.
    pub fn tombstone(&self, object: &DbObjectKey) -> Option<u64> {
        self.tombstones.get(object).map(|g| *g.value())
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Frees the state held for a deleted object. Fails if the object was
    /// re-added or deleted again since `generation`.
    pub fn release_state(&self, object: &DbObjectKey, generation: u64) -> Result<()> {
        match self.tombstones.remove_if(object, |_, g| *g == generation) {
            Some(_) => Ok(()),
            None => Err(LearningError::StaleGeneration {
                object: object.to_string(),
                requested: generation,
                current: self.tombstone(object),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DbEvent>>);

    impl DbListener for Recorder {
        fn notify(&self, event: DbEvent) {
            self.0.lock().push(event);
        }
    }

    fn db_with_recorder() -> (Arc<OperDb>, Arc<Recorder>) {
        let db = OperDb::new();
        let recorder = Arc::new(Recorder::default());
        db.register_listener(recorder.clone());
        (db, recorder)
    }

    #[test]
    fn test_add_change_delete_events() {
        let (db, recorder) = db_with_recorder();
        db.upsert_vrf(VrfEntry::new(VrfId(1), "vrf1"));
        db.upsert_vrf(VrfEntry::new(VrfId(1), "vrf1"));
        assert!(db.remove_vrf(VrfId(1)));
        assert!(!db.remove_vrf(VrfId(1)));

        let events = recorder.0.lock();
        let changes: Vec<DbChange> = events.iter().map(|e| e.change).collect();
        assert_eq!(changes, vec![DbChange::Add, DbChange::Change, DbChange::Delete]);
        let generations: Vec<u64> = events.iter().map(|e| e.generation).collect();
        assert_eq!(generations, vec![1, 2, 3]);
    }

    #[test]
    fn test_release_state_checks_generation() {
        let (db, recorder) = db_with_recorder();
        db.upsert_interface(InterfaceEntry::new(InterfaceId(1), "tap1", InterfaceKind::VmPort));
        db.remove_interface(InterfaceId(1));
        let generation = recorder.0.lock().last().unwrap().generation;
        let object = DbObjectKey::Interface(InterfaceId(1));

        assert_eq!(db.tombstone(&object), Some(generation));
        assert!(matches!(
            db.release_state(&object, generation - 1),
            Err(LearningError::StaleGeneration { .. })
        ));
        db.release_state(&object, generation).unwrap();
        assert_eq!(db.tombstone(&object), None);
        assert!(db.release_state(&object, generation).is_err());
    }

    #[test]
    fn test_readd_clears_tombstone() {
        let db = OperDb::new();
        db.upsert_vn(VnEntry::new(VnId(3), "vn3"));
        db.remove_vn(VnId(3));
        assert_eq!(db.tombstone_count(), 1);
        db.upsert_vn(VnEntry::new(VnId(3), "vn3"));
        assert_eq!(db.tombstone_count(), 0);
    }

    #[test]
    fn test_route_events_carry_payload_and_vrf() {
        let (db, recorder) = db_with_recorder();
        db.upsert_vrf(VrfEntry::new(VrfId(7), "blue"));
        let key = BridgeRouteKey::new("blue", MacAddress::new([0, 0, 0, 0x11, 0x22, 0x33]), None);
        db.upsert_route(BridgeRoute {
            key: key.clone(),
            vrf_id: VrfId(7),
            origin: RouteOrigin::MacLearning,
            nexthop: NextHop::Tunnel {
                dest: "10.0.0.2".parse().unwrap(),
                label: 5,
            },
            ethernet_tag: 0,
        });
        assert!(db.remove_route(&key));

        let events = recorder.0.lock();
        let last = events.last().unwrap();
        assert_eq!(last.change, DbChange::Delete);
        assert_eq!(last.vrf_id, Some(VrfId(7)));
        assert_eq!(last.route.as_ref().map(|r| r.origin), Some(RouteOrigin::MacLearning));
    }

    #[test]
    fn test_route_withdrawal_keeps_vrf_after_vrf_delete() {
        let (db, recorder) = db_with_recorder();
        db.upsert_vrf(VrfEntry::new(VrfId(7), "blue"));
        let key = BridgeRouteKey::new("blue", MacAddress::new([0, 0, 0, 0x11, 0x22, 0x44]), None);
        db.upsert_route(BridgeRoute {
            key: key.clone(),
            vrf_id: VrfId(7),
            origin: RouteOrigin::MacLearning,
            nexthop: NextHop::Tunnel {
                dest: "10.0.0.3".parse().unwrap(),
                label: 6,
            },
            ethernet_tag: 0,
        });
        assert!(db.remove_vrf(VrfId(7)));
        assert!(db.remove_route(&key));
        assert!(!db.remove_route(&key));

        let events = recorder.0.lock();
        let last = events.last().unwrap();
        assert_eq!(last.object, DbObjectKey::Route(key));
        assert_eq!(last.vrf_id, Some(VrfId(7)));
    }

    #[test]
    fn test_vn_gateway_lookup() {
        let mut vn = VnEntry::new(VnId(1), "vn1");
        vn.subnets.push(VnSubnet {
            prefix: "1.1.1.0/24".parse().unwrap(),
            gateway: "1.1.1.254".parse().unwrap(),
        });
        assert_eq!(vn.gateway_for("1.1.1.3".parse().unwrap()), Some("1.1.1.254".parse().unwrap()));
        assert_eq!(vn.gateway_for("2.2.2.2".parse().unwrap()), None);
    }
}
