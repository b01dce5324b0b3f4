//! IP-keyed learning: one MAC binding per (VRF, IP), with liveness probing.
//!
//! Learning a different MAC for a bound IP supersedes the old entry, whether
//! the new MAC was seen locally or announced by a remote EVPN route. When the
//! owning VN has a health-check service that monitors the IP, a probe is kept
//! running against the bound MAC; an unreachable report removes the entry if
//! the binding has not moved on in the meantime.
//!
//! Admission follows the partitions: traps arrive on an add queue gated by
//! the shared add pool, and an entry holds its tokens until the route it
//! programmed is acknowledged. A deleted entry lingers until its withdrawal
//! is acknowledged. Bindings age on the packet counter of the bound MAC.

use crate::aging::{AgingPartition, MIN_ITERATION_TIMEOUT};
use crate::context::{AgentContext, HostRoute, LocalRoute, ProbeHandle, ProbeRequest};
use crate::entry::{Dependencies, EntryId, LearningEntryOps};
use crate::error::{LearningError, Result};
use crate::key::MacIpKey;
use crate::mgmt::{EntryRef, MgmtRequest};
use crate::oper_db::{BridgeRouteKey, DbObjectKey, VnEntry};
use crate::packet::PacketTrap;
use crate::partition::{gate_open, next_tick, GATE_RECHECK_INTERVAL};
use crate::queue::{LearningSenders, MacIpReceiver, QueueKind};
use crate::snapshot::{MacIpEntrySnapshot, MacIpStats, SnapshotPage, SnapshotQuery};
use crate::token::{Token, TokenPool, TokenPools};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use vrouter_types::{HealthCheckId, InterfaceId, IpPrefix, MacAddress, VrfId};

/// Mac-IP entry ids live above every partition's id space.
const ENTRY_ID_BASE: u64 = 0xffff << 48;

#[derive(Debug)]
pub enum MacIpRequest {
    Trap(PacketTrap),
    Resync(MacIpKey),
    /// Delete the binding at `key`; with `id`, only that instance.
    Delete {
        key: MacIpKey,
        id: Option<EntryId>,
    },
    /// The bridge route programmed for `key` was acknowledged.
    ReleaseToken(MacIpKey),
    /// The liveness probe for `ip` found `mac` unreachable.
    Unreachable {
        vrf_id: VrfId,
        ip: IpAddr,
        mac: MacAddress,
    },
    /// A remote route now binds `ip` to `mac`.
    RemoteRoute {
        vrf_id: VrfId,
        ip: IpAddr,
        mac: MacAddress,
    },
    Snapshot {
        query: SnapshotQuery<MacIpKey>,
        reply: oneshot::Sender<SnapshotPage<MacIpEntrySnapshot, MacIpKey>>,
    },
    Stats(oneshot::Sender<MacIpStats>),
}

impl MacIpRequest {
    /// Only traps are gated; everything else is served at once.
    pub fn queue(&self) -> QueueKind {
        match self {
            MacIpRequest::Trap(_) => QueueKind::Add,
            _ => QueueKind::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveProbe {
    service: HealthCheckId,
    gateway: IpAddr,
    handle: ProbeHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InstalledRoutes {
    route: BridgeRouteKey,
    vrf_name: String,
    host: IpPrefix,
}

/// A MAC bound to an IP on a local interface.
#[derive(Debug)]
pub struct MacIpLearningEntry {
    id: EntryId,
    key: MacIpKey,
    mac: MacAddress,
    interface: InterfaceId,
    ethernet_tag: u32,
    deleted: bool,
    installed: Option<InstalledRoutes>,
    probe: Option<ActiveProbe>,
    tokens: Vec<Token>,
}

impl MacIpLearningEntry {
    pub fn new(key: MacIpKey, mac: MacAddress, interface: InterfaceId) -> Self {
        Self {
            id: EntryId(ENTRY_ID_BASE),
            key,
            mac,
            interface,
            ethernet_tag: 0,
            deleted: false,
            installed: None,
            probe: None,
            tokens: Vec::new(),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn key(&self) -> &MacIpKey {
        &self.key
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn interface(&self) -> InterfaceId {
        self.interface
    }

    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn probe_service(&self) -> Option<HealthCheckId> {
        self.probe.as_ref().map(|p| p.service)
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    fn add_with_token(&mut self, pool: &Arc<TokenPool>) -> bool {
        match pool.acquire() {
            Some(token) => {
                self.tokens.push(token);
                true
            }
            None => false,
        }
    }

    fn release_tokens(&mut self) -> usize {
        let released = self.tokens.len();
        self.tokens.clear();
        released
    }

    fn stop_probe(&mut self, ctx: &AgentContext) {
        if let Some(probe) = self.probe.take() {
            ctx.health_check.stop_probe(probe.handle);
        }
    }

    /// Keeps the running probe in line with the VN's health-check service.
    fn update_health_check_service(&mut self, ctx: &AgentContext, vn: &VnEntry) {
        let ip = self.key.ip;
        let wanted = vn
            .health_check
            .and_then(|id| ctx.oper_db.health_check(id))
            .filter(|service| service.monitors(ip))
            .map(|service| service.id)
            .zip(vn.gateway_for(ip));

        let current = self.probe.as_ref().map(|p| (p.service, p.gateway));
        if current == wanted {
            return;
        }
        self.stop_probe(ctx);
        if let Some((service, gateway)) = wanted {
            let handle = ctx.health_check.start_probe(ProbeRequest {
                service,
                vrf_id: self.key.vrf_id,
                interface: self.interface,
                ip,
                gateway,
                mac: self.mac,
            });
            debug!(key = %self.key, %service, %handle, "Started liveness probe");
            self.probe = Some(ActiveProbe {
                service,
                gateway,
                handle,
            });
        }
    }

    pub fn snapshot(&self) -> MacIpEntrySnapshot {
        MacIpEntrySnapshot {
            key: self.key,
            mac: self.mac,
            interface: self.interface,
            installed: self.is_installed(),
            deleted: self.deleted,
            probing: self.probe.is_some(),
            gateway: self.probe.as_ref().map(|p| p.gateway),
        }
    }
}

impl LearningEntryOps for MacIpLearningEntry {
    fn add(&mut self, ctx: &AgentContext) -> bool {
        let Some(vrf) = ctx.oper_db.vrf(self.key.vrf_id).filter(|v| v.active) else {
            return false;
        };
        let Some(intf) = ctx.oper_db.interface(self.interface) else {
            return false;
        };
        let Some(vn) = intf.vn.and_then(|id| ctx.oper_db.vn(id)) else {
            return false;
        };

        let host = IpPrefix::host(self.key.ip);
        let route = LocalRoute {
            vrf_id: vrf.id,
            vrf_name: vrf.name.clone(),
            mac: self.mac,
            ip: Some(self.key.ip),
            interface: self.interface,
            label: intf.label,
            sg_list: intf.sg_list.clone(),
            ethernet_tag: self.ethernet_tag,
        };
        let installed = InstalledRoutes {
            route: route.key(),
            vrf_name: vrf.name.clone(),
            host,
        };
        if let Some(old) = self.installed.take() {
            if old.vrf_name != installed.vrf_name {
                ctx.forwarding.delete_route(old.route);
                ctx.forwarding.delete_host_route(&old.vrf_name, old.host);
            }
        }

        ctx.forwarding.add_local_route(route);
        ctx.forwarding.add_host_route(HostRoute {
            vrf_id: vrf.id,
            vrf_name: vrf.name.clone(),
            prefix: host,
            mac: self.mac,
            interface: self.interface,
            label: intf.label,
        });
        self.installed = Some(installed);
        self.update_health_check_service(ctx, &vn);
        true
    }

    fn delete(&mut self, ctx: &AgentContext) -> bool {
        self.stop_probe(ctx);
        let Some(installed) = self.installed.take() else {
            return false;
        };
        let acked = ctx
            .oper_db
            .contains(&DbObjectKey::Route(installed.route.clone()));
        ctx.forwarding.delete_route(installed.route);
        ctx.forwarding
            .delete_host_route(&installed.vrf_name, installed.host);
        acked
    }

    fn dependencies(&self, ctx: &AgentContext) -> Dependencies {
        let vn = ctx
            .oper_db
            .interface(self.interface)
            .and_then(|intf| intf.vn);
        let health_check = vn
            .and_then(|id| ctx.oper_db.vn(id))
            .and_then(|vn| vn.health_check);
        Dependencies {
            interface: Some(self.interface),
            vrf: Some(self.key.vrf_id),
            vn,
            health_check,
            route: None,
        }
    }
}

/// The Mac-IP table. Only its own worker touches it.
pub struct MacIpLearningTable {
    ctx: AgentContext,
    pools: TokenPools,
    senders: LearningSenders,
    entries: BTreeMap<MacIpKey, MacIpLearningEntry>,
    aging: AgingPartition<MacIpKey>,
    next_id: u64,
    stats: MacIpStats,
}

impl MacIpLearningTable {
    pub fn new(ctx: AgentContext, pools: TokenPools, senders: LearningSenders) -> Self {
        Self {
            ctx,
            pools,
            senders,
            entries: BTreeMap::new(),
            aging: AgingPartition::new(),
            next_id: 0,
            stats: MacIpStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, key: &MacIpKey) -> Option<&MacIpLearningEntry> {
        self.entries.get(key)
    }

    pub fn aging(&self) -> &AgingPartition<MacIpKey> {
        &self.aging
    }

    fn allocate_id(&mut self) -> EntryId {
        self.next_id += 1;
        EntryId(ENTRY_ID_BASE | self.next_id)
    }

    fn notify_mgmt(&self, request: MgmtRequest) {
        if let Err(e) = self.senders.send_mgmt(request) {
            warn!(error = %e, "Dropping tracker notification");
        }
    }

    pub fn handle(&mut self, request: MacIpRequest, now: Instant) {
        match request {
            MacIpRequest::Trap(trap) => self.learn(trap, now),
            MacIpRequest::Resync(key) => self.resync(&key),
            MacIpRequest::Delete { key, id } => {
                let stale = id.is_some_and(|id| {
                    self.entries.get(&key).is_some_and(|e| e.id != id)
                });
                if !stale {
                    self.delete(&key);
                }
            }
            MacIpRequest::ReleaseToken(key) => self.release_token(&key),
            MacIpRequest::Unreachable { vrf_id, ip, mac } => {
                self.mac_ip_entry_unreachable(vrf_id, ip, mac)
            }
            MacIpRequest::RemoteRoute { vrf_id, ip, mac } => self.detect_ip_move(vrf_id, ip, mac),
            MacIpRequest::Snapshot { query, reply } => {
                let _ = reply.send(self.snapshot(&query));
            }
            MacIpRequest::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn learn(&mut self, trap: PacketTrap, now: Instant) {
        let Some(ip) = trap.src_ip else {
            debug!(mac = %trap.smac, "Trap without source IP");
            return;
        };
        let key = MacIpKey::new(trap.vrf_id, ip);
        let mut entry = MacIpLearningEntry::new(key, trap.smac, trap.interface);
        entry.id = self.allocate_id();
        entry.ethernet_tag = trap.ethernet_tag;
        self.add(entry, now);
    }

    /// Installs `entry`. A different binding for the same IP is deleted
    /// first; the same binding is refreshed in place.
    pub fn add(&mut self, mut entry: MacIpLearningEntry, now: Instant) {
        let key = entry.key;
        if let Some(existing) = self.entries.get(&key).filter(|e| !e.deleted) {
            if existing.mac == entry.mac && existing.interface == entry.interface {
                self.resync(&key);
                return;
            }
            info!(%key, old_mac = %existing.mac, new_mac = %entry.mac, "IP moved to a new MAC");
            self.stats.moves += 1;
            self.delete(&key);
        }
        // A superseded binding still waiting for its withdrawal hands over
        // its tokens.
        if let Some(mut old) = self.entries.remove(&key) {
            entry.tokens.append(&mut old.tokens);
        }

        if entry.add(&self.ctx) {
            self.stats.learned += 1;
            entry.add_with_token(&self.pools.add);
            debug!(%key, mac = %entry.mac, "Learned IP binding");
        }
        self.notify_mgmt(MgmtRequest::AddEntry {
            entry: EntryRef::MacIp(key),
            id: Some(entry.id),
            deps: entry.dependencies(&self.ctx),
        });
        let packets = self
            .ctx
            .counters
            .packets(key.vrf_id, entry.mac)
            .unwrap_or(0);
        self.aging.add(key, entry.mac, entry.id, packets, now);
        self.entries.insert(key, entry);
    }

    /// Withdraws the binding. Like a learned MAC, the entry lingers with its
    /// tokens until the withdrawal is acknowledged.
    pub fn delete(&mut self, key: &MacIpKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if entry.deleted {
            return;
        }
        entry.deleted = true;
        if entry.delete(&self.ctx) {
            entry.add_with_token(&self.pools.delete);
        } else {
            self.stats.tokens_released += entry.release_tokens() as u64;
        }
        let drained = entry.tokens.is_empty();
        let mac = entry.mac;
        self.stats.deleted += 1;
        self.aging.delete(key);
        if drained {
            self.entries.remove(key);
        }
        self.notify_mgmt(MgmtRequest::DeleteEntry {
            entry: EntryRef::MacIp(*key),
        });
        debug!(%key, %mac, "Deleted IP binding");
    }

    pub fn resync(&mut self, key: &MacIpKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if entry.deleted {
            return;
        }
        if entry.resync(&self.ctx) {
            entry.add_with_token(&self.pools.resync);
        }
        let deps = entry.dependencies(&self.ctx);
        let id = entry.id;
        self.notify_mgmt(MgmtRequest::AddEntry {
            entry: EntryRef::MacIp(*key),
            id: Some(id),
            deps,
        });
    }

    pub fn release_token(&mut self, key: &MacIpKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        self.stats.tokens_released += entry.release_tokens() as u64;
        if entry.deleted {
            self.entries.remove(key);
        }
    }

    /// Deletes the binding only if it still points at `mac`.
    pub fn mac_ip_entry_unreachable(&mut self, vrf_id: VrfId, ip: IpAddr, mac: MacAddress) {
        let key = MacIpKey::new(vrf_id, ip);
        match self.entries.get(&key).filter(|e| !e.deleted) {
            Some(entry) if entry.mac == mac => {
                info!(%key, %mac, "IP binding unreachable");
                self.stats.unreachable += 1;
                self.delete(&key);
            }
            Some(entry) => {
                debug!(
                    %key,
                    %mac,
                    current = %entry.mac,
                    "Ignoring unreachable for superseded binding"
                )
            }
            None => {}
        }
    }

    /// A remote route for `ip` with a different MAC means the IP left this
    /// node.
    pub fn detect_ip_move(&mut self, vrf_id: VrfId, ip: IpAddr, mac: MacAddress) {
        let key = MacIpKey::new(vrf_id, ip);
        let moved = self
            .entries
            .get(&key)
            .is_some_and(|e| !e.deleted && e.mac != mac);
        if moved {
            info!(%key, remote_mac = %mac, "IP moved to a remote MAC");
            self.stats.moves += 1;
            self.delete(&key);
        }
    }

    pub fn snapshot(
        &self,
        query: &SnapshotQuery<MacIpKey>,
    ) -> SnapshotPage<MacIpEntrySnapshot, MacIpKey> {
        let entries = self
            .entries
            .iter()
            .filter(|(key, _)| query.matches(key.vrf_id, key))
            .take(query.limit.saturating_add(1))
            .map(|(_, entry)| entry.snapshot())
            .collect();
        SnapshotPage::from_sorted(entries, query.limit, |e| e.key)
    }

    pub fn stats(&self) -> MacIpStats {
        MacIpStats {
            entries: self.entries.len(),
            aging_entries: self.aging.len(),
            ..self.stats.clone()
        }
    }

    /// One aging tick: idle bindings are posted to the table's own delete
    /// queue.
    pub fn run_aging(&mut self, now: Instant) {
        let aged = self
            .aging
            .run(&self.ctx.oper_db, self.ctx.counters.as_ref(), now);
        for (key, id) in aged {
            self.stats.aged += 1;
            debug!(%key, "Aged out IP binding");
            let request = MacIpRequest::Delete { key, id: Some(id) };
            if let Err(e) = self.senders.send_mac_ip(request) {
                warn!(error = %e, "Dropping aged delete");
            }
        }
    }
}

/// Entry point for the liveness-probe engine.
#[derive(Debug, Clone)]
pub struct MacIpLearningHandle {
    senders: LearningSenders,
}

impl MacIpLearningHandle {
    pub fn new(senders: LearningSenders) -> Self {
        Self { senders }
    }

    pub fn entry_unreachable(&self, vrf_id: VrfId, ip: IpAddr, mac: MacAddress) -> Result<()> {
        self.senders
            .send_mac_ip(MacIpRequest::Unreachable { vrf_id, ip, mac })
    }

    pub async fn snapshot(
        &self,
        query: SnapshotQuery<MacIpKey>,
    ) -> Result<SnapshotPage<MacIpEntrySnapshot, MacIpKey>> {
        let (reply, rx) = oneshot::channel();
        self.senders
            .send_mac_ip(MacIpRequest::Snapshot { query, reply })?;
        rx.await.map_err(|_| LearningError::ChannelClosed("mac-ip"))
    }
}

/// Runs the [`MacIpLearningTable`] until cancelled.
pub struct MacIpWorker {
    table: MacIpLearningTable,
    rx: MacIpReceiver,
    cancel: CancellationToken,
}

impl MacIpWorker {
    pub fn new(table: MacIpLearningTable, rx: MacIpReceiver, cancel: CancellationToken) -> Self {
        Self { table, rx, cancel }
    }

    #[instrument(name = "mac_ip", skip_all)]
    pub async fn run(mut self) {
        info!("Mac-IP learning table started");
        let pool = Arc::clone(&self.table.pools.add);
        let mut aging_tick: Option<Interval> = None;

        loop {
            let add_notified = pool.wakeup().notified();
            tokio::pin!(add_notified);
            add_notified.as_mut().enable();
            let add_open = gate_open(&pool, &self.rx.add);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(request) = self.rx.delete.recv() => {
                    self.table.handle(request, Instant::now());
                }
                Some(request) = self.rx.add.recv(), if add_open => {
                    self.table.handle(request, Instant::now());
                }
                _ = &mut add_notified, if !add_open => {
                    debug!("Add tokens available again");
                }
                _ = tokio::time::sleep(GATE_RECHECK_INTERVAL), if !add_open => {}
                now = next_tick(&mut aging_tick) => {
                    self.table.run_aging(now);
                }
            }

            if aging_tick.is_none() && self.table.aging.is_started() {
                let mut interval = tokio::time::interval(MIN_ITERATION_TIMEOUT);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                aging_tick = Some(interval);
            }
        }
        info!("Mac-IP learning table stopped");
    }
}
