//! The dependency tracker and the plumbing that feeds it.
//!
//! [`MgmtListener`] turns database notifications into tracker requests.
//! [`MgmtTracker`] keeps one [`MgmtTree`] per object kind plus the reverse
//! map from each learned entry to the objects it depends on, and fans
//! database changes out to the owning partition or the Mac-IP table.
//! [`MgmtWorker`] drives the tracker from its ungated queue.

use crate::context::AgentContext;
use crate::entry::{Dependencies, EntryId};
use crate::key::{LearningKey, MacIpKey};
use crate::mac_ip::MacIpRequest;
use crate::mgmt::{EntryRef, MgmtDbEntry, MgmtDbKind, MgmtRequest, MgmtTree};
use crate::oper_db::{BridgeRouteKey, DbChange, DbEvent, DbListener, DbObjectKey, RouteOrigin};
use crate::partition::PartitionRequest;
use crate::queue::LearningSenders;
use crate::snapshot::MgmtStats;
use std::collections::BTreeMap;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use vrouter_types::{HealthCheckId, InterfaceId, VnId, VrfId};

/// Forwards database notifications into the tracker's queue.
pub struct MgmtListener {
    senders: LearningSenders,
}

impl MgmtListener {
    pub fn new(senders: LearningSenders) -> Self {
        Self { senders }
    }
}

impl DbListener for MgmtListener {
    fn notify(&self, event: DbEvent) {
        if let Err(e) = self.senders.send_mgmt(MgmtRequest::Db(event)) {
            debug!(error = %e, "Tracker gone, dropping database event");
        }
    }
}

/// What the tracker knows about one learned entry.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedNode {
    /// Instance the dependencies were reported for.
    id: Option<EntryId>,
    deps: Vec<DbObjectKey>,
}

/// The global dependency graph. Only the tracker worker mutates it.
pub struct MgmtTracker {
    ctx: AgentContext,
    senders: LearningSenders,
    interfaces: MgmtTree<InterfaceId>,
    vrfs: MgmtTree<VrfId>,
    vns: MgmtTree<VnId>,
    health_checks: MgmtTree<HealthCheckId>,
    routes: MgmtTree<BridgeRouteKey>,
    /// Current dependencies of every tracked entry.
    nodes: BTreeMap<EntryRef, TrackedNode>,
    freed: u64,
}

impl MgmtTracker {
    pub fn new(ctx: AgentContext, senders: LearningSenders) -> Self {
        Self {
            ctx,
            senders,
            interfaces: MgmtTree::default(),
            vrfs: MgmtTree::default(),
            vns: MgmtTree::default(),
            health_checks: MgmtTree::default(),
            routes: MgmtTree::default(),
            nodes: BTreeMap::new(),
            freed: 0,
        }
    }

    pub fn find(&self, key: &DbObjectKey) -> Option<&MgmtDbEntry> {
        match key {
            DbObjectKey::Interface(id) => self.interfaces.find(id),
            DbObjectKey::Vrf(id) => self.vrfs.find(id),
            DbObjectKey::Vn(id) => self.vns.find(id),
            DbObjectKey::HealthCheck(id) => self.health_checks.find(id),
            DbObjectKey::Route(key) => self.routes.find(key),
        }
    }

    fn find_mut(&mut self, key: &DbObjectKey) -> Option<&mut MgmtDbEntry> {
        match key {
            DbObjectKey::Interface(id) => self.interfaces.find_mut(id),
            DbObjectKey::Vrf(id) => self.vrfs.find_mut(id),
            DbObjectKey::Vn(id) => self.vns.find_mut(id),
            DbObjectKey::HealthCheck(id) => self.health_checks.find_mut(id),
            DbObjectKey::Route(key) => self.routes.find_mut(key),
        }
    }

    fn remove(&mut self, key: &DbObjectKey) -> Option<MgmtDbEntry> {
        match key {
            DbObjectKey::Interface(id) => self.interfaces.remove(id),
            DbObjectKey::Vrf(id) => self.vrfs.remove(id),
            DbObjectKey::Vn(id) => self.vns.remove(id),
            DbObjectKey::HealthCheck(id) => self.health_checks.remove(id),
            DbObjectKey::Route(key) => self.routes.remove(key),
        }
    }

    /// Finds the tracked object for `key`, creating it if needed. A new
    /// object starts present or deleted according to the database. A route
    /// is linked under its VRF when the VRF name resolves, so the VRF is not
    /// freed while the route is still referenced.
    pub fn locate(&mut self, key: &DbObjectKey) -> &mut MgmtDbEntry {
        let present = self.ctx.oper_db.contains(key);
        match key {
            DbObjectKey::Interface(id) => self
                .interfaces
                .locate(*id, || MgmtDbEntry::new(MgmtDbKind::Interface, present)),
            DbObjectKey::Vrf(id) => self.vrfs.locate(*id, || {
                MgmtDbEntry::new(
                    MgmtDbKind::Vrf {
                        routes: Default::default(),
                    },
                    present,
                )
            }),
            DbObjectKey::Vn(id) => self
                .vns
                .locate(*id, || MgmtDbEntry::new(MgmtDbKind::Vn, present)),
            DbObjectKey::HealthCheck(id) => self
                .health_checks
                .locate(*id, || MgmtDbEntry::new(MgmtDbKind::HealthCheck, present)),
            DbObjectKey::Route(route) => {
                if self.routes.find(route).is_none() {
                    let vrf = self.ctx.oper_db.vrf_by_name(&route.vrf_name).map(|v| v.id);
                    if let Some(vrf_id) = vrf {
                        self.locate(&DbObjectKey::Vrf(vrf_id)).add_route(route.clone());
                    }
                    self.routes.locate(route.clone(), || {
                        MgmtDbEntry::new(MgmtDbKind::Route { vrf }, present)
                    });
                }
                self.routes.locate(route.clone(), || {
                    MgmtDbEntry::new(MgmtDbKind::Route { vrf: None }, present)
                })
            }
        }
    }

    pub fn tracked_entries(&self) -> usize {
        self.nodes.len()
    }

    /// Objects `entry` currently depends on, if it is tracked.
    pub fn dependencies_of(&self, entry: &EntryRef) -> Option<&[DbObjectKey]> {
        self.nodes.get(entry).map(|node| node.deps.as_slice())
    }

    /// Instance id `entry` was last reported with.
    pub fn tracked_id(&self, entry: &EntryRef) -> Option<EntryId> {
        self.nodes.get(entry).and_then(|node| node.id)
    }

    pub fn stats(&self) -> MgmtStats {
        MgmtStats {
            interfaces: self.interfaces.len(),
            vrfs: self.vrfs.len(),
            vns: self.vns.len(),
            health_checks: self.health_checks.len(),
            routes: self.routes.len(),
            tracked_entries: self.nodes.len(),
            freed: self.freed,
        }
    }

    /// Applies one queued request.
    pub fn handle(&mut self, request: MgmtRequest) {
        match request {
            MgmtRequest::Db(event) => self.handle_db_event(event),
            MgmtRequest::AddEntry { entry, id, deps } => self.update_ref(entry, id, &deps),
            MgmtRequest::DeleteEntry { entry } => self.release_node(&entry),
            MgmtRequest::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn send_resync(&self, entry: EntryRef) {
        let result = match entry {
            EntryRef::Mac(key) => self
                .senders
                .send_for_key(&key, PartitionRequest::Resync(key)),
            EntryRef::MacIp(key) => self.senders.send_mac_ip(MacIpRequest::Resync(key)),
        };
        if let Err(e) = result {
            warn!(%entry, error = %e, "Dropping resync");
        }
    }

    fn send_delete(&self, entry: EntryRef, id: Option<EntryId>) {
        let result = match entry {
            EntryRef::Mac(key) => self
                .senders
                .send_for_key(&key, PartitionRequest::Delete { key, id }),
            EntryRef::MacIp(key) => self.senders.send_mac_ip(MacIpRequest::Delete { key, id }),
        };
        if let Err(e) = result {
            warn!(%entry, error = %e, "Dropping delete");
        }
    }

    fn send_free(&self, object: DbObjectKey, generation: u64) {
        if let Err(e) = self
            .senders
            .send_to_partition(0, PartitionRequest::FreeDbState { object, generation })
        {
            warn!(error = %e, "Dropping state release");
        }
    }

    /// Re-points `entry` at its current dependencies. Objects it no longer
    /// uses are released; if a hard dependency is already gone the entry
    /// instance `id` is deleted.
    pub fn update_ref(&mut self, entry: EntryRef, id: Option<EntryId>, deps: &Dependencies) {
        let new_keys = deps.keys();
        let old_keys = self
            .nodes
            .remove(&entry)
            .map(|node| node.deps)
            .unwrap_or_default();

        for key in old_keys.iter().filter(|k| !new_keys.contains(k)) {
            if let Some(db_entry) = self.find_mut(key) {
                db_entry.remove_dependent(&entry);
            }
            self.try_delete(key);
        }

        let mut gone = false;
        for key in &new_keys {
            let present = self.ctx.oper_db.contains(key);
            let db_entry = self.locate(key);
            db_entry.add_dependent(entry);
            if Dependencies::is_hard(key) && (db_entry.is_deleted() || !present) {
                gone = true;
            }
        }

        if !new_keys.is_empty() {
            self.nodes.insert(
                entry,
                TrackedNode {
                    id,
                    deps: new_keys,
                },
            );
        }
        if gone {
            debug!(%entry, "Dependency already gone, deleting entry");
            self.send_delete(entry, id);
        }
    }

    /// Drops every reference held by a deleted entry and frees the objects
    /// that were only kept for it.
    pub fn release_node(&mut self, entry: &EntryRef) {
        let Some(node) = self.nodes.remove(entry) else {
            return;
        };
        for key in &node.deps {
            if let Some(db_entry) = self.find_mut(key) {
                db_entry.remove_dependent(entry);
            }
            self.try_delete(key);
        }
    }

    /// Frees a tracked object once nothing uses it and it is gone from the
    /// database. A freed route may in turn free its VRF.
    pub fn try_delete(&mut self, key: &DbObjectKey) {
        if !self.find(key).is_some_and(MgmtDbEntry::can_free) {
            return;
        }
        let Some(db_entry) = self.remove(key) else {
            return;
        };
        self.freed += 1;
        debug!(object = %key, "Released tracked object");
        if let Some(generation) = db_entry.delete_generation() {
            self.send_free(key.clone(), generation);
        }
        if let (DbObjectKey::Route(route), MgmtDbKind::Route { vrf: Some(vrf_id) }) =
            (key, db_entry.kind())
        {
            let vrf_key = DbObjectKey::Vrf(*vrf_id);
            if let Some(vrf) = self.find_mut(&vrf_key) {
                vrf.remove_route(route);
            }
            self.try_delete(&vrf_key);
        }
    }

    fn handle_route_payload(&self, event: &DbEvent) {
        let (Some(route), Some(vrf_id)) = (&event.route, event.vrf_id) else {
            return;
        };
        match (route.origin, route.key.ip) {
            (RouteOrigin::MacLearning, None) => {
                let key = LearningKey::new(vrf_id, route.key.mac);
                if let Err(e) = self
                    .senders
                    .send_for_key(&key, PartitionRequest::ReleaseToken(key))
                {
                    warn!(%key, error = %e, "Dropping token release");
                }
            }
            (RouteOrigin::MacLearning, Some(ip)) => {
                let key = MacIpKey::new(vrf_id, ip);
                if let Err(e) = self.senders.send_mac_ip(MacIpRequest::ReleaseToken(key)) {
                    warn!(%key, error = %e, "Dropping token release");
                }
            }
            (RouteOrigin::Evpn, Some(ip)) if event.change != DbChange::Delete => {
                let request = MacIpRequest::RemoteRoute {
                    vrf_id,
                    ip,
                    mac: route.key.mac,
                };
                if let Err(e) = self.senders.send_mac_ip(request) {
                    warn!(error = %e, "Dropping remote route notification");
                }
            }
            _ => {}
        }
    }

    /// Applies a database notification. A route payload is first routed to
    /// its learner; then changes resync the object's dependents and deletes
    /// delete them, each with the instance id it was tracked under.
    pub fn handle_db_event(&mut self, event: DbEvent) {
        self.handle_route_payload(&event);

        match event.change {
            DbChange::Add | DbChange::Change => {
                let Some(db_entry) = self.find_mut(&event.object) else {
                    return;
                };
                db_entry.mark_present();
                let dependents: Vec<EntryRef> = db_entry.dependents().iter().copied().collect();
                for entry in dependents {
                    self.send_resync(entry);
                }
            }
            DbChange::Delete => {
                if let DbObjectKey::Vrf(vrf_id) = event.object {
                    info!(%vrf_id, "VRF deleted");
                    if let Err(e) = self
                        .senders
                        .broadcast(|| PartitionRequest::VrfDelete(vrf_id))
                    {
                        warn!(%vrf_id, error = %e, "Dropping VRF delete");
                    }
                }
                let Some(db_entry) = self.find_mut(&event.object) else {
                    // Nothing tracked it; release right away.
                    self.send_free(event.object, event.generation);
                    return;
                };
                db_entry.mark_deleted(event.generation);
                let dependents: Vec<EntryRef> = db_entry.dependents().iter().copied().collect();
                for entry in dependents {
                    self.send_delete(entry, self.tracked_id(&entry));
                }
                self.try_delete(&event.object);
            }
        }
    }
}

/// Runs the [`MgmtTracker`] until cancelled. Its queue is never gated.
pub struct MgmtWorker {
    tracker: MgmtTracker,
    rx: UnboundedReceiver<MgmtRequest>,
    cancel: CancellationToken,
}

impl MgmtWorker {
    pub fn new(
        tracker: MgmtTracker,
        rx: UnboundedReceiver<MgmtRequest>,
        cancel: CancellationToken,
    ) -> Self {
        Self { tracker, rx, cancel }
    }

    #[instrument(name = "mgmt", skip_all)]
    pub async fn run(mut self) {
        info!("Dependency tracker started");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                request = self.rx.recv() => match request {
                    Some(request) => self.tracker.handle(request),
                    None => break,
                },
            }
        }
        info!("Dependency tracker stopped");
    }
}
