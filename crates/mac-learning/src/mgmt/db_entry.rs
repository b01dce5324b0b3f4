use crate::mgmt::EntryRef;
use crate::oper_db::BridgeRouteKey;
use std::collections::{BTreeMap, BTreeSet};
use vrouter_types::VrfId;

/// Kind-specific state of a tracked object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtDbKind {
    Interface,
    Vn,
    HealthCheck,
    /// Tracked routes in this VRF; the VRF outlives them.
    Vrf { routes: BTreeSet<BridgeRouteKey> },
    Route { vrf: Option<VrfId> },
}

/// A tracked external object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MgmtDbEntry {
    kind: MgmtDbKind,
    dependents: BTreeSet<EntryRef>,
    present: bool,
    deleted: bool,
    delete_generation: Option<u64>,
}

impl MgmtDbEntry {
    pub fn new(kind: MgmtDbKind, present: bool) -> Self {
        Self {
            kind,
            dependents: BTreeSet::new(),
            present,
            deleted: false,
            delete_generation: None,
        }
    }

    pub fn kind(&self) -> &MgmtDbKind {
        &self.kind
    }

    pub fn dependents(&self) -> &BTreeSet<EntryRef> {
        &self.dependents
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn delete_generation(&self) -> Option<u64> {
        self.delete_generation
    }

    pub fn add_dependent(&mut self, entry: EntryRef) -> bool {
        self.dependents.insert(entry)
    }

    pub fn remove_dependent(&mut self, entry: &EntryRef) -> bool {
        self.dependents.remove(entry)
    }

    /// The object was (re)added in the database.
    pub fn mark_present(&mut self) {
        self.present = true;
        self.deleted = false;
        self.delete_generation = None;
    }

    /// The object was deleted at `generation`.
    pub fn mark_deleted(&mut self, generation: u64) {
        self.present = false;
        self.deleted = true;
        self.delete_generation = Some(generation);
    }

    pub fn add_route(&mut self, route: BridgeRouteKey) {
        if let MgmtDbKind::Vrf { routes } = &mut self.kind {
            routes.insert(route);
        }
    }

    pub fn remove_route(&mut self, route: &BridgeRouteKey) {
        if let MgmtDbKind::Vrf { routes } = &mut self.kind {
            routes.remove(route);
        }
    }

    /// Nothing references this object any more.
    pub fn is_unused(&self) -> bool {
        self.dependents.is_empty()
            && match &self.kind {
                MgmtDbKind::Vrf { routes } => routes.is_empty(),
                _ => true,
            }
    }

    /// Unused, and the database object is gone.
    pub fn can_free(&self) -> bool {
        self.is_unused() && (self.deleted || !self.present)
    }
}

/// Tracked objects of one kind.
#[derive(Debug, Clone)]
pub struct MgmtTree<K: Ord> {
    entries: BTreeMap<K, MgmtDbEntry>,
}

impl<K: Ord> Default for MgmtTree<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord> MgmtTree<K> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, key: &K) -> Option<&MgmtDbEntry> {
        self.entries.get(key)
    }

    pub fn find_mut(&mut self, key: &K) -> Option<&mut MgmtDbEntry> {
        self.entries.get_mut(key)
    }

    pub fn locate(&mut self, key: K, make: impl FnOnce() -> MgmtDbEntry) -> &mut MgmtDbEntry {
        self.entries.entry(key).or_insert_with(make)
    }

    pub fn remove(&mut self, key: &K) -> Option<MgmtDbEntry> {
        self.entries.remove(key)
    }
}
