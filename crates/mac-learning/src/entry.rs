//! Learned bridge entries and the lifecycle contract they share.
//!
//! A [`LearningEntry`] is one of three variants:
//!
//! - `Local`: learned on a VM port, programmed with the port's label and
//!   security groups. Requires an active VRF and a port bound to a VN.
//! - `Remote`: learned from an overlay tunnel, programmed with the tunnel
//!   next-hop. Requires only that the VRF exists.
//! - `Pbb`: learned from a backbone tunnel, programmed in the service VRF
//!   with a next-hop through the backbone VRF. Requires a PBB association.
//!
//! The Mac-IP variant lives in [`crate::mac_ip`] and implements the same
//! [`LearningEntryOps`] contract.

use crate::context::{AgentContext, LocalRoute, RemoteRoute};
use crate::error::{LearningError, Result};
use crate::key::LearningKey;
use crate::oper_db::{BridgeRouteKey, DbObjectKey, InterfaceKind, NextHop};
use crate::packet::PacketTrap;
use crate::token::{Token, TokenPool};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use vrouter_types::{HealthCheckId, InterfaceId, MacAddress, VnId, VrfId};

/// Unique id of one entry instance; a relearn of the same key gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry-{}", self.0)
    }
}

/// External objects an entry currently depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    pub interface: Option<InterfaceId>,
    pub vrf: Option<VrfId>,
    pub vn: Option<VnId>,
    pub health_check: Option<HealthCheckId>,
    pub route: Option<BridgeRouteKey>,
}

impl Dependencies {
    pub fn keys(&self) -> Vec<DbObjectKey> {
        let mut keys = Vec::with_capacity(5);
        keys.extend(self.interface.map(DbObjectKey::Interface));
        keys.extend(self.vrf.map(DbObjectKey::Vrf));
        keys.extend(self.vn.map(DbObjectKey::Vn));
        keys.extend(self.health_check.map(DbObjectKey::HealthCheck));
        keys.extend(self.route.clone().map(DbObjectKey::Route));
        keys
    }

    /// Dependencies without which the entry can never be valid again once
    /// the object is gone.
    pub fn is_hard(key: &DbObjectKey) -> bool {
        matches!(key, DbObjectKey::Interface(_) | DbObjectKey::Vrf(_))
    }
}

/// Lifecycle shared by all learned entries.
pub trait LearningEntryOps {
    /// Programs forwarding state. Returns `false` without side effects when
    /// preconditions are not met yet.
    fn add(&mut self, ctx: &AgentContext) -> bool;

    /// Withdraws forwarding state. Returns `true` only if the withdrawal
    /// removed a programmed route, i.e. a route acknowledgement will follow.
    /// A second call is a no-op.
    fn delete(&mut self, ctx: &AgentContext) -> bool;

    fn resync(&mut self, ctx: &AgentContext) -> bool {
        self.add(ctx)
    }

    fn dependencies(&self, ctx: &AgentContext) -> Dependencies;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Local {
        interface: InterfaceId,
    },
    Remote {
        interface: InterfaceId,
        tunnel_dest: IpAddr,
        label: u32,
    },
    Pbb {
        interface: InterfaceId,
        bmac: MacAddress,
    },
}

impl EntryKind {
    pub fn interface(&self) -> InterfaceId {
        match self {
            EntryKind::Local { interface }
            | EntryKind::Remote { interface, .. }
            | EntryKind::Pbb { interface, .. } => *interface,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EntryKind::Local { .. } => "local",
            EntryKind::Remote { .. } => "remote",
            EntryKind::Pbb { .. } => "pbb",
        }
    }
}

#[derive(Debug)]
pub struct LearningEntry {
    id: EntryId,
    key: LearningKey,
    index: u32,
    ethernet_tag: u32,
    kind: EntryKind,
    deleted: bool,
    installed: Option<BridgeRouteKey>,
    tokens: Vec<Token>,
}

impl LearningEntry {
    pub fn new(id: EntryId, key: LearningKey, kind: EntryKind) -> Self {
        Self {
            id,
            key,
            index: 0,
            ethernet_tag: 0,
            kind,
            deleted: false,
            installed: None,
            tokens: Vec::new(),
        }
    }

    /// Decodes a trap into the variant matching the ingress interface.
    pub fn from_trap(id: EntryId, trap: &PacketTrap, ctx: &AgentContext) -> Result<Self> {
        let intf = ctx
            .oper_db
            .interface(trap.interface)
            .ok_or(LearningError::UnknownInterface(trap.interface))?;

        let kind = match (intf.kind, trap.pbb, trap.tunnel) {
            (InterfaceKind::PbbTunnel, Some(pbb), _) => EntryKind::Pbb {
                interface: intf.id,
                bmac: pbb.bmac,
            },
            (InterfaceKind::Fabric, _, Some(tunnel)) => EntryKind::Remote {
                interface: intf.id,
                tunnel_dest: tunnel.source,
                label: tunnel.label,
            },
            _ => EntryKind::Local { interface: intf.id },
        };

        let mut entry = Self::new(id, LearningKey::new(trap.vrf_id, trap.smac), kind);
        entry.index = trap.index;
        entry.ethernet_tag = trap.ethernet_tag;
        Ok(entry)
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn key(&self) -> &LearningKey {
        &self.key
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn ethernet_tag(&self) -> u32 {
        self.ethernet_tag
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn set_deleted(&mut self) {
        self.deleted = true;
    }

    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Takes over the route a superseded entry installed, so a relearn
    /// replaces it in place instead of withdrawing it first.
    pub fn inherit_route(&mut self, other: &mut LearningEntry) {
        if self.installed.is_none() {
            self.installed = other.installed.take();
        }
    }

    /// Moves every token held by a superseded entry onto this one.
    pub fn copy_token_from(&mut self, other: &mut LearningEntry) {
        self.tokens.append(&mut other.tokens);
    }

    /// Records one token against this entry. Returns `false` if the pool was
    /// drained by another partition between the gate check and now.
    pub fn add_with_token(&mut self, pool: &Arc<TokenPool>) -> bool {
        match pool.acquire() {
            Some(token) => {
                self.tokens.push(token);
                true
            }
            None => false,
        }
    }

    /// Drops every held token, returning them to their pools.
    pub fn release_tokens(&mut self) -> usize {
        let released = self.tokens.len();
        self.tokens.clear();
        released
    }

    fn program(&mut self, key: BridgeRouteKey, ctx: &AgentContext) {
        if let Some(old) = self.installed.take() {
            if old != key {
                ctx.forwarding.delete_route(old);
            }
        }
        self.installed = Some(key);
    }
}

impl LearningEntryOps for LearningEntry {
    fn add(&mut self, ctx: &AgentContext) -> bool {
        let Some(vrf) = ctx.oper_db.vrf(self.key.vrf_id) else {
            return false;
        };

        match self.kind.clone() {
            EntryKind::Local { interface } => {
                if !vrf.active {
                    return false;
                }
                let Some(intf) = ctx.oper_db.interface(interface) else {
                    return false;
                };
                if intf.vn.is_none() {
                    return false;
                }
                let route = LocalRoute {
                    vrf_id: vrf.id,
                    vrf_name: vrf.name.clone(),
                    mac: self.key.mac,
                    ip: None,
                    interface,
                    label: intf.label,
                    sg_list: intf.sg_list.clone(),
                    ethernet_tag: self.ethernet_tag,
                };
                let key = route.key();
                ctx.forwarding.add_local_route(route);
                self.program(key, ctx);
            }
            EntryKind::Remote {
                tunnel_dest, label, ..
            } => {
                let route = RemoteRoute {
                    vrf_id: vrf.id,
                    vrf_name: vrf.name.clone(),
                    mac: self.key.mac,
                    ip: None,
                    nexthop: NextHop::Tunnel {
                        dest: tunnel_dest,
                        label,
                    },
                    ethernet_tag: self.ethernet_tag,
                };
                let key = route.key();
                ctx.forwarding.add_remote_route(route);
                self.program(key, ctx);
            }
            EntryKind::Pbb { bmac, .. } => {
                let Some(pbb) = vrf.pbb.as_ref() else {
                    return false;
                };
                let route = RemoteRoute {
                    vrf_id: vrf.id,
                    vrf_name: vrf.name.clone(),
                    mac: self.key.mac,
                    ip: None,
                    nexthop: NextHop::Pbb {
                        bmac_vrf_name: pbb.bmac_vrf_name.clone(),
                        bmac,
                        isid: pbb.isid,
                    },
                    ethernet_tag: self.ethernet_tag,
                };
                let key = route.key();
                ctx.forwarding.add_remote_route(route);
                self.program(key, ctx);
            }
        }
        true
    }

    fn delete(&mut self, ctx: &AgentContext) -> bool {
        let Some(key) = self.installed.take() else {
            return false;
        };
        let acked = ctx.oper_db.contains(&DbObjectKey::Route(key.clone()));
        ctx.forwarding.delete_route(key);
        acked
    }

    fn dependencies(&self, ctx: &AgentContext) -> Dependencies {
        let mut deps = Dependencies {
            interface: Some(self.kind.interface()),
            vrf: Some(self.key.vrf_id),
            ..Dependencies::default()
        };
        if let EntryKind::Pbb { bmac, .. } = &self.kind {
            deps.route = ctx
                .oper_db
                .vrf(self.key.vrf_id)
                .and_then(|vrf| vrf.pbb.as_ref().map(|p| p.bmac_vrf_name.clone()))
                .map(|bmac_vrf_name| BridgeRouteKey::new(bmac_vrf_name, *bmac, None));
        }
        deps
    }
}
