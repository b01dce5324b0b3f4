//! Read-only introspection of the learning tables.
//!
//! Snapshots are paginated by key: a query returns at most `limit` entries
//! strictly after `start_after`, plus the cursor to pass for the next page.

use crate::entry::{EntryId, LearningEntry};
use crate::key::{LearningKey, MacIpKey};
use crate::token::TokenPoolStats;
use serde::Serialize;
use std::net::IpAddr;
use vrouter_types::{InterfaceId, MacAddress, VrfId};

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotQuery<K> {
    pub vrf_id: Option<VrfId>,
    pub start_after: Option<K>,
    pub limit: usize,
}

impl<K> Default for SnapshotQuery<K> {
    fn default() -> Self {
        Self {
            vrf_id: None,
            start_after: None,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl<K: Ord> SnapshotQuery<K> {
    pub fn vrf(vrf_id: VrfId) -> Self {
        Self {
            vrf_id: Some(vrf_id),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn after(mut self, key: K) -> Self {
        self.start_after = Some(key);
        self
    }

    pub fn matches(&self, vrf_id: VrfId, key: &K) -> bool {
        self.vrf_id.map_or(true, |v| v == vrf_id)
            && self.start_after.as_ref().map_or(true, |after| key > after)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LearningEntrySnapshot {
    pub key: LearningKey,
    pub id: EntryId,
    pub kind: &'static str,
    pub interface: InterfaceId,
    pub index: u32,
    pub ethernet_tag: u32,
    pub installed: bool,
    pub deleted: bool,
    pub tokens: usize,
}

impl From<&LearningEntry> for LearningEntrySnapshot {
    fn from(entry: &LearningEntry) -> Self {
        Self {
            key: *entry.key(),
            id: entry.id(),
            kind: entry.kind().name(),
            interface: entry.kind().interface(),
            index: entry.index(),
            ethernet_tag: entry.ethernet_tag(),
            installed: entry.is_installed(),
            deleted: entry.is_deleted(),
            tokens: entry.token_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MacIpEntrySnapshot {
    pub key: MacIpKey,
    pub mac: MacAddress,
    pub interface: InterfaceId,
    pub installed: bool,
    pub deleted: bool,
    pub probing: bool,
    pub gateway: Option<IpAddr>,
}

/// One page of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotPage<T, K> {
    pub entries: Vec<T>,
    /// Pass as `start_after` to fetch the following page.
    pub next: Option<K>,
}

impl<T, K: Clone> SnapshotPage<T, K> {
    /// Builds a page from up to `limit + 1` sorted candidates.
    pub fn from_sorted(mut entries: Vec<T>, limit: usize, key_of: impl Fn(&T) -> K) -> Self {
        let next = if entries.len() > limit {
            entries.truncate(limit);
            entries.last().map(&key_of)
        } else {
            None
        };
        Self { entries, next }
    }
}

/// Counters kept by one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub partition: usize,
    pub entries: usize,
    pub aging_entries: usize,
    pub learned: u64,
    pub add_failures: u64,
    pub resynced: u64,
    pub deleted: u64,
    pub aged: u64,
    pub tokens_released: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MgmtStats {
    pub interfaces: usize,
    pub vrfs: usize,
    pub vns: usize,
    pub health_checks: usize,
    pub routes: usize,
    pub tracked_entries: usize,
    pub freed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MacIpStats {
    pub entries: usize,
    pub aging_entries: usize,
    pub learned: u64,
    pub moves: u64,
    pub unreachable: u64,
    pub deleted: u64,
    pub aged: u64,
    pub tokens_released: u64,
}

/// Subsystem-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LearningStats {
    pub partitions: Vec<PartitionStats>,
    pub token_pools: Vec<TokenPoolStats>,
    pub mgmt: MgmtStats,
    pub mac_ip: MacIpStats,
}

impl LearningStats {
    pub fn total_entries(&self) -> usize {
        self.partitions.iter().map(|p| p.entries).sum()
    }
}
