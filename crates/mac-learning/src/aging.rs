//! Traffic-driven aging of learned entries.
//!
//! Each partition, and the Mac-IP table, keeps one [`AgingTable`] per VRF.
//! Tables are keyed by the owner's entry key; every aging entry names the
//! MAC whose packet counter keeps it alive. On every
//! [`MIN_ITERATION_TIMEOUT`] tick a table visits a slice of its entries,
//! resuming where the previous tick stopped, and reports the ones whose
//! packet counter has not moved for longer than the VRF's aging time.
//!
//! The slice size adapts so that the whole table is swept about ten times
//! per timeout window, but never fewer than [`MIN_ENTRIES_PER_SCAN`]
//! entries per tick.

use crate::context::PacketCounters;
use crate::entry::EntryId;
use crate::key::{LearningKey, VrfScoped};
use crate::oper_db::OperDb;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;
use tokio::time::Instant;
use vrouter_types::{MacAddress, VrfId};

pub const MIN_ENTRIES_PER_SCAN: usize = 100;
pub const MIN_ITERATION_TIMEOUT: Duration = Duration::from_millis(100);

/// Number of entries to visit per tick for a table of `table_size` entries
/// aged after `timeout`. Zero timeout disables aging.
pub fn entries_per_iteration(timeout: Duration, table_size: usize) -> usize {
    if timeout.is_zero() {
        return 0;
    }
    let scan_window = timeout.as_millis() / 10;
    let iterations = (scan_window / MIN_ITERATION_TIMEOUT.as_millis()).max(1);
    let per_iteration = (table_size as u128 / iterations) as usize;
    per_iteration.max(MIN_ENTRIES_PER_SCAN)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgingEntry {
    pub entry_id: EntryId,
    /// MAC whose packet counter is sampled.
    pub mac: MacAddress,
    pub packets_at_last_scan: u64,
    pub last_modified: Instant,
    pub addition_time: Instant,
    pub deleted: bool,
}

/// Aging state of one VRF within one partition.
#[derive(Debug)]
pub struct AgingTable<K = LearningKey> {
    vrf_id: VrfId,
    timeout: Duration,
    entries: BTreeMap<K, AgingEntry>,
    cursor: Option<K>,
}

impl<K: Copy + Ord> AgingTable<K> {
    pub fn new(vrf_id: VrfId) -> Self {
        Self {
            vrf_id,
            timeout: Duration::ZERO,
            entries: BTreeMap::new(),
            cursor: None,
        }
    }

    pub fn vrf_id(&self) -> VrfId {
        self.vrf_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&AgingEntry> {
        self.entries.get(key)
    }

    pub fn add(&mut self, key: K, mac: MacAddress, entry_id: EntryId, packets: u64, now: Instant) {
        self.entries.insert(
            key,
            AgingEntry {
                entry_id,
                mac,
                packets_at_last_scan: packets,
                last_modified: now,
                addition_time: now,
                deleted: false,
            },
        );
    }

    pub fn delete(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Re-reads the VRF's aging time from the database.
    pub fn refresh_timeout(&mut self, oper_db: &OperDb) {
        self.timeout = oper_db
            .vrf(self.vrf_id)
            .map(|vrf| Duration::from_secs(u64::from(vrf.mac_aging_time)))
            .unwrap_or(Duration::ZERO);
    }

    pub fn calculate_entries_per_iteration(&self) -> usize {
        entries_per_iteration(self.timeout, self.entries.len())
    }

    fn should_be_aged(
        vrf_id: VrfId,
        entry: &mut AgingEntry,
        timeout: Duration,
        counters: &dyn PacketCounters,
        now: Instant,
    ) -> bool {
        // An unreadable counter reads as unchanged.
        let packets = counters
            .packets(vrf_id, entry.mac)
            .unwrap_or(entry.packets_at_last_scan);
        if packets != entry.packets_at_last_scan {
            entry.packets_at_last_scan = packets;
            entry.last_modified = now;
            return false;
        }
        now.saturating_duration_since(entry.last_modified) > timeout
    }

    /// Visits the next slice of entries. Aged entries are reported once and
    /// stay in the table, marked deleted, until the partition removes them.
    pub fn run(
        &mut self,
        oper_db: &OperDb,
        counters: &dyn PacketCounters,
        now: Instant,
        aged: &mut Vec<(K, EntryId)>,
    ) -> bool {
        if self.entries.is_empty() {
            self.cursor = None;
            return false;
        }
        self.refresh_timeout(oper_db);
        let budget = self.calculate_entries_per_iteration();
        if budget == 0 {
            return true;
        }

        let start = match self.cursor.take() {
            Some(key) => Bound::Included(key),
            None => Bound::Unbounded,
        };
        let mut batch: Vec<K> = self
            .entries
            .range((start, Bound::Unbounded))
            .map(|(key, _)| *key)
            .take(budget + 1)
            .collect();
        if batch.len() > budget {
            self.cursor = batch.pop();
        }

        let timeout = self.timeout;
        for key in batch {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            if entry.deleted {
                continue;
            }
            if Self::should_be_aged(self.vrf_id, entry, timeout, counters, now) {
                entry.deleted = true;
                aged.push((key, entry.entry_id));
            }
        }
        true
    }
}

/// All aging tables of one partition.
#[derive(Debug)]
pub struct AgingPartition<K = LearningKey> {
    tables: BTreeMap<VrfId, AgingTable<K>>,
    started: bool,
}

impl<K> Default for AgingPartition<K> {
    fn default() -> Self {
        Self {
            tables: BTreeMap::new(),
            started: false,
        }
    }
}

impl<K: Copy + Ord + VrfScoped> AgingPartition<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the sweep timer should be running. Set on first insertion and
    /// never cleared.
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(AgingTable::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn table(&self, vrf_id: VrfId) -> Option<&AgingTable<K>> {
        self.tables.get(&vrf_id)
    }

    /// Tracks `key`, aged by the packet counter of `mac`.
    pub fn add(&mut self, key: K, mac: MacAddress, entry_id: EntryId, packets: u64, now: Instant) {
        self.started = true;
        let vrf_id = key.vrf_id();
        self.tables
            .entry(vrf_id)
            .or_insert_with(|| AgingTable::new(vrf_id))
            .add(key, mac, entry_id, packets, now);
    }

    pub fn delete(&mut self, key: &K) -> bool {
        self.tables
            .get_mut(&key.vrf_id())
            .is_some_and(|t| t.delete(key))
    }

    pub fn remove_vrf(&mut self, vrf_id: VrfId) -> Option<AgingTable<K>> {
        self.tables.remove(&vrf_id)
    }

    /// Runs one sweep tick over every table and returns the aged entries.
    pub fn run(
        &mut self,
        oper_db: &OperDb,
        counters: &dyn PacketCounters,
        now: Instant,
    ) -> Vec<(K, EntryId)> {
        let mut aged = Vec::new();
        self.tables
            .retain(|_, table| table.run(oper_db, counters, now, &mut aged));
        aged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::MacIpKey;
    use crate::oper_db::VrfEntry;
    use crate::sim::SimPacketCounters;
    use pretty_assertions::assert_eq;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0, 0, 0, 0, 0, last])
    }

    fn db_with_vrf(aging_secs: u32) -> std::sync::Arc<OperDb> {
        let db = OperDb::new();
        let mut vrf = VrfEntry::new(VrfId(1), "vrf1");
        vrf.mac_aging_time = aging_secs;
        db.upsert_vrf(vrf);
        db
    }

    #[test]
    fn test_entries_per_iteration_examples() {
        let one_sec = Duration::from_millis(1000);
        assert_eq!(entries_per_iteration(one_sec, 1000), 1000);
        assert_eq!(entries_per_iteration(one_sec, 100), 100);
        assert_eq!(entries_per_iteration(one_sec, 10000), 10000);

        let five_sec = Duration::from_millis(5000);
        assert_eq!(entries_per_iteration(five_sec, 1000), 200);
        assert_eq!(entries_per_iteration(five_sec, 100), 100);
        assert_eq!(entries_per_iteration(five_sec, 4639), 927);

        assert_eq!(entries_per_iteration(Duration::from_secs(180), 100_000), 555);
        assert_eq!(entries_per_iteration(Duration::ZERO, 100_000), 0);
    }

    #[test]
    fn test_entries_per_iteration_monotonic() {
        for timeout_ms in [100u64, 1000, 5000, 60_000, 300_000] {
            let timeout = Duration::from_millis(timeout_ms);
            let mut prev = 0;
            for size in (0..50_000).step_by(997) {
                let n = entries_per_iteration(timeout, size);
                assert!(n >= prev, "size monotonicity broken at {timeout_ms}ms/{size}");
                prev = n;
            }
        }
        for size in [0usize, 100, 5000, 123_456] {
            let mut prev = usize::MAX;
            for timeout_ms in (1000..600_000).step_by(7919) {
                let n = entries_per_iteration(Duration::from_millis(timeout_ms), size);
                assert!(n <= prev, "timeout monotonicity broken at {size}/{timeout_ms}ms");
                prev = n;
            }
        }
    }

    #[test]
    fn test_idle_entry_ages_after_timeout() {
        let db = db_with_vrf(1);
        let counters = SimPacketCounters::new();
        let start = Instant::now();
        let mut aging = AgingPartition::new();
        let key = LearningKey::new(VrfId(1), mac(1));
        aging.add(key, key.mac, EntryId(9), 0, start);
        assert!(aging.is_started());

        assert!(aging.run(&db, &counters, start + Duration::from_millis(500)).is_empty());
        let aged = aging.run(&db, &counters, start + Duration::from_millis(1100));
        assert_eq!(aged, vec![(key, EntryId(9))]);
        // Reported once.
        assert!(aging.run(&db, &counters, start + Duration::from_millis(1200)).is_empty());
    }

    #[test]
    fn test_traffic_refreshes_entry() {
        let db = db_with_vrf(1);
        let counters = SimPacketCounters::new();
        let start = Instant::now();
        let mut aging = AgingPartition::new();
        let key = LearningKey::new(VrfId(1), mac(1));
        aging.add(key, key.mac, EntryId(1), 0, start);

        counters.set(VrfId(1), mac(1), 10);
        assert!(aging.run(&db, &counters, start + Duration::from_millis(900)).is_empty());
        assert!(aging.run(&db, &counters, start + Duration::from_millis(1500)).is_empty());
        let aged = aging.run(&db, &counters, start + Duration::from_millis(2000));
        assert_eq!(aged.len(), 1);
    }

    #[test]
    fn test_missing_counter_counts_as_unchanged() {
        let db = db_with_vrf(1);
        let counters = SimPacketCounters::new();
        let start = Instant::now();
        let mut table = AgingTable::new(VrfId(1));
        table.add(LearningKey::new(VrfId(1), mac(1)), mac(1), EntryId(1), 5, start);
        let mut aged = Vec::new();
        table.run(&db, &counters, start + Duration::from_secs(2), &mut aged);
        assert_eq!(aged.len(), 1);
    }

    #[test]
    fn test_zero_timeout_disables_aging() {
        let db = db_with_vrf(0);
        let counters = SimPacketCounters::new();
        let start = Instant::now();
        let mut aging = AgingPartition::new();
        aging.add(LearningKey::new(VrfId(1), mac(1)), mac(1), EntryId(1), 0, start);
        assert!(aging.run(&db, &counters, start + Duration::from_secs(3600)).is_empty());
        assert_eq!(aging.len(), 1);
    }

    #[test]
    fn test_sweep_resumes_from_cursor() {
        // 60s timeout: 600 entries are visited in slices of 100.
        let db = db_with_vrf(60);
        let counters = SimPacketCounters::new();
        let start = Instant::now();
        let mut table = AgingTable::new(VrfId(1));
        for i in 0..=255u8 {
            let mac = MacAddress::new([0, 0, 0, 0, 1, i]);
            table.add(LearningKey::new(VrfId(1), mac), mac, EntryId(i.into()), 0, start);
        }
        for i in 0..=87u8 {
            let mac = MacAddress::new([0, 0, 0, 0, 2, i]);
            let id = EntryId(1000 + u64::from(i));
            table.add(LearningKey::new(VrfId(1), mac), mac, id, 0, start);
        }
        assert_eq!(table.len(), 344);

        let late = start + Duration::from_secs(61);
        let mut aged = Vec::new();
        table.run(&db, &counters, late, &mut aged);
        assert_eq!(aged.len(), 100);
        table.run(&db, &counters, late, &mut aged);
        table.run(&db, &counters, late, &mut aged);
        table.run(&db, &counters, late, &mut aged);
        assert_eq!(aged.len(), 344);

        let mut ids: Vec<EntryId> = aged.iter().map(|(_, id)| *id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 344);
    }

    #[test]
    fn test_remove_vrf_drops_table() {
        let mut aging = AgingPartition::new();
        let start = Instant::now();
        aging.add(LearningKey::new(VrfId(1), mac(1)), mac(1), EntryId(1), 0, start);
        aging.add(LearningKey::new(VrfId(2), mac(1)), mac(1), EntryId(2), 0, start);
        assert!(aging.remove_vrf(VrfId(1)).is_some());
        assert_eq!(aging.len(), 1);
        assert!(aging.delete(&LearningKey::new(VrfId(2), mac(1))));
        assert!(aging.is_empty());
    }

    #[test]
    fn test_ip_keyed_table_samples_bound_mac() {
        let db = db_with_vrf(1);
        let counters = SimPacketCounters::new();
        let start = Instant::now();
        let mut aging = AgingPartition::new();
        let quiet = MacIpKey::new(VrfId(1), "1.1.1.3".parse().unwrap());
        let busy = MacIpKey::new(VrfId(1), "1.1.1.4".parse().unwrap());
        aging.add(quiet, mac(3), EntryId(3), 0, start);
        aging.add(busy, mac(4), EntryId(4), 0, start);

        counters.set(VrfId(1), mac(4), 7);
        let aged = aging.run(&db, &counters, start + Duration::from_millis(1100));
        assert_eq!(aged, vec![(quiet, EntryId(3))]);
    }
}
