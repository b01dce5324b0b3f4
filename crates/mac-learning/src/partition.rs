//! One learning shard: an entry table, its aging state and the worker that
//! drains the shard's three queues.

use crate::aging::{AgingPartition, MIN_ITERATION_TIMEOUT};
use crate::context::AgentContext;
use crate::entry::{EntryId, LearningEntry, LearningEntryOps};
use crate::key::LearningKey;
use crate::mgmt::{EntryRef, MgmtRequest};
use crate::oper_db::DbObjectKey;
use crate::packet::PacketTrap;
use crate::queue::{LearningSenders, PartitionReceiver, QueueKind};
use crate::snapshot::{LearningEntrySnapshot, PartitionStats, SnapshotQuery};
use crate::token::{TokenPool, TokenPools};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use vrouter_types::{InterfaceId, VrfId};

/// How often a paused queue re-checks its gate without a wakeup.
pub const GATE_RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Which learned entries a flush removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope {
    Vrf(VrfId),
    Interface(InterfaceId),
}

#[derive(Debug)]
pub enum PartitionRequest {
    /// Source MAC trapped by the datapath.
    Trap(PacketTrap),
    /// The VRF is gone; drop its aging table.
    VrfDelete(VrfId),
    Resync(LearningKey),
    /// Delete the entry at `key`; with `id`, only that instance.
    Delete {
        key: LearningKey,
        id: Option<EntryId>,
    },
    /// The route programmed for `key` was acknowledged.
    ReleaseToken(LearningKey),
    /// Free state held for a deleted database object.
    FreeDbState {
        object: DbObjectKey,
        generation: u64,
    },
    Flush(FlushScope),
    Snapshot {
        query: SnapshotQuery<LearningKey>,
        reply: oneshot::Sender<Vec<LearningEntrySnapshot>>,
    },
    Stats(oneshot::Sender<PartitionStats>),
}

impl PartitionRequest {
    pub fn queue(&self) -> QueueKind {
        match self {
            PartitionRequest::Trap(_) | PartitionRequest::VrfDelete(_) => QueueKind::Add,
            PartitionRequest::Resync(_) => QueueKind::Resync,
            PartitionRequest::Delete { .. }
            | PartitionRequest::ReleaseToken(_)
            | PartitionRequest::FreeDbState { .. }
            | PartitionRequest::Flush(_)
            | PartitionRequest::Snapshot { .. }
            | PartitionRequest::Stats(_) => QueueKind::Delete,
        }
    }
}

/// The state of one shard. Only its own worker touches it.
pub struct LearningPartition {
    index: usize,
    ctx: AgentContext,
    pools: TokenPools,
    senders: LearningSenders,
    entries: BTreeMap<LearningKey, LearningEntry>,
    aging: AgingPartition,
    next_id: u64,
    stats: PartitionStats,
}

impl LearningPartition {
    pub fn new(
        index: usize,
        ctx: AgentContext,
        pools: TokenPools,
        senders: LearningSenders,
    ) -> Self {
        Self {
            index,
            ctx,
            pools,
            senders,
            entries: BTreeMap::new(),
            aging: AgingPartition::new(),
            next_id: 0,
            stats: PartitionStats {
                partition: index,
                ..PartitionStats::default()
            },
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, key: &LearningKey) -> Option<&LearningEntry> {
        self.entries.get(key)
    }

    pub fn aging(&self) -> &AgingPartition {
        &self.aging
    }

    fn allocate_id(&mut self) -> EntryId {
        self.next_id += 1;
        EntryId(((self.index as u64) << 48) | self.next_id)
    }

    fn notify_mgmt(&self, request: MgmtRequest) {
        if let Err(e) = self.senders.send_mgmt(request) {
            warn!(partition = self.index, error = %e, "Dropping tracker notification");
        }
    }

    pub fn handle(&mut self, request: PartitionRequest, now: Instant) {
        match request {
            PartitionRequest::Trap(trap) => self.learn(trap, now),
            PartitionRequest::VrfDelete(vrf_id) => {
                if self.aging.remove_vrf(vrf_id).is_some() {
                    debug!(partition = self.index, %vrf_id, "Dropped aging table");
                }
            }
            PartitionRequest::Resync(key) => self.resync(&key),
            PartitionRequest::Delete { key, id } => {
                let stale = id.is_some_and(|id| {
                    self.entries.get(&key).is_some_and(|e| e.id() != id)
                });
                if !stale {
                    self.delete(&key);
                }
            }
            PartitionRequest::ReleaseToken(key) => self.release_token(&key),
            PartitionRequest::FreeDbState { object, generation } => {
                self.free_db_state(&object, generation)
            }
            PartitionRequest::Flush(scope) => self.flush(scope),
            PartitionRequest::Snapshot { query, reply } => {
                let _ = reply.send(self.snapshot(&query));
            }
            PartitionRequest::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn learn(&mut self, trap: PacketTrap, now: Instant) {
        if !trap.smac.is_learnable() {
            debug!(partition = self.index, mac = %trap.smac, "Ignoring non-unicast source MAC");
            return;
        }
        let id = self.allocate_id();
        match LearningEntry::from_trap(id, &trap, &self.ctx) {
            Ok(entry) => self.add(entry, now),
            Err(e) => {
                debug!(
                    partition = self.index,
                    vrf_id = %trap.vrf_id,
                    mac = %trap.smac,
                    error = %e,
                    "Dropping trap"
                );
            }
        }
    }

    /// Installs `entry`, superseding whatever is stored under its key.
    pub fn add(&mut self, mut entry: LearningEntry, now: Instant) {
        let key = *entry.key();
        if let Some(mut old) = self.entries.remove(&key) {
            entry.copy_token_from(&mut old);
            if !old.is_deleted() {
                self.aging.delete(&key);
                entry.inherit_route(&mut old);
            }
        }

        if entry.add(&self.ctx) {
            self.stats.learned += 1;
            entry.add_with_token(&self.pools.add);
            debug!(partition = self.index, %key, kind = entry.kind().name(), "Learned");
        } else {
            self.stats.add_failures += 1;
            // A superseded binding must not stay programmed.
            if entry.delete(&self.ctx) {
                entry.add_with_token(&self.pools.delete);
            }
            debug!(partition = self.index, %key, "Add preconditions not met");
        }

        self.notify_mgmt(MgmtRequest::AddEntry {
            entry: EntryRef::Mac(key),
            id: Some(entry.id()),
            deps: entry.dependencies(&self.ctx),
        });
        let packets = self.ctx.counters.packets(key.vrf_id, key.mac).unwrap_or(0);
        self.aging.add(key, key.mac, entry.id(), packets, now);
        self.entries.insert(key, entry);
    }

    /// Marks the entry deleted and withdraws its route. The entry lingers
    /// with its tokens until the withdrawal is acknowledged; with nothing
    /// left to acknowledge it is removed at once.
    pub fn delete(&mut self, key: &LearningKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if entry.is_deleted() {
            return;
        }
        entry.set_deleted();
        if entry.delete(&self.ctx) {
            entry.add_with_token(&self.pools.delete);
        } else {
            self.stats.tokens_released += entry.release_tokens() as u64;
        }
        let drained = entry.token_count() == 0;
        self.stats.deleted += 1;
        self.aging.delete(key);
        if drained {
            self.entries.remove(key);
        }
        self.notify_mgmt(MgmtRequest::DeleteEntry {
            entry: EntryRef::Mac(*key),
        });
        debug!(partition = self.index, %key, "Deleted");
    }

    pub fn resync(&mut self, key: &LearningKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if entry.is_deleted() {
            return;
        }
        if entry.resync(&self.ctx) {
            entry.add_with_token(&self.pools.resync);
        }
        let deps = entry.dependencies(&self.ctx);
        let id = entry.id();
        self.stats.resynced += 1;
        self.notify_mgmt(MgmtRequest::AddEntry {
            entry: EntryRef::Mac(*key),
            id: Some(id),
            deps,
        });
    }

    pub fn release_token(&mut self, key: &LearningKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        self.stats.tokens_released += entry.release_tokens() as u64;
        if entry.is_deleted() {
            self.entries.remove(key);
        }
    }

    fn free_db_state(&mut self, object: &DbObjectKey, generation: u64) {
        debug_assert_eq!(self.index, 0, "database state is released by partition 0");
        match self.ctx.oper_db.release_state(object, generation) {
            Ok(()) => debug!(%object, generation, "Released database state"),
            Err(e) => debug!(error = %e, "Skipping stale state release"),
        }
    }

    fn flush(&mut self, scope: FlushScope) {
        let keys: Vec<LearningKey> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.is_deleted())
            .filter(|(key, e)| match scope {
                FlushScope::Vrf(vrf_id) => key.vrf_id == vrf_id,
                FlushScope::Interface(interface) => e.kind().interface() == interface,
            })
            .map(|(key, _)| *key)
            .collect();
        if !keys.is_empty() {
            info!(
                partition = self.index,
                ?scope,
                count = keys.len(),
                "Flushing learned entries"
            );
        }
        for key in keys {
            self.delete(&key);
        }
    }

    pub fn snapshot(&self, query: &SnapshotQuery<LearningKey>) -> Vec<LearningEntrySnapshot> {
        self.entries
            .iter()
            .filter(|(key, _)| query.matches(key.vrf_id, key))
            .take(query.limit.saturating_add(1))
            .map(|(_, entry)| LearningEntrySnapshot::from(entry))
            .collect()
    }

    pub fn stats(&self) -> PartitionStats {
        PartitionStats {
            entries: self.entries.len(),
            aging_entries: self.aging.len(),
            ..self.stats.clone()
        }
    }

    /// One aging tick: idle entries are posted to this shard's delete queue.
    pub fn run_aging(&mut self, now: Instant) {
        let aged = self
            .aging
            .run(&self.ctx.oper_db, self.ctx.counters.as_ref(), now);
        for (key, id) in aged {
            self.stats.aged += 1;
            debug!(partition = self.index, %key, "Aged out");
            let request = PartitionRequest::Delete { key, id: Some(id) };
            if let Err(e) = self.senders.send_to_partition(self.index, request) {
                warn!(partition = self.index, error = %e, "Dropping aged delete");
            }
        }
    }
}

/// Runs one [`LearningPartition`] until cancelled.
pub struct PartitionWorker {
    partition: LearningPartition,
    rx: PartitionReceiver,
    cancel: CancellationToken,
}

/// Open unless the pool is empty. A closed gate with work waiting counts a
/// pool failure.
pub(crate) fn gate_open<T>(pool: &TokenPool, rx: &UnboundedReceiver<T>) -> bool {
    pool.available() > 0 || (!rx.is_empty() && pool.can_proceed())
}

pub(crate) async fn next_tick(interval: &mut Option<Interval>) -> Instant {
    match interval {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}

impl PartitionWorker {
    pub fn new(
        partition: LearningPartition,
        rx: PartitionReceiver,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            partition,
            rx,
            cancel,
        }
    }

    #[instrument(name = "partition", skip_all, fields(index = self.partition.index))]
    pub async fn run(mut self) {
        info!("Learning partition started");
        let pools = self.partition.pools.clone();
        let mut aging_tick: Option<Interval> = None;

        loop {
            // Register for wakeups before sampling the gates so a release in
            // between is not missed.
            let add_notified = pools.add.wakeup().notified();
            let resync_notified = pools.resync.wakeup().notified();
            tokio::pin!(add_notified, resync_notified);
            add_notified.as_mut().enable();
            resync_notified.as_mut().enable();

            let add_open = gate_open(&pools.add, &self.rx.add);
            let resync_open = gate_open(&pools.resync, &self.rx.resync);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(request) = self.rx.delete.recv() => {
                    self.partition.handle(request, Instant::now());
                }
                Some(request) = self.rx.resync.recv(), if resync_open => {
                    self.partition.handle(request, Instant::now());
                }
                Some(request) = self.rx.add.recv(), if add_open => {
                    self.partition.handle(request, Instant::now());
                }
                _ = &mut add_notified, if !add_open => {
                    debug!("Add tokens available again");
                }
                _ = &mut resync_notified, if !resync_open => {
                    debug!("Resync tokens available again");
                }
                _ = tokio::time::sleep(GATE_RECHECK_INTERVAL), if !add_open || !resync_open => {}
                now = next_tick(&mut aging_tick) => {
                    self.partition.run_aging(now);
                }
            }

            if aging_tick.is_none() && self.partition.aging.is_started() {
                let mut interval = tokio::time::interval(MIN_ITERATION_TIMEOUT);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                aging_tick = Some(interval);
            }
        }
        info!("Learning partition stopped");
    }
}
