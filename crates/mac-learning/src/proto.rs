//! The learning dispatcher and the service that owns the workers.

use crate::config::LearningConfig;
use crate::context::AgentContext;
use crate::error::{LearningError, Result};
use crate::key::{LearningKey, MacIpKey};
use crate::mac_ip::{MacIpLearningHandle, MacIpLearningTable, MacIpRequest, MacIpWorker};
use crate::mgmt::{MgmtListener, MgmtRequest, MgmtTracker, MgmtWorker};
use crate::packet::PacketTrap;
use crate::partition::{FlushScope, LearningPartition, PartitionRequest, PartitionWorker};
use crate::queue::{partition_index, LearningSenders};
use crate::snapshot::{
    LearningEntrySnapshot, LearningStats, MacIpEntrySnapshot, SnapshotPage, SnapshotQuery,
};
use crate::token::{TokenPoolKind, TokenPools};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vrouter_types::{InterfaceId, MacAddress, VrfId};

async fn await_reply<T>(rx: oneshot::Receiver<T>, queue: &'static str) -> Result<T> {
    rx.await.map_err(|_| LearningError::ChannelClosed(queue))
}

/// Front door of the learning subsystem.
///
/// Routes every trap to the partition owning its (VRF, MAC), or to the
/// Mac-IP table when IP learning applies, and owns the token pools shared
/// by all partitions. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct MacLearningProto {
    config: Arc<LearningConfig>,
    ctx: AgentContext,
    pools: TokenPools,
    senders: LearningSenders,
}

impl MacLearningProto {
    pub fn new(
        config: Arc<LearningConfig>,
        ctx: AgentContext,
        pools: TokenPools,
        senders: LearningSenders,
    ) -> Self {
        Self {
            config,
            ctx,
            pools,
            senders,
        }
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    pub fn partition_count(&self) -> usize {
        self.senders.partition_count()
    }

    pub fn token_pools(&self) -> &TokenPools {
        &self.pools
    }

    /// Partition owning (vrf_id, mac).
    pub fn hash(&self, vrf_id: VrfId, mac: &MacAddress) -> usize {
        partition_index(vrf_id, mac, self.partition_count())
    }

    /// Wakes every partition paused on `kind` so it re-checks its gate.
    pub fn token_available(&self, kind: TokenPoolKind) {
        self.pools.get(kind).wakeup().notify_waiters();
    }

    fn wants_mac_ip(&self, trap: &PacketTrap) -> bool {
        if !self.config.mac_ip_learning || trap.src_ip.is_none() {
            return false;
        }
        self.ctx
            .oper_db
            .interface(trap.interface)
            .and_then(|intf| intf.vn)
            .and_then(|vn| self.ctx.oper_db.vn(vn))
            .is_some_and(|vn| vn.mac_ip_learning)
    }

    pub fn enqueue(&self, trap: PacketTrap) -> Result<()> {
        if self.wants_mac_ip(&trap) {
            return self.senders.send_mac_ip(MacIpRequest::Trap(trap));
        }
        let key = LearningKey::new(trap.vrf_id, trap.smac);
        self.senders.send_for_key(&key, PartitionRequest::Trap(trap))
    }

    pub fn flush_vrf(&self, vrf_id: VrfId) -> Result<()> {
        info!(%vrf_id, "Flushing learned MACs");
        self.senders
            .broadcast(|| PartitionRequest::Flush(FlushScope::Vrf(vrf_id)))
    }

    pub fn flush_interface(&self, interface: InterfaceId) -> Result<()> {
        info!(%interface, "Flushing learned MACs");
        self.senders
            .broadcast(|| PartitionRequest::Flush(FlushScope::Interface(interface)))
    }

    /// One page of learned MACs across all partitions, in key order.
    pub async fn snapshot(
        &self,
        query: SnapshotQuery<LearningKey>,
    ) -> Result<SnapshotPage<LearningEntrySnapshot, LearningKey>> {
        let mut replies = Vec::with_capacity(self.partition_count());
        for index in 0..self.partition_count() {
            let (reply, rx) = oneshot::channel();
            self.senders.send_to_partition(
                index,
                PartitionRequest::Snapshot {
                    query: query.clone(),
                    reply,
                },
            )?;
            replies.push(rx);
        }

        let mut entries = Vec::new();
        for rx in replies {
            entries.extend(await_reply(rx, "partition delete").await?);
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.truncate(query.limit.saturating_add(1));
        Ok(SnapshotPage::from_sorted(entries, query.limit, |e| e.key))
    }

    pub async fn mac_ip_snapshot(
        &self,
        query: SnapshotQuery<MacIpKey>,
    ) -> Result<SnapshotPage<MacIpEntrySnapshot, MacIpKey>> {
        MacIpLearningHandle::new(self.senders.clone())
            .snapshot(query)
            .await
    }

    pub async fn stats(&self) -> Result<LearningStats> {
        let mut partitions = Vec::with_capacity(self.partition_count());
        for index in 0..self.partition_count() {
            let (reply, rx) = oneshot::channel();
            self.senders
                .send_to_partition(index, PartitionRequest::Stats(reply))?;
            partitions.push(await_reply(rx, "partition delete").await?);
        }

        let (reply, rx) = oneshot::channel();
        self.senders.send_mgmt(MgmtRequest::Stats(reply))?;
        let mgmt = await_reply(rx, "mgmt").await?;

        let (reply, rx) = oneshot::channel();
        self.senders.send_mac_ip(MacIpRequest::Stats(reply))?;
        let mac_ip = await_reply(rx, "mac-ip").await?;

        Ok(LearningStats {
            partitions,
            token_pools: self.pools.stats(),
            mgmt,
            mac_ip,
        })
    }
}

/// The running subsystem: one task per partition, plus the dependency
/// tracker and the Mac-IP table.
pub struct MacLearningService {
    proto: MacLearningProto,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MacLearningService {
    /// Validates `config`, registers with the database and starts every
    /// worker on the current tokio runtime.
    pub fn spawn(config: LearningConfig, ctx: AgentContext) -> Result<Self> {
        config.validate()?;
        let pools = TokenPools::new(config.add_tokens, config.resync_tokens, config.delete_tokens);
        let (senders, receivers) = LearningSenders::channel(config.partition_count);
        ctx.oper_db
            .register_listener(Arc::new(MgmtListener::new(senders.clone())));

        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(config.partition_count + 2);
        for (index, rx) in receivers.partitions.into_iter().enumerate() {
            let partition =
                LearningPartition::new(index, ctx.clone(), pools.clone(), senders.clone());
            let worker = PartitionWorker::new(partition, rx, cancel.child_token());
            tasks.push(tokio::spawn(worker.run()));
        }

        let tracker = MgmtTracker::new(ctx.clone(), senders.clone());
        tasks.push(tokio::spawn(
            MgmtWorker::new(tracker, receivers.mgmt, cancel.child_token()).run(),
        ));

        let table = MacIpLearningTable::new(ctx.clone(), pools.clone(), senders.clone());
        tasks.push(tokio::spawn(
            MacIpWorker::new(table, receivers.mac_ip, cancel.child_token()).run(),
        ));

        info!(
            partitions = config.partition_count,
            add_tokens = config.add_tokens,
            resync_tokens = config.resync_tokens,
            delete_tokens = config.delete_tokens,
            mac_ip_learning = config.mac_ip_learning,
            "MAC learning service started"
        );

        Ok(Self {
            proto: MacLearningProto::new(Arc::new(config), ctx, pools, senders),
            cancel,
            tasks,
        })
    }

    pub fn proto(&self) -> &MacLearningProto {
        &self.proto
    }

    pub fn mac_ip_handle(&self) -> MacIpLearningHandle {
        MacIpLearningHandle::new(self.proto.senders.clone())
    }

    /// Cancels every worker and waits for them to stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Learning worker ended abnormally");
            }
        }
        debug!("MAC learning service stopped");
    }
}
