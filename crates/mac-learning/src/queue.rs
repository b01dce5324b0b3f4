//! Work queues between the learning components.
//!
//! Every partition owns three unbounded queues (add, resync, delete). The
//! Mac-IP table owns two: a gated add queue for traps and an ungated delete
//! queue for everything else. The dependency tracker owns one. Senders are
//! cheap to clone and are shared by every component that needs to post
//! work.

use crate::error::{LearningError, Result};
use crate::key::LearningKey;
use crate::mac_ip::MacIpRequest;
use crate::mgmt::MgmtRequest;
use crate::partition::PartitionRequest;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use vrouter_types::{MacAddress, VrfId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Add,
    Resync,
    Delete,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Add => write!(f, "add"),
            QueueKind::Resync => write!(f, "resync"),
            QueueKind::Delete => write!(f, "delete"),
        }
    }
}

fn hash_combine(seed: &mut u64, value: u64) {
    *seed ^= value
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(*seed << 6)
        .wrapping_add(*seed >> 2);
}

/// Stable hash of (VRF, MAC). Must not change across releases of the same
/// process, since every request for a key has to land on one partition.
pub fn hash_key(vrf_id: VrfId, mac: &MacAddress) -> u64 {
    let mut seed = 0;
    hash_combine(&mut seed, u64::from(vrf_id.get()));
    for octet in mac.octets() {
        hash_combine(&mut seed, u64::from(octet));
    }
    seed
}

pub fn partition_index(vrf_id: VrfId, mac: &MacAddress, partition_count: usize) -> usize {
    (hash_key(vrf_id, mac) % partition_count as u64) as usize
}

#[derive(Debug, Clone)]
pub struct PartitionSender {
    add: UnboundedSender<PartitionRequest>,
    resync: UnboundedSender<PartitionRequest>,
    delete: UnboundedSender<PartitionRequest>,
}

impl PartitionSender {
    pub fn send(&self, request: PartitionRequest) -> Result<()> {
        let (tx, name) = match request.queue() {
            QueueKind::Add => (&self.add, "partition add"),
            QueueKind::Resync => (&self.resync, "partition resync"),
            QueueKind::Delete => (&self.delete, "partition delete"),
        };
        tx.send(request)
            .map_err(|_| LearningError::ChannelClosed(name))
    }
}

#[derive(Debug)]
pub struct PartitionReceiver {
    pub add: UnboundedReceiver<PartitionRequest>,
    pub resync: UnboundedReceiver<PartitionRequest>,
    pub delete: UnboundedReceiver<PartitionRequest>,
}

#[derive(Debug)]
pub struct MacIpReceiver {
    pub add: UnboundedReceiver<MacIpRequest>,
    pub delete: UnboundedReceiver<MacIpRequest>,
}

#[derive(Debug, Clone)]
struct MacIpSender {
    add: UnboundedSender<MacIpRequest>,
    delete: UnboundedSender<MacIpRequest>,
}

/// Receiving halves, handed to the workers at spawn time.
#[derive(Debug)]
pub struct LearningReceivers {
    pub partitions: Vec<PartitionReceiver>,
    pub mgmt: UnboundedReceiver<MgmtRequest>,
    pub mac_ip: MacIpReceiver,
}

/// Sending halves of every queue in the subsystem.
#[derive(Debug, Clone)]
pub struct LearningSenders {
    partitions: Arc<[PartitionSender]>,
    mgmt: UnboundedSender<MgmtRequest>,
    mac_ip: MacIpSender,
}

impl LearningSenders {
    pub fn channel(partition_count: usize) -> (Self, LearningReceivers) {
        let mut senders = Vec::with_capacity(partition_count);
        let mut receivers = Vec::with_capacity(partition_count);
        for _ in 0..partition_count {
            let (add_tx, add_rx) = mpsc::unbounded_channel();
            let (resync_tx, resync_rx) = mpsc::unbounded_channel();
            let (delete_tx, delete_rx) = mpsc::unbounded_channel();
            senders.push(PartitionSender {
                add: add_tx,
                resync: resync_tx,
                delete: delete_tx,
            });
            receivers.push(PartitionReceiver {
                add: add_rx,
                resync: resync_rx,
                delete: delete_rx,
            });
        }
        let (mgmt_tx, mgmt_rx) = mpsc::unbounded_channel();
        let (mac_ip_add_tx, mac_ip_add_rx) = mpsc::unbounded_channel();
        let (mac_ip_delete_tx, mac_ip_delete_rx) = mpsc::unbounded_channel();
        (
            Self {
                partitions: senders.into(),
                mgmt: mgmt_tx,
                mac_ip: MacIpSender {
                    add: mac_ip_add_tx,
                    delete: mac_ip_delete_tx,
                },
            },
            LearningReceivers {
                partitions: receivers,
                mgmt: mgmt_rx,
                mac_ip: MacIpReceiver {
                    add: mac_ip_add_rx,
                    delete: mac_ip_delete_rx,
                },
            },
        )
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition_for(&self, key: &LearningKey) -> usize {
        partition_index(key.vrf_id, &key.mac, self.partitions.len())
    }

    pub fn send_to_partition(&self, index: usize, request: PartitionRequest) -> Result<()> {
        self.partitions
            .get(index)
            .ok_or(LearningError::ChannelClosed("partition"))?
            .send(request)
    }

    pub fn send_for_key(&self, key: &LearningKey, request: PartitionRequest) -> Result<()> {
        self.send_to_partition(self.partition_for(key), request)
    }

    /// Posts one request per partition, built by `make`.
    pub fn broadcast(&self, mut make: impl FnMut() -> PartitionRequest) -> Result<()> {
        for partition in self.partitions.iter() {
            partition.send(make())?;
        }
        Ok(())
    }

    pub fn send_mgmt(&self, request: MgmtRequest) -> Result<()> {
        self.mgmt
            .send(request)
            .map_err(|_| LearningError::ChannelClosed("mgmt"))
    }

    pub fn send_mac_ip(&self, request: MacIpRequest) -> Result<()> {
        let (tx, name) = match request.queue() {
            QueueKind::Add => (&self.mac_ip.add, "mac-ip add"),
            QueueKind::Resync | QueueKind::Delete => (&self.mac_ip.delete, "mac-ip delete"),
        };
        tx.send(request)
            .map_err(|_| LearningError::ChannelClosed(name))
    }
}
