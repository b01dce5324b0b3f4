//! vRouter agent MAC learning.
//!
//! Turns "unknown source MAC" packet traps into programmed bridge routes,
//! keeps them consistent with the interfaces, VRFs, virtual networks and
//! health-check services they depend on, ages out idle bindings and
//! throttles route programming with token pools.
//!
//! # Architecture
//!
//! ```text
//! traps ──> [MacLearningProto] ──hash(vrf, mac)──> [LearningPartition 0..N]
//!                 │                                   add │ resync │ delete
//!                 │ (src ip, VN learns IPs)                 │
//!                 └──────────> [MacIpLearningTable]         │
//!                                      ▲                    ▼
//! [OperDb] ──events──> [MgmtTracker] ──┴── resync/delete ───┘
//! ```
//!
//! - [`MacLearningProto`]: routes traps and owns the shared [`TokenPools`]
//! - [`partition`]: one shard per worker task, with an aging sweep
//! - [`mgmt`]: reverse dependencies from database objects to entries
//! - [`mac_ip`]: IP-keyed bindings with liveness probing
//! - [`sim`]: in-memory collaborators for tests and the daemon
//!
//! Everything runs on tokio; [`MacLearningService::spawn`] must be called
//! from within a runtime.

pub mod aging;
pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod key;
pub mod mac_ip;
pub mod mgmt;
pub mod oper_db;
pub mod packet;
pub mod partition;
pub mod proto;
pub mod queue;
pub mod sim;
pub mod snapshot;
pub mod token;

pub use config::LearningConfig;
pub use context::{AgentContext, ForwardingTable, HealthCheckApi, PacketCounters};
pub use entry::{EntryId, EntryKind, LearningEntry, LearningEntryOps};
pub use error::{LearningError, Result};
pub use key::{LearningKey, MacIpKey};
pub use mac_ip::{MacIpLearningEntry, MacIpLearningHandle};
pub use oper_db::OperDb;
pub use packet::PacketTrap;
pub use proto::{MacLearningProto, MacLearningService};
pub use snapshot::{LearningStats, SnapshotPage, SnapshotQuery};
pub use token::{Token, TokenPool, TokenPoolKind, TokenPools};
