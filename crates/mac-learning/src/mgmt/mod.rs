//! Management dependency tracking.
//!
//! The tracker keeps, for every external object a learned entry relies on
//! (interface, VRF, VN, health-check service, backbone route), the set of
//! entries depending on it. Database changes are fanned out as resyncs,
//! database deletes as entry deletes. Tracked objects are released lazily
//! once nothing depends on them any more.

mod db_entry;
mod tracker;

pub use db_entry::{MgmtDbEntry, MgmtDbKind, MgmtTree};
pub use tracker::{MgmtListener, MgmtTracker, MgmtWorker};

use crate::entry::{Dependencies, EntryId};
use crate::key::{LearningKey, MacIpKey};
use crate::oper_db::DbEvent;
use crate::snapshot::MgmtStats;
use std::fmt;
use tokio::sync::oneshot;

/// A learned entry as seen by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryRef {
    Mac(LearningKey),
    MacIp(MacIpKey),
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryRef::Mac(key) => write!(f, "mac {key}"),
            EntryRef::MacIp(key) => write!(f, "mac-ip {key}"),
        }
    }
}

#[derive(Debug)]
pub enum MgmtRequest {
    /// Database change notification.
    Db(DbEvent),
    /// An entry was added or resynced; `deps` are its current dependencies.
    /// Deletes cascaded to the entry carry `id`, so they cannot hit a later
    /// instance under the same key.
    AddEntry {
        entry: EntryRef,
        id: Option<EntryId>,
        deps: Dependencies,
    },
    /// An entry was deleted.
    DeleteEntry { entry: EntryRef },
    Stats(oneshot::Sender<MgmtStats>),
}
