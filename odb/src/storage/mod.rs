pub mod engine;
pub mod memory;
pub mod tmp;

use serde_derive::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{Oid, Tid};

/// What a storage reports back from `store()` and `tpc_vote()`.
///
/// Synchronous engines answer each store with the serial it assigned.
/// Engines that batch their answers (a network storage acknowledging at
/// vote time) return pairs instead, and may return an error payload that
/// the connection re-raises without touching object metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StoreReturn {
    Nothing,
    /// The serial for the oid that was just stored.
    One(Tid),
    /// Serials for a batch of earlier stores.
    Many(Vec<(Oid, Tid)>),
    Fail(Error),
}

/// A storage status report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,

    /// The number of objects with at least one revision.
    pub objects: u64,

    /// The total number of revisions kept.
    pub revisions: u64,

    /// The logical size of all revision data.
    pub size: u64,
}
