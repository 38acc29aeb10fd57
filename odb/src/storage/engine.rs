use std::sync::{Arc, Mutex};

use crate::db::Database;
use crate::error::CResult;
use crate::storage::{Status, StoreReturn};
use crate::types::{Oid, Tid};

/// An object storage engine: revisions of serialized object state, keyed
/// by oid, written through a two-phase commit.
///
/// One storage is shared by every connection of a database, behind a mutex
/// that doubles as the commit lock: `tpc_finish` runs to completion --
/// including the invalidation callback -- before any other connection can
/// load, so nobody reads a new revision they haven't been told to
/// invalidate.
pub trait Storage: std::fmt::Display + Send {
    /// Loads the current revision of an object: its data and serial.
    /// A non-empty `version` reads that branch, falling back to trunk.
    fn load(&mut self, oid: &Oid, version: &str) -> CResult<(Vec<u8>, Tid)>;

    /// Loads the revision that was current just before `tid`: its data,
    /// the tid that wrote it, and the tid that superseded it (none if it
    /// is still current). Returns `None` when no such revision exists.
    fn load_before(&mut self, oid: &Oid, tid: &Tid)
        -> CResult<Option<(Vec<u8>, Tid, Option<Tid>)>>;

    /// Loads the exact revision written by `tid`.
    fn load_serial(&mut self, oid: &Oid, tid: &Tid) -> CResult<Vec<u8>>;

    /// Stores object data within the in-progress transaction.
    /// `prev_serial` is the revision the writer based its change on; a
    /// mismatch with the committed serial is a write conflict, which the
    /// engine may resolve itself (reporting [`crate::types::RESOLVED_SERIAL`])
    /// or reject.
    fn store(
        &mut self,
        oid: &Oid,
        prev_serial: &Tid,
        data: Vec<u8>,
        version: &str,
        txn: u64,
    ) -> CResult<StoreReturn>;

    /// Allocates a fresh oid.
    fn new_oid(&mut self) -> CResult<Oid>;

    fn tpc_begin(&mut self, txn: u64) -> CResult<()>;

    /// Engines without a vote step inherit the default.
    fn tpc_vote(&mut self, _txn: u64) -> CResult<StoreReturn> {
        Ok(StoreReturn::Nothing)
    }

    /// Makes the transaction's writes visible and returns its tid. The
    /// callback, when given, MUST be invoked with the new tid before the
    /// commit lock is released.
    fn tpc_finish(&mut self, txn: u64, callback: Option<&mut dyn FnMut(&Tid)>) -> CResult<Tid>;

    fn tpc_abort(&mut self, txn: u64) -> CResult<()>;

    /// Stable key ordering data managers that share this storage.
    fn sort_key(&self) -> String;

    fn is_read_only(&self) -> bool {
        false
    }

    /// Brings a client storage up to date; a no-op for local engines.
    fn sync(&mut self) -> CResult<()> {
        Ok(())
    }

    /// Logical size of the stored data.
    fn size(&self) -> u64;

    fn status(&self) -> CResult<Status>;

    /// Gives the storage a handle to the database it serves. Engines that
    /// push invalidations of their own keep it; the rest ignore it.
    fn register_db(&mut self, _db: &Database) {}
}

/// Handle under which connections and the database share one engine.
pub type SharedStorage = Arc<Mutex<dyn Storage>>;
