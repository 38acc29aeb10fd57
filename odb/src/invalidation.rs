//! The invalidation queue.
//!
//! Peer commits are announced to a connection by the database, from
//! whatever thread finished the commit. The connection itself is
//! single-threaded, so this queue is the one piece of per-connection state
//! with a lock of its own. Invalidation is lazy: queuing an oid never
//! touches the cache; the connection consumes the queue when a ghost is
//! loaded and empties it wholesale at transaction boundaries.
//!
//! `txn_time` is the upper bound on revisions this connection should see:
//! it is the tid of the first peer commit since the last flush. Historical
//! (`noncurrent`) reads done under that bound are tracked so the flush can
//! check they were all for oids the connection knew were stale.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::cache::ObjectCache;
use crate::types::{id_repr, Oid, Tid};

#[derive(Default)]
struct State {
    invalidated: HashSet<Oid>,
    txn_time: Option<Tid>,
    noncurrent: HashSet<Oid>,
}

#[derive(Default)]
pub struct InvalidationQueue {
    state: Mutex<State>,
}

impl InvalidationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Writers only insert into sets; poisoned data stays consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues oids rewritten by a peer commit at `tid`. Additive and
    /// idempotent; the first call after a flush pins `txn_time`.
    pub fn invalidate(&self, tid: &Tid, oids: impl IntoIterator<Item = Oid>) {
        let mut state = self.state();
        if state.txn_time.is_none() {
            state.txn_time = Some(*tid);
        }
        state.invalidated.extend(oids);
    }

    pub fn is_invalidated(&self, oid: &Oid) -> bool {
        self.state().invalidated.contains(oid)
    }

    pub fn txn_time(&self) -> Option<Tid> {
        self.state().txn_time
    }

    /// Records that a historical revision is being used for `oid`.
    pub fn note_noncurrent(&self, oid: Oid) {
        self.state().noncurrent.insert(oid);
    }

    /// Drops `oid` from the queue: the object asserted independence from
    /// the peer commit.
    pub fn forget(&self, oid: &Oid) {
        self.state().invalidated.remove(oid);
    }

    pub fn len(&self) -> usize {
        self.state().invalidated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().invalidated.is_empty()
    }

    pub fn noncurrent_contains(&self, oid: &Oid) -> bool {
        self.state().noncurrent.contains(oid)
    }

    /// Drops everything queued without applying it. Only sound when the
    /// cache is being discarded as well.
    pub fn clear(&self) {
        let mut state = self.state();
        state.invalidated.clear();
        state.noncurrent.clear();
        state.txn_time = None;
    }

    /// Applies every queued invalidation to the cache and resets the
    /// queue. Runs under the queue lock so one peer transaction's
    /// invalidations land atomically with respect to incoming ones.
    pub fn flush(&self, cache: &mut ObjectCache) {
        let mut state = self.state();
        for oid in &state.noncurrent {
            assert!(
                state.invalidated.contains(oid),
                "noncurrent oid {} was never invalidated",
                id_repr(oid)
            );
        }
        cache.invalidate(state.invalidated.iter().copied());
        state.invalidated.clear();
        state.noncurrent.clear();
        state.txn_time = None;
    }
}
