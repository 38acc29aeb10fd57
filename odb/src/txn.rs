//! The transaction coordinator.
//!
//! A [`Transaction`] collects the objects registered as modified and
//! drives a connection through the two-phase commit in the right order:
//!
//! ```text
//! tpc_begin -> commit(obj)* -> [commit_sub] -> tpc_vote -> tpc_finish
//!                                  |
//!                                  +--------- tpc_abort (on any error)
//! ```
//!
//! The usual arrangement is one transaction per thread, fetched with
//! [`current`]; a connection can opt into a private one instead with
//! `set_local_transaction`.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connection::Connection;
use crate::error::CResult;
use crate::object::PObject;
use crate::types::Tid;

static TXN_COUNTER: AtomicU64 = AtomicU64::new(1);

pub struct Transaction {
    /// Token identifying this transaction to storages.
    token: u64,
    registered: Mutex<Vec<Arc<PObject>>>,
}

impl Transaction {
    pub fn new() -> Arc<Transaction> {
        Arc::new(Transaction {
            token: TXN_COUNTER.fetch_add(1, Ordering::Relaxed),
            registered: Mutex::new(Vec::new()),
        })
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    fn list(&self) -> MutexGuard<'_, Vec<Arc<PObject>>> {
        self.registered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Joins an object to this transaction; it will be committed (or
    /// aborted) with it. Registering twice is a no-op.
    pub fn register(&self, obj: &Arc<PObject>) {
        let mut list = self.list();
        if !list.iter().any(|o| Arc::ptr_eq(o, obj)) {
            list.push(obj.clone());
        }
    }

    pub fn registered(&self) -> Vec<Arc<PObject>> {
        self.list().clone()
    }

    pub fn clear(&self) {
        self.list().clear();
    }

    /// Commits everything registered through `conn`, promoting pending
    /// subtransaction work along the way. On failure the transaction is
    /// rolled back and the error returned for the caller to retry or give
    /// up on.
    pub fn commit(&self, conn: &mut Connection) -> CResult<Tid> {
        match self.drive(conn, false) {
            Ok(tid) => {
                self.clear();
                Ok(tid)
            }
            Err(err) => {
                if let Err(abort_err) = conn.tpc_abort(self) {
                    log::error!("rollback after failed commit also failed: {}", abort_err);
                }
                Err(err)
            }
        }
    }

    /// Commits everything registered into the connection's subtransaction
    /// buffer. The work only reaches the real storage when the enclosing
    /// transaction commits.
    pub fn commit_subtransaction(&self, conn: &mut Connection) -> CResult<()> {
        match self.drive(conn, true) {
            Ok(_) => {
                self.clear();
                Ok(())
            }
            Err(err) => {
                if let Err(abort_err) = conn.tpc_abort(self) {
                    log::error!("rollback after failed commit also failed: {}", abort_err);
                }
                Err(err)
            }
        }
    }

    fn drive(&self, conn: &mut Connection, sub: bool) -> CResult<Tid> {
        conn.tpc_begin(self, sub)?;
        for obj in self.registered() {
            conn.commit(&obj, self)?;
        }
        if !sub && conn.in_subtransaction() {
            conn.commit_sub(self)?;
        }
        conn.tpc_vote(self)?;
        conn.tpc_finish(self)
    }

    /// Undoes everything registered: added objects are disowned, modified
    /// ones ghosted so their next touch reloads committed state.
    pub fn abort(&self, conn: &mut Connection) -> CResult<()> {
        for obj in self.registered() {
            conn.abort_object(&obj)?;
        }
        conn.abort_sub(self)?;
        conn.tpc_abort(self)?;
        self.clear();
        Ok(())
    }
}

thread_local! {
    static AMBIENT: RefCell<Option<Arc<Transaction>>> = RefCell::new(None);
}

/// The thread's current transaction, created on first use. It stays
/// current after a commit or abort (emptied), matching the
/// transaction-per-thread model.
pub fn current() -> Arc<Transaction> {
    AMBIENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        match &*slot {
            Some(txn) => txn.clone(),
            None => {
                let txn = Transaction::new();
                *slot = Some(txn.clone());
                txn
            }
        }
    })
}
