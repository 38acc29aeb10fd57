use std::collections::HashMap;

use crate::error::{CResult, Error};
use crate::storage::engine::{SharedStorage, Storage};
use crate::storage::{Status, StoreReturn};
use crate::types::{Oid, Tid, Z64};

/// The subtransaction buffer.
///
/// While a connection is inside a subtransaction, a `TmpStore` stands in
/// for the real storage: stores accumulate here, loads answer from the
/// buffer and read through to the saved base storage for everything else.
/// `store` echoes the previous serial it was given, so objects keep their
/// pre-subtransaction serials and the eventual promotion into the real
/// storage passes the right conflict-detection baseline.
pub struct TmpStore {
    version: String,
    base: SharedStorage,
    /// Writes made visible by a subtransaction finish: oid -> (serial, data).
    index: HashMap<Oid, (Tid, Vec<u8>)>,
    /// Index insertion order; keeps promotion deterministic.
    order: Vec<Oid>,
    /// Writes of the subtransaction in progress.
    pending: Vec<(Oid, Tid, Vec<u8>)>,
    /// Oids created under this buffer; the connection prepends its own
    /// creations at each subtransaction finish and takes the lot back when
    /// it promotes or aborts.
    creating: Vec<Oid>,
}

impl TmpStore {
    pub fn new(version: String, base: SharedStorage) -> Self {
        TmpStore {
            version,
            base,
            index: HashMap::new(),
            order: Vec::new(),
            pending: Vec::new(),
            creating: Vec::new(),
        }
    }

    /// Buffered oids, oldest first.
    pub fn oids(&self) -> Vec<Oid> {
        self.order.clone()
    }

    pub fn prepend_creating(&mut self, mut oids: Vec<Oid>) {
        oids.extend(self.creating.drain(..));
        self.creating = oids;
    }

    pub fn take_creating(&mut self) -> Vec<Oid> {
        std::mem::take(&mut self.creating)
    }
}

impl std::fmt::Display for TmpStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tmp")
    }
}

impl Storage for TmpStore {
    fn load(&mut self, oid: &Oid, version: &str) -> CResult<(Vec<u8>, Tid)> {
        if let Some((serial, data)) = self.index.get(oid) {
            return Ok((data.clone(), *serial));
        }
        self.base.lock()?.load(oid, version)
    }

    fn load_before(
        &mut self,
        oid: &Oid,
        tid: &Tid,
    ) -> CResult<Option<(Vec<u8>, Tid, Option<Tid>)>> {
        self.base.lock()?.load_before(oid, tid)
    }

    fn load_serial(&mut self, oid: &Oid, tid: &Tid) -> CResult<Vec<u8>> {
        self.base.lock()?.load_serial(oid, tid)
    }

    fn store(
        &mut self,
        oid: &Oid,
        prev_serial: &Tid,
        data: Vec<u8>,
        version: &str,
        _txn: u64,
    ) -> CResult<StoreReturn> {
        if version != self.version {
            return Err(Error::Internal(format!(
                "subtransaction buffer is bound to version {:?}, not {:?}",
                self.version, version
            )));
        }
        self.pending.push((*oid, *prev_serial, data));
        Ok(StoreReturn::One(*prev_serial))
    }

    fn new_oid(&mut self) -> CResult<Oid> {
        self.base.lock()?.new_oid()
    }

    fn tpc_begin(&mut self, _txn: u64) -> CResult<()> {
        Ok(())
    }

    fn tpc_finish(&mut self, _txn: u64, _callback: Option<&mut dyn FnMut(&Tid)>) -> CResult<Tid> {
        for (oid, serial, data) in self.pending.drain(..) {
            if self.index.insert(oid, (serial, data)).is_none() {
                self.order.push(oid);
            }
        }
        Ok(Z64)
    }

    fn tpc_abort(&mut self, _txn: u64) -> CResult<()> {
        self.pending.clear();
        Ok(())
    }

    fn sort_key(&self) -> String {
        "tmp".to_string()
    }

    fn size(&self) -> u64 {
        let indexed: u64 = self.index.values().map(|(_, data)| data.len() as u64).sum();
        let pending: u64 = self.pending.iter().map(|(_, _, data)| data.len() as u64).sum();
        indexed + pending
    }

    fn status(&self) -> CResult<Status> {
        Ok(Status {
            name: self.to_string(),
            objects: self.index.len() as u64,
            revisions: (self.index.len() + self.pending.len()) as u64,
            size: self.size(),
        })
    }
}
