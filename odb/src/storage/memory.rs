use std::collections::HashMap;

use crate::error::{CResult, Error};
use crate::storage::engine::Storage;
use crate::storage::{Status, StoreReturn};
use crate::types::{id_repr, p64, Oid, Tid, RESOLVED_SERIAL, Z64};

/// Conflict resolver: given the oid, the committed data and the data being
/// stored, returns merged data, or `None` to reject the store.
pub type Resolver = Box<dyn Fn(&Oid, &[u8], &[u8]) -> Option<Vec<u8>> + Send>;

struct Revision {
    tid: Tid,
    data: Vec<u8>,
}

struct InFlight {
    txn: u64,
    tid: Tid,
    /// (oid, version, data) in store order.
    writes: Vec<(Oid, String, Vec<u8>)>,
}

/// A purely in-memory storage engine keeping every revision of every
/// object. Revisions per oid are held in commit order, which makes the
/// historical reads (`load_before`, `load_serial`) simple scans. Tids are
/// allocated from a counter at `tpc_begin`; writes buffer in the in-flight
/// transaction and only land at `tpc_finish`.
pub struct MemoryStorage {
    revs: HashMap<Oid, Vec<Revision>>,
    /// Branch data: version name -> oid -> (serial, data).
    versions: HashMap<String, HashMap<Oid, (Tid, Vec<u8>)>>,
    next_oid: u64,
    next_tid: u64,
    in_flight: Option<InFlight>,
    read_only: bool,
    resolver: Option<Resolver>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage {
            revs: HashMap::new(),
            versions: HashMap::new(),
            next_oid: 1,
            next_tid: 1,
            in_flight: None,
            read_only: false,
            resolver: None,
        }
    }

    pub fn set_read_only(&mut self, yes: bool) {
        self.read_only = yes;
    }

    /// Installs a conflict resolver consulted when a store's previous
    /// serial doesn't match the committed one.
    pub fn set_resolver(&mut self, f: Resolver) {
        self.resolver = Some(f);
    }

    fn committed(&self, oid: &Oid) -> Option<&Revision> {
        self.revs.get(oid).and_then(|chain| chain.last())
    }

    fn in_flight_mut(&mut self, txn: u64) -> CResult<&mut InFlight> {
        match self.in_flight {
            Some(ref mut f) if f.txn == txn => Ok(f),
            Some(_) => Err(Error::Internal(
                "storage is committing another transaction".to_string(),
            )),
            None => Err(Error::Internal(
                "no transaction in progress".to_string(),
            )),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memory")
    }
}

impl Storage for MemoryStorage {
    fn load(&mut self, oid: &Oid, version: &str) -> CResult<(Vec<u8>, Tid)> {
        if !version.is_empty() {
            if let Some((tid, data)) = self.versions.get(version).and_then(|v| v.get(oid)) {
                return Ok((data.clone(), *tid));
            }
        }
        match self.committed(oid) {
            Some(rev) => Ok((rev.data.clone(), rev.tid)),
            None => Err(Error::NotFound(id_repr(oid))),
        }
    }

    fn load_before(
        &mut self,
        oid: &Oid,
        tid: &Tid,
    ) -> CResult<Option<(Vec<u8>, Tid, Option<Tid>)>> {
        let chain = match self.revs.get(oid) {
            Some(chain) => chain,
            None => return Ok(None),
        };
        let at = match chain.iter().rposition(|rev| rev.tid < *tid) {
            Some(at) => at,
            None => return Ok(None),
        };
        let end = chain.get(at + 1).map(|rev| rev.tid);
        Ok(Some((chain[at].data.clone(), chain[at].tid, end)))
    }

    fn load_serial(&mut self, oid: &Oid, tid: &Tid) -> CResult<Vec<u8>> {
        self.revs
            .get(oid)
            .and_then(|chain| chain.iter().find(|rev| rev.tid == *tid))
            .map(|rev| rev.data.clone())
            .ok_or_else(|| Error::NotFound(format!("{} at {}", id_repr(oid), id_repr(tid))))
    }

    fn store(
        &mut self,
        oid: &Oid,
        prev_serial: &Tid,
        data: Vec<u8>,
        version: &str,
        txn: u64,
    ) -> CResult<StoreReturn> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let committed = match self.committed(oid) {
            Some(rev) => rev.tid,
            None => Z64,
        };
        if *prev_serial != committed {
            let old = self
                .committed(oid)
                .map(|rev| rev.data.clone())
                .unwrap_or_default();
            let merged = match &self.resolver {
                Some(resolve) => resolve(oid, &old, &data),
                None => None,
            };
            return match merged {
                Some(merged) => {
                    let flight = self.in_flight_mut(txn)?;
                    flight.writes.push((*oid, version.to_string(), merged));
                    Ok(StoreReturn::One(RESOLVED_SERIAL))
                }
                None => Err(Error::Conflict(*oid)),
            };
        }
        let flight = self.in_flight_mut(txn)?;
        let tid = flight.tid;
        flight.writes.push((*oid, version.to_string(), data));
        Ok(StoreReturn::One(tid))
    }

    fn new_oid(&mut self) -> CResult<Oid> {
        let oid = p64(self.next_oid);
        self.next_oid += 1;
        Ok(oid)
    }

    fn tpc_begin(&mut self, txn: u64) -> CResult<()> {
        match self.in_flight {
            Some(ref f) if f.txn == txn => Ok(()),
            Some(_) => Err(Error::Internal(
                "storage is committing another transaction".to_string(),
            )),
            None => {
                let tid = p64(self.next_tid);
                self.next_tid += 1;
                self.in_flight = Some(InFlight { txn, tid, writes: Vec::new() });
                Ok(())
            }
        }
    }

    fn tpc_finish(&mut self, txn: u64, callback: Option<&mut dyn FnMut(&Tid)>) -> CResult<Tid> {
        self.in_flight_mut(txn)?;
        let flight = match self.in_flight.take() {
            Some(f) => f,
            None => return Err(Error::Internal("no transaction in progress".to_string())),
        };
        let tid = flight.tid;
        for (oid, version, data) in flight.writes {
            if version.is_empty() {
                let chain = self.revs.entry(oid).or_default();
                match chain.last_mut() {
                    // The same oid stored twice in one transaction keeps
                    // one revision, the last write.
                    Some(last) if last.tid == tid => last.data = data,
                    _ => chain.push(Revision { tid, data }),
                }
            } else {
                self.versions
                    .entry(version)
                    .or_default()
                    .insert(oid, (tid, data));
            }
        }
        // The caller still holds this storage's lock, so the callback runs
        // before anyone else can read the new revisions.
        if let Some(cb) = callback {
            cb(&tid);
        }
        Ok(tid)
    }

    fn tpc_abort(&mut self, txn: u64) -> CResult<()> {
        if let Some(ref f) = self.in_flight {
            if f.txn == txn {
                self.in_flight = None;
            }
        }
        Ok(())
    }

    fn sort_key(&self) -> String {
        "memory".to_string()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn size(&self) -> u64 {
        self.revs
            .values()
            .flat_map(|chain| chain.iter())
            .map(|rev| rev.data.len() as u64)
            .sum()
    }

    fn status(&self) -> CResult<Status> {
        Ok(Status {
            name: self.to_string(),
            objects: self.revs.len() as u64,
            revisions: self.revs.values().map(|c| c.len() as u64).sum(),
            size: self.size(),
        })
    }
}
