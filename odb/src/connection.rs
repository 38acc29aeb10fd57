//! The per-session connection: an isolated, consistent view of the
//! database.
//!
//! Each connection manages independent copies of stored objects. The root
//! and everything reachable from it belong to the connection that loaded
//! them; object identity is preserved within a connection (two lookups of
//! one oid return the same object) but never across connections. At
//! transaction boundaries the copies are brought back in line with the
//! database.
//!
//!
//! READ ISOLATION
//! ==============
//! Peer commits are delivered as lazy invalidations: a set of stale oids
//! plus the tid of the first commit since the last flush. Already-loaded
//! objects keep their state until the boundary flush ghosts the stale
//! ones. Loading a ghost whose oid is stale is the interesting case:
//!
//! * If the object asserts independence, the current revision is accepted
//!   and the oid leaves the queue.
//! * Otherwise the connection asks the storage for the revision that was
//!   current just before the first peer commit (`load_before`). Reads stay
//!   consistent with everything loaded earlier in the transaction.
//! * If no historical revision is available (or the connection is bound to
//!   a branch, where historical reads don't exist), the load fails with a
//!   read conflict that stays sticky until the transaction ends, so a
//!   commit of that object cannot slip through on a race.
//!
//!
//! TWO-PHASE COMMIT
//! ================
//! The connection is a data manager driven by a transaction coordinator:
//!
//! IDLE --tpc_begin--> ACTIVE --commit*--> ACTIVE --tpc_vote--> VOTED --tpc_finish--> IDLE
//!                        |                                       |
//!                        +---------------tpc_abort---------------+
//!
//! `commit` serializes one registered object plus everything fresh it
//! discovers through reference edges, streaming each to the storage.
//! `tpc_finish` hands the storage a callback that broadcasts the
//! invalidations for this commit; the storage must run it while it still
//! holds its commit lock, so no peer can read updated data before being
//! told to invalidate.
//!
//! Subtransactions buffer commits in a temporary store; the buffered work
//! is promoted into the real storage when the enclosing transaction
//! commits, or dropped wholesale when it aborts.
//!
//! A connection is not thread-safe: the intended model is one connection
//! per thread. The single exception is invalidation delivery, which may
//! come from any thread and only ever touches the locked queue.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::storage::engine::Storage;
use serde_derive::{Deserialize, Serialize};

use crate::cache::ObjectCache;
use crate::codec::{Codec, JsonCodec, RefAllocator, RefResolver, Writer};
use crate::db::{self, Database, Parked};
use crate::error::{CResult, Error};
use crate::invalidation::InvalidationQueue;
use crate::object::{PObject, Phase, StateMap};
use crate::storage::engine::SharedStorage;
use crate::storage::tmp::TmpStore;
use crate::storage::StoreReturn;
use crate::txn::{self, Transaction};
use crate::types::{id_repr, Oid, Tid, RESOLVED_SERIAL, Z64};

static CONN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Connection tuning knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Branch label; empty means trunk.
    pub version: String,

    /// Target number of live (non-ghost) objects in the cache.
    pub cache_size: usize,

    /// How slowly an idle branch cache drains. Branch caches empty out
    /// when the branch goes unused; trunk caches keep their content.
    pub cache_drain_resistance: u32,

    /// Whether stale reads may fall back to historical revisions. Branch
    /// connections always have this off, since historical reads return
    /// trunk data only.
    pub mvcc: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            version: String::new(),
            cache_size: 400,
            cache_drain_resistance: 100,
            mvcc: true,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> CResult<()> {
        if self.cache_size == 0 {
            return Err(Error::Internal("cache_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Resolves decoded references out of the connection's cache, creating
/// ghost shells for oids seen for the first time.
struct CacheRefs<'a> {
    cache: &'a mut ObjectCache,
    conn_id: u64,
}

impl RefResolver for CacheRefs<'_> {
    fn resolve(&mut self, oid: Oid) -> CResult<Arc<PObject>> {
        if let Some(obj) = self.cache.get(&oid) {
            return Ok(obj);
        }
        let ghost = PObject::ghost(oid, self.conn_id, false);
        self.cache.insert(oid, ghost.clone());
        Ok(ghost)
    }
}

/// Hands out oids while serializing: fresh objects get identity and join
/// the commit walk; objects owned elsewhere are refused.
struct CommitRefs<'a> {
    oid_source: &'a SharedStorage,
    conn_id: u64,
    walker: &'a mut Writer,
}

impl RefAllocator for CommitRefs<'_> {
    fn reserve(&mut self, obj: &Arc<PObject>) -> CResult<Oid> {
        if let Some(jar) = obj.jar() {
            if jar != self.conn_id {
                return Err(Error::InvalidObjectReference(obj.describe()));
            }
        }
        if let Some(oid) = obj.oid() {
            return Ok(oid);
        }
        let oid = self.oid_source.lock()?.new_oid()?;
        obj.bind(self.conn_id, oid);
        self.walker.push(obj.clone());
        Ok(oid)
    }
}

type CloseCallback = Box<dyn FnOnce() -> CResult<()> + Send>;

/// A connection to the database, for loading and storing objects.
///
/// Obtained from [`Database::open`]. `root()` is the usual entry point;
/// everything reachable from the root loads lazily through this
/// connection and is committed through the transaction it is registered
/// with.
pub struct Connection {
    id: u64,
    version: String,
    mvcc: bool,
    db: Option<Database>,
    /// The storage taking loads and stores right now; a subtransaction
    /// swaps in a buffer store here.
    storage: Option<SharedStorage>,
    /// The real storage, which keeps allocating oids during
    /// subtransactions.
    oid_source: Option<SharedStorage>,
    sort_key_base: Option<String>,
    /// The real storage, parked while a subtransaction buffer stands in.
    tmp: Option<SharedStorage>,
    tmp_store: Option<Arc<Mutex<TmpStore>>>,
    codec: Arc<dyn Codec>,
    cache: ObjectCache,
    queue: Arc<InvalidationQueue>,
    /// Objects given an oid by `add()`, keyed by that oid, until they are
    /// committed or aborted.
    added: HashMap<Oid, Arc<PObject>>,
    /// Oids stored by the current transaction over an earlier revision.
    modified: Vec<Oid>,
    /// Oids stored by the current transaction for the first time.
    creating: Vec<Oid>,
    /// Oids whose read conflicted; sticky until the transaction ends.
    conflicts: HashSet<Oid>,
    /// While a commit walk runs, objects `add()`ed mid-walk land here and
    /// the walk drains them.
    added_during_commit: Option<Vec<Arc<PObject>>>,
    local_txn: Option<Arc<Transaction>>,
    load_count: u64,
    store_count: u64,
    reset_counter: u64,
    opened: Option<Instant>,
    debug_info: Vec<String>,
    on_close: Vec<CloseCallback>,
}

impl Connection {
    pub(crate) fn new(config: ConnectionConfig) -> Connection {
        let cache = if config.version.is_empty() {
            ObjectCache::new(config.cache_size)
        } else {
            ObjectCache::with_drain_resistance(config.cache_size, config.cache_drain_resistance)
        };
        Self::assemble(
            CONN_COUNTER.fetch_add(1, Ordering::Relaxed),
            config,
            cache,
            Arc::new(InvalidationQueue::new()),
            db::reset_counter(),
        )
    }

    /// Rebuilds a connection around the parked session state of a closed
    /// one. Keeps the old connection id: the objects in the parked cache
    /// still name it as their owner.
    pub(crate) fn revive(config: ConnectionConfig, parked: Parked) -> Connection {
        Self::assemble(
            parked.conn_id,
            config,
            parked.cache,
            parked.queue,
            parked.reset_counter,
        )
    }

    fn assemble(
        id: u64,
        config: ConnectionConfig,
        cache: ObjectCache,
        queue: Arc<InvalidationQueue>,
        reset_counter: u64,
    ) -> Connection {
        let mvcc = config.mvcc && config.version.is_empty();
        Connection {
            id,
            version: config.version,
            mvcc,
            db: None,
            storage: None,
            oid_source: None,
            sort_key_base: None,
            tmp: None,
            tmp_store: None,
            codec: Arc::new(JsonCodec::new()),
            cache,
            queue,
            added: HashMap::new(),
            modified: Vec::new(),
            creating: Vec::new(),
            conflicts: HashSet::new(),
            added_during_commit: None,
            local_txn: None,
            load_count: 0,
            store_count: 0,
            reset_counter,
            opened: None,
            debug_info: Vec::new(),
            on_close: Vec::new(),
        }
    }

    /// Wires the connection to its database: storage shortcuts, codec,
    /// and either a cache reset (after a code reload) or a flush of the
    /// invalidations that accumulated while the connection was parked.
    pub(crate) fn set_db(&mut self, db: &Database) -> CResult<()> {
        self.db = Some(db.clone());
        let storage = db.storage_shared();
        self.sort_key_base = Some(storage.lock()?.sort_key());
        self.oid_source = Some(storage.clone());
        self.storage = Some(storage);
        self.codec = db.codec();
        if self.reset_counter != db::reset_counter() {
            self.reset_cache();
        } else {
            self.flush_invalidations()?;
        }
        db.register_queue(self.id, &self.queue);
        self.opened = Some(Instant::now());
        Ok(())
    }

    fn reset_cache(&mut self) {
        self.reset_counter = db::reset_counter();
        self.queue.clear();
        let target = self.cache.target();
        let resistance = self.cache.drain_resistance();
        self.cache = ObjectCache::with_drain_resistance(target, resistance);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn db(&self) -> Option<Database> {
        self.db.clone()
    }

    fn storage_handle(&self) -> CResult<&SharedStorage> {
        self.storage.as_ref().ok_or(Error::Closed)
    }

    fn new_oid(&self) -> CResult<Oid> {
        let source = self.oid_source.as_ref().ok_or(Error::Closed)?;
        source.lock()?.new_oid()
    }

    /// The transaction this connection registers objects with: the local
    /// one if [`Connection::set_local_transaction`] was called, otherwise
    /// the thread's.
    pub fn transaction(&self) -> Arc<Transaction> {
        match &self.local_txn {
            Some(txn) => txn.clone(),
            None => txn::current(),
        }
    }

    /// Binds this connection to its own transaction instead of the
    /// thread's.
    pub fn set_local_transaction(&mut self) -> Arc<Transaction> {
        self.local_txn.get_or_insert_with(Transaction::new).clone()
    }

    /// Returns the object for `oid`, preserving identity: as long as the
    /// object stays cached, every call returns the same one. Objects not
    /// in the cache come back as ghosts.
    pub fn get(&mut self, oid: Oid) -> CResult<Arc<PObject>> {
        let storage = self.storage_handle()?.clone();
        if let Some(obj) = self.cache.get(&oid) {
            return Ok(obj);
        }
        if let Some(obj) = self.added.get(&oid) {
            return Ok(obj.clone());
        }
        let (data, serial) = storage.lock()?.load(&oid, &self.version)?;
        self.load_count += 1;
        let obj = self.codec.get_ghost(&data)?;
        obj.bind(self.id, oid);
        obj.set_serial(serial);
        self.cache.insert(oid, obj.clone());
        Ok(obj)
    }

    /// The database root object.
    pub fn root(&mut self) -> CResult<Arc<PObject>> {
        self.get(Z64)
    }

    /// Assigns an oid to a fresh object now, before it becomes reachable
    /// from a committed object, and registers it with the current
    /// transaction. Adding an object that is already ours returns its
    /// oid; one owned by another connection is refused.
    pub fn add(&mut self, obj: &Arc<PObject>) -> CResult<Oid> {
        self.storage_handle()?;
        match obj.jar() {
            Some(jar) if jar == self.id => obj
                .oid()
                .ok_or_else(|| Error::Internal("owned object has no oid".to_string())),
            Some(_) => Err(Error::InvalidObjectReference(obj.describe())),
            None => {
                let oid = self.new_oid()?;
                obj.bind(self.id, oid);
                self.added.insert(oid, obj.clone());
                if let Some(pending) = self.added_during_commit.as_mut() {
                    pending.push(obj.clone());
                }
                self.transaction().register(obj);
                Ok(oid)
            }
        }
    }

    /// Registers an object with the current transaction so it is stored
    /// at commit. The object must already be owned by this connection.
    pub fn register(&self, obj: &Arc<PObject>) {
        assert!(
            obj.jar() == Some(self.id),
            "registered object is not owned by this connection"
        );
        if obj.oid().is_none() {
            // Old code binds objects by assigning the owner directly
            // instead of going through add(); tolerated, for now.
            log::warn!("registering an object with no oid; use add()");
        }
        self.transaction().register(obj);
    }

    /// Loads state into a ghost, enforcing read isolation. See the module
    /// docs for the stale-oid cases.
    pub fn setstate(&mut self, obj: &Arc<PObject>) -> CResult<()> {
        let oid = match obj.oid() {
            Some(oid) => oid,
            None => {
                return Err(Error::Internal(
                    "cannot load state for an object without an oid".to_string(),
                ))
            }
        };
        if self.storage.is_none() {
            log::error!(
                "shouldn't load state for {} when the connection is closed",
                id_repr(&oid)
            );
            return Err(Error::Closed);
        }
        match self.load_state(obj, oid) {
            Err(err) => {
                if !matches!(err, Error::ReadConflict(_) | Error::Conflict(_)) {
                    log::error!("couldn't load state for {}: {}", id_repr(&oid), err);
                }
                Err(err)
            }
            ok => ok,
        }
    }

    fn load_state(&mut self, obj: &Arc<PObject>, oid: Oid) -> CResult<()> {
        // Invalidation tests run before and after the load: before, to
        // skip loading a revision we know we can't use; after, because
        // only then is the answer final.
        if self.queue.is_invalidated(&oid) && obj.independent().is_none() {
            return self.load_noncurrent_or_conflict(obj, oid);
        }

        let storage = self.storage_handle()?.clone();
        let (data, serial) = storage.lock()?.load(&oid, &self.version)?;
        self.load_count += 1;

        if self.queue.is_invalidated(&oid) {
            match obj.independent() {
                Some(independent) => {
                    if independent() {
                        self.queue.forget(&oid);
                    } else {
                        self.conflicts.insert(oid);
                        self.transaction().register(obj);
                        return Err(Error::ReadConflict(oid));
                    }
                }
                None => return self.load_noncurrent_or_conflict(obj, oid),
            }
        }

        let mut refs = CacheRefs { cache: &mut self.cache, conn_id: self.id };
        self.codec.set_ghost_state(obj, &data, &mut refs)?;
        obj.set_serial(serial);
        Ok(())
    }

    /// Falls back to the revision current at the read bound, or raises a
    /// sticky read conflict.
    fn load_noncurrent_or_conflict(&mut self, obj: &Arc<PObject>, oid: Oid) -> CResult<()> {
        if self.mvcc && self.setstate_noncurrent(obj, oid)? {
            return Ok(());
        }
        self.transaction().register(obj);
        self.conflicts.insert(oid);
        Err(Error::ReadConflict(oid))
    }

    /// Installs non-current state, if any revision was current at the
    /// read bound. Returns whether state was available.
    fn setstate_noncurrent(&mut self, obj: &Arc<PObject>, oid: Oid) -> CResult<bool> {
        let txn_time = match self.queue.txn_time() {
            Some(t) => t,
            None => return Ok(false),
        };
        let storage = self.storage_handle()?.clone();
        let found = match storage.lock()?.load_before(&oid, &txn_time) {
            Ok(found) => found,
            Err(Error::NotFound(_)) => None,
            Err(err) => return Err(err),
        };
        let (data, start, end) = match found {
            Some(t) => t,
            None => return Ok(false),
        };
        // The revision must have been current at the read bound: written
        // before it, superseded (if at all) at or after it. An object
        // untouched since the bound has no end tid; the bound comes from
        // an invalidation for some one object but bounds every load.
        assert!(
            start < txn_time,
            "historical revision {} not written before the read bound {}",
            id_repr(&start),
            id_repr(&txn_time)
        );
        assert!(
            end.map_or(true, |end| txn_time <= end),
            "historical revision for {} already stale at the read bound",
            id_repr(&oid)
        );
        if end.is_some() {
            self.queue.note_noncurrent(oid);
        }
        let mut refs = CacheRefs { cache: &mut self.cache, conn_id: self.id };
        self.codec.set_ghost_state(obj, &data, &mut refs)?;
        obj.set_serial(start);
        Ok(true)
    }

    /// A decoded copy of the revision of `obj` written by `tid`. The
    /// object itself is left untouched.
    pub fn oldstate(&mut self, obj: &Arc<PObject>, tid: &Tid) -> CResult<StateMap> {
        assert!(
            obj.jar() == Some(self.id),
            "object is not owned by this connection"
        );
        let oid = match obj.oid() {
            Some(oid) => oid,
            None => return Err(Error::Internal("object has no oid".to_string())),
        };
        let storage = self.storage_handle()?.clone();
        let data = storage.lock()?.load_serial(&oid, tid)?;
        let mut refs = CacheRefs { cache: &mut self.cache, conn_id: self.id };
        self.codec.get_state(&data, &mut refs)
    }

    /// Rebinds an oid to a replacement object: the newcomer takes over
    /// the old object's identity and cache slot and will be stored at the
    /// next commit.
    pub fn exchange(&mut self, old: &Arc<PObject>, new: &Arc<PObject>) -> CResult<()> {
        let oid = match old.oid() {
            Some(oid) => oid,
            None => return Err(Error::Internal("exchanged object has no oid".to_string())),
        };
        new.bind(self.id, oid);
        // The newcomer replaces that revision, not a brand-new object.
        new.set_serial(old.serial());
        new.mark_changed();
        self.transaction().register(new);
        self.cache.insert(oid, new.clone());
        Ok(())
    }

    /// Queues oids rewritten by a peer commit at `tid`. Called by the
    /// database from the committer's thread; consumed lazily here.
    pub fn invalidate(&self, tid: &Tid, oids: impl IntoIterator<Item = Oid>) {
        self.queue.invalidate(tid, oids);
    }

    fn flush_invalidations(&mut self) -> CResult<()> {
        self.queue.flush(&mut self.cache);
        // Now is a good time to collect some garbage.
        self.cache.incrgc();
        Ok(())
    }

    /// Orders data managers that share a storage: the storage's key first,
    /// then a per-connection tiebreak.
    pub fn sort_key(&self) -> CResult<String> {
        let base = self.sort_key_base.clone().ok_or(Error::Closed)?;
        Ok(format!("{}:{}", base, self.id))
    }

    pub fn in_subtransaction(&self) -> bool {
        self.tmp.is_some()
    }

    // ---- two-phase commit -------------------------------------------------

    pub fn tpc_begin(&mut self, txn: &Transaction, sub: bool) -> CResult<()> {
        self.modified.clear();
        self.creating.clear();
        if sub && self.tmp.is_none() {
            let real = self.storage_handle()?.clone();
            let mut buffer = TmpStore::new(self.version.clone(), real.clone());
            if let Some(db) = &self.db {
                buffer.register_db(db);
            }
            let buffer = Arc::new(Mutex::new(buffer));
            let shared: SharedStorage = buffer.clone();
            self.tmp = Some(real);
            self.storage = Some(shared);
            self.tmp_store = Some(buffer);
        }
        let storage = self.storage_handle()?.clone();
        let mut guard = storage.lock()?;
        guard.tpc_begin(txn.token())
    }

    /// Commits one registered object: classify it, then serialize and
    /// store it together with every fresh object its state references.
    pub fn commit(&mut self, obj: &Arc<PObject>, txn: &Transaction) -> CResult<()> {
        let initial_oid = obj.oid();
        if let Some(oid) = initial_oid {
            if self.conflicts.contains(&oid) {
                // Re-register, so a retry of this transaction sees the
                // conflict again instead of masking the race.
                self.transaction().register(obj);
                return Err(Error::ReadConflict(oid));
            }
        }

        if initial_oid.is_none() || obj.jar() != Some(self.id) {
            // Brand new; take ownership here.
            let oid = self.new_oid()?;
            obj.bind(self.id, oid);
            self.creating.push(oid);
        } else if let Some(oid) = initial_oid {
            if self.added.contains_key(&oid) {
                self.creating.push(oid);
                self.added.remove(&oid);
            } else if obj.phase() == Phase::Changed {
                if self.queue.is_invalidated(&oid) && !obj.resolvable() {
                    return Err(Error::Conflict(oid));
                }
                self.modified.push(oid);
            } else {
                // Nothing to do.
                return Ok(());
            }
        }

        self.added_during_commit = Some(Vec::new());
        let result = self.commit_walk(obj, txn);
        self.added_during_commit = None;
        result
    }

    fn commit_walk(&mut self, seed: &Arc<PObject>, txn: &Transaction) -> CResult<()> {
        let storage = self.storage_handle()?.clone();
        let oid_source = self.oid_source.clone().ok_or(Error::Closed)?;
        let mut walker = Writer::new(seed.clone());
        loop {
            if let Some(pending) = self.added_during_commit.as_mut() {
                for obj in pending.drain(..) {
                    walker.push(obj);
                }
            }
            let obj = match walker.next() {
                Some(obj) => obj,
                None => break,
            };
            let oid = match obj.oid() {
                Some(oid) => oid,
                None => return Err(Error::Internal("walked object has no oid".to_string())),
            };
            let serial = obj.serial();
            if serial == Z64 {
                // First revision of this object.
                self.creating.push(oid);
                self.added.remove(&oid);
            } else {
                if self.queue.is_invalidated(&oid) && !obj.resolvable() {
                    return Err(Error::Conflict(oid));
                }
                self.modified.push(oid);
            }

            let data = {
                let mut refs = CommitRefs {
                    oid_source: &oid_source,
                    conn_id: self.id,
                    walker: &mut walker,
                };
                self.codec.serialize(&obj, &mut refs)?
            };
            let ret = storage
                .lock()?
                .store(&oid, &serial, data, &self.version, txn.token())?;
            self.store_count += 1;
            // Cache before handling the return, in case it carries the
            // serial for a newly created object.
            let resident = self.codec.unwrap_for_cache(&obj);
            self.cache.insert(oid, resident);
            self.handle_serial(ret, Some(oid), true)?;
        }
        Ok(())
    }

    /// Routes what `store()` and `tpc_vote()` reported back onto the
    /// affected objects.
    fn handle_serial(&mut self, ret: StoreReturn, oid: Option<Oid>, change: bool) -> CResult<()> {
        match ret {
            StoreReturn::Nothing => Ok(()),
            StoreReturn::One(serial) => {
                let oid = oid.ok_or_else(|| {
                    Error::Internal("storage answered with a serial but no oid".to_string())
                })?;
                self.handle_one_serial(oid, serial, change);
                Ok(())
            }
            StoreReturn::Many(pairs) => {
                for (oid, serial) in pairs {
                    self.handle_one_serial(oid, serial, change);
                }
                Ok(())
            }
            StoreReturn::Fail(err) => Err(err),
        }
    }

    fn handle_one_serial(&mut self, oid: Oid, serial: Tid, change: bool) {
        let obj = match self.cache.peek(&oid) {
            Some(obj) => obj,
            None => return,
        };
        if serial == RESOLVED_SERIAL {
            // The storage merged concurrent changes; what we hold no
            // longer matches it. Ghost, so the next touch reloads.
            obj.ghostify();
        } else {
            if change {
                obj.mark_saved();
            }
            obj.set_serial(serial);
        }
    }

    pub fn tpc_vote(&mut self, txn: &Transaction) -> CResult<()> {
        let storage = self.storage_handle()?.clone();
        let ret = storage.lock()?.tpc_vote(txn.token())?;
        self.handle_serial(ret, None, true)
    }

    /// Second phase: make the commit visible. Outside a subtransaction
    /// the storage gets a callback that broadcasts this commit's
    /// invalidations to peer connections; the storage runs it under its
    /// commit lock, so no peer reads new data before hearing about it.
    pub fn tpc_finish(&mut self, txn: &Transaction) -> CResult<Tid> {
        let tid = if self.tmp.is_some() {
            // A subtransaction finished: nothing to invalidate yet.
            let buffer = match self.tmp_store.clone() {
                Some(buffer) => buffer,
                None => {
                    return Err(Error::Internal(
                        "subtransaction state out of sync".to_string(),
                    ))
                }
            };
            let mut guard = buffer.lock()?;
            guard.tpc_finish(txn.token(), None)?;
            guard.prepend_creating(mem::take(&mut self.creating));
            Z64
        } else {
            let storage = self.storage_handle()?.clone();
            let db = self.db.clone();
            // The broadcast covers creations as well as modifications.
            let announced: HashSet<Oid> = self
                .modified
                .iter()
                .chain(self.creating.iter())
                .copied()
                .collect();
            let source = self.id;
            let version = self.version.clone();
            let mut callback = |tid: &Tid| {
                if let Some(db) = &db {
                    db.invalidate(tid, &announced, source, &version);
                }
            };
            let tid = storage.lock()?.tpc_finish(txn.token(), Some(&mut callback))?;
            self.modified.clear();
            self.creating.clear();
            tid
        };
        self.conflicts.clear();
        self.flush_invalidations()?;
        Ok(tid)
    }

    pub fn tpc_abort(&mut self, txn: &Transaction) -> CResult<()> {
        let storage = self.storage_handle()?.clone();
        storage.lock()?.tpc_abort(txn.token())?;
        let modified = mem::take(&mut self.modified);
        self.cache.invalidate(modified);
        self.flush_invalidations()?;
        self.conflicts.clear();
        self.invalidate_creating(None);
        let added: Vec<Arc<PObject>> = self.added.drain().map(|(_, obj)| obj).collect();
        for obj in added {
            obj.clear_identity();
        }
        Ok(())
    }

    /// Aborts one registered object: an uncommitted addition is disowned,
    /// anything else is ghosted so its next touch reloads.
    pub fn abort_object(&mut self, obj: &Arc<PObject>) -> CResult<()> {
        let oid = match obj.oid() {
            Some(oid) => oid,
            None => return Err(Error::Internal("aborted object has no oid".to_string())),
        };
        if self.added.remove(&oid).is_some() {
            obj.clear_identity();
        } else {
            self.cache.invalidate_one(&oid);
        }
        Ok(())
    }

    /// Promotes all buffered subtransaction work into the real storage,
    /// which must already be in its first commit phase by the time the
    /// coordinator gets here.
    pub fn commit_sub(&mut self, txn: &Transaction) -> CResult<()> {
        let real = match self.tmp.take() {
            Some(storage) => storage,
            None => return Ok(()),
        };
        let buffer = match self.tmp_store.take() {
            Some(buffer) => buffer,
            None => {
                return Err(Error::Internal(
                    "subtransaction state out of sync".to_string(),
                ))
            }
        };
        self.storage = Some(real.clone());

        log::debug!(
            "committing subtransaction of size {}",
            buffer.lock()?.size()
        );
        real.lock()?.tpc_begin(txn.token())?;

        let (oids, buffered_creating) = {
            let mut guard = buffer.lock()?;
            (guard.oids(), guard.take_creating())
        };
        self.modified.extend(oids.iter().copied());
        self.creating.extend(buffered_creating);

        for oid in oids {
            let (data, serial) = buffer.lock()?.load(&oid, &self.version)?;
            let ret = real
                .lock()?
                .store(&oid, &serial, data, &self.version, txn.token())?;
            // The subtransaction already settled the change flags.
            self.handle_serial(ret, Some(oid), false)?;
        }
        Ok(())
    }

    /// Drops all buffered subtransaction work.
    pub fn abort_sub(&mut self, _txn: &Transaction) -> CResult<()> {
        let real = match self.tmp.take() {
            Some(storage) => storage,
            None => return Ok(()),
        };
        let buffer = match self.tmp_store.take() {
            Some(buffer) => buffer,
            None => {
                return Err(Error::Internal(
                    "subtransaction state out of sync".to_string(),
                ))
            }
        };
        self.storage = Some(real);
        let (oids, buffered_creating) = {
            let mut guard = buffer.lock()?;
            (guard.oids(), guard.take_creating())
        };
        self.cache.invalidate(oids);
        self.invalidate_creating(Some(buffered_creating));
        Ok(())
    }

    /// Disowns objects saved for the first time by a transaction that is
    /// going away: out of the cache, identity dropped, so they read as
    /// fresh unsaved objects again.
    fn invalidate_creating(&mut self, creating: Option<Vec<Oid>>) {
        let list = match creating {
            Some(list) => list,
            None => mem::take(&mut self.creating),
        };
        for oid in list {
            if let Some(obj) = self.cache.remove(&oid) {
                obj.clear_identity();
            }
        }
    }

    // ---- lifecycle --------------------------------------------------------

    /// Registers a callable to run at most once, the next time this
    /// connection is closed.
    pub fn on_close_callback(&mut self, f: impl FnOnce() -> CResult<()> + Send + 'static) {
        self.on_close.push(Box::new(f));
    }

    /// Closes the connection. Cached objects are not freed: the session
    /// state is parked with the database and the next open of the same
    /// version picks up the warm cache.
    pub fn close(&mut self) -> CResult<()> {
        // A good time to do some garbage collection.
        self.cache.incrgc();
        for callback in self.on_close.drain(..) {
            if let Err(err) = callback() {
                log::error!("close callback failed: {}", err);
            }
        }
        self.storage = None;
        self.oid_source = None;
        self.sort_key_base = None;
        self.tmp = None;
        self.tmp_store = None;
        self.opened = None;
        self.debug_info.clear();
        if let Some(db) = self.db.take() {
            let target = self.cache.target().max(1);
            let cache = mem::replace(&mut self.cache, ObjectCache::new(target));
            db.close_connection(Parked {
                conn_id: self.id,
                version: self.version.clone(),
                cache,
                queue: self.queue.clone(),
                reset_counter: self.reset_counter,
            });
        }
        Ok(())
    }

    /// Processes pending invalidations outside any transaction: aborts
    /// the current one, lets a client storage catch up, and flushes.
    pub fn sync(&mut self) -> CResult<()> {
        let txn = self.transaction();
        txn.abort(self)?;
        let storage = self.storage_handle()?.clone();
        storage.lock()?.sync()?;
        self.flush_invalidations()
    }

    pub fn is_read_only(&self) -> CResult<bool> {
        let storage = self.storage_handle()?.clone();
        let read_only = storage.lock()?.is_read_only();
        Ok(read_only)
    }

    /// The branch this connection reads; empty for trunk.
    pub fn version(&self) -> CResult<&str> {
        self.storage_handle()?;
        Ok(&self.version)
    }

    /// The branch an oid was last committed under; this connection's own
    /// branch when the database doesn't know better.
    pub fn modified_in_version(&self, oid: &Oid) -> CResult<String> {
        let db = self.db.as_ref().ok_or(Error::Closed)?;
        Ok(db
            .modified_in_version(oid)
            .unwrap_or_else(|| self.version.clone()))
    }

    // ---- cache management and introspection -------------------------------

    /// One incremental cache garbage-collection pass.
    pub fn cache_gc(&mut self) {
        self.cache.incrgc();
    }

    /// Ghosts every clean cached object. The age argument is historical
    /// and ignored.
    pub fn cache_minimize(&mut self, dt: Option<u64>) {
        if dt.is_some() {
            log::warn!("the dt argument to cache_minimize is ignored");
        }
        self.cache.minimize();
    }

    /// Deprecated name for a total cache sweep; use
    /// [`Connection::cache_minimize`].
    pub fn cache_full_sweep(&mut self, dt: u64) {
        log::warn!("cache_full_sweep is deprecated, use cache_minimize");
        self.cache.full_sweep(dt);
    }

    /// Debug view of the cache: ghosts first, then live objects in
    /// least-recently-used order.
    pub fn cache_items(&self) -> Vec<(Oid, Arc<PObject>)> {
        let (ghosts, live): (Vec<_>, Vec<_>) = self
            .cache
            .lru_items()
            .into_iter()
            .partition(|(_, obj)| obj.is_ghost());
        ghosts.into_iter().chain(live).collect()
    }

    /// Objects loaded and stored over this connection's lifetime; pass
    /// `clear` to reset the counters.
    pub fn transfer_counts(&mut self, clear: bool) -> (u64, u64) {
        let counts = (self.load_count, self.store_count);
        if clear {
            self.load_count = 0;
            self.store_count = 0;
        }
        counts
    }

    /// When this connection was (re)opened, if it is open.
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened
    }

    pub fn debug_info(&self) -> &[String] {
        &self.debug_info
    }

    pub fn set_debug_info(&mut self, info: impl IntoIterator<Item = String>) {
        self.debug_info.extend(info);
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.version.is_empty() {
            write!(f, "<Connection {}>", self.id)
        } else {
            write!(f, "<Connection {} (in version {:?})>", self.id, self.version)
        }
    }
}

#[cfg(test)]
impl Connection {
    pub(crate) fn test_queue(&self) -> &Arc<InvalidationQueue> {
        &self.queue
    }

    pub(crate) fn test_added_len(&self) -> usize {
        self.added.len()
    }

    pub(crate) fn test_creating(&self) -> &[Oid] {
        &self.creating
    }

    pub(crate) fn test_modified(&self) -> &[Oid] {
        &self.modified
    }

    pub(crate) fn test_has_conflict(&self, oid: &Oid) -> bool {
        self.conflicts.contains(oid)
    }

    pub(crate) fn test_cached(&self, oid: &Oid) -> Option<Arc<PObject>> {
        self.cache.peek(oid)
    }
}
