//! The database registry.
//!
//! A [`Database`] owns the shared storage and the codec, hands out
//! [`Connection`]s, and fans peer-commit invalidations out to every open
//! connection. Closed connections park their session state (cache and
//! invalidation queue) in a pool; the queue stays registered while parked,
//! so a revived connection starts from a warm cache that only needs its
//! pending invalidations flushed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::cache::ObjectCache;
use crate::codec::{Codec, JsonCodec, RefAllocator};
use crate::connection::{Connection, ConnectionConfig};
use crate::error::{CResult, Error};
use crate::invalidation::InvalidationQueue;
use crate::object::{PObject, StateMap};
use crate::storage::engine::{SharedStorage, Storage};
use crate::storage::Status;
use crate::txn::Transaction;
use crate::types::{Oid, Tid, Z64};

static GLOBAL_RESET_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Causes all connection caches to be discarded as connections are
/// reopened. Used after a code reload: live instances keep running old
/// code until their state is dropped, so bumping the counter makes every
/// connection start from ghosts on its next open.
pub fn reset_caches() {
    GLOBAL_RESET_COUNTER.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn reset_counter() -> u64 {
    GLOBAL_RESET_COUNTER.load(Ordering::SeqCst)
}

/// Session state of a closed connection, waiting to be reopened.
pub(crate) struct Parked {
    pub(crate) conn_id: u64,
    pub(crate) version: String,
    pub(crate) cache: ObjectCache,
    pub(crate) queue: Arc<InvalidationQueue>,
    pub(crate) reset_counter: u64,
}

struct DbInner {
    storage: SharedStorage,
    codec: Arc<dyn Codec>,
    config: ConnectionConfig,
    /// Open and parked connections by id; the values are weak so a
    /// connection dropped without `close()` just falls out of the fan-out.
    queues: Mutex<HashMap<u64, Weak<InvalidationQueue>>>,
    pool: Mutex<Vec<Parked>>,
    /// Which branch an oid was last committed under.
    versions: Mutex<HashMap<Oid, String>>,
}

/// A handle to one database; clones share the registry.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

/// Refuses reference allocation; used only for states known to have no
/// reference edges.
struct NoRefs;

impl RefAllocator for NoRefs {
    fn reserve(&mut self, _obj: &Arc<PObject>) -> CResult<Oid> {
        Err(Error::Internal(
            "unexpected reference in bootstrap state".to_string(),
        ))
    }
}

impl Database {
    /// Opens a database over a storage engine with the default codec and
    /// connection configuration, creating the root object if the storage
    /// is empty.
    pub fn new(storage: impl Storage + 'static) -> CResult<Database> {
        Self::with_codec(storage, Arc::new(JsonCodec::new()))
    }

    pub fn with_codec(storage: impl Storage + 'static, codec: Arc<dyn Codec>) -> CResult<Database> {
        let storage: SharedStorage = Arc::new(Mutex::new(storage));
        let db = Database {
            inner: Arc::new(DbInner {
                storage: storage.clone(),
                codec,
                config: ConnectionConfig::default(),
                queues: Mutex::new(HashMap::new()),
                pool: Mutex::new(Vec::new()),
                versions: Mutex::new(HashMap::new()),
            }),
        };
        db.ensure_root()?;
        storage.lock()?.register_db(&db);
        Ok(db)
    }

    fn ensure_root(&self) -> CResult<()> {
        let mut storage = self.inner.storage.lock()?;
        match storage.load(&Z64, "") {
            Ok(_) => return Ok(()),
            Err(Error::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        log::info!("creating the database root object");
        let root = PObject::new(StateMap::new());
        let data = self.inner.codec.serialize(&root, &mut NoRefs)?;
        let token = Transaction::new().token();
        storage.tpc_begin(token)?;
        storage.store(&Z64, &Z64, data, "", token)?;
        storage.tpc_finish(token, None)?;
        Ok(())
    }

    /// Opens a trunk connection.
    pub fn open(&self) -> CResult<Connection> {
        self.open_version("")
    }

    /// Opens a connection bound to a named branch. Branch connections read
    /// branch data and have multi-version reads disabled.
    pub fn open_version(&self, version: &str) -> CResult<Connection> {
        let mut config = self.inner.config.clone();
        config.version = version.to_string();
        self.open_with(config)
    }

    pub fn open_with(&self, config: ConnectionConfig) -> CResult<Connection> {
        config.validate()?;
        let parked = {
            let mut pool = self.pool();
            pool.iter()
                .position(|p| p.version == config.version)
                .map(|at| pool.remove(at))
        };
        let mut conn = match parked {
            Some(parked) => Connection::revive(config, parked),
            None => Connection::new(config),
        };
        conn.set_db(self)?;
        Ok(conn)
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<u64, Weak<InvalidationQueue>>> {
        self.inner.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pool(&self) -> MutexGuard<'_, Vec<Parked>> {
        self.inner.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register_queue(&self, conn_id: u64, queue: &Arc<InvalidationQueue>) {
        self.queues().insert(conn_id, Arc::downgrade(queue));
    }

    /// Announces a committed transaction to every connection but the
    /// committer. Called from the storage's finish callback, i.e. while
    /// the commit lock is held.
    pub fn invalidate(&self, tid: &Tid, oids: &HashSet<Oid>, source: u64, version: &str) {
        {
            let mut versions = self
                .inner
                .versions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for oid in oids {
                if version.is_empty() {
                    versions.remove(oid);
                } else {
                    versions.insert(*oid, version.to_string());
                }
            }
        }
        self.queues().retain(|id, weak| {
            if *id == source {
                return true;
            }
            match weak.upgrade() {
                Some(queue) => {
                    queue.invalidate(tid, oids.iter().copied());
                    true
                }
                None => false,
            }
        });
    }

    /// The branch an oid was last committed under, if any.
    pub fn modified_in_version(&self, oid: &Oid) -> Option<String> {
        self.inner
            .versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(oid)
            .cloned()
    }

    /// Takes a closed connection's session state into the pool.
    pub(crate) fn close_connection(&self, parked: Parked) {
        self.pool().push(parked);
    }

    pub(crate) fn storage_shared(&self) -> SharedStorage {
        self.inner.storage.clone()
    }

    pub(crate) fn codec(&self) -> Arc<dyn Codec> {
        self.inner.codec.clone()
    }

    pub fn status(&self) -> CResult<Status> {
        self.inner.storage.lock()?.status()
    }
}
