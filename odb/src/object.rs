//! The persistent object model.
//!
//! A [`PObject`] is the in-memory face of one database object. Its mutable
//! core (identity, revision, lifecycle phase, state) sits behind a mutex so
//! an `Arc<PObject>` can be shared between the application, the cache and
//! the connection without any of them owning the others.
//!
//! The lifecycle phase is a tri-state:
//!
//! * `Ghost` -- the object is known by identity only; its state was never
//!   loaded, or was dropped by a cache sweep or an invalidation.
//! * `Saved` -- state is loaded and matches the revision named by the
//!   object's serial.
//! * `Changed` -- state is loaded and modified; the object must be stored
//!   at the next commit.
//!
//! The jar back-pointer is the id of the owning connection, not a
//! reference, so dropping a connection never has to walk object graphs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{CResult, Error};
use crate::types::{id_repr, Oid, Tid, Z64};

/// Lifecycle phase of a persistent object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Ghost,
    Saved,
    Changed,
}

/// Optional predicate announcing that the object's state does not depend on
/// state a concurrent transaction may have rewritten. Consulted by the
/// connection before raising a read conflict.
pub type IndependentFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Object state: named fields holding values.
pub type StateMap = BTreeMap<String, Value>;

/// A state value. `Ref` edges hold real references to other persistent
/// objects; the codec turns them into oids on the way to the storage and
/// resolves them back through the connection's cache on the way in.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Ref(Arc<PObject>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            // References compare by object identity.
            (Value::Ref(a), Value::Ref(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Text(s) => write!(f, "Text({:?})", s),
            Value::List(l) => f.debug_tuple("List").field(l).finish(),
            Value::Map(m) => f.debug_tuple("Map").field(m).finish(),
            Value::Ref(o) => write!(f, "Ref({})", o.describe()),
        }
    }
}

struct Core {
    oid: Option<Oid>,
    /// Id of the owning connection, if any.
    jar: Option<u64>,
    /// Tid of the revision currently represented in memory; `Z64` until the
    /// object has been committed once.
    serial: Tid,
    phase: Phase,
    /// Whether the storage may resolve write conflicts for this object.
    resolvable: bool,
    state: Option<StateMap>,
}

/// A persistent object.
pub struct PObject {
    core: Mutex<Core>,
    independent: Option<IndependentFn>,
}

impl PObject {
    /// Creates a fresh, unsaved object with the given state. It has no oid
    /// and no owning connection until it is `add()`ed or reached from a
    /// committed object.
    pub fn new(state: StateMap) -> Arc<Self> {
        Arc::new(PObject {
            core: Mutex::new(Core {
                oid: None,
                jar: None,
                serial: Z64,
                phase: Phase::Changed,
                resolvable: false,
                state: Some(state),
            }),
            independent: None,
        })
    }

    /// Like [`PObject::new`], with an independence predicate attached.
    pub fn with_independent(
        state: StateMap,
        f: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(PObject {
            core: Mutex::new(Core {
                oid: None,
                jar: None,
                serial: Z64,
                phase: Phase::Changed,
                resolvable: false,
                state: Some(state),
            }),
            independent: Some(Arc::new(f)),
        })
    }

    /// Builds a stateless shell for a known oid: identity without state.
    pub(crate) fn ghost(oid: Oid, jar: u64, resolvable: bool) -> Arc<Self> {
        Arc::new(PObject {
            core: Mutex::new(Core {
                oid: Some(oid),
                jar: Some(jar),
                serial: Z64,
                phase: Phase::Ghost,
                resolvable,
                state: None,
            }),
            independent: None,
        })
    }

    /// Builds an unbound ghost shell; the connection stamps identity and
    /// serial after decoding.
    pub(crate) fn shell(resolvable: bool) -> Arc<Self> {
        Arc::new(PObject {
            core: Mutex::new(Core {
                oid: None,
                jar: None,
                serial: Z64,
                phase: Phase::Ghost,
                resolvable,
                state: None,
            }),
            independent: None,
        })
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        // A poisoned object mutex only means another thread panicked while
        // holding it; the data itself stays usable.
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn oid(&self) -> Option<Oid> {
        self.core().oid
    }

    pub fn jar(&self) -> Option<u64> {
        self.core().jar
    }

    pub fn serial(&self) -> Tid {
        self.core().serial
    }

    pub fn phase(&self) -> Phase {
        self.core().phase
    }

    pub fn is_ghost(&self) -> bool {
        self.phase() == Phase::Ghost
    }

    /// Whether the storage may run conflict resolution for this object.
    pub fn resolvable(&self) -> bool {
        self.core().resolvable
    }

    pub fn set_resolvable(&self, yes: bool) {
        self.core().resolvable = yes;
    }

    pub fn independent(&self) -> Option<IndependentFn> {
        self.independent.clone()
    }

    /// Reads a field of the object's state. Fails if the object is a ghost;
    /// ask the owning connection to load it first.
    pub fn get(&self, key: &str) -> CResult<Option<Value>> {
        let core = self.core();
        match &core.state {
            Some(state) => Ok(state.get(key).cloned()),
            None => Err(Error::Ghost(self.describe_core(&core))),
        }
    }

    /// Writes a field of the object's state and marks the object changed.
    /// The caller is responsible for registering the object with the
    /// current transaction so the change is picked up at commit.
    pub fn set(&self, key: &str, value: Value) -> CResult<()> {
        let mut core = self.core();
        if core.state.is_none() {
            return Err(Error::Ghost(self.describe_core(&core)));
        }
        if let Some(state) = core.state.as_mut() {
            state.insert(key.to_string(), value);
        }
        core.phase = Phase::Changed;
        Ok(())
    }

    /// Returns a clone of the full state map.
    pub fn state(&self) -> CResult<StateMap> {
        let core = self.core();
        match &core.state {
            Some(state) => Ok(state.clone()),
            None => Err(Error::Ghost(self.describe_core(&core))),
        }
    }

    /// Installs identity: owning connection and oid.
    pub(crate) fn bind(&self, jar: u64, oid: Oid) {
        let mut core = self.core();
        core.jar = Some(jar);
        core.oid = Some(oid);
    }

    /// Drops identity again; used when an uncommitted creation is rolled
    /// back. State and phase are untouched, so the object can be added to a
    /// connection again later.
    pub(crate) fn clear_identity(&self) {
        let mut core = self.core();
        core.jar = None;
        core.oid = None;
    }

    /// Drops loaded state, turning the object back into a ghost. A no-op
    /// for objects that are already ghosts.
    pub(crate) fn ghostify(&self) {
        let mut core = self.core();
        core.state = None;
        core.phase = Phase::Ghost;
    }

    /// Installs freshly loaded state; the object becomes `Saved`.
    pub(crate) fn set_state(&self, state: StateMap) {
        let mut core = self.core();
        core.state = Some(state);
        core.phase = Phase::Saved;
    }

    pub(crate) fn set_serial(&self, serial: Tid) {
        self.core().serial = serial;
    }

    pub(crate) fn mark_saved(&self) {
        self.core().phase = Phase::Saved;
    }

    pub(crate) fn mark_changed(&self) {
        self.core().phase = Phase::Changed;
    }

    fn describe_core(&self, core: &Core) -> String {
        match core.oid {
            Some(oid) => id_repr(&oid),
            None => "<unsaved>".to_string(),
        }
    }

    pub(crate) fn describe(&self) -> String {
        let core = self.core();
        self.describe_core(&core)
    }
}

impl std::fmt::Debug for PObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core();
        f.debug_struct("PObject")
            .field("oid", &core.oid.as_ref().map(id_repr))
            .field("jar", &core.jar)
            .field("serial", &id_repr(&core.serial))
            .field("phase", &core.phase)
            .finish()
    }
}
