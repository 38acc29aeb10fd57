//! A bounded cache of persistent objects, keyed by oid.
//!
//! The cache holds strong references, which is what preserves object
//! identity within a connection: as long as an oid is resident, every
//! lookup returns the same `Arc`. Capacity is enforced lazily -- nothing is
//! evicted at insert time; instead the connection runs [`ObjectCache::incrgc`]
//! at transaction boundaries, which walks the least-recently-used entries
//! and turns clean objects back into ghosts until the live count is at the
//! target. Changed objects are never swept; invalidation ghosts
//! unconditionally.

use std::collections::HashMap;
use std::sync::Arc;

use crate::object::{PObject, Phase};
use crate::types::Oid;

pub struct ObjectCache {
    data: HashMap<Oid, Arc<PObject>>,
    /// Resident oids, coldest first.
    lru: Vec<Oid>,
    /// Target number of non-ghost residents.
    target: usize,
    /// When non-zero, idle garbage-collection passes pull the effective
    /// target down by `1/drain_resistance` per pass, so a cache that is not
    /// being used drains to empty over time. Used for version connections.
    drain_resistance: u32,
    soft_target: usize,
}

impl ObjectCache {
    pub fn new(target: usize) -> Self {
        Self::with_drain_resistance(target, 0)
    }

    pub fn with_drain_resistance(target: usize, drain_resistance: u32) -> Self {
        ObjectCache {
            data: HashMap::new(),
            lru: Vec::new(),
            target,
            drain_resistance,
            soft_target: target,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn drain_resistance(&self) -> u32 {
        self.drain_resistance
    }

    fn touch(&mut self, oid: &Oid) {
        self.lru.retain(|o| o != oid);
        self.lru.push(*oid);
        // Activity resets the idle drain.
        self.soft_target = self.target;
    }

    pub fn get(&mut self, oid: &Oid) -> Option<Arc<PObject>> {
        let obj = self.data.get(oid).cloned();
        if obj.is_some() {
            self.touch(oid);
        }
        obj
    }

    /// Looks up without refreshing recency.
    pub fn peek(&self, oid: &Oid) -> Option<Arc<PObject>> {
        self.data.get(oid).cloned()
    }

    pub fn contains(&self, oid: &Oid) -> bool {
        self.data.contains_key(oid)
    }

    /// Inserts or replaces the resident object for an oid.
    pub fn insert(&mut self, oid: Oid, obj: Arc<PObject>) {
        self.data.insert(oid, obj);
        self.touch(&oid);
    }

    pub fn remove(&mut self, oid: &Oid) -> Option<Arc<PObject>> {
        self.lru.retain(|o| o != oid);
        self.data.remove(oid)
    }

    /// Ghosts the resident object for an oid, whatever its phase. Called on
    /// behalf of peer commits and local aborts; the next touch reloads.
    pub fn invalidate_one(&mut self, oid: &Oid) {
        if let Some(obj) = self.data.get(oid) {
            obj.ghostify();
        }
    }

    pub fn invalidate(&mut self, oids: impl IntoIterator<Item = Oid>) {
        for oid in oids {
            self.invalidate_one(&oid);
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn non_ghost_count(&self) -> usize {
        self.data.values().filter(|o| !o.is_ghost()).count()
    }

    pub fn ghost_count(&self) -> usize {
        self.data.values().filter(|o| o.is_ghost()).count()
    }

    /// Resident entries, coldest first.
    pub fn lru_items(&self) -> Vec<(Oid, Arc<PObject>)> {
        self.lru
            .iter()
            .filter_map(|oid| self.data.get(oid).map(|o| (*oid, o.clone())))
            .collect()
    }

    /// One incremental garbage-collection pass: ghost clean objects,
    /// coldest first, until the live count is at the effective target.
    pub fn incrgc(&mut self) {
        if self.drain_resistance > 0 {
            let step = (self.soft_target / self.drain_resistance as usize).max(1);
            self.soft_target = self.soft_target.saturating_sub(step);
        }
        let goal = self.target.min(self.soft_target);
        self.sweep_to(goal);
    }

    /// Ghosts every clean object, keeping only ghosts and changed objects
    /// live.
    pub fn minimize(&mut self) {
        self.sweep_to(0);
    }

    /// Historical entry point; the age argument was never honored here and
    /// the sweep is total.
    pub fn full_sweep(&mut self, _dt: u64) {
        self.minimize();
    }

    fn sweep_to(&mut self, goal: usize) {
        let mut live = self.non_ghost_count();
        if live <= goal {
            return;
        }
        for oid in self.lru.clone() {
            if live <= goal {
                break;
            }
            if let Some(obj) = self.data.get(&oid) {
                if obj.phase() == Phase::Saved {
                    obj.ghostify();
                    live -= 1;
                }
            }
        }
    }
}
