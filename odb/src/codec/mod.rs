//! Serialization of object state.
//!
//! The codec is the only component that sees both sides of an object: the
//! in-memory state tree with live `Ref` edges, and the byte frames the
//! storage keeps. Reference edges are where the two worlds meet, so both
//! directions take a collaborator:
//!
//! * decoding resolves every reference through a [`RefResolver`] -- the
//!   connection answers from its cache, creating ghost shells for oids it
//!   has never seen, which is how reachable objects load lazily;
//! * encoding funnels every reference through a [`RefAllocator`] -- the
//!   connection assigns an oid and an owner to objects that have neither,
//!   and the commit [`Writer`] picks them up so they are stored too.

pub mod json_codec;

pub use json_codec::JsonCodec;

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::CResult;
use crate::object::{PObject, StateMap};
use crate::types::Oid;

/// Resolves an oid found while decoding state into a live object.
pub trait RefResolver {
    fn resolve(&mut self, oid: Oid) -> CResult<Arc<PObject>>;
}

/// Hands out identity for objects discovered while encoding state.
///
/// For an object that already has an oid this returns it; for a fresh
/// object it allocates one, binds the object and queues it for storage.
/// Objects owned by another connection are an error.
pub trait RefAllocator {
    fn reserve(&mut self, obj: &Arc<PObject>) -> CResult<Oid>;
}

/// Encoder/decoder between object state and storage bytes.
pub trait Codec: Send + Sync {
    /// Builds an unbound ghost shell carrying only the metadata a ghost
    /// needs (conflict-resolution support); the caller stamps identity.
    fn get_ghost(&self, data: &[u8]) -> CResult<Arc<PObject>>;

    /// Decodes `data` into the ghost, which becomes `Saved`.
    fn set_ghost_state(
        &self,
        obj: &Arc<PObject>,
        data: &[u8],
        refs: &mut dyn RefResolver,
    ) -> CResult<()>;

    /// Decodes `data` into a detached state map, leaving `obj`s alone.
    /// Used for reading historical revisions.
    fn get_state(&self, data: &[u8], refs: &mut dyn RefResolver) -> CResult<StateMap>;

    /// Encodes the object's current state.
    fn serialize(&self, obj: &Arc<PObject>, refs: &mut dyn RefAllocator) -> CResult<Vec<u8>>;

    /// Returns the object that should sit in the cache for `obj`. Object
    /// models that wrap persistent objects in proxies override this to peel
    /// the wrapper; the default is the identity.
    fn unwrap_for_cache(&self, obj: &Arc<PObject>) -> Arc<PObject> {
        obj.clone()
    }
}

/// The commit-time walk over everything that must be stored.
///
/// Starts from one seed object. Serializing an object may discover fresh
/// objects through its `Ref` edges (the allocator pushes them here), and
/// the connection may queue objects added mid-commit; the walk ends only
/// when both sources are dry.
pub struct Writer {
    queue: VecDeque<Arc<PObject>>,
}

impl Writer {
    pub fn new(seed: Arc<PObject>) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(seed);
        Writer { queue }
    }

    pub fn push(&mut self, obj: Arc<PObject>) {
        self.queue.push_back(obj);
    }

    pub fn next(&mut self) -> Option<Arc<PObject>> {
        self.queue.pop_front()
    }
}
