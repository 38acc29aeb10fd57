//! `odb` is a transactional object database session layer: a [`Database`]
//! over a pluggable storage engine hands out per-thread [`Connection`]s,
//! each giving an isolated, consistent view of the stored object graph.
//! Objects load lazily as ghosts, commits run through a two-phase
//! protocol, and peer commits reach other connections as lazy
//! invalidations so every cache stays coherent.
//!
//! ## Getting started
//!
//! ```rust
//! use odb::error::CResult;
//! use odb::object::{PObject, StateMap, Value};
//! use odb::storage::memory::MemoryStorage;
//! use odb::Database;
//!
//! fn main() -> CResult<()> {
//!     let db = Database::new(MemoryStorage::new())?;
//!     let mut conn = db.open()?;
//!     let txn = conn.set_local_transaction();
//!
//!     // Hang a new object off the root and commit both.
//!     let item = PObject::new(StateMap::new());
//!     item.set("answer", Value::Int(42))?;
//!     let root = conn.root()?;
//!     conn.setstate(&root)?;
//!     root.set("item", Value::Ref(item.clone()))?;
//!     conn.register(&root);
//!     txn.commit(&mut conn)?;
//!
//!     assert_eq!(item.get("answer")?, Some(Value::Int(42)));
//!     conn.close()?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod connection;
pub mod db;
pub mod error;
pub mod invalidation;
pub mod object;
pub mod storage;
pub mod txn;
pub mod types;

mod connection_test;

pub use connection::{Connection, ConnectionConfig};
pub use db::Database;
pub use txn::Transaction;
