use serde_derive::{Deserialize, Serialize};

use crate::types::{id_repr, Oid};

/// The crate-wide result type.
pub type CResult<T> = std::result::Result<T, Error>;

/// All errors surfaced by the connection and its collaborators.
///
/// Conflict errors carry the offending oid so the transaction coordinator
/// can decide whether a retry makes sense. Storage errors may also travel as
/// data, inside `StoreReturn::Fail`, which is why the enum is serializable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The connection has been closed; it can't load or store objects.
    Closed,

    /// The storage was opened read-only and refused a write.
    ReadOnly,

    /// No revision exists for the oid (or for the requested historical one).
    NotFound(String),

    /// The object is already bound to a different connection.
    InvalidObjectReference(String),

    /// The object's state was requested but it is a ghost; load it first.
    Ghost(String),

    /// The current revision of the oid is newer than this connection's view
    /// and no historical fallback was available.
    ReadConflict(Oid),

    /// A modified object was committed after a peer rewrote it, and the
    /// object doesn't support conflict resolution.
    Conflict(Oid),

    /// Malformed serialized state.
    Parse(String),

    Io(String),

    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Closed => write!(f, "the database connection is closed"),
            Error::ReadOnly => write!(f, "the storage is read-only"),
            Error::NotFound(what) => write!(f, "no revision found for {}", what),
            Error::InvalidObjectReference(what) => {
                write!(f, "object belongs to another connection: {}", what)
            }
            Error::Ghost(what) => write!(f, "object {} is a ghost; no state loaded", what),
            Error::ReadConflict(oid) => {
                write!(f, "read conflict for object {}", id_repr(oid))
            }
            Error::Conflict(oid) => {
                write!(f, "write conflict for object {}", id_repr(oid))
            }
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Io(msg) => write!(f, "io error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {}", err))
    }
}
