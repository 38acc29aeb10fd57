use byteorder::{BigEndian, ByteOrder};

/// An object identifier: an opaque 8-byte string, unique within a database.
pub type Oid = [u8; 8];

/// A transaction identifier assigned by the storage at commit time.
/// Tids compare lexicographically, which for big-endian encoded counters is
/// the same as numerically, so later transactions always sort higher.
pub type Tid = [u8; 8];

/// The zero id. As an oid it names the database root; as a tid/serial it
/// marks an object that has never been committed.
pub const Z64: [u8; 8] = [0; 8];

/// Sentinel serial returned by a storage that resolved a write conflict on
/// the server side. The connection reacts by ghosting the object, since the
/// merged state lives in the storage only.
pub const RESOLVED_SERIAL: Tid = *b"resolved";

/// Builds an 8-byte id from an integer, big-endian.
pub fn p64(n: u64) -> [u8; 8] {
    let mut id = [0; 8];
    BigEndian::write_u64(&mut id, n);
    id
}

/// Reads an 8-byte id back as an integer, big-endian.
pub fn u64(id: &[u8; 8]) -> u64 {
    BigEndian::read_u64(id)
}

/// Renders an id for log and error messages, e.g. `0x0000000000000005`.
pub fn id_repr(id: &[u8; 8]) -> String {
    format!("0x{:016x}", u64(id))
}
