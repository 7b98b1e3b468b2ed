//! Core value types and codec primitives shared by the ForestDoc engine
//! crates: revision identifiers, uvarint encoding, and size limits.

pub mod limits;
pub mod revid;
pub mod varint;

pub use revid::RevId;
pub use varint::{get_uvarint, put_uvarint, put_uvarint_into, size_of_uvarint, MAX_VARINT_LEN64};

/// A document sequence number assigned by the storage layer on save.
///
/// 0 means "not yet saved".
pub type Sequence = u64;
