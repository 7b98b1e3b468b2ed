//! Per-document revision trees for the ForestDoc storage engine.
//!
//! Each document carries a tree of its revisions: a DAG with
//! generation-numbered identifiers, conflict-aware insertion, optional
//! delta compression of revision bodies, pruning/purging, and a compact
//! big-endian binary serialization. Trees are single-owner objects; callers
//! serialize access externally.

pub mod delta;
mod raw;
pub mod revision;
pub mod tree;

pub use delta::{BodyLoader, DeltaCodec, DeltaFlags, NoBodyLoader};
pub use revision::{Revision, RevisionFlags};
pub use tree::{InsertError, RevTree};
