//! A single revision: one node in a per-document revision tree.

use bitflags::bitflags;
use bytes::Bytes;
use fdoc_types::{RevId, Sequence};

bitflags! {
    /// Revision state bits. `DELETED`, `LEAF`, and `HAS_ATTACHMENTS` are
    /// persisted; `NEW` marks revisions inserted since the tree was last
    /// saved and is never written to disk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RevisionFlags: u8 {
        const DELETED = 0x01;
        const LEAF = 0x02;
        const NEW = 0x04;
        const HAS_ATTACHMENTS = 0x08;
    }
}

impl RevisionFlags {
    /// The subset of flags that survive a save/load round trip.
    pub const PERSISTENT: Self = Self::DELETED
        .union(Self::LEAF)
        .union(Self::HAS_ATTACHMENTS);
}

/// One revision of a document.
///
/// Revisions are owned by a [`RevTree`](crate::RevTree) and refer to their
/// parent (and optional delta reference) by index into the tree's revision
/// array. Indices are only stable between tree mutations; `sort`, `prune`,
/// and `purge` renumber them.
#[derive(Debug, Clone)]
pub struct Revision {
    pub(crate) rev_id: RevId,
    pub(crate) sequence: Sequence,
    pub(crate) body: Bytes,
    pub(crate) old_body_offset: u64,
    pub(crate) flags: RevisionFlags,
    pub(crate) parent_index: u16,
    pub(crate) delta_ref_index: u16,
}

impl Revision {
    /// Sentinel index meaning "no parent" / "no delta reference".
    pub const NO_PARENT: u16 = u16::MAX;

    /// The revision's generation-prefixed identifier.
    #[must_use]
    pub fn rev_id(&self) -> &RevId {
        &self.rev_id
    }

    /// Sequence number assigned when the document was saved; 0 if unsaved.
    #[must_use]
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// The revision's stored body bytes. May be a delta against the
    /// revision at [`delta_ref_index`](Self::delta_ref_index); empty when
    /// the body has been removed from the tree.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// File offset where the body used to live before it was removed from
    /// the tree, or 0.
    #[must_use]
    pub fn old_body_offset(&self) -> u64 {
        self.old_body_offset
    }

    /// Current flag bits.
    #[must_use]
    pub fn flags(&self) -> RevisionFlags {
        self.flags
    }

    /// Index of the parent revision in the owning tree.
    #[must_use]
    pub fn parent_index(&self) -> Option<u16> {
        (self.parent_index != Self::NO_PARENT).then_some(self.parent_index)
    }

    /// Index of the revision whose body is the reference for this
    /// revision's delta, if the body is delta-compressed.
    #[must_use]
    pub fn delta_ref_index(&self) -> Option<u16> {
        (self.delta_ref_index != Self::NO_PARENT).then_some(self.delta_ref_index)
    }

    /// Whether no other revision lists this one as its parent.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.flags.contains(RevisionFlags::LEAF)
    }

    /// Whether this revision is a deletion marker.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RevisionFlags::DELETED)
    }

    /// A leaf that is not deleted. Active revisions compete to be the
    /// document's winning revision.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_leaf() && !self.is_deleted()
    }

    /// Whether this revision was inserted since the tree was last saved.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.flags.contains(RevisionFlags::NEW)
    }

    /// Whether the revision body carries attachments.
    #[must_use]
    pub fn has_attachments(&self) -> bool {
        self.flags.contains(RevisionFlags::HAS_ATTACHMENTS)
    }

    /// Whether the stored body is a delta against another revision.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.delta_ref_index != Self::NO_PARENT
    }

    /// Whether a body (inline, possibly compressed) is present in the tree.
    #[must_use]
    pub fn is_body_available(&self) -> bool {
        !self.body.is_empty()
    }

    /// The body bytes if they are present and not delta-compressed.
    #[must_use]
    pub(crate) fn inline_body(&self) -> Option<&Bytes> {
        (!self.body.is_empty() && !self.is_compressed()).then_some(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(flags: RevisionFlags) -> Revision {
        Revision {
            rev_id: RevId::from("1-a"),
            sequence: 0,
            body: Bytes::new(),
            old_body_offset: 0,
            flags,
            parent_index: Revision::NO_PARENT,
            delta_ref_index: Revision::NO_PARENT,
        }
    }

    #[test]
    fn persistent_mask_excludes_new() {
        assert!(RevisionFlags::PERSISTENT.contains(RevisionFlags::LEAF));
        assert!(RevisionFlags::PERSISTENT.contains(RevisionFlags::DELETED));
        assert!(RevisionFlags::PERSISTENT.contains(RevisionFlags::HAS_ATTACHMENTS));
        assert!(!RevisionFlags::PERSISTENT.contains(RevisionFlags::NEW));
    }

    #[test]
    fn active_means_live_leaf() {
        assert!(rev(RevisionFlags::LEAF).is_active());
        assert!(!rev(RevisionFlags::LEAF | RevisionFlags::DELETED).is_active());
        assert!(!rev(RevisionFlags::empty()).is_active());
    }

    #[test]
    fn inline_body_requires_uncompressed_data() {
        let mut r = rev(RevisionFlags::LEAF);
        assert!(r.inline_body().is_none());
        r.body = Bytes::from_static(b"{}");
        assert!(r.inline_body().is_some());
        r.delta_ref_index = 3;
        assert!(r.inline_body().is_none());
        assert!(r.is_compressed());
    }
}
