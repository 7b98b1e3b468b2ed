//! The revision tree: a per-document DAG of revisions.
//!
//! Revisions are held in one array and refer to each other by 16-bit index.
//! The array is kept in canonical priority order (winning leaf first) by
//! [`RevTree::sort`]; any structural mutation may renumber indices, and the
//! sort/compact passes rewrite `parent_index` and `delta_ref_index` through
//! an old→new map when they do.

use std::cmp::Ordering;

use bytes::Bytes;
use fdoc_error::Result;
use fdoc_types::{RevId, Sequence};
use thiserror::Error;
use tracing::debug;

use crate::raw;
use crate::revision::{Revision, RevisionFlags};

/// Why an insertion was rejected.
///
/// Variants map onto the HTTP-style statuses replication clients expect;
/// see [`InsertError::http_status`]. A successful insertion reports 201
/// (or 200 when the new revision is a deletion).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// The revision ID has no positive generation prefix.
    #[error("revision ID has no valid generation")]
    InvalidGeneration,
    /// The revision is already in the tree; inserting it is a no-op.
    #[error("revision already exists")]
    AlreadyExists,
    /// The named parent revision is not in the tree.
    #[error("parent revision not found")]
    ParentNotFound,
    /// Inserting would create a branch and conflicts were not allowed.
    #[error("revision conflicts with an existing leaf")]
    Conflict,
    /// The new generation is not exactly one greater than the parent's.
    #[error("revision generation does not follow its parent")]
    GenerationGap,
}

impl InsertError {
    /// The HTTP-style status for this outcome.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::InvalidGeneration | Self::GenerationGap => 400,
            Self::AlreadyExists => 200,
            Self::ParentNotFound => 404,
            Self::Conflict => 409,
        }
    }
}

/// A document's revision tree.
#[derive(Debug, Default)]
pub struct RevTree {
    pub(crate) revs: Vec<Revision>,
    pub(crate) body_offset: u64,
    pub(crate) sorted: bool,
    pub(crate) changed: bool,
    unknown: bool,
}

impl RevTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            revs: Vec::new(),
            body_offset: 0,
            sorted: true,
            changed: false,
            unknown: false,
        }
    }

    /// Create a placeholder for a document whose tree has not been loaded.
    ///
    /// Every accessor except [`is_unknown`](Self::is_unknown) panics on a
    /// placeholder; it exists so callers can represent "document known to
    /// exist, content not read" without an `Option` at every call site.
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            unknown: true,
            ..Self::new()
        }
    }

    /// Rebuild a tree from its serialized form.
    ///
    /// `seq` is the owning document's sequence number (inherited by
    /// revisions stored with sequence 0) and `doc_offset` the file offset
    /// the document was read from.
    pub fn decode(raw_tree: Bytes, seq: Sequence, doc_offset: u64) -> Result<Self> {
        let revs = raw::decode_tree(&raw_tree, seq)?;
        Ok(Self {
            revs,
            body_offset: doc_offset,
            sorted: true,
            changed: false,
            unknown: false,
        })
    }

    /// Serialize the tree, winning revision first, ending with the zero
    /// terminator. Clears the `changed` flag.
    pub fn encode(&mut self) -> Vec<u8> {
        self.sort();
        let out = raw::encode_tree(&self.revs, self.body_offset);
        self.changed = false;
        out
    }

    /// Whether this tree is an unloaded placeholder.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.unknown
    }

    /// Whether the tree has been mutated since it was decoded or last
    /// encoded.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// File offset of the document this tree was loaded from (0 if never
    /// persisted).
    #[must_use]
    pub fn body_offset(&self) -> u64 {
        self.body_offset
    }

    /// Record where the document body was persisted; used when revision
    /// bodies are later evicted from the tree.
    pub fn set_body_offset(&mut self, offset: u64) {
        self.body_offset = offset;
    }

    /// Number of revisions in the tree.
    #[must_use]
    pub fn rev_count(&self) -> usize {
        self.revs.len()
    }

    /// The revision at `index`. Panics if out of range or the tree is a
    /// placeholder.
    #[must_use]
    pub fn rev(&self, index: u16) -> &Revision {
        assert!(!self.unknown, "accessing placeholder revision tree");
        &self.revs[usize::from(index)]
    }

    /// Find a revision by ID.
    #[must_use]
    pub fn get(&self, rev_id: &RevId) -> Option<&Revision> {
        self.index_of(rev_id).map(|i| &self.revs[usize::from(i)])
    }

    /// Find a revision's index by ID.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn index_of(&self, rev_id: &RevId) -> Option<u16> {
        for (i, rev) in self.revs.iter().enumerate() {
            if rev.rev_id == *rev_id {
                return Some(i as u16);
            }
        }
        assert!(!self.unknown, "accessing placeholder revision tree");
        None
    }

    /// Find a revision by the sequence it was saved at.
    #[must_use]
    pub fn get_by_sequence(&self, seq: Sequence) -> Option<&Revision> {
        let found = self.revs.iter().find(|rev| rev.sequence == seq);
        assert!(
            found.is_some() || !self.unknown,
            "accessing placeholder revision tree"
        );
        found
    }

    /// The winning revision. Sorts the tree first; panics on an empty tree
    /// or a placeholder.
    pub fn current_revision(&mut self) -> &Revision {
        assert!(!self.unknown, "accessing placeholder revision tree");
        assert!(!self.revs.is_empty(), "empty revision tree has no current revision");
        self.sort();
        &self.revs[0]
    }

    /// Indices of every leaf revision.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn current_revisions(&self) -> Vec<u16> {
        assert!(!self.unknown, "accessing placeholder revision tree");
        self.revs
            .iter()
            .enumerate()
            .filter(|(_, rev)| rev.is_leaf())
            .map(|(i, _)| i as u16)
            .collect()
    }

    /// Whether the document has more than one active leaf.
    #[must_use]
    pub fn has_conflict(&self) -> bool {
        if self.revs.len() < 2 {
            assert!(!self.unknown, "accessing placeholder revision tree");
            false
        } else if self.sorted {
            self.revs[1].is_active()
        } else {
            let mut active = 0;
            for rev in &self.revs {
                if rev.is_active() {
                    active += 1;
                    if active > 1 {
                        return true;
                    }
                }
            }
            false
        }
    }

    /// Index of `index`'s parent revision, if any.
    #[must_use]
    pub fn parent_of(&self, index: u16) -> Option<u16> {
        self.rev(index).parent_index()
    }

    /// The ancestry of `index`, starting with the revision itself.
    #[must_use]
    pub fn history(&self, index: u16) -> Vec<u16> {
        let mut chain = Vec::new();
        let mut cur = Some(index);
        while let Some(i) = cur {
            chain.push(i);
            cur = self.rev(i).parent_index();
        }
        chain
    }

    // -----------------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------------

    /// Lowest-level insert. Does no sanity checking, always appends.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn insert_unchecked(
        &mut self,
        rev_id: RevId,
        body: Bytes,
        parent: Option<u16>,
        deleted: bool,
        has_attachments: bool,
    ) -> u16 {
        assert!(!self.unknown, "inserting into placeholder revision tree");
        assert!(self.revs.len() < usize::from(u16::MAX), "revision tree full");
        assert!(rev_id.len() <= usize::from(u8::MAX), "revision ID too long");

        let mut flags = RevisionFlags::LEAF | RevisionFlags::NEW;
        if deleted {
            flags |= RevisionFlags::DELETED;
        }
        if has_attachments {
            flags |= RevisionFlags::HAS_ATTACHMENTS;
        }

        let parent_index = match parent {
            Some(p) => {
                self.revs[usize::from(p)].flags &= !RevisionFlags::LEAF;
                p
            }
            None => Revision::NO_PARENT,
        };

        self.revs.push(Revision {
            rev_id,
            sequence: 0,
            body,
            old_body_offset: 0,
            flags,
            parent_index,
            delta_ref_index: Revision::NO_PARENT,
        });

        self.changed = true;
        if self.revs.len() > 1 {
            self.sorted = false;
        }
        (self.revs.len() - 1) as u16
    }

    /// Insert a revision as a child of `parent` (given by index; `None`
    /// makes it a root).
    ///
    /// Returns the new revision's index. The HTTP-style status of a
    /// successful insert is 200 when `deleted`, else 201; failures carry
    /// their status in [`InsertError`].
    pub fn insert(
        &mut self,
        rev_id: RevId,
        body: Bytes,
        deleted: bool,
        has_attachments: bool,
        parent: Option<u16>,
        allow_conflict: bool,
    ) -> std::result::Result<u16, InsertError> {
        if rev_id.generation() == 0 {
            return Err(InsertError::InvalidGeneration);
        }
        if self.get(&rev_id).is_some() {
            return Err(InsertError::AlreadyExists);
        }

        let parent_gen = match parent {
            Some(p) => {
                let parent_rev = self.rev(p);
                if !allow_conflict && !parent_rev.is_leaf() {
                    return Err(InsertError::Conflict);
                }
                parent_rev.rev_id.generation()
            }
            None => {
                if !allow_conflict && !self.revs.is_empty() {
                    return Err(InsertError::Conflict);
                }
                0
            }
        };

        if rev_id.generation() != parent_gen + 1 {
            return Err(InsertError::GenerationGap);
        }

        Ok(self.insert_unchecked(rev_id, body, parent, deleted, has_attachments))
    }

    /// [`insert`](Self::insert), resolving the parent by revision ID.
    pub fn insert_with_parent_id(
        &mut self,
        rev_id: RevId,
        body: Bytes,
        deleted: bool,
        has_attachments: bool,
        parent_rev_id: Option<&RevId>,
        allow_conflict: bool,
    ) -> std::result::Result<u16, InsertError> {
        let parent = match parent_rev_id {
            Some(id) => Some(self.index_of(id).ok_or(InsertError::ParentNotFound)?),
            None => None,
        };
        self.insert(rev_id, body, deleted, has_attachments, parent, allow_conflict)
    }

    /// Insert a leaf revision along with its ancestry.
    ///
    /// `history` is ordered leaf-first: `history[0]` is the new revision and
    /// each later entry is the previous one's parent. Entries already in the
    /// tree are not re-inserted; the first such entry is the common
    /// ancestor and its position in `history` is returned. Entries newer
    /// than the common ancestor are inserted oldest-first with empty bodies,
    /// except `history[0]` which receives `body` and the flags.
    ///
    /// Returns `None` when the generation numbers in `history` are not
    /// strictly descending by one.
    pub fn insert_history(
        &mut self,
        history: &[RevId],
        body: Bytes,
        deleted: bool,
        has_attachments: bool,
    ) -> Option<usize> {
        assert!(!history.is_empty(), "insert_history requires a history");

        // Find the common ancestor, preflighting generations on the way.
        let mut last_gen = 0u32;
        let mut parent = None;
        let mut common = history.len();
        for (i, rev_id) in history.iter().enumerate() {
            let gen = rev_id.generation();
            if last_gen > 0 && gen != last_gen - 1 {
                return None;
            }
            last_gen = gen;
            parent = self.index_of(rev_id);
            if parent.is_some() {
                common = i;
                break;
            }
        }

        if common > 0 {
            // Insert the new revisions in chronological order.
            for i in (1..common).rev() {
                parent = Some(self.insert_unchecked(
                    history[i].clone(),
                    Bytes::new(),
                    parent,
                    false,
                    false,
                ));
            }
            self.insert_unchecked(history[0].clone(), body, parent, deleted, has_attachments);
        }
        Some(common)
    }

    // -----------------------------------------------------------------------
    // Canonical ordering
    // -----------------------------------------------------------------------

    /// Sort revisions into descending priority, placing the winning
    /// revision at index 0, and renumber parent/delta indices.
    #[allow(clippy::cast_possible_truncation)]
    pub fn sort(&mut self) {
        if self.sorted {
            return;
        }
        let n = self.revs.len();

        // Save the original parent indices and alias each parent_index
        // field as a self-index cookie so the sort's permutation can be
        // recovered afterwards.
        let mut old_parents = vec![0u16; n];
        for (i, rev) in self.revs.iter_mut().enumerate() {
            old_parents[i] = rev.parent_index;
            rev.parent_index = i as u16;
        }

        self.revs.sort_by(priority_cmp);

        // Invert the permutation: old index -> new index.
        let mut old_to_new = vec![0u16; n];
        for (new_index, rev) in self.revs.iter().enumerate() {
            old_to_new[usize::from(rev.parent_index)] = new_index as u16;
        }

        // Rewrite parent and delta reference indices through the map.
        for rev in &mut self.revs {
            let old_index = usize::from(rev.parent_index);
            let old_parent = old_parents[old_index];
            rev.parent_index = if old_parent == Revision::NO_PARENT {
                Revision::NO_PARENT
            } else {
                old_to_new[usize::from(old_parent)]
            };
            if rev.delta_ref_index != Revision::NO_PARENT {
                rev.delta_ref_index = old_to_new[usize::from(rev.delta_ref_index)];
            }
        }
        self.sorted = true;
    }

    // -----------------------------------------------------------------------
    // Pruning / purging / compaction
    // -----------------------------------------------------------------------

    /// Depth of each revision measured from the leaves (leaves are 0).
    ///
    /// Where branches give a revision more than one depth, `use_max` picks
    /// the longest path, otherwise the shortest. Unreachable revisions keep
    /// `u16::MAX`.
    pub(crate) fn compute_depths(&self, use_max: bool) -> Vec<u16> {
        let mut depths = vec![u16::MAX; self.revs.len()];
        for (i, rev) in self.revs.iter().enumerate() {
            if rev.is_leaf() {
                // Walk the ancestry from this leaf, assigning consecutive
                // depths until they stop improving.
                let mut d = 0u16;
                let mut index = i;
                loop {
                    let old = depths[index];
                    if old != u16::MAX && (if use_max { d <= old } else { d >= old }) {
                        break;
                    }
                    depths[index] = d;
                    match self.revs[index].parent_index {
                        Revision::NO_PARENT => break,
                        parent => index = usize::from(parent),
                    }
                    d += 1;
                }
            } else if self.sorted {
                break; // leaves come first in sorted order
            }
        }
        depths
    }

    /// Remove every revision more than `max_depth` steps (longest path)
    /// away from a leaf. Returns the number removed.
    pub fn prune(&mut self, max_depth: u16) -> usize {
        if max_depth == 0 || self.revs.len() <= usize::from(max_depth) {
            return 0;
        }
        let depths = self.compute_depths(true);
        let mut pruned = 0;
        for (rev, depth) in self.revs.iter_mut().zip(depths) {
            if depth > max_depth {
                rev.rev_id = RevId::default(); // tombstone
                pruned += 1;
            }
        }
        if pruned > 0 {
            self.compact();
            debug!(pruned, max_depth, "pruned revision tree");
        }
        pruned
    }

    /// Remove the leaf revision `leaf_id` and every ancestor left without
    /// descendants. Returns the number removed (0 if `leaf_id` is absent or
    /// not a leaf).
    pub fn purge(&mut self, leaf_id: &RevId) -> usize {
        let Some(start) = self.index_of(leaf_id) else {
            return 0;
        };
        if !self.revs[usize::from(start)].is_leaf() {
            return 0;
        }
        let mut purged = 0;
        let mut cur = Some(usize::from(start));
        while let Some(i) = cur {
            purged += 1;
            self.revs[i].rev_id = RevId::default(); // tombstone
            let parent = self.revs[i].parent_index;
            self.revs[i].parent_index = Revision::NO_PARENT; // unlink
            cur = match parent {
                Revision::NO_PARENT => None,
                p if self.confirm_leaf(p) => Some(usize::from(p)),
                _ => None,
            };
        }
        self.compact();
        debug!(purged, leaf = %leaf_id, "purged revision branch");
        purged
    }

    /// Mark `index` as a leaf and return true if no revision has it as a
    /// parent.
    fn confirm_leaf(&mut self, index: u16) -> bool {
        if self.revs.iter().any(|rev| rev.parent_index == index) {
            return false;
        }
        self.revs[usize::from(index)].flags |= RevisionFlags::LEAF;
        true
    }

    /// Slide surviving revisions down over the tombstones, renumbering
    /// parent and delta reference indices.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn compact(&mut self) {
        // Pass 1: map old indices to new, tombstones to NO_PARENT.
        let mut map = vec![Revision::NO_PARENT; self.revs.len()];
        let mut next = 0u16;
        for (i, rev) in self.revs.iter().enumerate() {
            if !rev.rev_id.is_empty() {
                map[i] = next;
                next += 1;
            }
        }

        // Pass 2: drop tombstones and rewrite indices, preserving order.
        let old = std::mem::take(&mut self.revs);
        self.revs.reserve_exact(usize::from(next));
        for mut rev in old {
            if rev.rev_id.is_empty() {
                continue;
            }
            if rev.parent_index != Revision::NO_PARENT {
                rev.parent_index = map[usize::from(rev.parent_index)];
            }
            if rev.delta_ref_index != Revision::NO_PARENT {
                rev.delta_ref_index = map[usize::from(rev.delta_ref_index)];
            }
            self.revs.push(rev);
        }
        self.changed = true;
    }
}

/// Priority comparison: leaves first, then non-deleted, then higher rev ID.
fn priority_cmp(a: &Revision, b: &Revision) -> Ordering {
    b.is_leaf()
        .cmp(&a.is_leaf())
        .then_with(|| a.is_deleted().cmp(&b.is_deleted()))
        .then_with(|| b.rev_id.cmp(&a.rev_id))
}
