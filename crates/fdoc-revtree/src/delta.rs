//! Delta compression of revision bodies.
//!
//! A revision's body may be stored as a delta against another revision's
//! body (its *delta reference*). The delta algorithm itself and the loading
//! of evicted bodies are external collaborators, consumed through the
//! [`DeltaCodec`] and [`BodyLoader`] traits; the tree only manages the
//! reference links and guarantees they stay acyclic.

use bitflags::bitflags;
use bytes::Bytes;
use tracing::debug;

use crate::revision::Revision;
use crate::tree::RevTree;

bitflags! {
    /// Options passed through to the delta collaborator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeltaFlags: u8 {
        /// Omit the delta's internal checksum.
        const NO_CHECKSUM = 0x01;
    }
}

// The storage layer already checksums whole documents, and both ends of a
// tree delta live in the same document.
pub(crate) const REV_DELTA_FLAGS: DeltaFlags = DeltaFlags::NO_CHECKSUM;

/// Produces and applies binary deltas between revision bodies.
pub trait DeltaCodec {
    /// Compute a delta that transforms `reference` into `target`, or `None`
    /// if the pair can't be delta-encoded.
    fn create_delta(&self, reference: &[u8], target: &[u8], flags: DeltaFlags) -> Option<Bytes>;

    /// Reconstruct the target bytes from `reference` and `delta`, or `None`
    /// if the delta doesn't apply.
    fn apply_delta(&self, reference: &[u8], delta: &[u8], flags: DeltaFlags) -> Option<Bytes>;
}

/// Loads revision bodies that were evicted from the tree and live at a file
/// offset in the backing store.
pub trait BodyLoader {
    /// Materialize `rev`'s stored body, or `None` if it is unavailable.
    fn read_body(&self, rev: &Revision) -> Option<Bytes>;
}

/// Loader for trees whose referenced bodies are all inline.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBodyLoader;

impl BodyLoader for NoBodyLoader {
    fn read_body(&self, _rev: &Revision) -> Option<Bytes> {
        None
    }
}

impl RevTree {
    /// Whether the revision at `index` has a body present in the tree.
    #[must_use]
    pub fn is_body_available(&self, index: u16) -> bool {
        self.rev(index).is_body_available()
    }

    /// The current (possibly delta-expanded) body of the revision at
    /// `index`, or `None` if no body is available.
    ///
    /// Delta-compressed bodies are expanded transparently, recursing
    /// through the reference chain; references whose own bodies were
    /// evicted are fetched through `loader`.
    pub fn read_body_of_revision(
        &self,
        index: u16,
        codec: &dyn DeltaCodec,
        loader: &dyn BodyLoader,
    ) -> Option<Bytes> {
        let rev = self.rev(index);
        if rev.body.is_empty() {
            return None;
        }
        let Some(ref_index) = rev.delta_ref_index() else {
            return Some(rev.body.clone());
        };

        // Expand the delta-compressed body.
        let reference = self.rev(ref_index);
        let reference_body = if let Some(inline) = reference.inline_body() {
            inline.clone()
        } else if reference.is_body_available() {
            // The reference is itself compressed; chains are acyclic by
            // construction, so this terminates.
            self.read_body_of_revision(ref_index, codec, loader)?
        } else {
            loader.read_body(reference)?
        };
        codec.apply_delta(&reference_body, &rev.body, REV_DELTA_FLAGS)
    }

    /// Compute a delta for the revision at `target` using `reference`'s
    /// body as the base. Returns the stored delta directly when `target` is
    /// already compressed against that same reference.
    pub fn generate_delta(
        &self,
        target: u16,
        reference: u16,
        codec: &dyn DeltaCodec,
        loader: &dyn BodyLoader,
    ) -> Option<Bytes> {
        assert_ne!(target, reference, "revision can't delta against itself");
        let target_rev = self.rev(target);
        if target_rev.is_compressed() && target_rev.delta_ref_index == reference {
            return Some(target_rev.body.clone());
        }
        let target_body = self.read_body_of_revision(target, codec, loader)?;
        let reference_body = self.read_body_of_revision(reference, codec, loader)?;
        codec.create_delta(&reference_body, &target_body, REV_DELTA_FLAGS)
    }

    /// Apply an externally produced `delta` against the current body of the
    /// revision at `index`.
    pub fn apply_delta_to(
        &self,
        index: u16,
        delta: &[u8],
        codec: &dyn DeltaCodec,
        loader: &dyn BodyLoader,
    ) -> Option<Bytes> {
        let rev = self.rev(index);
        if rev.body.is_empty() {
            return None;
        }
        if let Some(inline) = rev.inline_body() {
            return codec.apply_delta(inline, delta, REV_DELTA_FLAGS);
        }
        let expanded = self.read_body_of_revision(index, codec, loader)?;
        codec.apply_delta(&expanded, delta, REV_DELTA_FLAGS)
    }

    /// Replace the body of the revision at `target` with a delta computed
    /// from `reference`. Refuses (returning false, tree untouched) when the
    /// link would create a reference cycle or either body is unavailable.
    pub fn compress(
        &mut self,
        target: u16,
        reference: u16,
        codec: &dyn DeltaCodec,
        loader: &dyn BodyLoader,
    ) -> bool {
        if self.rev(target).is_compressed() {
            return true;
        }
        // Make sure there won't be a cycle.
        let mut link = reference;
        while self.rev(link).is_compressed() {
            if link == target {
                return false;
            }
            link = self.rev(link).delta_ref_index;
        }

        let Some(delta) = self.generate_delta(target, reference, codec, loader) else {
            return false;
        };
        debug!(
            target,
            reference,
            delta_len = delta.len(),
            "compressed revision body"
        );
        self.replace_body(target, delta);
        self.revs[usize::from(target)].delta_ref_index = reference;
        true
    }

    /// If the revision at `index` is delta-compressed, expand and store its
    /// full body. Returns false (tree untouched) when the body can't be
    /// reconstructed.
    pub fn decompress(
        &mut self,
        index: u16,
        codec: &dyn DeltaCodec,
        loader: &dyn BodyLoader,
    ) -> bool {
        if !self.rev(index).is_compressed() {
            return true;
        }
        let Some(body) = self.read_body_of_revision(index, codec, loader) else {
            return false;
        };
        self.replace_body(index, body);
        self.revs[usize::from(index)].delta_ref_index = Revision::NO_PARENT;
        true
    }

    /// Remove the body of the revision at `index` from the tree.
    ///
    /// Revisions delta-compressed against it are expanded first when
    /// `allow_expansion` is set; otherwise their presence makes this refuse.
    pub fn remove_body(
        &mut self,
        index: u16,
        allow_expansion: bool,
        codec: &dyn DeltaCodec,
        loader: &dyn BodyLoader,
    ) -> bool {
        if !self.rev(index).is_body_available() {
            return true;
        }
        #[allow(clippy::cast_possible_truncation)]
        let dependents: Vec<u16> = self
            .revs
            .iter()
            .enumerate()
            .filter(|(_, rev)| rev.delta_ref_index == index)
            .map(|(i, _)| i as u16)
            .collect();
        for dependent in dependents {
            if !allow_expansion || !self.decompress(dependent, codec, loader) {
                return false;
            }
        }
        self.replace_body(index, Bytes::new());
        true
    }

    /// Store a new body for the revision at `index`. An empty `body`
    /// removes it, remembering the document offset where it last lived.
    pub(crate) fn replace_body(&mut self, index: u16, body: Bytes) {
        let tree_offset = self.body_offset;
        let rev = &mut self.revs[usize::from(index)];
        if body.is_empty() {
            if rev.body.is_empty() {
                return;
            }
            if tree_offset > 0 {
                rev.old_body_offset = tree_offset;
            }
        }
        rev.body = body;
        self.changed = true;
    }
}
