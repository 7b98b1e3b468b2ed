//! End-to-end revision tree scenarios: history building, conflicts, delta
//! round trips, and serialization properties over generated trees.

use bytes::Bytes;
use fdoc_revtree::{DeltaCodec, DeltaFlags, InsertError, NoBodyLoader, RevTree};
use fdoc_types::limits::TREE_TERMINATOR_SIZE;
use fdoc_types::{size_of_uvarint, RevId};
use proptest::prelude::*;

/// Test delta codec: the delta records the reference length and carries the
/// target verbatim, so applying against the wrong reference fails loudly.
struct PrefixCodec;

impl DeltaCodec for PrefixCodec {
    fn create_delta(&self, reference: &[u8], target: &[u8], _flags: DeltaFlags) -> Option<Bytes> {
        let mut delta = Vec::with_capacity(target.len() + 2);
        delta.extend_from_slice(&u16::try_from(reference.len()).ok()?.to_be_bytes());
        delta.extend_from_slice(target);
        Some(Bytes::from(delta))
    }

    fn apply_delta(&self, reference: &[u8], delta: &[u8], _flags: DeltaFlags) -> Option<Bytes> {
        let (len_bytes, target) = delta.split_at_checked(2)?;
        let ref_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]);
        (usize::from(ref_len) == reference.len()).then(|| Bytes::copy_from_slice(target))
    }
}

fn insert(tree: &mut RevTree, id: &str, body: &[u8], parent: Option<u16>, conflict: bool) -> u16 {
    tree.insert(
        RevId::from(id),
        Bytes::copy_from_slice(body),
        false,
        false,
        parent,
        conflict,
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// Concrete scenarios
// ---------------------------------------------------------------------------

#[test]
fn linear_history() {
    let mut tree = RevTree::new();
    let a = insert(&mut tree, "1-a", b"", None, false);
    insert(&mut tree, "2-b", b"", Some(a), false);

    assert_eq!(tree.current_revision().rev_id().as_bytes(), b"2-b");
    assert!(!tree.has_conflict());

    let encoded = tree.encode();
    // Each record: 10-byte header + ID + 1-byte sequence varint, no body.
    let expected: usize = [b"1-a".len(), b"2-b".len()]
        .iter()
        .map(|id_len| 10 + id_len + size_of_uvarint(0))
        .sum::<usize>()
        + TREE_TERMINATOR_SIZE;
    assert_eq!(encoded.len(), expected);
    assert!(!tree.is_changed());
}

#[test]
fn conflicting_branch_and_winner() {
    let mut tree = RevTree::new();
    let a = insert(&mut tree, "1-a", b"", None, false);
    insert(&mut tree, "2-b", b"", Some(a), false);

    let a = tree.index_of(&RevId::from("1-a")).unwrap();
    let err = tree
        .insert(RevId::from("2-c"), Bytes::new(), false, false, Some(a), false)
        .unwrap_err();
    assert_eq!(err, InsertError::Conflict);
    assert_eq!(err.http_status(), 409);

    insert(&mut tree, "2-c", b"", Some(a), true);
    // "2-c" beats "2-b" on the suffix tiebreak.
    assert_eq!(tree.current_revision().rev_id().as_bytes(), b"2-c");
    assert!(tree.has_conflict());
}

#[test]
fn generation_must_follow_parent() {
    let mut tree = RevTree::new();
    let a = insert(&mut tree, "1-a", b"", None, false);
    let err = tree
        .insert(RevId::from("3-z"), Bytes::new(), false, false, Some(a), false)
        .unwrap_err();
    assert_eq!(err.http_status(), 400);
}

#[test]
fn delta_compression_round_trip() {
    let mut tree = RevTree::new();
    let reference = insert(&mut tree, "1-a", b"hello world", None, false);
    let target = insert(&mut tree, "2-b", b"hello brave new world", Some(reference), false);

    assert!(tree.compress(target, reference, &PrefixCodec, &NoBodyLoader));
    let body = tree
        .read_body_of_revision(target, &PrefixCodec, &NoBodyLoader)
        .unwrap();
    assert_eq!(body.as_ref(), b"hello brave new world");

    // Removing the reference body forces the target to expand first.
    assert!(tree.remove_body(reference, true, &PrefixCodec, &NoBodyLoader));
    assert!(!tree.rev(target).is_compressed());
    assert_eq!(tree.rev(target).body().as_ref(), b"hello brave new world");
    assert!(!tree.rev(reference).is_body_available());
}

#[test]
fn compressed_trees_survive_serialization() {
    let mut tree = RevTree::new();
    let reference = insert(&mut tree, "1-a", b"hello world", None, false);
    let target = insert(&mut tree, "2-b", b"hello brave new world", Some(reference), false);
    assert!(tree.compress(target, reference, &PrefixCodec, &NoBodyLoader));

    let encoded = Bytes::from(tree.encode());
    let decoded = RevTree::decode(encoded, 0, 0).unwrap();
    let target = decoded.index_of(&RevId::from("2-b")).unwrap();
    assert!(decoded.rev(target).is_compressed());
    let body = decoded
        .read_body_of_revision(target, &PrefixCodec, &NoBodyLoader)
        .unwrap();
    assert_eq!(body.as_ref(), b"hello brave new world");
}

#[test]
fn sequences_inherit_document_sequence_on_decode() {
    let mut tree = RevTree::new();
    insert(&mut tree, "1-a", b"x", None, false);
    let decoded = RevTree::decode(Bytes::from(tree.encode()), 17, 0x2000).unwrap();
    let rev = decoded.get(&RevId::from("1-a")).unwrap();
    assert_eq!(rev.sequence(), 17);
    assert_eq!(decoded.body_offset(), 0x2000);
}

#[test]
fn pruned_tree_round_trips() {
    let mut tree = RevTree::new();
    let mut parent = None;
    for id in ["1-a", "2-b", "3-c", "4-d", "5-e"] {
        parent = Some(insert(&mut tree, id, b"{}", parent, false));
    }
    assert_eq!(tree.prune(2), 2);

    let decoded = RevTree::decode(Bytes::from(tree.encode()), 0, 0).unwrap();
    assert_eq!(decoded.rev_count(), 3);
    assert!(decoded.get(&RevId::from("5-e")).is_some());
    assert!(decoded.get(&RevId::from("2-b")).is_none());
}

// ---------------------------------------------------------------------------
// Generated trees
// ---------------------------------------------------------------------------

/// Recipe for one generated revision: which earlier revision (if any) is
/// its parent, and whether it's a deletion.
#[derive(Debug, Clone)]
struct RevSpecItem {
    parent_choice: u16,
    deleted: bool,
    body: Vec<u8>,
}

fn arb_tree_recipe() -> impl Strategy<Value = Vec<RevSpecItem>> {
    prop::collection::vec(
        (any::<u16>(), any::<bool>(), prop::collection::vec(any::<u8>(), 0..24)).prop_map(
            |(parent_choice, deleted, body)| RevSpecItem {
                parent_choice,
                deleted,
                body,
            },
        ),
        1..24,
    )
}

/// Materialize a recipe into a tree. Revision `i` either starts a new root
/// or extends one of the previously inserted revisions.
fn build_tree(recipe: &[RevSpecItem]) -> RevTree {
    let mut tree = RevTree::new();
    for (i, item) in recipe.iter().enumerate() {
        let parent = if i == 0 {
            None
        } else {
            let choice = usize::from(item.parent_choice) % (i + 1);
            (choice < i).then(|| u16::try_from(choice).unwrap())
        };
        let gen = match parent {
            Some(p) => tree.rev(p).rev_id().generation() + 1,
            None => 1,
        };
        let rev_id = RevId::from(format!("{gen}-{i:04x}").as_str());
        tree.insert(
            rev_id,
            Bytes::from(item.body.clone()),
            item.deleted,
            false,
            parent,
            true,
        )
        .unwrap();
    }
    tree
}

/// (rev ID, persistent flags, parent rev ID, sequence, body) for every
/// revision, in sorted order. Parent linkage is compared by ID so index
/// renumbering can't mask breakage.
fn normalized(tree: &mut RevTree) -> Vec<(Vec<u8>, u8, Option<Vec<u8>>, u64, Vec<u8>)> {
    tree.sort();
    (0..u16::try_from(tree.rev_count()).unwrap())
        .map(|i| {
            let rev = tree.rev(i);
            let parent = tree
                .parent_of(i)
                .map(|p| tree.rev(p).rev_id().as_bytes().to_vec());
            (
                rev.rev_id().as_bytes().to_vec(),
                (rev.flags() & fdoc_revtree::RevisionFlags::PERSISTENT).bits(),
                parent,
                rev.sequence(),
                rev.body().to_vec(),
            )
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_encode_decode_round_trip(recipe in arb_tree_recipe()) {
        let mut tree = build_tree(&recipe);
        let encoded = Bytes::from(tree.encode());
        prop_assert!(encoded.ends_with(&[0, 0, 0, 0]));

        let mut decoded = RevTree::decode(encoded.clone(), 0, 0).unwrap();
        prop_assert_eq!(normalized(&mut tree), normalized(&mut decoded));

        // Determinism: re-encoding the decoded tree is byte-identical.
        prop_assert_eq!(decoded.encode(), encoded.to_vec());
    }

    #[test]
    fn prop_sort_places_unique_winner_first(recipe in arb_tree_recipe()) {
        let mut tree = build_tree(&recipe);
        tree.sort();
        let winner = tree.rev(0);
        for i in 1..u16::try_from(tree.rev_count()).unwrap() {
            let rev = tree.rev(i);
            let better_leaf = rev.is_leaf() && !winner.is_leaf();
            let better_alive = rev.is_leaf() == winner.is_leaf()
                && !rev.is_deleted()
                && winner.is_deleted();
            let better_id = rev.is_leaf() == winner.is_leaf()
                && rev.is_deleted() == winner.is_deleted()
                && rev.rev_id() > winner.rev_id();
            prop_assert!(!(better_leaf || better_alive || better_id),
                "revision {i} outranks the winner");
        }
    }

    #[test]
    fn prop_parent_chains_stay_acyclic_after_sort(recipe in arb_tree_recipe()) {
        let mut tree = build_tree(&recipe);
        tree.sort();
        let n = tree.rev_count();
        for i in 0..u16::try_from(n).unwrap() {
            let mut steps = 0;
            let mut cur = Some(i);
            while let Some(index) = cur {
                cur = tree.parent_of(index);
                steps += 1;
                prop_assert!(steps <= n, "parent chain from {i} does not terminate");
            }
        }
    }

    #[test]
    fn prop_prune_bounds_depths_and_keeps_leaves(
        recipe in arb_tree_recipe(),
        max_depth in 1u16..6,
    ) {
        let mut tree = build_tree(&recipe);
        let leaves_before: Vec<Vec<u8>> = tree
            .current_revisions()
            .iter()
            .map(|&i| tree.rev(i).rev_id().as_bytes().to_vec())
            .collect();

        tree.prune(max_depth);

        let mut leaves_after: Vec<Vec<u8>> = tree
            .current_revisions()
            .iter()
            .map(|&i| tree.rev(i).rev_id().as_bytes().to_vec())
            .collect();
        let mut expected = leaves_before;
        expected.sort();
        leaves_after.sort();
        prop_assert_eq!(leaves_after, expected);

        // Recompute each survivor's longest-path depth from scratch; prune
        // must have removed everything deeper than max_depth.
        let n = tree.rev_count();
        let mut longest = vec![0u16; n];
        for leaf in tree.current_revisions() {
            let mut d = 0u16;
            let mut cur = Some(leaf);
            while let Some(i) = cur {
                let slot = &mut longest[usize::from(i)];
                *slot = (*slot).max(d);
                cur = tree.parent_of(i);
                d += 1;
            }
        }
        for (i, depth) in longest.iter().enumerate() {
            prop_assert!(
                *depth <= max_depth,
                "revision {i} survives at depth {depth} > {max_depth}"
            );
        }
    }

    #[test]
    fn prop_purge_removes_leaf_and_keeps_links_valid(recipe in arb_tree_recipe()) {
        let mut tree = build_tree(&recipe);
        let leaves = tree.current_revisions();
        let victim = tree.rev(leaves[0]).rev_id().clone();

        prop_assert!(tree.purge(&victim) >= 1);
        prop_assert!(tree.get(&victim).is_none());

        // All remaining parent links resolve.
        for i in 0..u16::try_from(tree.rev_count()).unwrap() {
            if let Some(p) = tree.parent_of(i) {
                prop_assert!(usize::from(p) < tree.rev_count());
                prop_assert_ne!(p, i);
            }
        }
    }
}
