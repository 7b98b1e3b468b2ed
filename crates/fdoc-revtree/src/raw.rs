//! On-disk serialization of a revision tree.
//!
//! A serialized tree is a sequence of revision records followed by a 32-bit
//! zero terminator. All multi-byte fields are big-endian except varints.
//!
//! ```text
//! Offset  Size  Description
//!   0       4   Record size in bytes, including this field (0 = terminator)
//!   4       2   Parent revision index (0xFFFF = none)
//!   6       2   Delta reference index (0xFFFF = none)
//!   8       1   Flags: persistent revision flags | HAS_BODY_OFFSET | HAS_DATA
//!   9       1   Revision ID length
//!  10       n   Revision ID bytes
//!   -       -   Sequence (uvarint)
//!   -       -   HAS_DATA: body bytes to end of record
//!               HAS_BODY_OFFSET: former body file offset (uvarint)
//! ```
//!
//! Decoding is zero-copy: revision IDs and bodies are sub-slices of the
//! caller's buffer.

use bytes::Bytes;
use fdoc_error::{ForestError, Result};
use fdoc_types::limits::{MAX_REV_COUNT, RAW_REV_HEADER_SIZE, TREE_TERMINATOR_SIZE};
use fdoc_types::{get_uvarint, put_uvarint, size_of_uvarint, RevId, Sequence};
use tracing::debug;

use crate::revision::{Revision, RevisionFlags};

/// Private flag bits used only in the encoded form.
const HAS_BODY_OFFSET: u8 = 0x40;
const HAS_DATA: u8 = 0x80;

/// Bytes this revision will occupy when written, including the record
/// header. Must agree exactly with [`write_rev`].
pub(crate) fn size_to_write(rev: &Revision, tree_body_offset: u64) -> usize {
    let mut size = RAW_REV_HEADER_SIZE + rev.rev_id.len() + size_of_uvarint(rev.sequence);
    if !rev.body.is_empty() {
        size += rev.body.len();
    } else if rev.old_body_offset > 0 {
        size += size_of_uvarint(rev.old_body_offset);
    } else if tree_body_offset > 0 {
        size += size_of_uvarint(tree_body_offset);
    }
    size
}

/// Append one revision record to `out`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn write_rev(out: &mut Vec<u8>, rev: &Revision, tree_body_offset: u64) {
    debug_assert!(rev.rev_id.len() <= usize::from(u8::MAX));
    let size = size_to_write(rev, tree_body_offset);
    out.extend_from_slice(&(size as u32).to_be_bytes());
    out.extend_from_slice(&rev.parent_index.to_be_bytes());
    out.extend_from_slice(&rev.delta_ref_index.to_be_bytes());

    let mut flags = (rev.flags & RevisionFlags::PERSISTENT).bits();
    if !rev.body.is_empty() {
        flags |= HAS_DATA;
    } else if rev.old_body_offset > 0 || tree_body_offset > 0 {
        flags |= HAS_BODY_OFFSET;
    }
    out.push(flags);
    out.push(rev.rev_id.len() as u8);
    out.extend_from_slice(rev.rev_id.as_bytes());
    put_uvarint(out, rev.sequence);

    if flags & HAS_DATA != 0 {
        out.extend_from_slice(&rev.body);
    } else if flags & HAS_BODY_OFFSET != 0 {
        let offset = if rev.old_body_offset > 0 {
            rev.old_body_offset
        } else {
            tree_body_offset
        };
        put_uvarint(out, offset);
    }
}

/// Serialize `revs` (already in canonical order) to a byte string ending in
/// the zero terminator.
pub(crate) fn encode_tree(revs: &[Revision], tree_body_offset: u64) -> Vec<u8> {
    let total: usize = revs
        .iter()
        .map(|rev| size_to_write(rev, tree_body_offset))
        .sum::<usize>()
        + TREE_TERMINATOR_SIZE;
    let mut out = Vec::with_capacity(total);
    for rev in revs {
        write_rev(&mut out, rev, tree_body_offset);
    }
    out.extend_from_slice(&0u32.to_be_bytes());
    debug_assert_eq!(out.len(), total);
    debug!(revisions = revs.len(), bytes = out.len(), "encoded revision tree");
    out
}

/// Parse a serialized tree into revisions, in the order encountered.
///
/// Revisions stored with sequence 0 inherit the document's `seq`. Returned
/// revisions hold zero-copy slices of `raw`.
pub(crate) fn decode_tree(raw: &Bytes, seq: Sequence) -> Result<Vec<Revision>> {
    let data: &[u8] = raw;
    let mut revs = Vec::new();
    let mut pos = 0usize;
    loop {
        let Some(size_bytes) = data.get(pos..pos + 4) else {
            return Err(ForestError::corrupt("truncated revision record"));
        };
        let size = u32::from_be_bytes(size_bytes.try_into().expect("4-byte slice")) as usize;
        if size == 0 {
            if pos + TREE_TERMINATOR_SIZE != data.len() {
                return Err(ForestError::corrupt("data after tree terminator"));
            }
            break;
        }
        if revs.len() >= MAX_REV_COUNT {
            return Err(ForestError::corrupt(format!(
                "revision count exceeds {MAX_REV_COUNT}"
            )));
        }
        let end = pos + size;
        if size < RAW_REV_HEADER_SIZE || end + TREE_TERMINATOR_SIZE > data.len() {
            return Err(ForestError::corrupt(format!(
                "revision record at {pos} has bad size {size}"
            )));
        }
        revs.push(read_rev(raw, pos, end, seq)?);
        pos = end;
    }
    debug!(revisions = revs.len(), "decoded revision tree");
    Ok(revs)
}

/// Parse one record occupying `raw[pos..end]`.
fn read_rev(raw: &Bytes, pos: usize, end: usize, seq: Sequence) -> Result<Revision> {
    let data: &[u8] = raw;
    let parent_index = u16::from_be_bytes([data[pos + 4], data[pos + 5]]);
    let delta_ref_index = u16::from_be_bytes([data[pos + 6], data[pos + 7]]);
    let flag_byte = data[pos + 8];
    let rev_id_len = usize::from(data[pos + 9]);

    let id_start = pos + RAW_REV_HEADER_SIZE;
    if id_start + rev_id_len > end {
        return Err(ForestError::corrupt(format!(
            "revision ID overruns record at {pos}"
        )));
    }
    let rev_id = RevId::new(raw.slice(id_start..id_start + rev_id_len));

    let tail_start = id_start + rev_id_len;
    let (sequence, seq_len) = get_uvarint(&data[tail_start..end])
        .ok_or_else(|| ForestError::corrupt(format!("bad sequence varint at {tail_start}")))?;
    let body_start = tail_start + seq_len;

    let mut body = Bytes::new();
    let mut old_body_offset = 0u64;
    if flag_byte & HAS_DATA != 0 {
        body = raw.slice(body_start..end);
    } else if flag_byte & HAS_BODY_OFFSET != 0 {
        (old_body_offset, _) = get_uvarint(&data[body_start..end]).ok_or_else(|| {
            ForestError::corrupt(format!("bad body offset varint at {body_start}"))
        })?;
    }

    Ok(Revision {
        rev_id,
        sequence: if sequence == 0 { seq } else { sequence },
        body,
        old_body_offset,
        flags: RevisionFlags::from_bits_truncate(flag_byte) & RevisionFlags::PERSISTENT,
        parent_index,
        delta_ref_index,
    })
}
