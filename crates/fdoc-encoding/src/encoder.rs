//! Streaming writer for the tagged binary value format.
//!
//! Values are emitted depth-first: scalars directly, containers by
//! declaring their size up front (`begin_array`/`begin_dict`), writing
//! exactly that many items, and closing the frame. Dictionaries reserve a
//! side index of 16-bit key hashes that is filled in when the frame closes,
//! so readers can probe for a key without decoding every entry.
//!
//! Two interning schemes reduce repeated strings:
//!
//! - **Shared strings** (opt-in): the second occurrence of a string becomes
//!   a backward reference to the first, whose code byte is rewritten from
//!   [`TypeCode::String`] to [`TypeCode::SharedString`] in place.
//! - **Extern strings**: strings interned into a caller-owned table and
//!   referenced by 1-based index; the table lives outside the stream.

use std::collections::HashMap;

use fdoc_error::{ForestError, Result};
use fdoc_types::limits::{MAX_SHARED_STRING_LEN, MIN_SHARED_STRING_LEN};
use fdoc_types::{put_uvarint_into, MAX_VARINT_LEN64};

use crate::typecode::{hash_code, TypeCode};
use crate::writer::Writer;

/// One open container (or the stream root).
#[derive(Debug)]
struct Frame {
    /// Declared number of items.
    count: u64,
    /// Items written so far.
    i: u64,
    /// Key hashes collected for a dict frame; empty for arrays and the root.
    hashes: Vec<u16>,
    /// Output offset of the dict's reserved hash index.
    index_pos: usize,
}

impl Frame {
    fn root() -> Self {
        Self {
            count: 0,
            i: 0,
            hashes: Vec::new(),
            index_pos: 0,
        }
    }
}

/// Streaming encoder for the tagged value format.
///
/// Single-owner and strictly sequential: the output buffer is exclusively
/// owned by the writer until [`into_output`](Self::into_output).
#[derive(Debug)]
pub struct DataWriter<'e> {
    out: Writer,
    states: Vec<Frame>,
    shared_strings_enabled: bool,
    /// String content -> output offset of its first occurrence's code byte.
    shared_strings: HashMap<String, usize>,
    extern_strings: Option<ExternTable<'e>>,
}

#[derive(Debug)]
struct ExternTable<'e> {
    strings: &'e mut Vec<String>,
    /// String content -> 1-based id. Inverse of `strings`.
    lookup: HashMap<String, u32>,
    max: u32,
}

impl<'e> DataWriter<'e> {
    /// Create a writer without extern string interning.
    #[must_use]
    pub fn new(out: Writer) -> Self {
        Self {
            out,
            states: vec![Frame::root()],
            shared_strings_enabled: false,
            shared_strings: HashMap::new(),
            extern_strings: None,
        }
    }

    /// Create a writer that interns strings into the caller-owned
    /// `extern_strings` table, growing it up to `max_extern_strings`
    /// entries.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_extern_strings(
        out: Writer,
        extern_strings: &'e mut Vec<String>,
        max_extern_strings: u32,
    ) -> Self {
        let lookup = extern_strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32 + 1))
            .collect();
        let mut writer = Self::new(out);
        writer.extern_strings = Some(ExternTable {
            strings: extern_strings,
            lookup,
            max: max_extern_strings,
        });
        writer
    }

    /// Enable intra-stream string sharing.
    pub fn set_shared_strings_enabled(&mut self, enabled: bool) {
        self.shared_strings_enabled = enabled;
    }

    /// Borrow the encoded bytes so far. Invalidated by any further write.
    #[must_use]
    pub fn output(&self) -> &[u8] {
        self.out.output()
    }

    /// Finish encoding and take the output.
    #[must_use]
    pub fn into_output(self) -> Vec<u8> {
        self.out.into_output()
    }

    fn state_mut(&mut self) -> &mut Frame {
        self.states.last_mut().expect("root frame always present")
    }

    /// Emit a type code, counting one item in the open frame.
    fn add_type_code(&mut self, code: TypeCode) {
        self.state_mut().i += 1;
        self.out.write(&[code as u8]);
    }

    fn add_uvarint(&mut self, n: u64) {
        let mut buf = [0u8; MAX_VARINT_LEN64];
        let len = put_uvarint_into(&mut buf, n);
        self.out.write(&buf[..len]);
    }

    // -----------------------------------------------------------------------
    // Scalars
    // -----------------------------------------------------------------------

    /// Write a null.
    pub fn write_null(&mut self) {
        self.add_type_code(TypeCode::Null);
    }

    /// Write a boolean.
    pub fn write_bool(&mut self, b: bool) {
        self.add_type_code(if b { TypeCode::True } else { TypeCode::False });
    }

    /// Write a signed integer in the narrowest of the Int8/16/32/64 forms
    /// that holds it.
    pub fn write_int(&mut self, i: i64) {
        let (code, size) = if i >= i64::from(i8::MIN) && i <= i64::from(i8::MAX) {
            (TypeCode::Int8, 1)
        } else if i >= i64::from(i16::MIN) && i <= i64::from(i16::MAX) {
            (TypeCode::Int16, 2)
        } else if i >= i64::from(i32::MIN) && i <= i64::from(i32::MAX) {
            (TypeCode::Int32, 4)
        } else {
            (TypeCode::Int64, 8)
        };
        self.add_type_code(code);
        let be = i.to_be_bytes();
        self.out.write(&be[8 - size..]);
    }

    /// Write an unsigned integer, using the signed forms when it fits.
    #[allow(clippy::cast_possible_wrap)]
    pub fn write_uint(&mut self, u: u64) {
        if u < i64::MAX as u64 {
            return self.write_int(u as i64);
        }
        self.add_type_code(TypeCode::UInt64);
        self.out.write(&u.to_be_bytes());
    }

    /// Write a double, demoting to the narrowest integer form when the
    /// value is integral. Fails on NaN.
    #[allow(clippy::float_cmp, clippy::cast_possible_truncation)]
    pub fn write_double(&mut self, n: f64) -> Result<()> {
        if n.is_nan() {
            return Err(ForestError::NanNotSupported);
        }
        if n == (n as i64) as f64 {
            self.write_int(n as i64);
            return Ok(());
        }
        self.add_type_code(TypeCode::Float64);
        self.out.write(&n.to_be_bytes());
        Ok(())
    }

    /// Write a float, demoting integral values through `i32`. Fails on NaN.
    #[allow(clippy::float_cmp, clippy::cast_possible_truncation)]
    pub fn write_float(&mut self, n: f32) -> Result<()> {
        if n.is_nan() {
            return Err(ForestError::NanNotSupported);
        }
        if n == (n as i32) as f32 {
            self.write_int(i64::from(n as i32));
            return Ok(());
        }
        self.add_type_code(TypeCode::Float32);
        self.out.write(&n.to_be_bytes());
        Ok(())
    }

    /// Write a number kept in its original textual form.
    pub fn write_raw_number(&mut self, digits: &str) {
        self.add_type_code(TypeCode::RawNumber);
        self.add_uvarint(digits.len() as u64);
        self.out.write(digits.as_bytes());
    }

    /// Write a date as seconds since the Unix epoch.
    pub fn write_date(&mut self, seconds_since_epoch: u64) {
        self.add_type_code(TypeCode::Date);
        self.add_uvarint(seconds_since_epoch);
    }

    /// Write opaque binary data.
    pub fn write_data(&mut self, data: &[u8]) {
        self.add_type_code(TypeCode::Data);
        self.add_uvarint(data.len() as u64);
        self.out.write(data);
    }

    // -----------------------------------------------------------------------
    // Strings
    // -----------------------------------------------------------------------

    /// Write a string, preferring an extern reference, then a shared
    /// reference, then the literal bytes.
    ///
    /// `can_add_extern` permits growing the extern table for a string not
    /// yet interned there.
    pub fn write_string(&mut self, s: &str, can_add_extern: bool) -> Result<()> {
        if self.extern_strings.is_some() {
            if let Some(id) = self.intern_extern_string(s, can_add_extern) {
                self.write_extern_string(id);
                return Ok(());
            }
        }

        if self.shared_strings_enabled
            && (MIN_SHARED_STRING_LEN..=MAX_SHARED_STRING_LEN).contains(&s.len())
        {
            let cur_offset = self.out.len();
            if cur_offset > u32::MAX as usize {
                return Err(ForestError::OutputTooLarge);
            }
            if let Some(&first_offset) = self.shared_strings.get(s) {
                // Flip the first occurrence's code byte to SharedString and
                // reference it by backward distance.
                self.out
                    .rewrite(first_offset, &[TypeCode::SharedString as u8]);
                self.add_type_code(TypeCode::SharedStringRef);
                self.add_uvarint((cur_offset - first_offset) as u64);
                return Ok(());
            }
            self.shared_strings.insert(s.to_owned(), cur_offset);
        }

        self.add_type_code(TypeCode::String);
        self.add_uvarint(s.len() as u64);
        self.out.write(s.as_bytes());
        Ok(())
    }

    /// Write a reference to an already-interned extern string.
    pub fn write_extern_string(&mut self, extern_ref: u32) {
        assert!(extern_ref > 0, "extern string ids are 1-based");
        self.add_type_code(TypeCode::ExternStringRef);
        self.add_uvarint(u64::from(extern_ref));
    }

    /// Look up (or intern) `s` in the extern table, returning its 1-based
    /// id, or `None` when it isn't there and can't be added.
    #[allow(clippy::cast_possible_truncation)]
    fn intern_extern_string(&mut self, s: &str, can_add: bool) -> Option<u32> {
        let table = self.extern_strings.as_mut()?;
        if let Some(&id) = table.lookup.get(s) {
            return Some(id);
        }
        let n = table.strings.len() as u32;
        if n < table.max && can_add {
            table.strings.push(s.to_owned());
            let id = n + 1;
            table.lookup.insert(s.to_owned(), id);
            return Some(id);
        }
        None
    }

    // -----------------------------------------------------------------------
    // Containers
    // -----------------------------------------------------------------------

    /// Open an array declared to hold `count` values.
    pub fn begin_array(&mut self, count: u32) {
        self.add_type_code(TypeCode::Array);
        self.add_uvarint(u64::from(count));
        self.push_frame(count);
    }

    /// Close the innermost array. Fails unless exactly the declared number
    /// of values was written.
    pub fn end_array(&mut self) -> Result<()> {
        self.pop_frame()
    }

    /// Open a dictionary declared to hold `count` key/value pairs,
    /// reserving its key-hash index.
    pub fn begin_dict(&mut self, count: u32) {
        self.add_type_code(TypeCode::Dict);
        self.add_uvarint(u64::from(count));
        self.push_frame(count);
        // Placeholder for the hash index, rewritten by end_dict.
        let index_pos = self.out.len();
        let placeholder = vec![0u8; count as usize * 2];
        self.out.write(&placeholder);
        let frame = self.state_mut();
        frame.hashes = vec![0u16; count as usize];
        frame.index_pos = index_pos;
    }

    /// Write a dictionary key. The key is written as a string (sharing and
    /// extern interning apply) and its hash recorded in the frame's index;
    /// keys don't count toward the declared item count.
    pub fn write_key(&mut self, key: &str, can_add_extern: bool) -> Result<()> {
        let hash = hash_code(key);
        self.write_string(key, can_add_extern)?;
        self.record_key_hash(hash);
        Ok(())
    }

    /// Write a dictionary key that is already interned as an extern string,
    /// with a caller-supplied hash.
    pub fn write_extern_key(&mut self, extern_ref: u32, hash: u16) {
        self.write_extern_string(extern_ref);
        self.record_key_hash(hash);
    }

    /// Close the innermost dictionary, filling in the key-hash index. Fails
    /// unless exactly the declared number of pairs was written.
    pub fn end_dict(&mut self) -> Result<()> {
        let frame = self.states.last().expect("root frame always present");
        let mut index = Vec::with_capacity(frame.hashes.len() * 2);
        for hash in &frame.hashes {
            index.extend_from_slice(&hash.to_be_bytes());
        }
        let index_pos = frame.index_pos;
        self.out.rewrite(index_pos, &index);
        self.pop_frame()
    }

    fn push_frame(&mut self, count: u32) {
        self.states.push(Frame {
            count: u64::from(count),
            i: 0,
            hashes: Vec::new(),
            index_pos: 0,
        });
    }

    fn pop_frame(&mut self) -> Result<()> {
        assert!(self.states.len() > 1, "no open container to close");
        let frame = self.states.last().expect("checked above");
        if frame.i != frame.count {
            return Err(ForestError::MismatchedCount {
                declared: frame.count,
                written: frame.i,
            });
        }
        self.states.pop();
        Ok(())
    }

    /// Uncount the just-written key and slot its hash into the frame index.
    fn record_key_hash(&mut self, hash: u16) {
        let frame = self.state_mut();
        frame.i -= 1;
        let slot = frame.i as usize;
        frame.hashes[slot] = hash;
    }
}
