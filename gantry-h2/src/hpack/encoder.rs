//! HPACK header block encoding (RFC 7541 §6).
//!
//! The encoder keeps its own dynamic table, mirrored by the peer's
//! decoder: exact matches emit an index, name matches emit a literal with
//! incremental indexing against the known name, and sensitive fields are
//! emitted never-indexed and kept out of the table. Strings are Huffman
//! coded when that is shorter.

use bytes::{BufMut, BytesMut};

use super::huffman;
use super::table::{DynamicTable, Field, STATIC_TABLE};

#[derive(Debug)]
pub struct Encoder {
    table: DynamicTable,
    /// A table resize to signal at the start of the next block
    /// (triggered by the peer's SETTINGS_HEADER_TABLE_SIZE).
    pending_resize: Option<usize>,
}

enum Index {
    /// Exact (name, value) hit.
    Full(usize),
    /// Name-only hit.
    Name(usize),
    None,
}

impl Encoder {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_size),
            pending_resize: None,
        }
    }

    #[must_use]
    pub fn table_size(&self) -> usize {
        self.table.size()
    }

    /// Adopts the peer's new table ceiling; the resize signal is emitted
    /// at the start of the next header block, as the RFC requires.
    pub fn update_max_size(&mut self, max_size: usize) {
        self.pending_resize = Some(max_size);
        // Evict eagerly so memory shrinks now; the signal still goes out
        // with the next block.
        if max_size < self.table.max_size() {
            self.table.resize(max_size);
        }
    }

    /// Encodes one header block.
    pub fn encode<'a, I>(&mut self, fields: I, dst: &mut BytesMut)
    where
        I: IntoIterator<Item = &'a Field>,
    {
        if let Some(size) = self.pending_resize.take() {
            self.table.resize(size);
            encode_int(size as u32, 5, 0x20, dst);
        }

        for field in fields {
            self.encode_field(field, dst);
        }
    }

    fn encode_field(&mut self, field: &Field, dst: &mut BytesMut) {
        if field.sensitive {
            // Never indexed: protects the value from plaintext reuse in
            // either table.
            match self.search(field) {
                Index::Full(idx) | Index::Name(idx) => {
                    encode_int(idx as u32, 4, 0x10, dst);
                }
                Index::None => {
                    dst.put_u8(0x10);
                    encode_string(&field.name, dst);
                }
            }
            encode_string(&field.value, dst);
            return;
        }

        match self.search(field) {
            Index::Full(idx) => {
                encode_int(idx as u32, 7, 0x80, dst);
            }
            Index::Name(idx) => {
                encode_int(idx as u32, 6, 0x40, dst);
                encode_string(&field.value, dst);
                self.table.insert(field.clone());
            }
            Index::None => {
                dst.put_u8(0x40);
                encode_string(&field.name, dst);
                encode_string(&field.value, dst);
                self.table.insert(field.clone());
            }
        }
    }

    fn search(&self, field: &Field) -> Index {
        let mut name_idx = None;
        for (i, (name, value)) in STATIC_TABLE.iter().enumerate() {
            if field.name == name.as_bytes() {
                if field.value == value.as_bytes() {
                    return Index::Full(i + 1);
                }
                name_idx.get_or_insert(i + 1);
            }
        }
        for (idx, entry) in self.table.iter() {
            if entry.name == field.name {
                if entry.value == field.value {
                    return Index::Full(idx);
                }
                name_idx.get_or_insert(idx);
            }
        }
        match name_idx {
            Some(idx) => Index::Name(idx),
            None => Index::None,
        }
    }
}

/// Encodes an N-bit-prefix integer with `flags` in the spare prefix bits.
pub(crate) fn encode_int(value: u32, prefix: u8, flags: u8, dst: &mut BytesMut) {
    debug_assert!((1..=8).contains(&prefix));
    let mask: u32 = (1 << prefix) - 1;
    if value < mask {
        dst.put_u8(flags | value as u8);
        return;
    }
    dst.put_u8(flags | mask as u8);
    let mut rest = value - mask;
    while rest >= 128 {
        dst.put_u8((rest & 0x7f) as u8 | 0x80);
        rest >>= 7;
    }
    dst.put_u8(rest as u8);
}

/// Encodes a string literal, Huffman coded when shorter.
fn encode_string(src: &[u8], dst: &mut BytesMut) {
    let huff_len = huffman::encoded_len(src);
    if huff_len < src.len() {
        encode_int(huff_len as u32, 7, 0x80, dst);
        let mut encoded = Vec::with_capacity(huff_len);
        huffman::encode(src, &mut encoded);
        debug_assert_eq!(encoded.len(), huff_len);
        dst.put_slice(&encoded);
    } else {
        encode_int(src.len() as u32, 7, 0x00, dst);
        dst.put_slice(src);
    }
}
