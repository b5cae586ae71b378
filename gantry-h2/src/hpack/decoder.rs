//! HPACK header block decoding (RFC 7541 §6).

use bytes::Bytes;

use super::huffman;
use super::table::{DynamicTable, Field};

/// Decoding failures. All of them escalate to a COMPRESSION_ERROR on the
/// connection; a header block is never partially applied.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DecoderError {
    /// Index zero or past the end of the combined table space.
    InvalidTableIndex,
    /// Variable-length integer exceeded 32 bits.
    IntegerOverflow,
    /// The block ended inside a field representation.
    NeedMore,
    /// A Huffman code not in the table, or an explicit EOS symbol.
    InvalidHuffmanCode,
    /// Huffman padding longer than 7 bits or not all ones.
    InvalidHuffmanPadding,
    /// A dynamic table size update above the advertised limit.
    InvalidMaxDynamicSize,
    /// A dynamic table size update after the first field of a block.
    InvalidSizeUpdatePosition,
}

impl std::fmt::Display for DecoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidTableIndex => "invalid table index",
            Self::IntegerOverflow => "integer overflow",
            Self::NeedMore => "truncated header block",
            Self::InvalidHuffmanCode => "invalid huffman code",
            Self::InvalidHuffmanPadding => "invalid huffman padding",
            Self::InvalidMaxDynamicSize => "table size update above limit",
            Self::InvalidSizeUpdatePosition => "table size update after fields",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for DecoderError {}

/// Decodes header blocks against a bounded dynamic table.
#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    /// Ceiling for peer-signalled table sizes: the value this side
    /// advertised in SETTINGS_HEADER_TABLE_SIZE.
    size_limit: usize,
}

impl Decoder {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_size),
            size_limit: max_size,
        }
    }

    #[must_use]
    pub fn table_size(&self) -> usize {
        self.table.size()
    }

    #[must_use]
    pub fn table_max_size(&self) -> usize {
        self.table.max_size()
    }

    /// Lowers (or raises) the advertised ceiling. Entries are evicted
    /// immediately when the current table no longer fits, before any
    /// further decoding.
    pub fn set_size_limit(&mut self, limit: usize) {
        self.size_limit = limit;
        if self.table.max_size() > limit {
            self.table.resize(limit);
        }
    }

    /// Decodes one complete header block, invoking `f` per field in
    /// order. On error the block must be abandoned and the connection
    /// torn down; the table may have observed a prefix of the block.
    pub fn decode<F>(&mut self, src: &[u8], mut f: F) -> Result<(), DecoderError>
    where
        F: FnMut(Field),
    {
        let mut pos = 0;
        let mut seen_field = false;

        while pos < src.len() {
            let b = src[pos];
            if b & 0x80 != 0 {
                // Indexed field.
                let (index, used) = decode_int(&src[pos..], 7)?;
                pos += used;
                let field = self.table.get(index as usize)?;
                seen_field = true;
                f(field);
            } else if b & 0xc0 == 0x40 {
                // Literal with incremental indexing.
                let (name, value, used) = self.decode_literal(&src[pos..], 6)?;
                pos += used;
                let field = Field::new(name, value);
                self.table.insert(field.clone());
                seen_field = true;
                f(field);
            } else if b & 0xe0 == 0x20 {
                // Dynamic table size update; only legal before any field.
                if seen_field {
                    return Err(DecoderError::InvalidSizeUpdatePosition);
                }
                let (size, used) = decode_int(&src[pos..], 5)?;
                pos += used;
                if size as usize > self.size_limit {
                    return Err(DecoderError::InvalidMaxDynamicSize);
                }
                tracing::trace!(size, "dynamic table size update");
                self.table.resize(size as usize);
            } else {
                // Literal without indexing (0x00) or never indexed (0x10).
                let sensitive = b & 0x10 != 0;
                let (name, value, used) = self.decode_literal(&src[pos..], 4)?;
                pos += used;
                let mut field = Field::new(name, value);
                field.sensitive = sensitive;
                seen_field = true;
                f(field);
            }
        }
        Ok(())
    }

    fn decode_literal(
        &self,
        src: &[u8],
        prefix: u8,
    ) -> Result<(Bytes, Bytes, usize), DecoderError> {
        let (index, mut used) = decode_int(src, prefix)?;
        let name = if index == 0 {
            let (name, n) = decode_string(&src[used..])?;
            used += n;
            name
        } else {
            self.table.get(index as usize)?.name
        };
        let (value, n) = decode_string(&src[used..])?;
        used += n;
        Ok((name, value, used))
    }
}

/// Decodes an N-bit-prefix variable length integer (RFC 7541 §5.1).
/// Returns the value and the octets consumed.
pub(crate) fn decode_int(src: &[u8], prefix: u8) -> Result<(u32, usize), DecoderError> {
    debug_assert!((1..=8).contains(&prefix));
    if src.is_empty() {
        return Err(DecoderError::NeedMore);
    }
    let mask = if prefix == 8 { 0xff } else { (1u8 << prefix) - 1 };
    let mut value = u64::from(src[0] & mask);
    if value < u64::from(mask) {
        return Ok((value as u32, 1));
    }
    let mut shift = 0u32;
    let mut used = 1;
    loop {
        let Some(&b) = src.get(used) else {
            return Err(DecoderError::NeedMore);
        };
        used += 1;
        value += u64::from(b & 0x7f) << shift;
        shift += 7;
        if value > u64::from(u32::MAX) {
            return Err(DecoderError::IntegerOverflow);
        }
        if b & 0x80 == 0 {
            return Ok((value as u32, used));
        }
        if shift > 28 {
            return Err(DecoderError::IntegerOverflow);
        }
    }
}

/// Decodes a string literal (RFC 7541 §5.2): huffman bit, length, octets.
fn decode_string(src: &[u8]) -> Result<(Bytes, usize), DecoderError> {
    if src.is_empty() {
        return Err(DecoderError::NeedMore);
    }
    let huff = src[0] & 0x80 != 0;
    let (len, mut used) = decode_int(src, 7)?;
    let len = len as usize;
    if src.len() < used + len {
        return Err(DecoderError::NeedMore);
    }
    let raw = &src[used..used + len];
    used += len;
    let bytes = if huff {
        let mut out = Vec::with_capacity(len * 2);
        huffman::decode(raw, &mut out)?;
        Bytes::from(out)
    } else {
        Bytes::copy_from_slice(raw)
    };
    Ok((bytes, used))
}
