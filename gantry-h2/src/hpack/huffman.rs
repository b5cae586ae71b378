//! Huffman coding for HPACK string literals (RFC 7541 §5.2, Appendix B).
//!
//! The RFC's code assignment is canonical: codes are allocated in order of
//! increasing length and, within a length, in symbol order. Storing only
//! the per-symbol code lengths is therefore enough to reconstruct the
//! exact codes, and decoding can use the classic canonical-Huffman walk
//! (per-length first-code and symbol offsets) instead of a generated
//! state table.

use std::sync::OnceLock;

use super::DecoderError;

/// Code length in bits for every symbol 0..=255 plus EOS (index 256),
/// from RFC 7541 Appendix B.
#[rustfmt::skip]
const CODE_LENGTHS: [u8; 257] = [
    13, 23, 28, 28, 28, 28, 28, 28, 28, 24, 30, 28, 28, 30, 28, 28, // 0
    28, 28, 28, 28, 28, 28, 30, 28, 28, 28, 28, 28, 28, 28, 28, 28, // 16
     6, 10, 10, 12, 13,  6,  8, 11, 10, 10,  8, 11,  8,  6,  6,  6, // 32
     5,  5,  5,  6,  6,  6,  6,  6,  6,  6,  7,  8, 15,  6, 12, 10, // 48
    13,  6,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7, // 64
     7,  7,  7,  7,  7,  7,  7,  7,  8,  7,  8, 13, 19, 13, 14,  6, // 80
    15,  5,  6,  5,  6,  5,  6,  6,  6,  5,  7,  7,  6,  6,  6,  5, // 96
     6,  7,  6,  5,  5,  6,  7,  7,  7,  7,  7, 15, 11, 14, 13, 28, // 112
    20, 22, 20, 20, 22, 22, 22, 23, 22, 23, 23, 23, 23, 23, 24, 23, // 128
    24, 24, 22, 23, 24, 23, 23, 23, 23, 21, 22, 23, 22, 23, 23, 24, // 144
    22, 21, 20, 22, 22, 23, 23, 21, 23, 22, 22, 24, 21, 22, 23, 23, // 160
    21, 21, 22, 21, 23, 22, 23, 23, 20, 22, 22, 22, 23, 22, 22, 23, // 176
    26, 26, 20, 19, 22, 23, 22, 25, 26, 26, 26, 27, 27, 26, 24, 25, // 192
    19, 21, 26, 27, 27, 26, 27, 24, 21, 21, 26, 26, 28, 27, 27, 27, // 208
    20, 24, 20, 21, 22, 21, 21, 23, 22, 22, 25, 25, 24, 24, 26, 23, // 224
    26, 27, 26, 26, 27, 27, 27, 27, 27, 28, 27, 27, 27, 27, 27, 26, // 240
    30,                                                             // 256 EOS
];

const EOS: u16 = 256;
const MAX_BITS: usize = 30;

struct Table {
    /// Code for each symbol, right-aligned.
    codes: [u32; 257],
    /// Symbols sorted by (length, symbol): the canonical order.
    symbols: [u16; 257],
    /// First code of each bit length.
    first_code: [u32; MAX_BITS + 1],
    /// Index into `symbols` of the first code of each bit length.
    first_index: [u16; MAX_BITS + 1],
    /// Number of codes of each bit length.
    count: [u16; MAX_BITS + 1],
}

fn table() -> &'static Table {
    static TABLE: OnceLock<Table> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut count = [0u16; MAX_BITS + 1];
        for &len in CODE_LENGTHS.iter() {
            count[len as usize] += 1;
        }

        let mut first_code = [0u32; MAX_BITS + 1];
        let mut first_index = [0u16; MAX_BITS + 1];
        let mut code = 0u32;
        let mut index = 0u16;
        for len in 1..=MAX_BITS {
            code <<= 1;
            first_code[len] = code;
            first_index[len] = index;
            code += u32::from(count[len]);
            index += count[len];
        }

        let mut symbols = [0u16; 257];
        let mut next = first_index;
        let mut codes = [0u32; 257];
        for sym in 0..257u16 {
            let len = CODE_LENGTHS[sym as usize] as usize;
            let slot = next[len];
            next[len] += 1;
            symbols[slot as usize] = sym;
            codes[sym as usize] = first_code[len] + u32::from(slot - first_index[len]);
        }

        Table {
            codes,
            symbols,
            first_code,
            first_index,
            count,
        }
    })
}

/// Length in octets of `src` once Huffman encoded.
pub(crate) fn encoded_len(src: &[u8]) -> usize {
    let bits: usize = src
        .iter()
        .map(|&b| CODE_LENGTHS[b as usize] as usize)
        .sum();
    bits.div_ceil(8)
}

/// Huffman-encodes `src`, padding the final octet with the EOS prefix.
pub(crate) fn encode(src: &[u8], dst: &mut Vec<u8>) {
    let table = table();
    let mut acc: u64 = 0;
    let mut pending = 0usize;
    for &b in src {
        let len = CODE_LENGTHS[b as usize] as usize;
        acc = (acc << len) | u64::from(table.codes[b as usize]);
        pending += len;
        while pending >= 8 {
            pending -= 8;
            dst.push((acc >> pending) as u8);
        }
    }
    if pending > 0 {
        // Pad with the MSBs of EOS (all ones).
        dst.push(((acc << (8 - pending)) as u8) | (0xff >> pending));
    }
}

/// Decodes a Huffman-coded string. Rejects over-long padding, padding
/// that is not all ones, and an explicit EOS in the body.
pub(crate) fn decode(src: &[u8], dst: &mut Vec<u8>) -> Result<(), DecoderError> {
    let table = table();
    let mut code: u32 = 0;
    let mut len: usize = 0;
    for &byte in src {
        for shift in (0..8).rev() {
            let bit = u32::from(byte >> shift) & 1;
            code = (code << 1) | bit;
            len += 1;
            if len > MAX_BITS {
                return Err(DecoderError::InvalidHuffmanCode);
            }
            let n = u32::from(table.count[len]);
            if n > 0 && code >= table.first_code[len] && code < table.first_code[len] + n {
                let slot = table.first_index[len] as usize + (code - table.first_code[len]) as usize;
                let sym = table.symbols[slot];
                if sym == EOS {
                    // EOS inside the body is a coding error (RFC 7541 §5.2).
                    return Err(DecoderError::InvalidHuffmanCode);
                }
                dst.push(sym as u8);
                code = 0;
                len = 0;
            }
        }
    }
    // Remaining bits are padding: fewer than 8, all ones.
    if len >= 8 || code != (1u32 << len) - 1 {
        return Err(DecoderError::InvalidHuffmanPadding);
    }
    Ok(())
}
