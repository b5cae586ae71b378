//! HPACK header compression (RFC 7541).

mod decoder;
mod encoder;
mod huffman;
mod table;

pub use self::decoder::{Decoder, DecoderError};
pub use self::encoder::Encoder;
pub use self::table::{DynamicTable, Field};
