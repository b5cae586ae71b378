use bytes::BufMut;

use gantry_core::buf::Buffer;

use super::{StreamId, HEADER_LEN};

/// The fixed 9-octet frame header:
/// `len(24) | type(8) | flags(8) | R(1) | stream_id(31)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Head {
    kind: Kind,
    flag: u8,
    stream_id: StreamId,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Kind {
    Data,
    Headers,
    Priority,
    Reset,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    /// Any type this implementation does not know; its payload is
    /// skipped by length.
    Unknown(u8),
}

// ===== impl Head =====

impl Head {
    #[must_use]
    pub fn new(kind: Kind, flag: u8, stream_id: StreamId) -> Self {
        Self {
            kind,
            flag,
            stream_id,
        }
    }

    /// Parses the 9-octet header. `header` must hold at least
    /// [`HEADER_LEN`](super::HEADER_LEN) bytes.
    #[must_use]
    pub fn parse(header: &[u8]) -> Self {
        let (stream_id, _) = StreamId::parse(&header[5..]);
        Self {
            kind: Kind::new(header[3]),
            flag: header[4],
            stream_id,
        }
    }

    /// The payload length field of a raw header.
    #[must_use]
    pub fn parse_len(header: &[u8]) -> u32 {
        (u32::from(header[0]) << 16) | (u32::from(header[1]) << 8) | u32::from(header[2])
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn flag(&self) -> u8 {
        self.flag
    }

    pub fn encode<T: BufMut>(&self, payload_len: usize, dst: &mut T) {
        debug_assert!(payload_len < 1 << 24);
        dst.put_uint(payload_len as u64, 3);
        dst.put_u8(self.kind.into());
        dst.put_u8(self.flag);
        dst.put_u32(u32::from(self.stream_id));
    }

    /// Reads the next frame header from a demux buffer without consuming
    /// it, tolerating wrapped content. `None` until 9 octets are there.
    #[must_use]
    pub fn peek(buf: &Buffer) -> Option<(Self, u32)> {
        if buf.data() < HEADER_LEN {
            return None;
        }
        let mut raw = [0u8; HEADER_LEN];
        buf.get_block(&mut raw, 0);
        Some((Self::parse(&raw), Self::parse_len(&raw)))
    }

    /// Consumes the header [`Head::peek`] saw: exactly 9 octets iff the
    /// peek succeeded, nothing otherwise.
    #[must_use]
    pub fn take(buf: &mut Buffer) -> Option<(Self, u32)> {
        let peeked = Self::peek(buf)?;
        buf.advance(HEADER_LEN);
        Some(peeked)
    }
}

// ===== impl Kind =====

impl Kind {
    #[must_use]
    pub fn new(byte: u8) -> Self {
        match byte {
            0 => Self::Data,
            1 => Self::Headers,
            2 => Self::Priority,
            3 => Self::Reset,
            4 => Self::Settings,
            5 => Self::PushPromise,
            6 => Self::Ping,
            7 => Self::GoAway,
            8 => Self::WindowUpdate,
            9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<Kind> for u8 {
    fn from(src: Kind) -> Self {
        match src {
            Kind::Data => 0,
            Kind::Headers => 1,
            Kind::Priority => 2,
            Kind::Reset => 3,
            Kind::Settings => 4,
            Kind::PushPromise => 5,
            Kind::Ping => 6,
            Kind::GoAway => 7,
            Kind::WindowUpdate => 8,
            Kind::Continuation => 9,
            Kind::Unknown(other) => other,
        }
    }
}
