use std::fmt;

use bytes::{Buf, BufMut, Bytes};

use super::{debug_flags, strip_padding, Error, Head, Kind, StreamId};

/// A DATA frame: a chunk of a stream's body, counted against both the
/// stream and connection flow-control windows.
#[derive(Eq, PartialEq)]
pub struct Data<T = Bytes> {
    stream_id: StreamId,
    data: T,
    flags: DataFlags,
    pad_len: Option<u8>,
}

#[derive(Copy, Clone, Default, Eq, PartialEq)]
struct DataFlags(u8);

const END_STREAM: u8 = 0x1;
const PADDED: u8 = 0x8;
const ALL: u8 = END_STREAM | PADDED;

impl<T> Data<T> {
    pub fn new(stream_id: StreamId, payload: T) -> Self {
        debug_assert!(!stream_id.is_zero());
        Self {
            stream_id,
            data: payload,
            flags: DataFlags::default(),
            pad_len: None,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn is_end_stream(&self) -> bool {
        self.flags.is_end_stream()
    }

    pub fn set_end_stream(&mut self, on: bool) {
        if on {
            self.flags.set_end_stream();
        } else {
            self.flags.unset_end_stream();
        }
    }

    #[must_use]
    pub fn payload(&self) -> &T {
        &self.data
    }

    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub fn into_payload(self) -> T {
        self.data
    }

    /// Total number of flow-controlled octets this frame consumed on the
    /// wire: content plus any pad-length octet and padding.
    #[must_use]
    pub fn flow_len(&self) -> u32
    where
        T: AsRef<[u8]>,
    {
        let pad = match self.pad_len {
            Some(len) => len as u32 + 1,
            None => 0,
        };
        self.data.as_ref().len() as u32 + pad
    }
}

impl Data<Bytes> {
    /// Builds a DATA frame from a raw payload, handling the PADDED flag.
    pub fn load(head: Head, mut payload: Bytes) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Data);
        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        let flags = DataFlags::load(head.flag());
        let pad_len = if flags.is_padded() {
            let (start, end) = strip_padding(&payload)?;
            let pad = payload[0];
            payload = payload.slice(start..end);
            Some(pad)
        } else {
            None
        };
        Ok(Self {
            stream_id: head.stream_id(),
            data: payload,
            flags,
            pad_len,
        })
    }
}

impl<T: Buf> Data<T> {
    /// Encodes the frame header and copies the payload into `dst`.
    /// Padding is never produced on the send side.
    pub fn encode<B: BufMut>(&mut self, dst: &mut B) {
        let len = self.data.remaining();
        debug_assert!(len < 1 << 24);
        let head = Head::new(Kind::Data, self.flags.into(), self.stream_id);
        head.encode(len, dst);
        while self.data.has_remaining() {
            let chunk = self.data.chunk();
            let n = chunk.len();
            dst.put_slice(chunk);
            self.data.advance(n);
        }
    }
}

impl<T> fmt::Debug for Data<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = fmt.debug_struct("Data");
        f.field("stream_id", &self.stream_id);
        f.field("flags", &self.flags);
        if let Some(pad) = self.pad_len {
            f.field("pad_len", &pad);
        }
        f.finish()
    }
}

// ===== impl DataFlags =====

impl DataFlags {
    fn load(bits: u8) -> Self {
        Self(bits & ALL)
    }

    fn is_end_stream(&self) -> bool {
        self.0 & END_STREAM == END_STREAM
    }

    fn set_end_stream(&mut self) {
        self.0 |= END_STREAM;
    }

    fn unset_end_stream(&mut self) {
        self.0 &= !END_STREAM;
    }

    fn is_padded(&self) -> bool {
        self.0 & PADDED == PADDED
    }
}

impl From<DataFlags> for u8 {
    fn from(src: DataFlags) -> Self {
        // PADDED is a receive-side artifact; never emit it.
        src.0 & !PADDED
    }
}

impl fmt::Debug for DataFlags {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_flags(fmt, self.0)
            .flag_if(self.is_end_stream(), "END_STREAM")
            .flag_if(self.is_padded(), "PADDED")
            .finish()
    }
}
