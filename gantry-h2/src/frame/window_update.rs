use bytes::BufMut;

use super::{unpack_u32, Error, Head, Kind, StreamId};

const SIZE_INCREMENT_MASK: u32 = 1 << 31;

/// A WINDOW_UPDATE frame: credits `size_increment` flow-control octets to
/// a stream, or to the whole connection when the stream id is zero.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WindowUpdate {
    stream_id: StreamId,
    size_increment: u32,
}

impl WindowUpdate {
    #[must_use]
    pub fn new(stream_id: StreamId, size_increment: u32) -> Self {
        debug_assert!(size_increment > 0);
        Self {
            stream_id,
            size_increment,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn size_increment(&self) -> u32 {
        self.size_increment
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::WindowUpdate);
        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }

        // The most significant bit is reserved and ignored on receipt.
        let size_increment = unpack_u32(payload, 0) & !SIZE_INCREMENT_MASK;

        if size_increment == 0 {
            return Err(Error::InvalidWindowUpdateValue);
        }

        Ok(Self {
            stream_id: head.stream_id(),
            size_increment,
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        tracing::trace!(id = ?self.stream_id, inc = self.size_increment, "encoding WINDOW_UPDATE");
        let head = Head::new(Kind::WindowUpdate, 0, self.stream_id);
        head.encode(4, dst);
        dst.put_u32(self.size_increment);
    }
}
