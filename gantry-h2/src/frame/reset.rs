use bytes::BufMut;

use super::{unpack_u32, Error, Head, Kind, Reason, StreamId};

/// An RST_STREAM frame: immediate termination of a single stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Reset {
    stream_id: StreamId,
    reason: Reason,
}

impl Reset {
    #[must_use]
    pub fn new(stream_id: StreamId, reason: Reason) -> Self {
        Self { stream_id, reason }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn reason(&self) -> Reason {
        self.reason
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Reset);
        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }
        Ok(Self {
            stream_id: head.stream_id(),
            reason: Reason::from(unpack_u32(payload, 0)),
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        tracing::trace!(id = ?self.stream_id, reason = ?self.reason, "encoding RST_STREAM");
        let head = Head::new(Kind::Reset, 0, self.stream_id);
        head.encode(4, dst);
        dst.put_u32(self.reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frame = Reset::new(StreamId::from(3), Reason::CANCEL);
        let mut dst = bytes::BytesMut::new();
        frame.encode(&mut dst);
        assert_eq!(&dst[..], &[0, 0, 4, 3, 0, 0, 0, 0, 3, 0, 0, 0, 8]);
        let parsed = Reset::load(Head::parse(&dst), &dst[9..]).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn stream_zero_rejected() {
        let head = Head::new(Kind::Reset, 0, StreamId::ZERO);
        assert_eq!(Reset::load(head, &[0; 4]), Err(Error::InvalidStreamId));
    }

    #[test]
    fn wrong_length_rejected() {
        let head = Head::new(Kind::Reset, 0, StreamId::from(1));
        assert_eq!(Reset::load(head, &[0; 5]), Err(Error::BadFrameSize));
    }
}
