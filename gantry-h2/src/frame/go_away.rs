use std::fmt;

use bytes::{BufMut, Bytes};

use super::{unpack_u32, Error, Head, Kind, Reason, StreamId};

/// A GOAWAY frame: the sender will accept no stream above
/// `last_stream_id`; `reason` says why.
#[derive(Clone, Eq, PartialEq)]
pub struct GoAway {
    last_stream_id: StreamId,
    reason: Reason,
    debug_data: Bytes,
}

impl GoAway {
    #[must_use]
    pub fn new(last_stream_id: StreamId, reason: Reason) -> Self {
        Self {
            last_stream_id,
            reason,
            debug_data: Bytes::new(),
        }
    }

    #[must_use]
    pub fn with_debug_data(last_stream_id: StreamId, reason: Reason, debug_data: Bytes) -> Self {
        Self {
            last_stream_id,
            reason,
            debug_data,
        }
    }

    #[must_use]
    pub fn last_stream_id(&self) -> StreamId {
        self.last_stream_id
    }

    #[must_use]
    pub fn reason(&self) -> Reason {
        self.reason
    }

    #[must_use]
    pub fn debug_data(&self) -> &Bytes {
        &self.debug_data
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::GoAway);
        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() < 8 {
            return Err(Error::BadFrameSize);
        }
        let (last_stream_id, _) = StreamId::parse(&payload[..4]);
        let reason = Reason::from(unpack_u32(payload, 4));
        let debug_data = Bytes::copy_from_slice(&payload[8..]);
        Ok(Self {
            last_stream_id,
            reason,
            debug_data,
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        tracing::trace!(reason = ?self.reason, last = ?self.last_stream_id, "encoding GOAWAY");
        let head = Head::new(Kind::GoAway, 0, StreamId::ZERO);
        head.encode(8 + self.debug_data.len(), dst);
        dst.put_u32(u32::from(self.last_stream_id));
        dst.put_u32(self.reason.into());
        dst.put_slice(&self.debug_data);
    }
}

impl fmt::Debug for GoAway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("GoAway");
        builder.field("last_stream_id", &self.last_stream_id);
        builder.field("reason", &self.reason);
        if !self.debug_data.is_empty() {
            builder.field("debug_data", &self.debug_data);
        }
        builder.finish()
    }
}
