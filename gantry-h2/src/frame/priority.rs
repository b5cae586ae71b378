use std::fmt;

use bytes::BufMut;

use super::{unpack_u32, Error, Head, Kind, StreamId};

/// A PRIORITY frame. The dependency tree is parsed and validated but not
/// used for send scheduling; the mux drains its send list round-robin.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Priority {
    stream_id: StreamId,
    dependency: StreamDependency,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct StreamDependency {
    /// The stream this one depends on.
    dependency_id: StreamId,
    /// Weight in `[0, 255]` (wire value; effective weight is +1).
    weight: u8,
    is_exclusive: bool,
}

impl Priority {
    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Priority);
        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() != 5 {
            return Err(Error::BadFrameSize);
        }
        let dependency = StreamDependency::load(payload)?;
        if dependency.dependency_id() == head.stream_id() {
            return Err(Error::InvalidDependencyId);
        }
        Ok(Self {
            stream_id: head.stream_id(),
            dependency,
        })
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn dependency(&self) -> &StreamDependency {
        &self.dependency
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        let head = Head::new(Kind::Priority, 0, self.stream_id);
        head.encode(5, dst);
        self.dependency.encode(dst);
    }
}

// ===== impl StreamDependency =====

impl StreamDependency {
    #[must_use]
    pub fn new(dependency_id: StreamId, weight: u8, is_exclusive: bool) -> Self {
        Self {
            dependency_id,
            weight,
            is_exclusive,
        }
    }

    /// Parses the 5-octet dependency block shared by PRIORITY and
    /// HEADERS-with-PRIORITY.
    pub fn load(src: &[u8]) -> Result<Self, Error> {
        if src.len() < 5 {
            return Err(Error::BadFrameSize);
        }
        let packed = unpack_u32(src, 0);
        let is_exclusive = packed & (1 << 31) != 0;
        let dependency_id = StreamId::from(packed & !(1 << 31));
        Ok(Self::new(dependency_id, src[4], is_exclusive))
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        let mut packed = u32::from(self.dependency_id);
        if self.is_exclusive {
            packed |= 1 << 31;
        }
        dst.put_u32(packed);
        dst.put_u8(self.weight);
    }

    #[must_use]
    pub fn dependency_id(&self) -> StreamId {
        self.dependency_id
    }

    #[must_use]
    pub fn weight(&self) -> u8 {
        self.weight
    }

    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.is_exclusive
    }
}

impl fmt::Debug for StreamDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDependency")
            .field("dependency_id", &self.dependency_id)
            .field("weight", &self.weight)
            .field("is_exclusive", &self.is_exclusive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_length_is_frame_size_error() {
        let head = Head::new(Kind::Priority, 0, StreamId::from(1));
        assert_eq!(Priority::load(head, &[0; 4]), Err(Error::BadFrameSize));
        assert_eq!(Priority::load(head, &[0; 6]), Err(Error::BadFrameSize));
    }

    #[test]
    fn exclusive_bit_round_trips() {
        let dep = StreamDependency::new(StreamId::from(7), 42, true);
        let mut dst = bytes::BytesMut::new();
        dep.encode(&mut dst);
        let parsed = StreamDependency::load(&dst).unwrap();
        assert_eq!(parsed, dep);
    }

    #[test]
    fn self_dependency_rejected() {
        let head = Head::new(Kind::Priority, 0, StreamId::from(5));
        let payload = [0, 0, 0, 5, 15];
        assert_eq!(
            Priority::load(head, &payload),
            Err(Error::InvalidDependencyId)
        );
    }
}
