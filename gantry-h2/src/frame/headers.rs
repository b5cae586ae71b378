use std::fmt;

use bytes::{BufMut, Bytes};

use super::{debug_flags, strip_padding, Error, Head, Kind, StreamDependency, StreamId};

/// A HEADERS frame carrying a (possibly partial) HPACK header block
/// fragment.
///
/// The fragment stays opaque at this layer: the connection owns the HPACK
/// decoder and only runs it once END_HEADERS completes the block, because
/// the dynamic table must observe blocks whole and in order. Padding and
/// the optional priority fields are stripped here.
#[derive(Eq, PartialEq, Clone)]
pub struct Headers {
    stream_id: StreamId,
    flags: HeadersFlags,
    priority: Option<StreamDependency>,
    fragment: Bytes,
}

#[derive(Copy, Clone, Default, Eq, PartialEq)]
struct HeadersFlags(u8);

const END_STREAM: u8 = 0x1;
const END_HEADERS: u8 = 0x4;
const PADDED: u8 = 0x8;
const PRIORITY: u8 = 0x20;
const ALL: u8 = END_STREAM | END_HEADERS | PADDED | PRIORITY;

impl Headers {
    /// A response HEADERS frame around an already-encoded block fragment.
    #[must_use]
    pub fn new(stream_id: StreamId, fragment: Bytes) -> Self {
        Self {
            stream_id,
            flags: HeadersFlags(END_HEADERS),
            priority: None,
            fragment,
        }
    }

    /// Builds a HEADERS frame from a raw payload, stripping padding and
    /// priority fields.
    pub fn load(head: Head, mut payload: Bytes) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Headers);
        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        let flags = HeadersFlags::load(head.flag());

        if flags.is_padded() {
            let (start, end) = strip_padding(&payload)?;
            payload = payload.slice(start..end);
        }

        let priority = if flags.is_priority() {
            if payload.len() < 5 {
                return Err(Error::BadFrameSize);
            }
            let dep = StreamDependency::load(&payload[..5])?;
            if dep.dependency_id() == head.stream_id() {
                return Err(Error::InvalidDependencyId);
            }
            payload = payload.slice(5..);
            Some(dep)
        } else {
            None
        };

        Ok(Self {
            stream_id: head.stream_id(),
            flags,
            priority,
            fragment: payload,
        })
    }

    /// Appends a CONTINUATION fragment to this block.
    pub fn push_continuation(&mut self, fragment: &[u8], end_headers: bool) {
        let mut joined = Vec::with_capacity(self.fragment.len() + fragment.len());
        joined.extend_from_slice(&self.fragment);
        joined.extend_from_slice(fragment);
        self.fragment = Bytes::from(joined);
        if end_headers {
            self.flags.set_end_headers();
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn is_end_headers(&self) -> bool {
        self.flags.is_end_headers()
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
    pub fn priority(&self) -> Option<&StreamDependency> {
        self.priority.as_ref()
    }

    /// The accumulated header block fragment.
    #[must_use]
    pub fn fragment(&self) -> &Bytes {
        &self.fragment
    }

    /// Encodes the block, splitting into HEADERS + CONTINUATION frames
    /// when the fragment exceeds `max_frame_size`.
    pub fn encode<B: BufMut>(&self, max_frame_size: usize, dst: &mut B) {
        debug_assert!(max_frame_size > 0);
        let total = self.fragment.len();
        let first_len = total.min(max_frame_size);
        let one_frame = first_len == total;

        let mut flags = self.flags;
        if !one_frame {
            flags.unset_end_headers();
        }
        // Never emit padding or priority from the response side.
        let head = Head::new(Kind::Headers, flags.0 & !(PADDED | PRIORITY), self.stream_id);
        head.encode(first_len, dst);
        dst.put_slice(&self.fragment[..first_len]);

        let mut offset = first_len;
        while offset < total {
            let chunk = (total - offset).min(max_frame_size);
            let last = offset + chunk == total;
            let cont_flags = if last { END_HEADERS } else { 0 };
            let head = Head::new(Kind::Continuation, cont_flags, self.stream_id);
            head.encode(chunk, dst);
            dst.put_slice(&self.fragment[offset..offset + chunk]);
            offset += chunk;
        }
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = fmt.debug_struct("Headers");
        f.field("stream_id", &self.stream_id)
            .field("flags", &self.flags)
            .field("fragment_len", &self.fragment.len());
        if let Some(ref dep) = self.priority {
            f.field("priority", dep);
        }
        f.finish()
    }
}

// ===== impl HeadersFlags =====

impl HeadersFlags {
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

    fn is_end_headers(&self) -> bool {
        self.0 & END_HEADERS == END_HEADERS
    }

    fn set_end_headers(&mut self) {
        self.0 |= END_HEADERS;
    }

    fn unset_end_headers(&mut self) {
        self.0 &= !END_HEADERS;
    }

    fn is_padded(&self) -> bool {
        self.0 & PADDED == PADDED
    }

    fn is_priority(&self) -> bool {
        self.0 & PRIORITY == PRIORITY
    }
}

impl fmt::Debug for HeadersFlags {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_flags(fmt, self.0)
            .flag_if(self.is_end_stream(), "END_STREAM")
            .flag_if(self.is_end_headers(), "END_HEADERS")
            .flag_if(self.is_padded(), "PADDED")
            .flag_if(self.is_priority(), "PRIORITY")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn load_plain_fragment() {
        let head = Head::new(Kind::Headers, END_HEADERS | END_STREAM, StreamId::from(1));
        let frame = Headers::load(head, Bytes::from_static(b"\x82\x84")).unwrap();
        assert!(frame.is_end_headers());
        assert!(frame.is_end_stream());
        assert_eq!(&frame.fragment()[..], b"\x82\x84");
    }

    #[test]
    fn load_strips_priority_fields() {
        let head = Head::new(Kind::Headers, END_HEADERS | PRIORITY, StreamId::from(3));
        // depends on stream 1, weight 16, then one fragment byte
        let payload = Bytes::from_static(&[0, 0, 0, 1, 15, 0x82]);
        let frame = Headers::load(head, payload).unwrap();
        let dep = frame.priority().unwrap();
        assert_eq!(dep.dependency_id(), StreamId::from(1));
        assert_eq!(dep.weight(), 15);
        assert_eq!(&frame.fragment()[..], b"\x82");
    }

    #[test]
    fn self_dependency_is_rejected() {
        let head = Head::new(Kind::Headers, PRIORITY, StreamId::from(3));
        let payload = Bytes::from_static(&[0, 0, 0, 3, 15]);
        assert_eq!(
            Headers::load(head, payload),
            Err(Error::InvalidDependencyId)
        );
    }

    #[test]
    fn continuation_completes_the_block() {
        let head = Head::new(Kind::Headers, 0, StreamId::from(1));
        let mut frame = Headers::load(head, Bytes::from_static(b"\x82")).unwrap();
        assert!(!frame.is_end_headers());
        frame.push_continuation(b"\x84", true);
        assert!(frame.is_end_headers());
        assert_eq!(&frame.fragment()[..], b"\x82\x84");
    }

    #[test]
    fn encode_splits_into_continuation() {
        let frame = Headers::new(StreamId::from(1), Bytes::from_static(b"abcdef"));
        let mut dst = BytesMut::new();
        frame.encode(4, &mut dst);
        // HEADERS(4 bytes, no END_HEADERS) + CONTINUATION(2, END_HEADERS)
        assert_eq!(&dst[..9], &[0, 0, 4, 1, 0, 0, 0, 0, 1]);
        assert_eq!(&dst[9..13], b"abcd");
        assert_eq!(&dst[13..22], &[0, 0, 2, 9, 4, 0, 0, 0, 1]);
        assert_eq!(&dst[22..], b"ef");
    }
}
