//! HTTP/1.1-equivalent views of a stream.
//!
//! The application never sees frames: at stream open it gets the request
//! as an HTTP/1.1-style head (or its serialized form), and it answers by
//! writing a status line + headers + body, which the engine parses back
//! (via httparse) into a HEADERS frame and DATA. The per-direction
//! [`H1ParserState`] is the interface the surrounding system's analysers
//! key off.

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::frame::Reason;
use crate::hpack::Field;

/// Progress of the HTTP/1-equivalent message on one direction of a
/// stream. The wire parser itself lives outside the engine; only this
/// state enum is shared.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum H1ParserState {
    Idle,
    Headers,
    Body,
    Trailers,
    Done,
    Error,
}

/// A decoded request: the pseudo-headers plus regular fields in received
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Bytes,
    pub path: Bytes,
    pub scheme: Bytes,
    pub authority: Bytes,
    pub fields: Vec<Field>,
}

/// Headers that must not cross from HTTP/1 connection semantics into a
/// multiplexed stream (RFC 7540 §8.1.2.2).
const CONNECTION_HEADERS: &[&[u8]] = &[
    b"connection",
    b"keep-alive",
    b"proxy-connection",
    b"transfer-encoding",
    b"upgrade",
];

impl RequestHead {
    /// Materializes a request from a decoded header list, enforcing the
    /// RFC 7540 §8.1.2 malformed-message rules: pseudo-headers first and
    /// unique, lowercase names, no connection-specific fields, `te`
    /// restricted to `trailers`, cookie crumbs joined.
    pub fn from_fields(decoded: Vec<Field>) -> Result<Self, Reason> {
        let mut method = None;
        let mut path = None;
        let mut scheme = None;
        let mut authority = None;
        let mut fields = Vec::with_capacity(decoded.len());
        let mut cookie: SmallVec<[Bytes; 4]> = SmallVec::new();
        let mut seen_regular = false;

        for field in decoded {
            if field.name.is_empty() {
                return Err(Reason::PROTOCOL_ERROR);
            }
            if field.name[0] == b':' {
                if seen_regular {
                    // Pseudo-header after a regular field.
                    return Err(Reason::PROTOCOL_ERROR);
                }
                let slot = match &field.name[..] {
                    b":method" => &mut method,
                    b":path" => &mut path,
                    b":scheme" => &mut scheme,
                    b":authority" => &mut authority,
                    // Response pseudo-headers or inventions.
                    _ => return Err(Reason::PROTOCOL_ERROR),
                };
                if slot.is_some() {
                    return Err(Reason::PROTOCOL_ERROR);
                }
                *slot = Some(field.value);
                continue;
            }
            seen_regular = true;
            if field.name.iter().any(|b| b.is_ascii_uppercase()) {
                return Err(Reason::PROTOCOL_ERROR);
            }
            if CONNECTION_HEADERS.contains(&&field.name[..]) {
                return Err(Reason::PROTOCOL_ERROR);
            }
            if &field.name[..] == b"te" && &field.value[..] != b"trailers" {
                return Err(Reason::PROTOCOL_ERROR);
            }
            if &field.name[..] == b"cookie" {
                cookie.push(field.value);
                continue;
            }
            fields.push(field);
        }

        // CONNECT carries only :method and :authority; everything else
        // requires the full triple (RFC 7540 §8.1.2.3, §8.3).
        let method = method.ok_or(Reason::PROTOCOL_ERROR)?;
        let (path, scheme, authority) = if &method[..] == b"CONNECT" {
            if path.is_some() || scheme.is_some() {
                return Err(Reason::PROTOCOL_ERROR);
            }
            (
                Bytes::new(),
                Bytes::new(),
                authority.ok_or(Reason::PROTOCOL_ERROR)?,
            )
        } else {
            let path = path.ok_or(Reason::PROTOCOL_ERROR)?;
            if path.is_empty() {
                return Err(Reason::PROTOCOL_ERROR);
            }
            (
                path,
                scheme.ok_or(Reason::PROTOCOL_ERROR)?,
                authority.unwrap_or_default(),
            )
        };

        if !cookie.is_empty() {
            // Re-join crumbs the client split for compression.
            let mut joined = BytesMut::new();
            for (i, crumb) in cookie.iter().enumerate() {
                if i > 0 {
                    joined.put_slice(b"; ");
                }
                joined.put_slice(crumb);
            }
            fields.push(Field::new(&b"cookie"[..], joined.freeze()));
        }

        Ok(Self {
            method,
            path,
            scheme,
            authority,
            fields,
        })
    }

    /// Serializes the HTTP/1.1-equivalent request head.
    #[must_use]
    pub fn to_h1(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(128);
        out.put_slice(&self.method);
        out.put_u8(b' ');
        if self.path.is_empty() {
            out.put_slice(&self.authority);
        } else {
            out.put_slice(&self.path);
        }
        out.put_slice(b" HTTP/1.1\r\n");
        if !self.authority.is_empty() {
            out.put_slice(b"host: ");
            out.put_slice(&self.authority);
            out.put_slice(b"\r\n");
        }
        for field in &self.fields {
            out.put_slice(&field.name);
            out.put_slice(b": ");
            out.put_slice(&field.value);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.freeze()
    }

    /// The request announced no body at all.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.fields
            .iter()
            .find(|f| &f.name[..] == b"content-length")
            .and_then(|f| std::str::from_utf8(&f.value).ok())
            .and_then(|s| s.parse().ok())
    }
}

/// The parsed head of an application response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub fields: Vec<Field>,
}

/// Incremental parse state for the application's H1-style response
/// bytes: buffers until the blank line, parses the head, then passes
/// body bytes through.
#[derive(Debug)]
pub struct ResponseState {
    head_buf: Vec<u8>,
    head: Option<ResponseHead>,
    head_sent: bool,
    content_length: Option<u64>,
    body_written: u64,
}

/// What a chunk of application response bytes turned into.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ResponseWrite {
    /// Body bytes to queue for DATA emission.
    pub body: Bytes,
    /// The announced content-length has been fully written.
    pub body_complete: bool,
}

const MAX_HEAD_BYTES: usize = 64 * 1024;

impl ResponseState {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            head_buf: Vec::new(),
            head: None,
            head_sent: false,
            content_length: None,
            body_written: 0,
        }
    }

    #[must_use]
    pub(crate) fn head(&self) -> Option<&ResponseHead> {
        self.head.as_ref()
    }

    /// The head is parsed but its HEADERS frame not yet emitted.
    #[must_use]
    pub(crate) fn head_pending(&self) -> bool {
        self.head.is_some() && !self.head_sent
    }

    pub(crate) fn mark_head_sent(&mut self) {
        self.head_sent = true;
    }

    #[must_use]
    pub(crate) fn head_sent(&self) -> bool {
        self.head_sent
    }

    #[must_use]
    pub(crate) fn parser_state(&self) -> H1ParserState {
        if self.head.is_none() {
            if self.head_buf.is_empty() {
                H1ParserState::Idle
            } else {
                H1ParserState::Headers
            }
        } else if matches!(self.content_length, Some(cl) if self.body_written >= cl) {
            H1ParserState::Done
        } else {
            H1ParserState::Body
        }
    }

    /// Accepts application bytes: head bytes until the blank line, body
    /// bytes afterwards.
    pub(crate) fn write(&mut self, src: &[u8]) -> Result<ResponseWrite, Reason> {
        let body = if self.head.is_some() {
            Bytes::copy_from_slice(src)
        } else {
            self.head_buf.extend_from_slice(src);
            if self.head_buf.len() > MAX_HEAD_BYTES {
                return Err(Reason::INTERNAL_ERROR);
            }
            let Some(head_end) = find_head_end(&self.head_buf) else {
                return Ok(ResponseWrite {
                    body: Bytes::new(),
                    body_complete: false,
                });
            };
            let rest = self.head_buf.split_off(head_end);
            self.parse_head()?;
            Bytes::from(rest)
        };

        self.body_written += body.len() as u64;
        if let Some(cl) = self.content_length {
            if self.body_written > cl {
                // More body than announced.
                return Err(Reason::INTERNAL_ERROR);
            }
        }
        let body_complete = matches!(self.content_length, Some(cl) if self.body_written >= cl);
        Ok(ResponseWrite {
            body,
            body_complete,
        })
    }

    fn parse_head(&mut self) -> Result<(), Reason> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Response::new(&mut headers);
        let status = match parsed.parse(&self.head_buf) {
            Ok(httparse::Status::Complete(_)) => parsed.code.ok_or(Reason::INTERNAL_ERROR)?,
            _ => return Err(Reason::INTERNAL_ERROR),
        };

        let mut fields = Vec::with_capacity(parsed.headers.len());
        for header in parsed.headers.iter() {
            let name = header.name.to_ascii_lowercase();
            if CONNECTION_HEADERS.contains(&name.as_bytes()) {
                // Connection-level semantics stay on our side.
                continue;
            }
            if name == "content-length" {
                self.content_length = std::str::from_utf8(header.value)
                    .ok()
                    .and_then(|s| s.parse().ok());
            }
            fields.push(Field::new(name, Bytes::copy_from_slice(header.value)));
        }
        self.head = Some(ResponseHead { status, fields });
        Ok(())
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &'static str, value: &'static str) -> Field {
        Field::new(name.as_bytes(), value.as_bytes())
    }

    #[test]
    fn builds_and_serializes_a_get() {
        let head = RequestHead::from_fields(vec![
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":path", "/search?q=1"),
            field(":authority", "example.com"),
            field("user-agent", "demo"),
        ])
        .unwrap();
        assert_eq!(&head.method[..], b"GET");
        let h1 = head.to_h1();
        let text = std::str::from_utf8(&h1).unwrap();
        assert!(text.starts_with("GET /search?q=1 HTTP/1.1\r\n"));
        assert!(text.contains("host: example.com\r\n"));
        assert!(text.contains("user-agent: demo\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn cookie_crumbs_rejoin() {
        let head = RequestHead::from_fields(vec![
            field(":method", "GET"),
            field(":scheme", "http"),
            field(":path", "/"),
            field("cookie", "a=1"),
            field("cookie", "b=2"),
        ])
        .unwrap();
        let cookie = head
            .fields
            .iter()
            .find(|f| &f.name[..] == b"cookie")
            .unwrap();
        assert_eq!(&cookie.value[..], b"a=1; b=2");
    }

    #[test]
    fn pseudo_after_regular_is_malformed() {
        let err = RequestHead::from_fields(vec![
            field(":method", "GET"),
            field("accept", "*/*"),
            field(":path", "/"),
        ])
        .unwrap_err();
        assert_eq!(err, Reason::PROTOCOL_ERROR);
    }

    #[test]
    fn duplicate_pseudo_is_malformed() {
        let err = RequestHead::from_fields(vec![
            field(":method", "GET"),
            field(":method", "POST"),
            field(":scheme", "http"),
            field(":path", "/"),
        ])
        .unwrap_err();
        assert_eq!(err, Reason::PROTOCOL_ERROR);
    }

    #[test]
    fn connection_headers_are_malformed() {
        let err = RequestHead::from_fields(vec![
            field(":method", "GET"),
            field(":scheme", "http"),
            field(":path", "/"),
            field("transfer-encoding", "chunked"),
        ])
        .unwrap_err();
        assert_eq!(err, Reason::PROTOCOL_ERROR);
    }

    #[test]
    fn missing_path_is_malformed() {
        let err = RequestHead::from_fields(vec![field(":method", "GET"), field(":scheme", "http")])
            .unwrap_err();
        assert_eq!(err, Reason::PROTOCOL_ERROR);
    }

    #[test]
    fn connect_skips_path_and_scheme() {
        let head = RequestHead::from_fields(vec![
            field(":method", "CONNECT"),
            field(":authority", "example.com:443"),
        ])
        .unwrap();
        assert!(head.path.is_empty());
        let h1 = head.to_h1();
        assert!(h1.starts_with(&b"CONNECT example.com:443 HTTP/1.1\r\n"[..]));
    }

    #[test]
    fn response_head_parses_and_body_flows() {
        let mut state = ResponseState::new();
        let w = state
            .write(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nServer: demo\r\n\r\nhel")
            .unwrap();
        assert_eq!(&w.body[..], b"hel");
        assert!(!w.body_complete);
        let head = state.head().unwrap();
        assert_eq!(head.status, 200);
        // Names are lowercased on the way through.
        assert!(head.fields.iter().any(|f| &f.name[..] == b"server"));
        let w = state.write(b"lo").unwrap();
        assert_eq!(&w.body[..], b"lo");
        assert!(w.body_complete);
        assert_eq!(state.parser_state(), H1ParserState::Done);
    }

    #[test]
    fn response_head_split_across_writes() {
        let mut state = ResponseState::new();
        let w = state.write(b"HTTP/1.1 204 No Content\r\n").unwrap();
        assert!(state.head().is_none());
        assert!(w.body.is_empty());
        state.write(b"\r\n").unwrap();
        assert_eq!(state.head().unwrap().status, 204);
    }

    #[test]
    fn response_drops_connection_headers() {
        let mut state = ResponseState::new();
        state
            .write(b"HTTP/1.1 200 OK\r\nConnection: close\r\ncontent-length: 0\r\n\r\n")
            .unwrap();
        assert!(state
            .head()
            .unwrap()
            .fields
            .iter()
            .all(|f| &f.name[..] != b"connection"));
    }

    #[test]
    fn overlong_body_is_rejected() {
        let mut state = ResponseState::new();
        state
            .write(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nab")
            .unwrap();
        assert_eq!(state.write(b"c"), Err(Reason::INTERNAL_ERROR));
    }
}
