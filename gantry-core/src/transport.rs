//! The transport capability the engine consumes.
//!
//! The socket layer stays outside the core; muxes drive whatever
//! implements [`Transport`]: a real TCP stream on a worker's poller, or
//! the in-memory [`PipeTransport`] the test suites use. The want-read /
//! want-write flags are how a mux tells the poller which readiness it
//! cares about next.

use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buf::Buffer;

/// Outcome of a transport read into a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes appended to the buffer.
    Data(usize),
    /// Nothing available; retry after readiness.
    WouldBlock,
    /// Orderly end of stream from the peer.
    Eof,
    /// Transport failure; the connection is unusable.
    Err(io::ErrorKind),
}

/// Outcome of a transport write.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// `n` bytes consumed from the source.
    Data(usize),
    /// No room; retry after writability.
    WouldBlock,
    /// Transport failure.
    Err(io::ErrorKind),
}

/// Shutdown direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dir {
    Read,
    Write,
    Both,
}

pub trait Transport {
    /// Reads into the buffer's free space.
    fn read(&mut self, buf: &mut Buffer) -> ReadStatus;

    /// Writes from `src`, returning how much was accepted.
    fn write(&mut self, src: &[u8]) -> WriteStatus;

    /// Half- or full-closes the transport.
    fn shutdown(&mut self, dir: Dir);

    /// Declares interest in read readiness.
    fn want_read(&mut self, on: bool);

    /// Declares interest in write readiness.
    fn want_write(&mut self, on: bool);
}

/// [`Transport`] over a non-blocking mio TCP stream. The want flags are
/// collected here and applied by the worker when it re-registers the
/// stream's interest set.
#[derive(Debug)]
pub struct TcpTransport {
    stream: mio::net::TcpStream,
    wants_read: bool,
    wants_write: bool,
}

impl TcpTransport {
    #[must_use]
    pub fn new(stream: mio::net::TcpStream) -> Self {
        Self {
            stream,
            wants_read: true,
            wants_write: false,
        }
    }

    #[must_use]
    pub fn stream_mut(&mut self) -> &mut mio::net::TcpStream {
        &mut self.stream
    }

    /// (want_read, want_write) as last declared by the mux.
    #[must_use]
    pub fn wants(&self) -> (bool, bool) {
        (self.wants_read, self.wants_write)
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut Buffer) -> ReadStatus {
        let mut total = 0usize;
        loop {
            let (first, _) = buf.write_slices();
            if first.is_empty() {
                break;
            }
            match self.stream.read(first) {
                Ok(0) => {
                    return if total > 0 {
                        ReadStatus::Data(total)
                    } else {
                        ReadStatus::Eof
                    };
                }
                Ok(n) => {
                    buf.grow(n);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadStatus::Err(e.kind()),
            }
        }
        if total > 0 {
            ReadStatus::Data(total)
        } else {
            ReadStatus::WouldBlock
        }
    }

    fn write(&mut self, src: &[u8]) -> WriteStatus {
        match self.stream.write(src) {
            Ok(n) => WriteStatus::Data(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => WriteStatus::WouldBlock,
            Err(e) => WriteStatus::Err(e.kind()),
        }
    }

    fn shutdown(&mut self, dir: Dir) {
        let how = match dir {
            Dir::Read => std::net::Shutdown::Read,
            Dir::Write => std::net::Shutdown::Write,
            Dir::Both => std::net::Shutdown::Both,
        };
        if let Err(err) = self.stream.shutdown(how) {
            tracing::debug!(%err, "tcp shutdown");
        }
    }

    fn want_read(&mut self, on: bool) {
        self.wants_read = on;
    }

    fn want_write(&mut self, on: bool) {
        self.wants_write = on;
    }
}

#[derive(Debug, Default)]
struct PipeSide {
    data: Vec<u8>,
    closed: bool,
}

#[derive(Debug, Default)]
struct PipeShared {
    /// Client-to-server direction.
    c2s: PipeSide,
    /// Server-to-client direction.
    s2c: PipeSide,
}

/// An in-memory duplex pipe for tests: one endpoint plays the client, the
/// other the server. Unbounded, so flow control is exercised by the
/// protocol windows rather than the transport.
#[derive(Debug, Clone)]
pub struct PipeTransport {
    shared: Arc<Mutex<PipeShared>>,
    /// True on the endpoint handed to the engine (reads c2s, writes s2c).
    server_side: bool,
    wants_read: bool,
    wants_write: bool,
}

impl PipeTransport {
    /// Builds a connected (client, server) endpoint pair.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let shared = Arc::new(Mutex::new(PipeShared::default()));
        let client = Self {
            shared: shared.clone(),
            server_side: false,
            wants_read: true,
            wants_write: false,
        };
        let server = Self {
            shared,
            server_side: true,
            wants_read: true,
            wants_write: false,
        };
        (client, server)
    }

    /// Queues raw bytes for the opposite endpoint to read.
    pub fn feed(&self, bytes: &[u8]) {
        let mut shared = self.shared.lock();
        let side = if self.server_side {
            &mut shared.s2c
        } else {
            &mut shared.c2s
        };
        side.data.extend_from_slice(bytes);
    }

    /// Takes everything this endpoint has written so far.
    #[must_use]
    pub fn drain_written(&self) -> Vec<u8> {
        let mut shared = self.shared.lock();
        let side = if self.server_side {
            &mut shared.s2c
        } else {
            &mut shared.c2s
        };
        std::mem::take(&mut side.data)
    }

    /// Closes this endpoint's outgoing direction (peer sees EOF).
    pub fn close(&self) {
        let mut shared = self.shared.lock();
        let side = if self.server_side {
            &mut shared.s2c
        } else {
            &mut shared.c2s
        };
        side.closed = true;
    }

    #[must_use]
    pub fn wants(&self) -> (bool, bool) {
        (self.wants_read, self.wants_write)
    }
}

impl Transport for PipeTransport {
    fn read(&mut self, buf: &mut Buffer) -> ReadStatus {
        let mut shared = self.shared.lock();
        let side = if self.server_side {
            &mut shared.c2s
        } else {
            &mut shared.s2c
        };
        if side.data.is_empty() {
            return if side.closed {
                ReadStatus::Eof
            } else {
                ReadStatus::WouldBlock
            };
        }
        let n = buf.put_slice(&side.data);
        side.data.drain(..n);
        if n == 0 {
            ReadStatus::WouldBlock
        } else {
            ReadStatus::Data(n)
        }
    }

    fn write(&mut self, src: &[u8]) -> WriteStatus {
        let mut shared = self.shared.lock();
        let side = if self.server_side {
            &mut shared.s2c
        } else {
            &mut shared.c2s
        };
        if side.closed {
            return WriteStatus::Err(io::ErrorKind::BrokenPipe);
        }
        side.data.extend_from_slice(src);
        WriteStatus::Data(src.len())
    }

    fn shutdown(&mut self, dir: Dir) {
        if matches!(dir, Dir::Write | Dir::Both) {
            self.close();
        }
    }

    fn want_read(&mut self, on: bool) {
        self.wants_read = on;
    }

    fn want_write(&mut self, on: bool) {
        self.wants_write = on;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_round_trip() {
        let (client, mut server) = PipeTransport::pair();
        client.feed(b"hello");
        let mut buf = Buffer::with_capacity(16);
        assert_eq!(server.read(&mut buf), ReadStatus::Data(5));
        assert_eq!(server.read(&mut buf), ReadStatus::WouldBlock);
        assert_eq!(server.write(b"world"), WriteStatus::Data(5));
        assert_eq!(client.drain_written(), Vec::<u8>::new());
        let mut cbuf = Buffer::with_capacity(16);
        let mut c = client.clone();
        assert_eq!(c.read(&mut cbuf), ReadStatus::Data(5));
        let got = cbuf.take(5);
        assert_eq!(&got[..], b"world");
    }

    #[test]
    fn pipe_eof_after_close() {
        let (client, mut server) = PipeTransport::pair();
        client.feed(b"x");
        client.close();
        let mut buf = Buffer::with_capacity(4);
        assert_eq!(server.read(&mut buf), ReadStatus::Data(1));
        assert_eq!(server.read(&mut buf), ReadStatus::Eof);
    }

    #[test]
    fn pipe_read_respects_buffer_room() {
        let (client, mut server) = PipeTransport::pair();
        client.feed(b"abcdefgh");
        let mut buf = Buffer::with_capacity(4);
        assert_eq!(server.read(&mut buf), ReadStatus::Data(4));
        assert!(buf.is_full());
        buf.advance(4);
        assert_eq!(server.read(&mut buf), ReadStatus::Data(4));
    }
}
