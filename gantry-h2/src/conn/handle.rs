//! Application-facing stream handles.
//!
//! The connection owns its streams in an arena; the application holds a
//! `(connection id, stream id, slot, generation)` handle that is
//! validated on every call. Releasing a stream bumps the slot's
//! generation, so a stale handle can never reach a recycled stream; it
//! observes [`HandleError::Gone`] instead.

use crate::frame::{Reason, StreamId};

/// An opaque, copyable reference to one stream of one connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub(crate) conn_id: u64,
    pub(crate) id: StreamId,
    pub(crate) slot: usize,
    pub(crate) generation: u32,
}

impl StreamHandle {
    /// The wire stream id this handle refers to.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.id
    }
}

/// Why a handle operation was refused.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// The stream no longer exists (released, reaped, or never created);
    /// the handle is permanently dead.
    Gone,
    /// The stream was reset; the code is the terminal error.
    Reset(Reason),
    /// The operation does not fit the stream's current state (e.g.
    /// writing a response before the request arrived).
    InvalidState,
}

impl std::fmt::Display for HandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gone => f.write_str("stream is gone"),
            Self::Reset(reason) => write!(f, "stream reset: {reason:?}"),
            Self::InvalidState => f.write_str("operation invalid in current stream state"),
        }
    }
}

impl std::error::Error for HandleError {}

/// A notification queued for the application.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub handle: StreamHandle,
    pub kind: StreamEventKind,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamEventKind {
    /// The request head is complete and readable.
    Request,
    /// More request body bytes are buffered.
    Data,
    /// The peer finished its half (END_STREAM).
    End,
    /// The response has been fully emitted; the stream can be released.
    Complete,
    /// The peer reset the stream; reads observe end-of-stream with this
    /// code.
    Reset(Reason),
    /// The connection failed; the stream is dead with this code.
    ConnError(Reason),
}
