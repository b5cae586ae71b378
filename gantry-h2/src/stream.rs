//! Per-stream state.
//!
//! A stream tracks its RFC 7540 §5.1 life cycle, its two flow-control
//! windows, the blocked-reason flags the mux and demux coordinate
//! through, and the buffered request input / response output exchanged
//! with the application. The connection owns every stream exclusively;
//! the application reaches one only through a generational handle.

use std::collections::VecDeque;

use bitflags::bitflags;
use bytes::Bytes;

use crate::frame::Reason;
use crate::frame::StreamId;
use crate::h1::{H1ParserState, RequestHead, ResponseState};
use crate::hpack::Field;

/// Stream states, RFC 7540 §5.1. `Error` is the transient "must emit
/// RST_STREAM" state; it transitions to `Reset` once the frame is queued.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    /// Half-closed (remote): the peer finished sending.
    HalfClosedRemote,
    /// Half-closed (local): our side finished sending.
    HalfClosedLocal,
    /// A stream error was detected; RST_STREAM is owed to the peer.
    Error,
    /// RST_STREAM sent or received.
    Reset,
    Closed,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct StreamFlags: u16 {
        /// END_STREAM received from the peer.
        const ES_RCVD    = 0x0001;
        /// END_STREAM sent by us.
        const ES_SENT    = 0x0002;
        /// RST_STREAM received from the peer.
        const RST_RCVD   = 0x0004;
        /// RST_STREAM sent by us.
        const RST_SENT   = 0x0008;
        /// Blocked: mux is busy emitting another frame.
        const BLK_MBUSY  = 0x0010;
        /// Blocked: no room in the mux buffer.
        const BLK_MROOM  = 0x0020;
        /// Blocked: connection send window exhausted.
        const BLK_MFCTL  = 0x0040;
        /// Blocked: stream send window exhausted.
        const BLK_SFCTL  = 0x0080;
        /// Blocked: application is not consuming input.
        const BLK_SFULL  = 0x0100;
        /// Linked in the connection's send list.
        const IN_SEND_LIST = 0x0200;
        /// Linked in the connection's fctl list.
        const IN_FCTL_LIST = 0x0400;
        /// The application released its handle.
        const APP_DONE   = 0x0800;
    }
}

/// One multiplexed request/response exchange.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    state: StreamState,
    pub(crate) flags: StreamFlags,
    /// Octets we may still send (peer-advertised). Goes negative only
    /// through a SETTINGS_INITIAL_WINDOW_SIZE reduction.
    pub(crate) send_window: i32,
    /// Octets the peer may still send to us.
    pub(crate) recv_window: i32,
    /// Input consumed by the application since the last WINDOW_UPDATE.
    pub(crate) consumed: u32,
    /// Our advertised per-stream window, for replenishment bookkeeping.
    pub(crate) recv_window_max: i32,
    pub(crate) errcode: Reason,

    /// Decoded request head, present once HEADERS completed.
    pub(crate) request: Option<RequestHead>,
    /// Buffered request body chunks not yet read by the application.
    pub(crate) rxbuf: VecDeque<Bytes>,

    /// Response head parse progress (application writes H1 bytes).
    pub(crate) response: ResponseState,
    /// Response body chunks not yet emitted.
    pub(crate) txbuf: VecDeque<Bytes>,
    /// The application finished the response body.
    pub(crate) tx_eos: bool,
    /// Response trailers to emit after the body, carrying END_STREAM.
    pub(crate) trailers: Option<Vec<Field>>,

    /// H1-equivalent parser states the surrounding system keys off.
    pub(crate) req_parser_state: H1ParserState,
    pub(crate) res_parser_state: H1ParserState,
}

impl Stream {
    #[must_use]
    pub(crate) fn new(id: StreamId, send_window: i32, recv_window: i32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            flags: StreamFlags::empty(),
            send_window,
            recv_window,
            consumed: 0,
            recv_window_max: recv_window,
            errcode: Reason::NO_ERROR,
            request: None,
            rxbuf: VecDeque::new(),
            response: ResponseState::new(),
            txbuf: VecDeque::new(),
            tx_eos: false,
            trailers: None,
            req_parser_state: H1ParserState::Idle,
            res_parser_state: H1ParserState::Idle,
        }
    }

    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    #[must_use]
    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    #[must_use]
    pub fn errcode(&self) -> Reason {
        self.errcode
    }

    /// Whether the peer half is finished (no more DATA legal).
    #[must_use]
    pub(crate) fn is_recv_closed(&self) -> bool {
        matches!(
            self.state,
            StreamState::HalfClosedRemote
                | StreamState::Reset
                | StreamState::Closed
                | StreamState::Error
        )
    }

    #[must_use]
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state, StreamState::Reset | StreamState::Closed)
    }

    /// A complete HEADERS block opened (or, for trailers, finished) the
    /// stream. Returns true when this was the opening block.
    pub(crate) fn recv_headers(&mut self, end_stream: bool) -> Result<bool, Reason> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    self.flags |= StreamFlags::ES_RCVD;
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
                self.req_parser_state = if end_stream {
                    H1ParserState::Done
                } else {
                    H1ParserState::Body
                };
                Ok(true)
            }
            // Trailers: legal only with END_STREAM while the peer half
            // is still open.
            StreamState::Open | StreamState::HalfClosedLocal if end_stream => {
                self.flags |= StreamFlags::ES_RCVD;
                self.recv_close();
                Ok(false)
            }
            StreamState::Open | StreamState::HalfClosedLocal => Err(Reason::PROTOCOL_ERROR),
            _ => Err(Reason::STREAM_CLOSED),
        }
    }

    /// DATA arrived. The caller has already debited the windows.
    pub(crate) fn recv_data(&mut self, payload: Bytes, end_stream: bool) -> Result<(), Reason> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedLocal => {
                if !payload.is_empty() {
                    self.rxbuf.push_back(payload);
                }
                if end_stream {
                    self.flags |= StreamFlags::ES_RCVD;
                    self.req_parser_state = H1ParserState::Done;
                    self.recv_close();
                }
                Ok(())
            }
            _ => Err(Reason::STREAM_CLOSED),
        }
    }

    /// The peer's half is done (END_STREAM observed).
    pub(crate) fn recv_close(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    /// Our half is done (END_STREAM emitted).
    pub(crate) fn send_close(&mut self) {
        self.flags |= StreamFlags::ES_SENT;
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    /// RST_STREAM received from the peer: immediate cancellation.
    pub(crate) fn recv_reset(&mut self, reason: Reason) {
        self.flags |= StreamFlags::RST_RCVD;
        self.errcode = reason;
        self.state = StreamState::Reset;
        self.rxbuf.clear();
        self.txbuf.clear();
        self.req_parser_state = H1ParserState::Error;
    }

    /// Marks a local stream error; the mux owes the peer an RST_STREAM.
    pub(crate) fn local_error(&mut self, reason: Reason) {
        if self.is_terminal() {
            return;
        }
        self.errcode = reason;
        self.state = StreamState::Error;
        self.txbuf.clear();
    }

    /// The owed RST_STREAM was queued; the stream is now reset.
    pub(crate) fn reset_sent(&mut self) {
        self.flags |= StreamFlags::RST_SENT;
        self.state = StreamState::Reset;
    }

    /// Credits the peer-advertised send window. Errors on overflow past
    /// 2³¹-1 (RFC 7540 §6.9.1).
    pub(crate) fn credit_send_window(&mut self, delta: u32) -> Result<(), Reason> {
        let new = i64::from(self.send_window) + i64::from(delta);
        if new > i64::from(i32::MAX) {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.send_window = new as i32;
        Ok(())
    }

    /// Shifts the send window by a SETTINGS_INITIAL_WINDOW_SIZE delta.
    /// This is the only path that may drive a window negative.
    pub(crate) fn shift_send_window(&mut self, delta: i64) -> Result<(), Reason> {
        let new = i64::from(self.send_window) + delta;
        if new > i64::from(i32::MAX) {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.send_window = new as i32;
        Ok(())
    }

    /// True when the stream has response output ready to emit.
    #[must_use]
    pub(crate) fn has_tx(&self) -> bool {
        self.response.head_pending() || !self.txbuf.is_empty() || self.tx_pending_eos()
    }

    /// An END_STREAM is still owed with no body bytes left.
    #[must_use]
    pub(crate) fn tx_pending_eos(&self) -> bool {
        self.tx_eos && self.txbuf.is_empty() && !self.flags.contains(StreamFlags::ES_SENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Stream {
        Stream::new(StreamId::from(1), 65_535, 65_535)
    }

    #[test]
    fn headers_open_then_data_then_es() {
        let mut s = stream();
        assert_eq!(s.recv_headers(false), Ok(true));
        assert_eq!(s.state(), StreamState::Open);
        s.recv_data(Bytes::from_static(b"body"), true).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedRemote);
        assert!(s.flags().contains(StreamFlags::ES_RCVD));
    }

    #[test]
    fn headers_with_es_half_closes() {
        let mut s = stream();
        assert_eq!(s.recv_headers(true), Ok(true));
        assert_eq!(s.state(), StreamState::HalfClosedRemote);
    }

    #[test]
    fn data_after_es_is_stream_closed() {
        let mut s = stream();
        s.recv_headers(true).unwrap();
        assert_eq!(
            s.recv_data(Bytes::from_static(b"x"), false),
            Err(Reason::STREAM_CLOSED)
        );
    }

    #[test]
    fn trailers_require_end_stream() {
        let mut s = stream();
        s.recv_headers(false).unwrap();
        assert_eq!(s.recv_headers(false), Err(Reason::PROTOCOL_ERROR));
        assert_eq!(s.recv_headers(true), Ok(false));
        assert_eq!(s.state(), StreamState::HalfClosedRemote);
    }

    #[test]
    fn both_halves_closed_is_closed() {
        let mut s = stream();
        s.recv_headers(true).unwrap();
        s.send_close();
        assert_eq!(s.state(), StreamState::Closed);
        // Reverse order too.
        let mut s = stream();
        s.recv_headers(false).unwrap();
        s.send_close();
        assert_eq!(s.state(), StreamState::HalfClosedLocal);
        s.recv_close();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn reset_clears_buffers() {
        let mut s = stream();
        s.recv_headers(false).unwrap();
        s.recv_data(Bytes::from_static(b"queued"), false).unwrap();
        s.recv_reset(Reason::CANCEL);
        assert_eq!(s.state(), StreamState::Reset);
        assert_eq!(s.errcode(), Reason::CANCEL);
        assert!(s.rxbuf.is_empty());
    }

    #[test]
    fn send_window_overflow_is_flow_control_error() {
        let mut s = stream();
        s.send_window = i32::MAX - 10;
        assert_eq!(s.credit_send_window(11), Err(Reason::FLOW_CONTROL_ERROR));
        assert!(s.credit_send_window(10).is_ok());
        assert_eq!(s.send_window, i32::MAX);
    }

    #[test]
    fn settings_shift_may_go_negative() {
        let mut s = stream();
        s.send_window = 100;
        s.shift_send_window(-65_535).unwrap();
        assert!(s.send_window < 0);
        s.credit_send_window(70_000).unwrap();
        assert!(s.send_window > 0);
    }
}
