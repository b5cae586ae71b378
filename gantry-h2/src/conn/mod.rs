//! The H2 connection: demux and mux over one transport.
//!
//! One `Connection` drives one accepted socket. The receive side is an
//! explicit state machine (`DemuxState`) stepped whenever the transport
//! is readable or a blocking condition clears; the send side drains a
//! control-frame queue and a round-robin list of streams with output,
//! under per-stream and connection flow-control windows. Streams live in
//! a slab arena indexed by stream id; the application refers to them
//! through generational [`StreamHandle`]s.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use slab::Slab;

use gantry_core::buf::Buffer;
use gantry_core::pool::BufferPool;
use gantry_core::transport::{Dir, Transport};

use crate::config::H2Config;
use crate::frame::{
    self, Reason, Settings, StreamId, WindowUpdate, DEFAULT_INITIAL_WINDOW_SIZE,
};
use crate::h1::RequestHead;
use crate::hpack;
use crate::stream::{Stream, StreamFlags, StreamState};

pub mod handle;

mod demux;
mod mux;

pub use self::handle::{HandleError, StreamEvent, StreamEventKind, StreamHandle};

/// Demux progress over one connection, per spec: preface verification,
/// the first SETTINGS frame, then the frame loop with its ACK detour and
/// the two-step error drain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DemuxState {
    /// Waiting for the 24-byte client preface.
    Preface,
    /// Waiting for the client's first, non-ACK SETTINGS frame.
    Settings1,
    /// Waiting for the next 9-byte frame header.
    FrameHeader,
    /// Consuming the current frame's payload.
    FramePayload,
    /// An ACK (SETTINGS or PING echo) must leave before more parsing.
    FrameAck,
    /// A connection error was detected; GOAWAY is owed.
    Error,
    /// GOAWAY queued (or abandoned); draining the mux buffer then closing.
    Error2,
}

bitflags! {
    /// Blocked-reason and life-cycle bits.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ConnFlags: u32 {
        /// Demux stalled: no demux buffer could be allocated.
        const DEM_DALLOC   = 0x0000_0001;
        /// Demux stalled: demux buffer full.
        const DEM_DFULL    = 0x0000_0002;
        /// Demux stalled: target stream's input is blocked by the app.
        const DEM_SFULL    = 0x0000_0004;
        /// Demux stalled: mux busy emitting (ACK cannot be queued).
        const DEM_MBUSY    = 0x0000_0008;
        /// Demux stalled: no room in the mux buffer for a required ACK.
        const DEM_MROOM    = 0x0000_0010;
        /// Mux stalled: no mux buffer could be allocated.
        const MUX_MALLOC   = 0x0000_0020;
        /// Mux stalled: mux buffer full, waiting for the socket.
        const MUX_MFULL    = 0x0000_0040;
        /// Our SETTINGS went out, the peer's ACK is still owed.
        const SETTINGS_ACK_OWED = 0x0000_0080;
        /// GOAWAY left the wire.
        const GOAWAY_SENT  = 0x0000_0100;
        /// GOAWAY could not be emitted; the socket was closed instead.
        const GOAWAY_FAILED = 0x0000_0200;
        /// The peer sent us GOAWAY.
        const GOAWAY_RCVD  = 0x0000_0400;
        /// Peer closed its sending half.
        const EOF_RCVD     = 0x0000_0800;
        /// Transport is dead (error or fully shut down).
        const CLOSED       = 0x0000_1000;
        /// Graceful shutdown requested by the operator.
        const SHUTTING     = 0x0000_2000;
    }
}

/// Whether the connection still wants to be driven.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnStatus {
    Active,
    Closed,
}

/// A connection-level failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnError {
    Protocol(Reason),
    Transport(std::io::ErrorKind),
}

/// Control frames owed to the peer, emitted in order ahead of stream
/// output.
#[derive(Debug)]
pub(crate) enum Ctrl {
    Settings(Settings),
    SettingsAck,
    Pong([u8; 8]),
    WindowUpdate(WindowUpdate),
    Reset(frame::Reset),
}

pub(crate) struct Slot {
    pub(crate) generation: u32,
    pub(crate) stream: Stream,
}

/// The connection-level receive window the peer starts with (RFC 7540
/// §6.9.2 fixes it; only WINDOW_UPDATE can grow it).
const CONN_RECV_WINDOW: i32 = DEFAULT_INITIAL_WINDOW_SIZE as i32;

pub struct Connection<T: Transport> {
    pub(crate) transport: T,
    pub(crate) conn_id: u64,
    pub(crate) cfg: H2Config,
    pub(crate) pool: Arc<BufferPool>,

    pub(crate) state: DemuxState,
    pub(crate) flags: ConnFlags,
    pub(crate) errcode: Reason,

    pub(crate) dbuf: Option<Buffer>,
    pub(crate) mbuf: Option<Buffer>,

    // Current frame header scratch (demux).
    pub(crate) dsi: StreamId,
    pub(crate) dft: u8,
    pub(crate) dff: u8,
    pub(crate) dfl: u32,
    /// Whether the current DATA frame's windows were already debited
    /// (they are charged once, up front, for the whole frame).
    pub(crate) data_debited: bool,
    /// HEADERS awaiting CONTINUATION fragments.
    pub(crate) partial_headers: Option<frame::Headers>,

    pub(crate) decoder: hpack::Decoder,
    pub(crate) encoder: hpack::Encoder,

    // Peer-advertised settings.
    pub(crate) peer_initial_window: i32,
    pub(crate) peer_max_frame: u32,
    pub(crate) peer_max_concurrent: Option<u32>,
    pub(crate) peer_push_enabled: bool,

    // Flow control.
    pub(crate) conn_send_window: i32,
    pub(crate) conn_recv_window: i32,
    pub(crate) conn_consumed: u32,

    // Stream arena and indexes.
    pub(crate) slots: Slab<Slot>,
    pub(crate) by_id: BTreeMap<StreamId, usize>,
    pub(crate) gen_counter: u32,
    pub(crate) send_list: VecDeque<usize>,
    pub(crate) fctl_list: VecDeque<usize>,

    pub(crate) max_stream_id: StreamId,
    pub(crate) last_sid: StreamId,
    pub(crate) goaway_queued: Option<frame::GoAway>,

    pub(crate) ctrl: VecDeque<Ctrl>,
    /// An encoded frame that missed the mux buffer; always flushed first
    /// so HPACK emission order is preserved.
    pub(crate) parked: Option<Bytes>,

    pub(crate) events: VecDeque<StreamEvent>,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, pool: Arc<BufferPool>, cfg: H2Config, conn_id: u64) -> Self {
        let decoder = hpack::Decoder::new(cfg.header_table_size as usize);
        Self {
            transport,
            conn_id,
            pool,
            state: DemuxState::Preface,
            flags: ConnFlags::empty(),
            errcode: Reason::NO_ERROR,
            dbuf: None,
            mbuf: None,
            dsi: StreamId::ZERO,
            dft: 0,
            dff: 0,
            dfl: 0,
            data_debited: false,
            partial_headers: None,
            decoder,
            // The peer decodes against 4096 until our SETTINGS say
            // otherwise; it will signal adoption in a header block.
            encoder: hpack::Encoder::new(frame::DEFAULT_SETTINGS_HEADER_TABLE_SIZE),
            peer_initial_window: DEFAULT_INITIAL_WINDOW_SIZE as i32,
            peer_max_frame: frame::DEFAULT_MAX_FRAME_SIZE,
            peer_max_concurrent: None,
            peer_push_enabled: true,
            conn_send_window: DEFAULT_INITIAL_WINDOW_SIZE as i32,
            conn_recv_window: CONN_RECV_WINDOW,
            conn_consumed: 0,
            slots: Slab::new(),
            by_id: BTreeMap::new(),
            gen_counter: 0,
            send_list: VecDeque::new(),
            fctl_list: VecDeque::new(),
            max_stream_id: StreamId::ZERO,
            last_sid: StreamId::MAX,
            goaway_queued: None,
            ctrl: VecDeque::new(),
            parked: None,
            events: VecDeque::new(),
            cfg,
        }
    }

    #[must_use]
    pub fn state(&self) -> DemuxState {
        self.state
    }

    #[must_use]
    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.flags.contains(ConnFlags::CLOSED)
    }

    /// Live streams currently in the arena.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.by_id.len()
    }

    /// (want_read, want_write) for the poller.
    #[must_use]
    pub fn wants(&self) -> (bool, bool) {
        if self.is_closed() {
            return (false, false);
        }
        let want_write = self.has_output();
        let want_read = !matches!(self.state, DemuxState::Error | DemuxState::Error2);
        (want_read, want_write)
    }

    /// Next queued application notification.
    pub fn poll_event(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    /// Direct access to the transport, e.g. to register the underlying
    /// socket with a poller.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The peer's advertised MAX_CONCURRENT_STREAMS, if any. Relevant
    /// only to server push, which this engine never initiates.
    #[must_use]
    pub fn peer_max_concurrent(&self) -> Option<u32> {
        self.peer_max_concurrent
    }

    /// Whether the peer left server push enabled.
    #[must_use]
    pub fn is_peer_push_enabled(&self) -> bool {
        self.peer_push_enabled
    }

    /// The terminal failure, once the connection entered an error state.
    #[must_use]
    pub fn last_error(&self) -> Option<ConnError> {
        match self.state {
            DemuxState::Error | DemuxState::Error2 if self.errcode != Reason::NO_ERROR => {
                Some(ConnError::Protocol(self.errcode))
            }
            _ => None,
        }
    }

    // ===== stream arena =====

    pub(crate) fn handle_for(&self, slot: usize) -> StreamHandle {
        StreamHandle {
            conn_id: self.conn_id,
            id: self.slots[slot].stream.id(),
            slot,
            generation: self.slots[slot].generation,
        }
    }

    fn validate(&self, h: &StreamHandle) -> Result<usize, HandleError> {
        if h.conn_id != self.conn_id {
            return Err(HandleError::Gone);
        }
        match self.slots.get(h.slot) {
            Some(slot) if slot.generation == h.generation => Ok(h.slot),
            _ => Err(HandleError::Gone),
        }
    }

    /// Number of peer-initiated streams that still count against
    /// MAX_CONCURRENT_STREAMS.
    pub(crate) fn active_streams(&self) -> usize {
        self.slots
            .iter()
            .filter(|(_, s)| !s.stream.is_terminal())
            .count()
    }

    pub(crate) fn create_stream(&mut self, id: StreamId) -> usize {
        self.gen_counter = self.gen_counter.wrapping_add(1);
        let stream = Stream::new(
            id,
            self.peer_initial_window,
            self.cfg.initial_window_size as i32,
        );
        let slot = self.slots.insert(Slot {
            generation: self.gen_counter,
            stream,
        });
        self.by_id.insert(id, slot);
        slot
    }

    /// Drops a stream from the arena once it is terminal and the
    /// application has let go. Straggler frames for the id are absorbed
    /// by the id-range checks in the demux.
    pub(crate) fn maybe_reap(&mut self, slot: usize) {
        let Some(entry) = self.slots.get(slot) else {
            return;
        };
        if !(entry.stream.is_terminal() && entry.stream.flags.contains(StreamFlags::APP_DONE)) {
            return;
        }
        self.unlink_stream(slot);
        let id = self.slots.remove(slot).stream.id();
        self.by_id.remove(&id);
        tracing::trace!(?id, "stream reaped");
    }

    pub(crate) fn unlink_stream(&mut self, slot: usize) {
        let flags = &mut self.slots[slot].stream.flags;
        if flags.contains(StreamFlags::IN_SEND_LIST) {
            flags.remove(StreamFlags::IN_SEND_LIST);
            self.send_list.retain(|&s| s != slot);
        }
        let flags = &mut self.slots[slot].stream.flags;
        if flags.contains(StreamFlags::IN_FCTL_LIST) {
            flags.remove(StreamFlags::IN_FCTL_LIST);
            self.fctl_list.retain(|&s| s != slot);
        }
    }

    /// Links a stream into the send list (or fctl list when the
    /// connection window is dry). Invariant: never both lists at once.
    pub(crate) fn enlist_for_send(&mut self, slot: usize) {
        let conn_window_dry = self.conn_send_window <= 0;
        let flags = &mut self.slots[slot].stream.flags;
        if flags.intersects(StreamFlags::IN_SEND_LIST | StreamFlags::IN_FCTL_LIST) {
            return;
        }
        if conn_window_dry {
            flags.insert(StreamFlags::IN_FCTL_LIST | StreamFlags::BLK_MFCTL);
            self.fctl_list.push_back(slot);
        } else {
            flags.insert(StreamFlags::IN_SEND_LIST);
            self.send_list.push_back(slot);
        }
    }

    /// A connection-level WINDOW_UPDATE arrived: flow-blocked streams
    /// move back to the send list.
    pub(crate) fn promote_fctl_list(&mut self) {
        while let Some(slot) = self.fctl_list.pop_front() {
            let flags = &mut self.slots[slot].stream.flags;
            flags.remove(StreamFlags::IN_FCTL_LIST | StreamFlags::BLK_MFCTL);
            flags.insert(StreamFlags::IN_SEND_LIST);
            self.send_list.push_back(slot);
        }
    }

    pub(crate) fn push_event(&mut self, slot: usize, kind: StreamEventKind) {
        let handle = self.handle_for(slot);
        self.events.push_back(StreamEvent { handle, kind });
    }

    // ===== error paths =====

    /// Escalates to a connection error: every live stream dies with the
    /// code, a GOAWAY is owed, and the demux stops parsing.
    pub(crate) fn conn_error(&mut self, reason: Reason) {
        if matches!(self.state, DemuxState::Error | DemuxState::Error2) {
            return;
        }
        tracing::debug!(?reason, "connection error");
        self.errcode = reason;
        // A graceful shutdown already fixed last_sid; a hard error
        // reports the highest id we actually processed.
        if !self.flags.contains(ConnFlags::SHUTTING) {
            self.last_sid = self.max_stream_id;
        }
        self.goaway_queued = Some(frame::GoAway::new(self.last_sid, reason));
        let slots: Vec<usize> = self.by_id.values().copied().collect();
        for slot in slots {
            if !self.slots[slot].stream.is_terminal() {
                self.slots[slot].stream.local_error(reason);
                self.slots[slot].stream.reset_sent();
                self.push_event(slot, StreamEventKind::ConnError(reason));
            }
            self.unlink_stream(slot);
        }
        self.send_list.clear();
        self.fctl_list.clear();
        self.partial_headers = None;
        self.state = DemuxState::Error;
    }

    /// A transport failure: no GOAWAY can be delivered; streams observe a
    /// transport-error code and the connection releases immediately.
    pub(crate) fn transport_error(&mut self, kind: std::io::ErrorKind) {
        tracing::debug!(?kind, "transport error");
        let slots: Vec<usize> = self.by_id.values().copied().collect();
        for slot in slots {
            if !self.slots[slot].stream.is_terminal() {
                self.slots[slot]
                    .stream
                    .recv_reset(Reason::INTERNAL_ERROR);
                self.push_event(slot, StreamEventKind::ConnError(Reason::INTERNAL_ERROR));
            }
            self.unlink_stream(slot);
        }
        self.close_now();
    }

    /// A stream-level error: RST_STREAM goes out, the connection lives.
    pub(crate) fn stream_error(&mut self, slot: usize, reason: Reason) {
        let id = self.slots[slot].stream.id();
        proto_err!(stream: "stream {:?} error {:?}", id, reason);
        self.unlink_stream(slot);
        let stream = &mut self.slots[slot].stream;
        if stream.flags.contains(StreamFlags::RST_SENT) {
            return;
        }
        stream.local_error(reason);
        stream.reset_sent();
        self.ctrl.push_back(Ctrl::Reset(frame::Reset::new(id, reason)));
        self.push_event(slot, StreamEventKind::Reset(reason));
        self.maybe_reap(slot);
    }

    /// Refuses a stream id without materializing a stream.
    pub(crate) fn refuse_stream(&mut self, id: StreamId, reason: Reason) {
        tracing::debug!(?id, ?reason, "refusing stream");
        self.ctrl.push_back(Ctrl::Reset(frame::Reset::new(id, reason)));
    }

    pub(crate) fn close_now(&mut self) {
        if self.flags.contains(ConnFlags::CLOSED) {
            return;
        }
        self.transport.shutdown(Dir::Both);
        self.transport.want_read(false);
        self.transport.want_write(false);
        if let Some(buf) = self.dbuf.take() {
            self.pool.release(buf, None);
        }
        if let Some(buf) = self.mbuf.take() {
            self.pool.release(buf, None);
        }
        self.flags.insert(ConnFlags::CLOSED);
        self.state = DemuxState::Error2;
    }

    // ===== public contract =====

    /// Operator-initiated graceful shutdown: no new streams, existing
    /// ones finish, the socket closes once the stream map drains.
    pub fn shutdown(&mut self) {
        if self
            .flags
            .intersects(ConnFlags::SHUTTING | ConnFlags::CLOSED)
        {
            return;
        }
        self.flags.insert(ConnFlags::SHUTTING);
        self.last_sid = self.max_stream_id;
        self.goaway_queued = Some(frame::GoAway::new(self.last_sid, Reason::NO_ERROR));
        tracing::debug!(last = ?self.last_sid, "graceful shutdown");
    }

    /// The connection task's timer fired. Idle connections close
    /// gracefully; a connection already draining gives up and closes.
    pub fn on_timeout(&mut self) -> ConnStatus {
        match self.state {
            DemuxState::Error | DemuxState::Error2 => {
                // Drain took too long.
                self.close_now();
            }
            _ if self.by_id.is_empty() => {
                self.shutdown();
                let _ = self.on_writable();
                self.close_now();
            }
            _ => {
                self.conn_error(Reason::NO_ERROR);
                let _ = self.on_writable();
            }
        }
        self.status()
    }

    /// True once the connection has fully wound down.
    pub(crate) fn done(&self) -> bool {
        if self.flags.contains(ConnFlags::CLOSED) {
            return true;
        }
        let drained = !self.has_output();
        match self.state {
            DemuxState::Error2 => drained,
            _ => {
                drained
                    && self.by_id.is_empty()
                    && (self.flags.contains(ConnFlags::GOAWAY_SENT)
                        && self.flags.contains(ConnFlags::SHUTTING)
                        || self.flags.contains(ConnFlags::EOF_RCVD))
            }
        }
    }

    pub(crate) fn status(&mut self) -> ConnStatus {
        if self.done() {
            self.close_now();
            ConnStatus::Closed
        } else {
            ConnStatus::Active
        }
    }

    // ===== settings =====

    /// Applies a peer SETTINGS frame and queues the ACK.
    pub(crate) fn apply_settings(&mut self, settings: &Settings) {
        if let Some(size) = settings.header_table_size() {
            // Cap how much encoder memory the peer can demand.
            let adopted = size.min(65_536) as usize;
            self.encoder.update_max_size(adopted);
        }
        if let Some(enabled) = settings.is_push_enabled() {
            self.peer_push_enabled = enabled;
        }
        if let Some(max) = settings.max_concurrent_streams() {
            self.peer_max_concurrent = Some(max);
        }
        if let Some(size) = settings.max_frame_size() {
            self.peer_max_frame = size;
        }
        if let Some(new) = settings.initial_window_size() {
            let delta = i64::from(new) - i64::from(self.peer_initial_window);
            self.peer_initial_window = new as i32;
            let slots: Vec<usize> = self.by_id.values().copied().collect();
            for slot in slots {
                if self.slots[slot].stream.shift_send_window(delta).is_err() {
                    self.conn_error(Reason::FLOW_CONTROL_ERROR);
                    return;
                }
                self.unblock_if_sendable(slot);
            }
        }
        self.ctrl.push_back(Ctrl::SettingsAck);
    }

    /// Clears SFCTL blockage when the stream's window reopened.
    pub(crate) fn unblock_if_sendable(&mut self, slot: usize) {
        let stream = &mut self.slots[slot].stream;
        if stream.send_window > 0 {
            stream.flags.remove(StreamFlags::BLK_SFCTL);
            if stream.has_tx() && !stream.is_terminal() {
                self.enlist_for_send(slot);
            }
        }
    }

    // ===== application surface =====

    /// The decoded request head, once [`StreamEventKind::Request`] fired.
    pub fn request(&self, h: &StreamHandle) -> Result<&RequestHead, HandleError> {
        let slot = self.validate(h)?;
        let stream = &self.slots[slot].stream;
        if let Some(code) = reset_code(stream) {
            return Err(HandleError::Reset(code));
        }
        stream.request.as_ref().ok_or(HandleError::InvalidState)
    }

    /// Reads up to `max` request body bytes. The bool is true at
    /// end-of-stream. Consumption feeds the WINDOW_UPDATE replenishment.
    pub fn read_body(
        &mut self,
        h: &StreamHandle,
        max: usize,
    ) -> Result<(Bytes, bool), HandleError> {
        let slot = self.validate(h)?;
        if let Some(code) = reset_code(&self.slots[slot].stream) {
            return Err(HandleError::Reset(code));
        }
        let stream = &mut self.slots[slot].stream;
        let mut out = bytes::BytesMut::new();
        while out.len() < max {
            let Some(front) = stream.rxbuf.front_mut() else {
                break;
            };
            let take = (max - out.len()).min(front.len());
            out.extend_from_slice(&front[..take]);
            if take == front.len() {
                stream.rxbuf.pop_front();
            } else {
                *front = front.slice(take..);
            }
        }
        let n = out.len();
        let eos = stream.rxbuf.is_empty() && stream.flags.contains(StreamFlags::ES_RCVD);
        if n > 0 {
            self.account_stream_consumed(slot, n as u32);
            self.account_conn_consumed(n as u32);
        }
        Ok((out.freeze(), eos))
    }

    /// Writes response bytes in HTTP/1.1 form: a status line and headers,
    /// then the body. Returns the bytes accepted (always all of them;
    /// output is buffered per stream and paced by flow control).
    pub fn write(&mut self, h: &StreamHandle, src: &[u8]) -> Result<usize, HandleError> {
        let slot = self.validate(h)?;
        if let Some(code) = reset_code(&self.slots[slot].stream) {
            return Err(HandleError::Reset(code));
        }
        let stream = &mut self.slots[slot].stream;
        if stream.request.is_none() || stream.flags.contains(StreamFlags::ES_SENT) {
            return Err(HandleError::InvalidState);
        }
        match stream.response.write(src) {
            Ok(outcome) => {
                if !outcome.body.is_empty() {
                    stream.txbuf.push_back(outcome.body);
                }
                if outcome.body_complete {
                    stream.tx_eos = true;
                }
                stream.res_parser_state = stream.response.parser_state();
                if self.slots[slot].stream.has_tx() {
                    self.enlist_for_send(slot);
                }
                Ok(src.len())
            }
            Err(reason) => {
                self.stream_error(slot, reason);
                Err(HandleError::Reset(reason))
            }
        }
    }

    /// Ends the response body (for responses without content-length).
    pub fn finish(&mut self, h: &StreamHandle) -> Result<(), HandleError> {
        let slot = self.validate(h)?;
        let stream = &mut self.slots[slot].stream;
        if stream.response.head().is_none() {
            return Err(HandleError::InvalidState);
        }
        stream.tx_eos = true;
        if self.slots[slot].stream.has_tx() {
            self.enlist_for_send(slot);
        }
        Ok(())
    }

    /// Application-side cancel: RST_STREAM with `reason` goes out.
    pub fn reset(&mut self, h: &StreamHandle, reason: Reason) -> Result<(), HandleError> {
        let slot = self.validate(h)?;
        if !self.slots[slot].stream.is_terminal() {
            self.stream_error(slot, reason);
        }
        Ok(())
    }

    /// Marks or clears the "application cannot consume input" condition.
    /// While set, the demux parks DATA for this stream in the demux
    /// buffer, which backpressures the whole connection by design.
    pub fn set_input_blocked(&mut self, h: &StreamHandle, blocked: bool) -> Result<(), HandleError> {
        let slot = self.validate(h)?;
        let stream = &mut self.slots[slot].stream;
        if blocked {
            stream.flags.insert(StreamFlags::BLK_SFULL);
        } else {
            stream.flags.remove(StreamFlags::BLK_SFULL);
            self.flags.remove(ConnFlags::DEM_SFULL);
        }
        Ok(())
    }

    /// The application is done with this stream; the handle dies and the
    /// stream is reaped once terminal.
    pub fn release(&mut self, h: &StreamHandle) {
        let Ok(slot) = self.validate(h) else {
            return;
        };
        self.slots[slot].stream.flags.insert(StreamFlags::APP_DONE);
        // An abandoned but unfinished response is a cancellation.
        if !self.slots[slot].stream.is_terminal()
            && !self.slots[slot].stream.flags.contains(StreamFlags::ES_SENT)
        {
            self.stream_error(slot, Reason::CANCEL);
        }
        self.maybe_reap(slot);
    }

    /// The stream's request parser state, as exposed to analysers.
    pub fn parser_states(
        &self,
        h: &StreamHandle,
    ) -> Result<(crate::h1::H1ParserState, crate::h1::H1ParserState), HandleError> {
        let slot = self.validate(h)?;
        let stream = &self.slots[slot].stream;
        Ok((stream.req_parser_state, stream.res_parser_state))
    }

    // ===== recv window replenishment =====

    pub(crate) fn account_stream_consumed(&mut self, slot: usize, n: u32) {
        let stream = &mut self.slots[slot].stream;
        if stream.is_recv_closed() {
            return;
        }
        stream.consumed += n;
        let threshold = (stream.recv_window_max as u32 / 2).max(1);
        if stream.consumed >= threshold {
            let delta = stream.consumed;
            stream.consumed = 0;
            stream.recv_window += delta as i32;
            let id = stream.id();
            self.ctrl
                .push_back(Ctrl::WindowUpdate(WindowUpdate::new(id, delta)));
        }
    }

    pub(crate) fn account_conn_consumed(&mut self, n: u32) {
        self.conn_consumed += n;
        let threshold = (CONN_RECV_WINDOW as u32 / 2).max(1);
        if self.conn_consumed >= threshold {
            let delta = self.conn_consumed;
            self.conn_consumed = 0;
            self.conn_recv_window += delta as i32;
            self.ctrl
                .push_back(Ctrl::WindowUpdate(WindowUpdate::new(StreamId::ZERO, delta)));
        }
    }
}

fn reset_code(stream: &Stream) -> Option<Reason> {
    match stream.state() {
        StreamState::Reset | StreamState::Error => Some(stream.errcode()),
        _ => None,
    }
}

impl<T: Transport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("streams", &self.by_id.len())
            .field("max_stream_id", &self.max_stream_id)
            .finish()
    }
}
