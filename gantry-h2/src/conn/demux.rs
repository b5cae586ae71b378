//! The demux side: transport reads and the frame-parsing state machine.

use bytes::Bytes;

use gantry_core::transport::{ReadStatus, Transport};

use crate::frame::{self, Head, Kind, Reason, PREFACE};
use crate::h1::RequestHead;
use crate::stream::StreamFlags;

use super::{ConnFlags, ConnStatus, Connection, Ctrl, DemuxState, StreamEventKind};

/// Outcome of one demux step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    /// State advanced; step again.
    Continue,
    /// More input is required before the state can advance.
    NeedRead,
    /// A blocking condition (buffer room, app input backpressure) must
    /// clear first; the flags say which.
    Blocked,
    /// The connection is gone.
    Closed,
}

/// What to parse after a frame handler ran.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum AfterFrame {
    /// Straight to the next frame header.
    NextHeader,
    /// An ACK is owed first.
    Ack,
}

/// Fragment accumulation guard: a header block larger than this aborts
/// the connection rather than buffering without bound.
const MAX_HEADER_BLOCK: usize = 128 * 1024;

impl<T: Transport> Connection<T> {
    /// Drives the connection after read readiness: fill the demux
    /// buffer, step the state machine, and push any produced output.
    pub fn on_readable(&mut self) -> ConnStatus {
        if self.is_closed() {
            return ConnStatus::Closed;
        }
        loop {
            let filled = self.fill_dbuf();
            let progressed = self.demux_run();
            self.drive_mux();
            if self.is_closed() || (filled == 0 && !progressed) {
                break;
            }
        }
        self.update_wants();
        self.status()
    }

    /// Re-enters the demux after a blocking condition cleared (buffer
    /// freed, application consumed input).
    pub fn on_unblocked(&mut self) -> ConnStatus {
        self.flags
            .remove(ConnFlags::DEM_DALLOC | ConnFlags::MUX_MALLOC);
        self.on_readable()
    }

    /// Reads transport bytes into the demux buffer. Returns bytes added.
    fn fill_dbuf(&mut self) -> usize {
        if self.is_closed() || self.flags.contains(ConnFlags::EOF_RCVD) {
            return 0;
        }
        if self.dbuf.is_none() {
            match self.pool.alloc(1) {
                Ok(buf) => self.dbuf = Some(buf),
                Err(_) => {
                    // Wait for a buffer; the owner registers us on the
                    // pool wait list.
                    self.flags.insert(ConnFlags::DEM_DALLOC);
                    return 0;
                }
            }
        }
        let Some(buf) = self.dbuf.as_mut() else {
            return 0;
        };
        if buf.is_full() {
            self.flags.insert(ConnFlags::DEM_DFULL);
            return 0;
        }
        match self.transport.read(buf) {
            ReadStatus::Data(n) => {
                self.flags.remove(ConnFlags::DEM_DFULL);
                n
            }
            ReadStatus::WouldBlock => 0,
            ReadStatus::Eof => {
                tracing::debug!("peer closed its half");
                self.flags.insert(ConnFlags::EOF_RCVD);
                self.handle_eof();
                0
            }
            ReadStatus::Err(kind) => {
                self.transport_error(kind);
                0
            }
        }
    }

    /// Streams whose request was still inbound when the peer vanished
    /// observe a transport-level cancellation.
    fn handle_eof(&mut self) {
        let slots: Vec<usize> = self.by_id.values().copied().collect();
        for slot in slots {
            let stream = &mut self.slots[slot].stream;
            if !stream.is_terminal() && !stream.flags.contains(StreamFlags::ES_RCVD) {
                stream.recv_reset(Reason::CANCEL);
                self.unlink_stream(slot);
                self.push_event(slot, StreamEventKind::ConnError(Reason::CANCEL));
                self.maybe_reap(slot);
            }
        }
    }

    /// Steps the demux until it cannot advance. Returns whether any
    /// progress happened.
    pub(crate) fn demux_run(&mut self) -> bool {
        let mut progressed = false;
        loop {
            match self.demux_step() {
                Step::Continue => progressed = true,
                Step::NeedRead | Step::Blocked | Step::Closed => break,
            }
        }
        progressed
    }

    /// One transition of the demux state machine.
    pub(crate) fn demux_step(&mut self) -> Step {
        match self.state {
            DemuxState::Preface => self.step_preface(),
            DemuxState::Settings1 | DemuxState::FrameHeader => self.step_frame_header(),
            DemuxState::FramePayload => self.step_frame_payload(),
            DemuxState::FrameAck => self.step_frame_ack(),
            DemuxState::Error => self.step_goaway_error(),
            DemuxState::Error2 => self.step_drain(),
        }
    }

    fn step_preface(&mut self) -> Step {
        let Some(buf) = self.dbuf.as_mut() else {
            return Step::NeedRead;
        };
        if buf.data() < PREFACE.len() {
            if self.flags.contains(ConnFlags::EOF_RCVD) {
                self.close_now();
                return Step::Closed;
            }
            return Step::NeedRead;
        }
        let mut head = [0u8; 24];
        buf.get_block(&mut head, 0);
        if &head != PREFACE {
            proto_err!(conn: "invalid connection preface");
            self.conn_error(Reason::PROTOCOL_ERROR);
            return Step::Continue;
        }
        buf.advance(PREFACE.len());
        tracing::trace!("preface verified, queueing server SETTINGS");
        self.ctrl.push_back(Ctrl::Settings(self.cfg.to_settings()));
        self.flags.insert(ConnFlags::SETTINGS_ACK_OWED);
        self.state = DemuxState::Settings1;
        Step::Continue
    }

    fn step_frame_header(&mut self) -> Step {
        let Some(buf) = self.dbuf.as_mut() else {
            return Step::NeedRead;
        };
        let Some((head, len)) = Head::peek(buf) else {
            return Step::NeedRead;
        };

        if len > self.cfg.max_frame_size {
            proto_err!(conn: "frame length {} above advertised max", len);
            self.conn_error(Reason::FRAME_SIZE_ERROR);
            return Step::Continue;
        }
        if self.state == DemuxState::Settings1 {
            let is_settings = head.kind() == Kind::Settings && head.flag() & 0x1 == 0;
            if !is_settings {
                proto_err!(conn: "expected initial SETTINGS, got {:?}", head.kind());
                self.conn_error(Reason::PROTOCOL_ERROR);
                return Step::Continue;
            }
        }
        match (&self.partial_headers, head.kind()) {
            (Some(partial), Kind::Continuation) if partial.stream_id() == head.stream_id() => {}
            (Some(_), _) => {
                proto_err!(conn: "header block interrupted by {:?}", head.kind());
                self.conn_error(Reason::PROTOCOL_ERROR);
                return Step::Continue;
            }
            (None, Kind::Continuation) => {
                proto_err!(conn: "CONTINUATION without an open header block");
                self.conn_error(Reason::PROTOCOL_ERROR);
                return Step::Continue;
            }
            (None, _) => {}
        }

        let _ = Head::take(buf);
        self.dfl = len;
        self.dft = head.kind().into();
        self.dff = head.flag();
        self.dsi = head.stream_id();
        self.state = DemuxState::FramePayload;
        tracing::trace!(kind = ?head.kind(), sid = ?self.dsi, len, "frame header");
        Step::Continue
    }

    fn step_frame_payload(&mut self) -> Step {
        match Kind::new(self.dft) {
            Kind::Data => self.recv_data_frame(),
            Kind::Unknown(_) => self.skip_payload(),
            kind => {
                let need = self.dfl as usize;
                let Some(buf) = self.dbuf.as_mut() else {
                    return Step::NeedRead;
                };
                if buf.data() < need {
                    if buf.is_full() {
                        // The frame can never fit; the advertised
                        // max-frame-size exceeded the buffer size.
                        tracing::error!(need, cap = buf.capacity(), "frame exceeds buffer");
                        self.conn_error(Reason::INTERNAL_ERROR);
                        return Step::Continue;
                    }
                    return Step::NeedRead;
                }
                let payload = buf.take(need);
                let after = self.dispatch(kind, payload);
                if matches!(self.state, DemuxState::Error | DemuxState::Error2) {
                    return Step::Continue;
                }
                self.state = match after {
                    AfterFrame::NextHeader => DemuxState::FrameHeader,
                    AfterFrame::Ack => DemuxState::FrameAck,
                };
                Step::Continue
            }
        }
    }

    fn step_frame_ack(&mut self) -> Step {
        if self.flush_ctrl() {
            self.flags.remove(ConnFlags::DEM_MROOM | ConnFlags::DEM_MBUSY);
            self.state = DemuxState::FrameHeader;
            Step::Continue
        } else {
            // The ACK cannot leave until the mux buffer drains.
            self.flags.insert(ConnFlags::DEM_MROOM);
            Step::Blocked
        }
    }

    fn step_goaway_error(&mut self) -> Step {
        if self.flush_goaway() {
            self.state = DemuxState::Error2;
            Step::Continue
        } else if self.flags.contains(ConnFlags::GOAWAY_FAILED) {
            Step::Closed
        } else {
            Step::Blocked
        }
    }

    fn step_drain(&mut self) -> Step {
        // Quiesce: eat and ignore any further input.
        if let Some(buf) = self.dbuf.as_mut() {
            let n = buf.data();
            buf.advance(n);
        }
        if !self.has_output() {
            self.close_now();
            return Step::Closed;
        }
        Step::Blocked
    }

    fn dispatch(&mut self, kind: Kind, payload: Bytes) -> AfterFrame {
        match kind {
            Kind::Headers => self.recv_headers_frame(payload),
            Kind::Continuation => self.recv_continuation(payload),
            Kind::Settings => self.recv_settings(&payload),
            Kind::Ping => self.recv_ping(&payload),
            Kind::WindowUpdate => self.recv_window_update(&payload),
            Kind::Reset => self.recv_reset_frame(&payload),
            Kind::GoAway => self.recv_goaway(&payload),
            Kind::Priority => self.recv_priority(&payload),
            Kind::PushPromise => {
                // Clients may not push (RFC 7540 §8.2).
                proto_err!(conn: "PUSH_PROMISE from client");
                self.conn_error(Reason::PROTOCOL_ERROR);
                AfterFrame::NextHeader
            }
            Kind::Data | Kind::Unknown(_) => {
                // Consumed incrementally in step_frame_payload.
                debug_assert!(false, "incremental frame reached dispatch");
                AfterFrame::NextHeader
            }
        }
    }

    /// Unknown frame types are skipped by reading their length off the
    /// wire, possibly across several buffer fills.
    fn skip_payload(&mut self) -> Step {
        let Some(buf) = self.dbuf.as_mut() else {
            return Step::NeedRead;
        };
        let n = (self.dfl as usize).min(buf.data());
        buf.advance(n);
        self.dfl -= n as u32;
        if self.dfl == 0 {
            self.state = DemuxState::FrameHeader;
            Step::Continue
        } else {
            Step::NeedRead
        }
    }

    // ===== DATA =====

    /// DATA is consumed incrementally: window accounting happens once for
    /// the whole frame, payload bytes move to the stream as they arrive.
    /// Padded frames are handled whole.
    fn recv_data_frame(&mut self) -> Step {
        if self.dsi.is_zero() {
            proto_err!(conn: "DATA on stream 0");
            self.conn_error(Reason::PROTOCOL_ERROR);
            return Step::Continue;
        }

        if !self.data_debited {
            // Both windows are debited by the full frame length up
            // front, padding included.
            if self.conn_recv_window < self.dfl as i32 {
                self.conn_error(Reason::FLOW_CONTROL_ERROR);
                return Step::Continue;
            }
            self.conn_recv_window -= self.dfl as i32;
            if let Some(&slot) = self.by_id.get(&self.dsi) {
                let stream = &mut self.slots[slot].stream;
                if !stream.is_terminal() && stream.recv_window < self.dfl as i32 {
                    // The discard path below replenishes the connection
                    // window as the payload drains.
                    self.stream_error(slot, Reason::FLOW_CONTROL_ERROR);
                } else if !stream.is_terminal() {
                    stream.recv_window -= self.dfl as i32;
                }
            }
            self.data_debited = true;
        }

        let padded = self.dff & 0x8 != 0;
        let end_stream = self.dff & 0x1 != 0;

        let slot = match self.by_id.get(&self.dsi) {
            Some(&slot) => {
                if self.slots[slot].stream.is_terminal() {
                    // Our RST crossed the peer's DATA: absorb quietly,
                    // replenish the connection window (grace behavior,
                    // uniform for every reset stream).
                    return self.discard_data_payload();
                }
                slot
            }
            None => {
                if self.dsi > self.max_stream_id {
                    proto_err!(conn: "DATA on idle stream {:?}", self.dsi);
                    self.conn_error(Reason::PROTOCOL_ERROR);
                    return Step::Continue;
                }
                // The stream is long gone: stragglers get STREAM_CLOSED.
                self.refuse_stream(self.dsi, Reason::STREAM_CLOSED);
                return self.discard_data_payload();
            }
        };

        if self.slots[slot].stream.is_recv_closed() {
            let _ = self.discard_data_payload();
            self.stream_error(slot, Reason::STREAM_CLOSED);
            return Step::Continue;
        }
        if self.slots[slot].stream.flags.contains(StreamFlags::BLK_SFULL) {
            // Application backpressure: leave the payload in the demux
            // buffer until it consumes.
            self.flags.insert(ConnFlags::DEM_SFULL);
            return Step::Blocked;
        }

        let Some(buf) = self.dbuf.as_mut() else {
            return Step::NeedRead;
        };

        if padded {
            // Padded frames are parsed whole.
            let need = self.dfl as usize;
            if buf.data() < need {
                return Step::NeedRead;
            }
            let payload = buf.take(need);
            let head = Head::new(Kind::Data, self.dff, self.dsi);
            let frame = match frame::Data::load(head, payload) {
                Ok(frame) => frame,
                Err(err) => {
                    self.conn_error(err.reason());
                    return Step::Continue;
                }
            };
            let pad_octets = self.dfl - frame.payload().len() as u32;
            self.dfl = 0;
            self.data_debited = false;
            // Padding never reaches the application; it is consumed here.
            if pad_octets > 0 {
                self.account_conn_consumed(pad_octets);
                self.account_stream_consumed(slot, pad_octets);
            }
            let body = frame.into_payload();
            self.deliver_data(slot, body, end_stream);
            self.state = DemuxState::FrameHeader;
            return Step::Continue;
        }

        let avail = (self.dfl as usize).min(buf.data());
        if avail == 0 && self.dfl > 0 {
            return Step::NeedRead;
        }
        let chunk = buf.take(avail);
        self.dfl -= avail as u32;
        let last = self.dfl == 0;
        if last {
            self.data_debited = false;
        }
        self.deliver_data(slot, chunk, end_stream && last);
        if last {
            self.state = DemuxState::FrameHeader;
            Step::Continue
        } else {
            Step::NeedRead
        }
    }

    fn deliver_data(&mut self, slot: usize, body: Bytes, end_stream: bool) {
        let had_bytes = !body.is_empty();
        match self.slots[slot].stream.recv_data(body, end_stream) {
            Ok(()) => {
                if had_bytes {
                    self.push_event(slot, StreamEventKind::Data);
                }
                if end_stream {
                    self.push_event(slot, StreamEventKind::End);
                    self.maybe_reap(slot);
                }
            }
            Err(reason) => self.stream_error(slot, reason),
        }
    }

    /// Consumes the remaining payload of a DATA frame aimed at a dead
    /// stream; the connection window is replenished right away.
    fn discard_data_payload(&mut self) -> Step {
        let Some(buf) = self.dbuf.as_mut() else {
            return Step::NeedRead;
        };
        let n = (self.dfl as usize).min(buf.data());
        buf.advance(n);
        self.dfl -= n as u32;
        self.account_conn_consumed(n as u32);
        if self.dfl == 0 {
            self.data_debited = false;
            self.state = DemuxState::FrameHeader;
            Step::Continue
        } else {
            Step::NeedRead
        }
    }

    // ===== HEADERS / CONTINUATION =====

    fn recv_headers_frame(&mut self, payload: Bytes) -> AfterFrame {
        let head = Head::new(Kind::Headers, self.dff, self.dsi);
        let frame = match frame::Headers::load(head, payload) {
            Ok(frame) => frame,
            Err(err) => {
                proto_err!(conn: "bad HEADERS: {}", err);
                self.conn_error(err.reason());
                return AfterFrame::NextHeader;
            }
        };
        if frame.is_end_headers() {
            self.headers_complete(frame);
        } else {
            tracing::trace!(sid = ?self.dsi, "header block continues");
            self.partial_headers = Some(frame);
        }
        AfterFrame::NextHeader
    }

    fn recv_continuation(&mut self, payload: Bytes) -> AfterFrame {
        let end_headers = self.dff & 0x4 != 0;
        // The header-stage check guarantees a partial block exists.
        let Some(mut partial) = self.partial_headers.take() else {
            self.conn_error(Reason::PROTOCOL_ERROR);
            return AfterFrame::NextHeader;
        };
        partial.push_continuation(&payload, end_headers);
        if partial.fragment().len() > MAX_HEADER_BLOCK {
            proto_err!(conn: "header block exceeds {} bytes", MAX_HEADER_BLOCK);
            self.conn_error(Reason::COMPRESSION_ERROR);
            return AfterFrame::NextHeader;
        }
        if end_headers {
            self.headers_complete(partial);
        } else {
            self.partial_headers = Some(partial);
        }
        AfterFrame::NextHeader
    }

    /// A complete header block: decode it (always, to keep the HPACK
    /// tables synchronized), then open / finish / refuse the stream.
    fn headers_complete(&mut self, frame: frame::Headers) {
        let sid = frame.stream_id();
        let end_stream = frame.is_end_stream();

        let mut fields = Vec::new();
        if let Err(err) = self
            .decoder
            .decode(frame.fragment(), |field| fields.push(field))
        {
            proto_err!(conn: "hpack failure: {}", err);
            self.conn_error(frame::Error::from(err).reason());
            return;
        }

        if let Some(&slot) = self.by_id.get(&sid) {
            // Trailers for an existing stream.
            if self.slots[slot].stream.is_terminal() {
                return;
            }
            match self.slots[slot].stream.recv_headers(end_stream) {
                Ok(_) => {
                    tracing::trace!(?sid, fields = fields.len(), "request trailers");
                    self.push_event(slot, StreamEventKind::End);
                    self.maybe_reap(slot);
                }
                Err(reason) => self.stream_error(slot, reason),
            }
            return;
        }

        if !sid.is_client_initiated() {
            proto_err!(conn: "HEADERS on non-client stream {:?}", sid);
            self.conn_error(Reason::PROTOCOL_ERROR);
            return;
        }
        if sid <= self.max_stream_id {
            proto_err!(conn: "HEADERS reuses stream id {:?}", sid);
            self.conn_error(Reason::PROTOCOL_ERROR);
            return;
        }
        self.max_stream_id = sid;

        if self.flags.intersects(ConnFlags::SHUTTING) && sid > self.last_sid {
            // Late stream during graceful shutdown.
            self.refuse_stream(sid, Reason::REFUSED_STREAM);
            return;
        }
        if self.cfg.max_concurrent_streams != 0
            && self.active_streams() >= self.cfg.max_concurrent_streams as usize
        {
            self.refuse_stream(sid, Reason::REFUSED_STREAM);
            return;
        }

        let slot = self.create_stream(sid);
        if let Err(reason) = self.slots[slot].stream.recv_headers(end_stream) {
            self.stream_error(slot, reason);
            return;
        }
        match RequestHead::from_fields(fields) {
            Ok(head) => {
                tracing::debug!(?sid, method = ?head.method, path = ?head.path, "request");
                self.slots[slot].stream.request = Some(head);
                self.push_event(slot, StreamEventKind::Request);
                if end_stream {
                    self.push_event(slot, StreamEventKind::End);
                }
            }
            Err(reason) => {
                // Malformed request: stream error, connection survives.
                self.stream_error(slot, reason);
            }
        }
    }

    // ===== control frames =====

    fn recv_settings(&mut self, payload: &[u8]) -> AfterFrame {
        let head = Head::new(Kind::Settings, self.dff, self.dsi);
        match frame::Settings::load(head, payload) {
            Ok(settings) => {
                if settings.is_ack() {
                    tracing::trace!("SETTINGS ACK received");
                    self.flags.remove(ConnFlags::SETTINGS_ACK_OWED);
                    AfterFrame::NextHeader
                } else {
                    tracing::debug!(?settings, "applying peer SETTINGS");
                    self.apply_settings(&settings);
                    AfterFrame::Ack
                }
            }
            Err(err) => {
                proto_err!(conn: "bad SETTINGS: {}", err);
                self.conn_error(err.reason());
                AfterFrame::NextHeader
            }
        }
    }

    fn recv_ping(&mut self, payload: &[u8]) -> AfterFrame {
        let head = Head::new(Kind::Ping, self.dff, self.dsi);
        match frame::Ping::load(head, payload) {
            Ok(ping) if ping.is_ack() => AfterFrame::NextHeader,
            Ok(ping) => {
                self.ctrl.push_back(Ctrl::Pong(*ping.payload()));
                AfterFrame::Ack
            }
            Err(err) => {
                proto_err!(conn: "bad PING: {}", err);
                self.conn_error(err.reason());
                AfterFrame::NextHeader
            }
        }
    }

    fn recv_window_update(&mut self, payload: &[u8]) -> AfterFrame {
        let head = Head::new(Kind::WindowUpdate, self.dff, self.dsi);
        let update = match frame::WindowUpdate::load(head, payload) {
            Ok(update) => update,
            Err(frame::Error::InvalidWindowUpdateValue) => {
                // Zero increment: connection error on stream 0, stream
                // error on a live stream, connection error otherwise.
                if let Some(&slot) = self.by_id.get(&self.dsi) {
                    if !self.dsi.is_zero() {
                        self.stream_error(slot, Reason::PROTOCOL_ERROR);
                        return AfterFrame::NextHeader;
                    }
                }
                proto_err!(conn: "WINDOW_UPDATE with zero increment");
                self.conn_error(Reason::PROTOCOL_ERROR);
                return AfterFrame::NextHeader;
            }
            Err(err) => {
                proto_err!(conn: "bad WINDOW_UPDATE: {}", err);
                self.conn_error(err.reason());
                return AfterFrame::NextHeader;
            }
        };

        if update.stream_id().is_zero() {
            let new = i64::from(self.conn_send_window) + i64::from(update.size_increment());
            if new > i64::from(i32::MAX) {
                self.conn_error(Reason::FLOW_CONTROL_ERROR);
                return AfterFrame::NextHeader;
            }
            self.conn_send_window = new as i32;
            tracing::trace!(window = self.conn_send_window, "connection window credit");
            if self.conn_send_window > 0 {
                self.promote_fctl_list();
            }
            return AfterFrame::NextHeader;
        }

        match self.by_id.get(&update.stream_id()) {
            Some(&slot) => {
                if self.slots[slot].stream.is_terminal() {
                    return AfterFrame::NextHeader;
                }
                match self.slots[slot]
                    .stream
                    .credit_send_window(update.size_increment())
                {
                    Ok(()) => self.unblock_if_sendable(slot),
                    Err(reason) => self.stream_error(slot, reason),
                }
            }
            None if update.stream_id() > self.max_stream_id => {
                proto_err!(conn: "WINDOW_UPDATE on idle stream {:?}", update.stream_id());
                self.conn_error(Reason::PROTOCOL_ERROR);
            }
            None => {
                // Straggler for a reaped stream: ignore.
            }
        }
        AfterFrame::NextHeader
    }

    fn recv_reset_frame(&mut self, payload: &[u8]) -> AfterFrame {
        let head = Head::new(Kind::Reset, self.dff, self.dsi);
        let frame = match frame::Reset::load(head, payload) {
            Ok(frame) => frame,
            Err(err) => {
                proto_err!(conn: "bad RST_STREAM: {}", err);
                self.conn_error(err.reason());
                return AfterFrame::NextHeader;
            }
        };
        match self.by_id.get(&frame.stream_id()) {
            Some(&slot) => {
                if !self.slots[slot].stream.is_terminal() {
                    tracing::debug!(sid = ?frame.stream_id(), reason = ?frame.reason(), "peer reset");
                    self.unlink_stream(slot);
                    self.slots[slot].stream.recv_reset(frame.reason());
                    self.push_event(slot, StreamEventKind::Reset(frame.reason()));
                    self.maybe_reap(slot);
                }
            }
            None if frame.stream_id() > self.max_stream_id => {
                proto_err!(conn: "RST_STREAM on idle stream {:?}", frame.stream_id());
                self.conn_error(Reason::PROTOCOL_ERROR);
            }
            None => {}
        }
        AfterFrame::NextHeader
    }

    fn recv_goaway(&mut self, payload: &[u8]) -> AfterFrame {
        let head = Head::new(Kind::GoAway, self.dff, self.dsi);
        match frame::GoAway::load(head, payload) {
            Ok(frame) => {
                tracing::debug!(last = ?frame.last_stream_id(), reason = ?frame.reason(), "peer GOAWAY");
                self.flags.insert(ConnFlags::GOAWAY_RCVD);
            }
            Err(err) => {
                proto_err!(conn: "bad GOAWAY: {}", err);
                self.conn_error(err.reason());
            }
        }
        AfterFrame::NextHeader
    }

    fn recv_priority(&mut self, payload: &[u8]) -> AfterFrame {
        let head = Head::new(Kind::Priority, self.dff, self.dsi);
        match frame::Priority::load(head, payload) {
            Ok(frame) => {
                // Parsed and validated; scheduling stays round-robin.
                tracing::trace!(?frame, "priority noted");
            }
            Err(frame::Error::InvalidDependencyId) => {
                if let Some(&slot) = self.by_id.get(&self.dsi) {
                    self.stream_error(slot, Reason::PROTOCOL_ERROR);
                }
            }
            Err(err) => {
                proto_err!(conn: "bad PRIORITY: {}", err);
                self.conn_error(err.reason());
            }
        }
        AfterFrame::NextHeader
    }
}
