//! The mux side: control-frame queue, stream output under flow control,
//! GOAWAY emission and the transport flush.

use bytes::{Bytes, BytesMut};

use gantry_core::transport::{Transport, WriteStatus};

use crate::frame::{self, Head, Kind, HEADER_LEN};
use crate::hpack::Field;
use crate::stream::StreamFlags;

use super::{ConnFlags, ConnStatus, Connection, Ctrl, DemuxState, HandleError, StreamHandle};

impl<T: Transport> Connection<T> {
    /// Drives the connection after write readiness.
    pub fn on_writable(&mut self) -> ConnStatus {
        if self.is_closed() {
            return ConnStatus::Closed;
        }
        self.flags.remove(ConnFlags::MUX_MFULL);
        self.drive_mux();
        // Output space may have unblocked the demux (pending ACK).
        if self.flags.contains(ConnFlags::DEM_MROOM) {
            self.flags.remove(ConnFlags::DEM_MROOM);
            self.demux_run();
            self.drive_mux();
        }
        self.update_wants();
        self.status()
    }

    /// Anything queued for the wire?
    #[must_use]
    pub(crate) fn has_output(&self) -> bool {
        self.parked.is_some()
            || !self.ctrl.is_empty()
            || self.goaway_queued.is_some()
            || self.mbuf.as_ref().is_some_and(|b| !b.is_empty())
            || !self.send_list.is_empty()
    }

    /// One mux pass: flush, control frames, stream output, GOAWAY.
    pub(crate) fn drive_mux(&mut self) {
        if self.is_closed() {
            return;
        }
        self.flush_mbuf();
        self.flush_parked();
        self.flush_ctrl();
        match self.state {
            DemuxState::Error => {
                // The error-path GOAWAY is the only output that matters.
                if self.flush_goaway() && !self.flags.contains(ConnFlags::GOAWAY_FAILED) {
                    self.state = DemuxState::Error2;
                }
            }
            DemuxState::Error2 => {}
            _ => {
                self.serve_streams();
                // A graceful GOAWAY rides along after stream output.
                self.flush_goaway();
            }
        }
        self.flush_mbuf();
        if self.state == DemuxState::Error2 && !self.has_output() {
            self.close_now();
        }
    }

    /// Pushes mux buffer bytes into the transport until it blocks.
    pub(crate) fn flush_mbuf(&mut self) {
        loop {
            let Some(buf) = self.mbuf.as_mut() else {
                return;
            };
            if buf.is_empty() {
                return;
            }
            let (first, _) = buf.read_slices();
            let n = first.len();
            debug_assert!(n > 0);
            let chunk = first.to_vec();
            match self.transport.write(&chunk) {
                WriteStatus::Data(written) => {
                    buf.advance(written);
                    if written < n {
                        self.flags.insert(ConnFlags::MUX_MFULL);
                        return;
                    }
                }
                WriteStatus::WouldBlock => {
                    self.flags.insert(ConnFlags::MUX_MFULL);
                    return;
                }
                WriteStatus::Err(kind) => {
                    self.transport_error(kind);
                    return;
                }
            }
        }
    }

    fn ensure_mbuf(&mut self) -> bool {
        if self.mbuf.is_some() {
            return true;
        }
        match self.pool.alloc(0) {
            Ok(buf) => {
                self.mbuf = Some(buf);
                true
            }
            Err(_) => {
                self.flags.insert(ConnFlags::MUX_MALLOC);
                false
            }
        }
    }

    /// Copies an encoded frame into the mux buffer, flushing first when
    /// it is tight. Returns false if there is still no room.
    fn emit_bytes(&mut self, bytes: &[u8]) -> bool {
        if !self.ensure_mbuf() {
            return false;
        }
        if self.mbuf.as_ref().is_some_and(|b| b.room() < bytes.len()) {
            self.flush_mbuf();
        }
        match self.mbuf.as_mut() {
            Some(buf) if buf.room() >= bytes.len() => {
                buf.put_slice(bytes);
                true
            }
            _ => false,
        }
    }

    /// The parked frame (one that missed the buffer) goes out before
    /// anything else so HPACK emission order holds.
    fn flush_parked(&mut self) {
        let Some(mut bytes) = self.parked.take() else {
            return;
        };
        // A frame larger than a whole buffer can never be staged; stream
        // it straight to the transport once the buffer has drained.
        let mbuf_empty = self.mbuf.as_ref().map_or(true, gantry_core::buf::Buffer::is_empty);
        if bytes.len() > self.pool.bufsize() && mbuf_empty {
            loop {
                match self.transport.write(&bytes) {
                    WriteStatus::Data(n) if n == bytes.len() => return,
                    WriteStatus::Data(n) => bytes = bytes.slice(n..),
                    WriteStatus::WouldBlock => {
                        self.flags.insert(ConnFlags::MUX_MFULL);
                        self.parked = Some(bytes);
                        return;
                    }
                    WriteStatus::Err(kind) => {
                        self.transport_error(kind);
                        return;
                    }
                }
            }
        }
        if !self.emit_bytes(&bytes) {
            self.parked = Some(bytes);
        }
    }

    /// Drains the control-frame queue into the mux buffer. Returns true
    /// once the queue is empty.
    pub(crate) fn flush_ctrl(&mut self) -> bool {
        if self.parked.is_some() {
            // HPACK ordering: nothing may overtake a parked HEADERS.
            self.flush_parked();
            if self.parked.is_some() {
                return false;
            }
        }
        while let Some(ctrl) = self.ctrl.front() {
            let mut scratch = BytesMut::with_capacity(32);
            match ctrl {
                Ctrl::Settings(settings) => settings.encode(&mut scratch),
                Ctrl::SettingsAck => frame::Settings::ack().encode(&mut scratch),
                Ctrl::Pong(payload) => frame::Ping::pong(*payload).encode(&mut scratch),
                Ctrl::WindowUpdate(update) => update.encode(&mut scratch),
                Ctrl::Reset(reset) => reset.encode(&mut scratch),
            }
            if !self.emit_bytes(&scratch) {
                return false;
            }
            self.ctrl.pop_front();
        }
        true
    }

    /// Emits a queued GOAWAY. Returns true when none is pending anymore.
    /// A GOAWAY that cannot be buffered marks the connection failed and
    /// closes the socket without it, so this is always safe to call.
    pub(crate) fn flush_goaway(&mut self) -> bool {
        let Some(frame) = self.goaway_queued.take() else {
            return true;
        };
        let mut scratch = BytesMut::with_capacity(HEADER_LEN + 8 + frame.debug_data().len());
        frame.encode(&mut scratch);
        if self.emit_bytes(&scratch) {
            tracing::debug!(last = ?frame.last_stream_id(), reason = ?frame.reason(), "GOAWAY sent");
            self.flags.insert(ConnFlags::GOAWAY_SENT);
            self.flush_mbuf();
            true
        } else if self.flags.contains(ConnFlags::MUX_MALLOC) || self.mbuf_is_wedged() {
            // No room and no prospect of room: report the failure and
            // drop the connection rather than wait forever.
            tracing::warn!("GOAWAY could not be emitted, closing without it");
            self.flags.insert(ConnFlags::GOAWAY_FAILED);
            self.close_now();
            true
        } else {
            self.goaway_queued = Some(frame);
            false
        }
    }

    /// The mux buffer is full and the socket will not take more.
    fn mbuf_is_wedged(&self) -> bool {
        self.flags.contains(ConnFlags::MUX_MFULL)
            && self.mbuf.as_ref().is_some_and(|b| b.is_full())
    }

    // ===== stream output =====

    /// Round-robin drain of the send list. Each stream emits what its
    /// windows and the buffer allow; streams with work left requeue at
    /// the tail.
    fn serve_streams(&mut self) {
        let mut passes = self.send_list.len();
        while passes > 0 {
            if self.parked.is_some() || self.flags.contains(ConnFlags::MUX_MALLOC) {
                break;
            }
            let Some(slot) = self.send_list.pop_front() else {
                break;
            };
            passes -= 1;
            self.slots[slot]
                .stream
                .flags
                .remove(StreamFlags::IN_SEND_LIST | StreamFlags::BLK_MROOM);
            self.emit_stream(slot);
            // The stream may have finished and been reaped.
            let Some(entry) = self.slots.get(slot) else {
                continue;
            };
            // Re-enlist if output remains and nothing blocks it.
            let stream = &entry.stream;
            if !stream.is_terminal()
                && stream.has_tx()
                && !stream
                    .flags
                    .intersects(StreamFlags::BLK_SFCTL | StreamFlags::IN_FCTL_LIST)
                && !self.flags.contains(ConnFlags::MUX_MFULL)
            {
                self.enlist_for_send(slot);
            }
        }
    }

    /// Emits as much of one stream's response as currently possible:
    /// HEADERS first, then DATA under flow control, then trailers or the
    /// closing empty DATA.
    fn emit_stream(&mut self, slot: usize) {
        if self.slots[slot].stream.response.head_pending() {
            let (status, fields) = {
                let stream = &self.slots[slot].stream;
                let Some(head) = stream.response.head() else {
                    return;
                };
                (head.status, head.fields.clone())
            };
            let no_body = {
                let stream = &self.slots[slot].stream;
                stream.tx_eos && stream.txbuf.is_empty() && stream.trailers.is_none()
            };
            let frame = self.encode_response_headers(slot, status, &fields, no_body);
            // Parked or placed, the block is committed (the encoder
            // state moved); it must never be re-encoded.
            let placed = self.emit_or_park(frame);
            self.slots[slot].stream.response.mark_head_sent();
            if no_body {
                self.finish_sending(slot);
                return;
            }
            if !placed {
                return;
            }
        }

        if !self.slots[slot].stream.response.head_sent() {
            return;
        }

        // Body under flow control.
        loop {
            let Some(front_len) = self.slots[slot].stream.txbuf.front().map(Bytes::len) else {
                break;
            };
            if self.slots[slot].stream.send_window <= 0 {
                self.slots[slot].stream.flags.insert(StreamFlags::BLK_SFCTL);
                return;
            }
            if self.conn_send_window <= 0 {
                self.enlist_for_send(slot);
                return;
            }
            if !self.ensure_mbuf() {
                return;
            }
            self.flush_room(HEADER_LEN + 1);
            let room = self.mbuf.as_ref().map_or(0, |b| b.room());
            if room <= HEADER_LEN {
                self.flags.insert(ConnFlags::MUX_MFULL);
                self.slots[slot].stream.flags.insert(StreamFlags::BLK_MROOM);
                self.enlist_for_send(slot);
                return;
            }
            let stream = &self.slots[slot].stream;
            let budget = (stream.send_window.min(self.conn_send_window) as usize)
                .min(self.peer_max_frame as usize)
                .min(room - HEADER_LEN)
                .min(front_len);
            debug_assert!(budget > 0);

            let last_bytes = front_len == budget && self.slots[slot].stream.txbuf.len() == 1;
            let end_stream = last_bytes
                && self.slots[slot].stream.tx_eos
                && self.slots[slot].stream.trailers.is_none();

            // Frame header straight into the buffer, then the payload.
            let mut head_scratch = BytesMut::with_capacity(HEADER_LEN);
            let flags = if end_stream { 0x1 } else { 0x0 };
            Head::new(Kind::Data, flags, self.slots[slot].stream.id())
                .encode(budget, &mut head_scratch);
            let Some(buf) = self.mbuf.as_mut() else { return };
            buf.put_slice(&head_scratch);
            {
                let stream = &mut self.slots[slot].stream;
                let front = stream.txbuf.front_mut().map(|f| {
                    let chunk = f.slice(..budget);
                    *f = f.slice(budget..);
                    chunk
                });
                if let Some(chunk) = front {
                    if let Some(buf) = self.mbuf.as_mut() {
                        buf.put_slice(&chunk);
                    }
                }
                if stream
                    .txbuf
                    .front()
                    .is_some_and(bytes::Bytes::is_empty)
                {
                    stream.txbuf.pop_front();
                }
                stream.send_window -= budget as i32;
            }
            self.conn_send_window -= budget as i32;
            tracing::trace!(
                sid = ?self.slots[slot].stream.id(),
                len = budget,
                end_stream,
                "DATA emitted"
            );
            if end_stream {
                self.finish_sending(slot);
                return;
            }
        }

        // Trailers or the closing empty DATA frame.
        if self.slots[slot].stream.tx_pending_eos() {
            if let Some(trailers) = self.slots[slot].stream.trailers.take() {
                let frame = self.encode_trailers(slot, &trailers);
                if !self.emit_or_park(frame) {
                    // Parked; completion happens when it flushes.
                    self.finish_sending(slot);
                    return;
                }
                self.finish_sending(slot);
            } else {
                let mut scratch = BytesMut::with_capacity(HEADER_LEN);
                Head::new(Kind::Data, 0x1, self.slots[slot].stream.id())
                    .encode(0, &mut scratch);
                if !self.emit_bytes(&scratch) {
                    self.flags.insert(ConnFlags::MUX_MFULL);
                    self.enlist_for_send(slot);
                    return;
                }
                self.finish_sending(slot);
            }
        }
    }

    /// Flush the mux buffer early when less than `want` room remains.
    fn flush_room(&mut self, want: usize) {
        if self.mbuf.as_ref().is_some_and(|b| b.room() < want) {
            self.flush_mbuf();
        }
    }

    /// END_STREAM has been emitted for this stream.
    fn finish_sending(&mut self, slot: usize) {
        let stream = &mut self.slots[slot].stream;
        stream.send_close();
        tracing::debug!(sid = ?stream.id(), state = ?stream.state(), "response complete");
        self.unlink_stream(slot);
        self.push_event(slot, super::StreamEventKind::Complete);
        self.maybe_reap(slot);
    }

    /// Encodes the response HEADERS through the connection's HPACK
    /// encoder (stateful: the result must be the next HEADERS emitted).
    fn encode_response_headers(
        &mut self,
        slot: usize,
        status: u16,
        fields: &[Field],
        end_stream: bool,
    ) -> Bytes {
        let mut block = BytesMut::with_capacity(64);
        let status_field = Field::new(
            &b":status"[..],
            Bytes::from(status.to_string().into_bytes()),
        );
        self.encoder
            .encode(std::iter::once(&status_field).chain(fields), &mut block);
        let mut frame = frame::Headers::new(self.slots[slot].stream.id(), block.freeze());
        frame.set_end_stream(end_stream);
        let mut scratch = BytesMut::with_capacity(frame.fragment().len() + HEADER_LEN * 2);
        frame.encode(self.peer_max_frame as usize, &mut scratch);
        scratch.freeze()
    }

    fn encode_trailers(&mut self, slot: usize, trailers: &[Field]) -> Bytes {
        let mut block = BytesMut::with_capacity(32);
        self.encoder.encode(trailers.iter(), &mut block);
        let mut frame = frame::Headers::new(self.slots[slot].stream.id(), block.freeze());
        frame.set_end_stream(true);
        let mut scratch = BytesMut::with_capacity(frame.fragment().len() + HEADER_LEN * 2);
        frame.encode(self.peer_max_frame as usize, &mut scratch);
        scratch.freeze()
    }

    /// Emits an encoded HEADERS block or parks it; parked output always
    /// leaves first. Returns whether the frame was placed now.
    fn emit_or_park(&mut self, bytes: Bytes) -> bool {
        if self.emit_bytes(&bytes) {
            true
        } else {
            debug_assert!(self.parked.is_none());
            self.flags.insert(ConnFlags::MUX_MFULL);
            self.parked = Some(bytes);
            false
        }
    }

    /// Queues response trailers; they carry END_STREAM after the body.
    pub fn write_trailers(
        &mut self,
        h: &StreamHandle,
        trailers: Vec<(Bytes, Bytes)>,
    ) -> Result<(), HandleError> {
        let slot = self.validate(h)?;
        let stream = &mut self.slots[slot].stream;
        if stream.response.head().is_none() || stream.flags.contains(StreamFlags::ES_SENT) {
            return Err(HandleError::InvalidState);
        }
        stream.trailers = Some(
            trailers
                .into_iter()
                .map(|(name, value)| Field::new(name, value))
                .collect(),
        );
        stream.tx_eos = true;
        if self.slots[slot].stream.has_tx() {
            self.enlist_for_send(slot);
        }
        Ok(())
    }

    /// Applies the current want flags to the transport.
    pub(crate) fn update_wants(&mut self) {
        let (read, write) = self.wants();
        self.transport.want_read(read);
        self.transport.want_write(write);
    }
}
