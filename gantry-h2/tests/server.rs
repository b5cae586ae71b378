//! End-to-end scenarios: a server-side connection driven over an
//! in-memory pipe with hand-encoded client frames.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use gantry_core::pool::BufferPool;
use gantry_core::transport::PipeTransport;
use gantry_h2::conn::{ConnStatus, Connection};
use gantry_h2::frame::{self, Head, Kind, Reason, StreamId, HEADER_LEN, PREFACE};
use gantry_h2::hpack::{Decoder, Encoder, Field};
use gantry_h2::{H2Config, HandleError, StreamEventKind, StreamHandle};

// ===== client-side helpers =====

struct TestClient {
    /// The client's endpoint of the pipe (feeds c2s).
    pipe: PipeTransport,
    /// A clone of the server's endpoint, to observe server output.
    server_out: PipeTransport,
    encoder: Encoder,
    decoder: Decoder,
}

#[derive(Debug)]
struct RawFrame {
    kind: u8,
    flags: u8,
    sid: u32,
    payload: Vec<u8>,
}

impl TestClient {
    fn frames(&mut self) -> Vec<RawFrame> {
        let raw = self.server_out.drain_written();
        let mut out = Vec::new();
        let mut pos = 0;
        while pos + HEADER_LEN <= raw.len() {
            let len = frame::Head::parse_len(&raw[pos..]) as usize;
            let head = Head::parse(&raw[pos..]);
            assert!(
                pos + HEADER_LEN + len <= raw.len(),
                "truncated frame in server output"
            );
            out.push(RawFrame {
                kind: u8::from(head.kind()),
                flags: head.flag(),
                sid: head.stream_id().into(),
                payload: raw[pos + HEADER_LEN..pos + HEADER_LEN + len].to_vec(),
            });
            pos += HEADER_LEN + len;
        }
        assert_eq!(pos, raw.len(), "trailing garbage in server output");
        out
    }

    fn send_headers(&mut self, sid: u32, fields: &[(&str, &str)], end_stream: bool) {
        let block = self.encode_block(fields);
        let mut frame = frame::Headers::new(StreamId::from(sid), block);
        frame.set_end_stream(end_stream);
        let mut dst = BytesMut::new();
        frame.encode(16_384, &mut dst);
        self.pipe.feed(&dst);
    }

    fn encode_block(&mut self, fields: &[(&str, &str)]) -> Bytes {
        let fields: Vec<Field> = fields
            .iter()
            .map(|(n, v)| {
                Field::new(
                    Bytes::copy_from_slice(n.as_bytes()),
                    Bytes::copy_from_slice(v.as_bytes()),
                )
            })
            .collect();
        let mut block = BytesMut::new();
        self.encoder.encode(fields.iter(), &mut block);
        block.freeze()
    }

    fn send_data(&mut self, sid: u32, payload: &[u8], end_stream: bool) {
        const MAX_FRAME_SIZE: usize = 16_384;
        let mut chunks = payload.chunks(MAX_FRAME_SIZE).peekable();
        loop {
            let chunk = chunks.next().unwrap_or(&[]);
            let is_last = chunks.peek().is_none();
            let mut frame = frame::Data::new(StreamId::from(sid), Bytes::copy_from_slice(chunk));
            frame.set_end_stream(is_last && end_stream);
            let mut dst = BytesMut::new();
            frame.encode(&mut dst);
            self.pipe.feed(&dst);
            if is_last {
                break;
            }
        }
    }

    fn send_window_update(&mut self, sid: u32, delta: u32) {
        let mut dst = BytesMut::new();
        frame::WindowUpdate::new(StreamId::from(sid), delta).encode(&mut dst);
        self.pipe.feed(&dst);
    }

    fn send_rst(&mut self, sid: u32, reason: Reason) {
        let mut dst = BytesMut::new();
        frame::Reset::new(StreamId::from(sid), reason).encode(&mut dst);
        self.pipe.feed(&dst);
    }

    fn send_settings_ack(&mut self) {
        let mut dst = BytesMut::new();
        frame::Settings::ack().encode(&mut dst);
        self.pipe.feed(&dst);
    }

    /// Decodes a server HEADERS payload into (name, value) strings.
    fn decode_headers(&mut self, payload: &[u8]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.decoder
            .decode(payload, |f| {
                out.push((
                    String::from_utf8(f.name.to_vec()).unwrap(),
                    String::from_utf8(f.value.to_vec()).unwrap(),
                ));
            })
            .unwrap();
        out
    }
}

fn pool() -> Arc<BufferPool> {
    Arc::new(BufferPool::new(64, 16_384, 1))
}

fn connect(cfg: H2Config) -> (TestClient, Connection<PipeTransport>) {
    let (client_end, server_end) = PipeTransport::pair();
    let server_out = server_end.clone();
    let conn = Connection::new(server_end, pool(), cfg, 1);
    (
        TestClient {
            pipe: client_end,
            server_out,
            encoder: Encoder::new(4_096),
            decoder: Decoder::new(4_096),
        },
        conn,
    )
}

fn quiet_cfg() -> H2Config {
    // Advertise nothing: the initial SETTINGS frame stays empty.
    H2Config {
        max_concurrent_streams: 0,
        ..H2Config::default()
    }
}

/// Preface + empty SETTINGS, drained and ACKed.
fn handshake(client: &mut TestClient, conn: &mut Connection<PipeTransport>) {
    client.pipe.feed(PREFACE);
    let mut dst = BytesMut::new();
    frame::Settings::default().encode(&mut dst);
    client.pipe.feed(&dst);
    assert_eq!(conn.on_readable(), ConnStatus::Active);
    let frames = client.frames();
    assert_eq!(frames.len(), 2, "expected server SETTINGS + ACK");
    client.send_settings_ack();
    assert_eq!(conn.on_readable(), ConnStatus::Active);
}

fn expect_request(conn: &mut Connection<PipeTransport>) -> StreamHandle {
    loop {
        let ev = conn.poll_event().expect("expected a stream event");
        if ev.kind == StreamEventKind::Request {
            return ev.handle;
        }
    }
}

const GET_ROOT: &[(&str, &str)] = &[
    (":method", "GET"),
    (":scheme", "http"),
    (":path", "/"),
    (":authority", "example.com"),
];

// ===== seed scenario 1: preface then settings =====

#[test]
fn preface_then_settings_exchange() {
    let (mut client, mut conn) = connect(quiet_cfg());
    client.pipe.feed(PREFACE);
    assert_eq!(conn.on_readable(), ConnStatus::Active);
    // The server SETTINGS goes out as soon as the preface is recognized.
    let raw = client.server_out.drain_written();
    assert_eq!(raw, [0, 0, 0, 4, 0, 0, 0, 0, 0]);

    let mut dst = BytesMut::new();
    frame::Settings::default().encode(&mut dst);
    client.pipe.feed(&dst);
    assert_eq!(conn.on_readable(), ConnStatus::Active);
    let raw = client.server_out.drain_written();
    assert_eq!(raw, [0, 0, 0, 4, 1, 0, 0, 0, 0]);
}

#[test]
fn bad_preface_is_protocol_error() {
    let (mut client, mut conn) = connect(quiet_cfg());
    client.pipe.feed(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
    assert_eq!(conn.on_readable(), ConnStatus::Closed);
    let frames = client.frames();
    let goaway = frames.iter().find(|f| f.kind == 7).expect("GOAWAY");
    assert_eq!(
        u32::from_be_bytes(goaway.payload[4..8].try_into().unwrap()),
        u32::from(Reason::PROTOCOL_ERROR)
    );
}

// ===== seed scenario 2: single GET =====

#[test]
fn single_get_round_trip() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    client.send_headers(1, GET_ROOT, true);
    conn.on_readable();

    let handle = expect_request(&mut conn);
    let req = conn.request(&handle).unwrap();
    assert_eq!(&req.method[..], b"GET");
    assert_eq!(&req.path[..], b"/");
    let (_, eos) = conn.read_body(&handle, 1024).unwrap();
    assert!(eos);

    conn.write(
        &handle,
        b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello",
    )
    .unwrap();
    conn.on_writable();

    let frames = client.frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].kind, 1); // HEADERS
    assert_eq!(frames[0].sid, 1);
    assert_eq!(frames[0].flags & 0x4, 0x4); // END_HEADERS
    let headers = client.decode_headers(&frames[0].payload);
    assert_eq!(headers[0], (":status".into(), "200".into()));
    assert_eq!(frames[1].kind, 0); // DATA
    assert_eq!(frames[1].payload, b"hello");
    assert_eq!(frames[1].flags & 0x1, 0x1); // END_STREAM

    conn.release(&handle);
    assert_eq!(conn.stream_count(), 0);
    // The connection stays open for more streams.
    assert!(!conn.is_closed());
}

#[test]
fn zero_length_body_request_is_valid() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    // Minimal block, END_STREAM + END_HEADERS, no DATA at all.
    client.send_headers(1, &[(":method", "GET"), (":scheme", "http"), (":path", "/")], true);
    conn.on_readable();
    let handle = expect_request(&mut conn);
    let (body, eos) = conn.read_body(&handle, 64).unwrap();
    assert!(body.is_empty());
    assert!(eos);
}

// ===== seed scenario 3: flow control =====

#[test]
fn flow_control_stall_and_resume() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    client.send_headers(1, GET_ROOT, true);
    conn.on_readable();
    let handle = expect_request(&mut conn);

    let body = vec![b'x'; 200_000];
    conn.write(&handle, b"HTTP/1.1 200 OK\r\ncontent-length: 200000\r\n\r\n")
        .unwrap();
    conn.write(&handle, &body).unwrap();
    conn.on_writable();

    let frames = client.frames();
    let sent: usize = frames
        .iter()
        .filter(|f| f.kind == 0)
        .map(|f| f.payload.len())
        .sum();
    assert_eq!(sent, 65_535, "initial window worth of DATA then stall");

    // Stream credit alone is not enough: the connection window is dry.
    client.send_window_update(1, 100_000);
    conn.on_readable();
    assert_eq!(client.frames().iter().filter(|f| f.kind == 0).count(), 0);

    client.send_window_update(0, 100_000);
    conn.on_readable();
    let frames = client.frames();
    let resumed: usize = frames
        .iter()
        .filter(|f| f.kind == 0)
        .map(|f| f.payload.len())
        .sum();
    assert_eq!(resumed, 100_000, "connection window caps the resume");
}

// ===== seed scenario 4: protocol error =====

#[test]
fn data_on_stream_zero_is_connection_error() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    // A DATA frame on stream 0, encoded by hand.
    let mut dst = BytesMut::new();
    Head::new(Kind::Data, 0, StreamId::ZERO).encode(3, &mut dst);
    dst.extend_from_slice(b"nop");
    client.pipe.feed(&dst);

    assert_eq!(conn.on_readable(), ConnStatus::Closed);
    let frames = client.frames();
    let goaway = frames.iter().find(|f| f.kind == 7).expect("GOAWAY");
    let last_sid = u32::from_be_bytes(goaway.payload[0..4].try_into().unwrap());
    let code = u32::from_be_bytes(goaway.payload[4..8].try_into().unwrap());
    assert_eq!(last_sid, 0);
    assert_eq!(code, u32::from(Reason::PROTOCOL_ERROR));
}

// ===== seed scenario 5: stream reset =====

#[test]
fn rst_stream_cancels_one_stream_only() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    client.send_headers(
        3,
        &[
            (":method", "POST"),
            (":scheme", "http"),
            (":path", "/upload"),
        ],
        false,
    );
    client.send_data(3, b"partial body", false);
    conn.on_readable();
    let handle = expect_request(&mut conn);

    client.send_rst(3, Reason::CANCEL);
    conn.on_readable();

    // Buffered input is dropped; reads observe the cancel code.
    assert_eq!(
        conn.read_body(&handle, 1024),
        Err(HandleError::Reset(Reason::CANCEL))
    );
    assert!(!conn.is_closed());

    // A later stream still works.
    client.send_headers(5, GET_ROOT, true);
    conn.on_readable();
    let h5 = expect_request(&mut conn);
    assert_eq!(h5.stream_id(), StreamId::from(5));
}

// ===== seed scenario 6: graceful shutdown =====

#[test]
fn graceful_shutdown_drains_and_refuses_new_streams() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    client.send_headers(1, GET_ROOT, true);
    conn.on_readable();
    let handle = expect_request(&mut conn);

    conn.shutdown();
    conn.on_writable();
    let frames = client.frames();
    let goaway = frames.iter().find(|f| f.kind == 7).expect("GOAWAY");
    let last_sid = u32::from_be_bytes(goaway.payload[0..4].try_into().unwrap());
    let code = u32::from_be_bytes(goaway.payload[4..8].try_into().unwrap());
    assert_eq!(last_sid, 1);
    assert_eq!(code, u32::from(Reason::NO_ERROR));

    // A stream above last_sid is refused, the connection survives.
    client.send_headers(3, GET_ROOT, true);
    assert_eq!(conn.on_readable(), ConnStatus::Active);
    let frames = client.frames();
    let rst = frames.iter().find(|f| f.kind == 3).expect("RST_STREAM");
    assert_eq!(rst.sid, 3);
    assert_eq!(
        u32::from_be_bytes(rst.payload[0..4].try_into().unwrap()),
        u32::from(Reason::REFUSED_STREAM)
    );

    // The stream below last_sid completes normally, then the socket
    // closes once the map empties.
    conn.write(&handle, b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n")
        .unwrap();
    conn.on_writable();
    conn.release(&handle);
    assert_eq!(conn.on_writable(), ConnStatus::Closed);
}

// ===== boundary behaviors =====

#[test]
fn data_at_max_frame_size_ok_one_more_fails() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);
    client.send_headers(
        1,
        &[
            (":method", "POST"),
            (":scheme", "http"),
            (":path", "/"),
        ],
        false,
    );
    conn.on_readable();
    let handle = expect_request(&mut conn);

    // Exactly max_frame_size is accepted.
    client.send_data(1, &vec![0u8; 16_384], false);
    assert_eq!(conn.on_readable(), ConnStatus::Active);
    let (body, _) = conn.read_body(&handle, 20_000).unwrap();
    assert_eq!(body.len(), 16_384);

    // One byte more is a FRAME_SIZE_ERROR connection error.
    let mut dst = BytesMut::new();
    Head::new(Kind::Data, 0, StreamId::from(1)).encode(16_385, &mut dst);
    dst.extend_from_slice(&vec![0u8; 16_385]);
    client.pipe.feed(&dst);
    assert_eq!(conn.on_readable(), ConnStatus::Closed);
    let frames = client.frames();
    let goaway = frames.iter().find(|f| f.kind == 7).expect("GOAWAY");
    assert_eq!(
        u32::from_be_bytes(goaway.payload[4..8].try_into().unwrap()),
        u32::from(Reason::FRAME_SIZE_ERROR)
    );
}

#[test]
fn window_update_zero_delta_is_protocol_error() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    let mut dst = BytesMut::new();
    Head::new(Kind::WindowUpdate, 0, StreamId::ZERO).encode(4, &mut dst);
    dst.extend_from_slice(&[0, 0, 0, 0]);
    client.pipe.feed(&dst);

    assert_eq!(conn.on_readable(), ConnStatus::Closed);
    let frames = client.frames();
    let goaway = frames.iter().find(|f| f.kind == 7).expect("GOAWAY");
    assert_eq!(
        u32::from_be_bytes(goaway.payload[4..8].try_into().unwrap()),
        u32::from(Reason::PROTOCOL_ERROR)
    );
}

#[test]
fn window_overflow_via_settings_then_update() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    client.send_headers(1, GET_ROOT, true);
    conn.on_readable();
    let _handle = expect_request(&mut conn);

    // Peer pushes the stream window to the ceiling, then credits more.
    let mut settings = frame::Settings::default();
    settings.set_initial_window_size(Some((1 << 31) - 1));
    let mut dst = BytesMut::new();
    settings.encode(&mut dst);
    client.pipe.feed(&dst);
    conn.on_readable();

    client.send_window_update(1, 2);
    conn.on_readable();
    let frames = client.frames();
    let rst = frames.iter().find(|f| f.kind == 3).expect("RST_STREAM");
    assert_eq!(
        u32::from_be_bytes(rst.payload[0..4].try_into().unwrap()),
        u32::from(Reason::FLOW_CONTROL_ERROR)
    );
    assert!(!conn.is_closed());
}

// ===== supplementary coverage =====

#[test]
fn ping_is_echoed_with_ack() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    let mut dst = BytesMut::new();
    frame::Ping::new(*b"gantry!!").encode(&mut dst);
    client.pipe.feed(&dst);
    conn.on_readable();

    let frames = client.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind, 6);
    assert_eq!(frames[0].flags & 0x1, 0x1);
    assert_eq!(frames[0].payload, b"gantry!!");
}

#[test]
fn unknown_frame_types_are_skipped() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    let mut dst = BytesMut::new();
    Head::new(Kind::Unknown(0x42), 0xff, StreamId::from(9)).encode(6, &mut dst);
    dst.extend_from_slice(b"mystry");
    client.pipe.feed(&dst);
    assert_eq!(conn.on_readable(), ConnStatus::Active);

    // The connection still works afterwards.
    client.send_headers(1, GET_ROOT, true);
    conn.on_readable();
    expect_request(&mut conn);
}

#[test]
fn headers_split_across_continuation() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    let block = client.encode_block(&[
        (":method", "GET"),
        (":scheme", "http"),
        (":path", "/split"),
        ("x-filler", "some longer value to make the block split nicely"),
    ]);
    let cut = block.len() / 2;

    // HEADERS without END_HEADERS, then CONTINUATION carrying the rest.
    let mut dst = BytesMut::new();
    Head::new(Kind::Headers, 0x1, StreamId::from(1)).encode(cut, &mut dst);
    dst.extend_from_slice(&block[..cut]);
    Head::new(Kind::Continuation, 0x4, StreamId::from(1)).encode(block.len() - cut, &mut dst);
    dst.extend_from_slice(&block[cut..]);
    client.pipe.feed(&dst);

    conn.on_readable();
    let handle = expect_request(&mut conn);
    let req = conn.request(&handle).unwrap();
    assert_eq!(&req.path[..], b"/split");
}

#[test]
fn interrupted_header_block_is_protocol_error() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    let block = client.encode_block(GET_ROOT);
    let mut dst = BytesMut::new();
    // HEADERS without END_HEADERS followed by a PING.
    Head::new(Kind::Headers, 0x1, StreamId::from(1)).encode(block.len(), &mut dst);
    dst.extend_from_slice(&block);
    client.pipe.feed(&dst);
    let mut ping = BytesMut::new();
    frame::Ping::new([0; 8]).encode(&mut ping);
    client.pipe.feed(&ping);

    assert_eq!(conn.on_readable(), ConnStatus::Closed);
}

#[test]
fn push_promise_from_client_is_protocol_error() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    // Hand-encoded PUSH_PROMISE (END_HEADERS, promised stream 2): the
    // engine rejects it before looking at the payload.
    let mut dst = BytesMut::new();
    Head::new(Kind::PushPromise, 0x4, StreamId::from(1)).encode(4, &mut dst);
    dst.extend_from_slice(&[0, 0, 0, 2]);
    client.pipe.feed(&dst);
    assert_eq!(conn.on_readable(), ConnStatus::Closed);
}

#[test]
fn streams_beyond_concurrency_cap_are_refused() {
    let cfg = H2Config {
        max_concurrent_streams: 1,
        ..H2Config::default()
    };
    let (mut client, mut conn) = connect(cfg);
    handshake(&mut client, &mut conn);

    client.send_headers(1, GET_ROOT, false);
    client.send_headers(3, GET_ROOT, true);
    conn.on_readable();

    let frames = client.frames();
    let rst = frames.iter().find(|f| f.kind == 3).expect("RST_STREAM");
    assert_eq!(rst.sid, 3);
    assert_eq!(
        u32::from_be_bytes(rst.payload[0..4].try_into().unwrap()),
        u32::from(Reason::REFUSED_STREAM)
    );
    assert!(!conn.is_closed());
}

#[test]
fn malformed_request_is_stream_error() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    // Missing :path.
    client.send_headers(1, &[(":method", "GET"), (":scheme", "http")], true);
    assert_eq!(conn.on_readable(), ConnStatus::Active);
    let frames = client.frames();
    let rst = frames.iter().find(|f| f.kind == 3).expect("RST_STREAM");
    assert_eq!(rst.sid, 1);
    assert_eq!(
        u32::from_be_bytes(rst.payload[0..4].try_into().unwrap()),
        u32::from(Reason::PROTOCOL_ERROR)
    );

    // HPACK state survived: the next stream decodes fine.
    client.send_headers(3, GET_ROOT, true);
    conn.on_readable();
    expect_request(&mut conn);
}

#[test]
fn stream_id_reuse_is_protocol_error() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    client.send_headers(5, GET_ROOT, true);
    conn.on_readable();
    let h = expect_request(&mut conn);
    conn.write(&h, b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n")
        .unwrap();
    conn.on_writable();
    conn.release(&h);

    // Lower id after 5 was seen.
    client.send_headers(3, GET_ROOT, true);
    assert_eq!(conn.on_readable(), ConnStatus::Closed);
}

#[test]
fn request_body_is_delivered_and_windows_replenish() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    client.send_headers(
        1,
        &[
            (":method", "POST"),
            (":scheme", "http"),
            (":path", "/echo"),
        ],
        false,
    );
    // More than half the 65535 stream window, body still open so the
    // stream window keeps being replenished.
    client.send_data(1, &vec![b'a'; 16_000], false);
    client.send_data(1, &vec![b'b'; 17_000], false);
    conn.on_readable();

    let handle = expect_request(&mut conn);
    let (body, eos) = conn.read_body(&handle, 64_000).unwrap();
    assert_eq!(body.len(), 33_000);
    assert!(!eos);

    conn.on_writable();
    let frames = client.frames();
    // Consumption crossed half of both windows: WINDOW_UPDATEs go out.
    let wus: Vec<&RawFrame> = frames.iter().filter(|f| f.kind == 8).collect();
    assert!(
        wus.iter().any(|f| f.sid == 0),
        "connection window replenished"
    );
    assert!(wus.iter().any(|f| f.sid == 1), "stream window replenished");
}

#[test]
fn response_trailers_carry_end_stream() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    client.send_headers(1, GET_ROOT, true);
    conn.on_readable();
    let handle = expect_request(&mut conn);

    conn.write(&handle, b"HTTP/1.1 200 OK\r\n\r\nchunk").unwrap();
    conn.write_trailers(
        &handle,
        vec![(
            Bytes::from_static(b"grpc-status"),
            Bytes::from_static(b"0"),
        )],
    )
    .unwrap();
    conn.on_writable();

    let frames = client.frames();
    assert_eq!(frames[0].kind, 1); // response HEADERS
    assert_eq!(frames[1].kind, 0); // DATA "chunk"
    assert_eq!(frames[1].flags & 0x1, 0);
    assert_eq!(frames[2].kind, 1); // trailers
    assert_eq!(frames[2].flags & 0x1, 0x1); // END_STREAM
    let trailers = {
        // First decode the response headers to keep the table in sync.
        let mut names = client.decode_headers(&frames[0].payload);
        names.clear();
        client.decode_headers(&frames[2].payload)
    };
    assert_eq!(trailers[0], ("grpc-status".into(), "0".into()));
}

#[test]
fn idle_timeout_closes_gracefully() {
    let (mut client, mut conn) = connect(quiet_cfg());
    handshake(&mut client, &mut conn);

    assert_eq!(conn.on_timeout(), ConnStatus::Closed);
    let frames = client.frames();
    let goaway = frames.iter().find(|f| f.kind == 7).expect("GOAWAY");
    assert_eq!(
        u32::from_be_bytes(goaway.payload[4..8].try_into().unwrap()),
        u32::from(Reason::NO_ERROR)
    );
}
