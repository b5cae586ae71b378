//! Full-stack smoke test: real TCP, worker threads, one GET.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;

use gantry::h2::frame::{self, Head, HEADER_LEN, PREFACE};
use gantry::h2::hpack::{Encoder, Field};
use gantry::h2::{H2Config, StreamEventKind};
use gantry::core::RuntimeConfig;

fn read_exact_frame(stream: &mut TcpStream) -> (u8, u8, u32, Vec<u8>) {
    let mut head = [0u8; HEADER_LEN];
    stream.read_exact(&mut head).expect("frame header");
    let len = Head::parse_len(&head) as usize;
    let parsed = Head::parse(&head);
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).expect("frame payload");
    (
        u8::from(parsed.kind()),
        parsed.flag(),
        parsed.stream_id().into(),
        payload,
    )
}

#[test]
fn serves_a_get_over_tcp() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let service: Arc<gantry::Service> = Arc::new(|conn, event| match event.kind {
        StreamEventKind::Request => {
            let _ = conn.write(
                &event.handle,
                b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello",
            );
        }
        StreamEventKind::Complete
        | StreamEventKind::Reset(_)
        | StreamEventKind::ConnError(_) => {
            conn.release(&event.handle);
        }
        _ => {}
    });

    let runtime = RuntimeConfig {
        nbthread: 2,
        ..RuntimeConfig::default()
    };
    let server = gantry::serve(
        "127.0.0.1:0".parse().unwrap(),
        runtime,
        H2Config::default(),
        service,
    )
    .expect("server start");

    let mut stream = TcpStream::connect(server.local_addr()).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // Handshake: preface + empty SETTINGS.
    stream.write_all(PREFACE).unwrap();
    let mut dst = BytesMut::new();
    frame::Settings::default().encode(&mut dst);
    stream.write_all(&dst).unwrap();

    // Open stream 1 with a GET.
    let mut encoder = Encoder::new(4_096);
    let fields = [
        Field::new(&b":method"[..], &b"GET"[..]),
        Field::new(&b":scheme"[..], &b"http"[..]),
        Field::new(&b":path"[..], &b"/"[..]),
        Field::new(&b":authority"[..], &b"localhost"[..]),
    ];
    let mut block = BytesMut::new();
    encoder.encode(fields.iter(), &mut block);
    let mut headers = frame::Headers::new(frame::StreamId::from(1), block.freeze());
    headers.set_end_stream(true);
    let mut dst = BytesMut::new();
    headers.encode(16_384, &mut dst);
    stream.write_all(&dst).unwrap();

    // Expect SETTINGS, SETTINGS-ACK, then HEADERS + DATA on stream 1.
    let mut got_headers = false;
    let mut body = Vec::new();
    loop {
        let (kind, flags, sid, payload) = read_exact_frame(&mut stream);
        match kind {
            4 => {} // SETTINGS / ACK
            1 => {
                assert_eq!(sid, 1);
                got_headers = true;
            }
            0 => {
                assert_eq!(sid, 1);
                body.extend_from_slice(&payload);
                if flags & 0x1 != 0 {
                    break;
                }
            }
            other => panic!("unexpected frame type {other}"),
        }
    }
    assert!(got_headers);
    assert_eq!(body, b"hello");

    drop(stream);
    server.stop();
}
