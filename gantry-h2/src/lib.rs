//! The gantry HTTP/2 engine.
//!
//! One [`Connection`] drives one accepted TCP connection whose ALPN
//! selected `h2`: it verifies the preface, exchanges SETTINGS, parses and
//! emits frames, decompresses header blocks through an HPACK decoder with
//! a bounded dynamic table, demultiplexes requests into per-stream state
//! machines with their own flow-control windows, and re-multiplexes
//! responses onto the wire under both per-stream and connection windows.
//!
//! The application side sees each stream as an HTTP/1.1-equivalent
//! request and answers with a status line, headers and body through a
//! generational [`StreamHandle`]; everything else (routing, TLS, config
//! files) plugs in around the engine.

#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

#[macro_use]
mod macros;

pub mod config;
pub mod conn;
pub mod frame;
pub mod h1;
pub mod hpack;
pub mod stream;

pub use self::config::H2Config;
pub use self::conn::handle::{HandleError, StreamEvent, StreamEventKind, StreamHandle};
pub use self::conn::{ConnError, ConnFlags, ConnStatus, Connection, DemuxState};
pub use self::frame::{FrameSize, Reason, StreamId};
pub use self::stream::{StreamFlags, StreamState};
