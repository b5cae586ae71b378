//! Gantry: a cooperative multi-threaded L4/L7 proxy engine.
//!
//! The facade crate re-exports the engine's member crates:
//!
//! - [`core`]: buffers, ticks and timers, tasks and run queues, the worker
//!   scheduler and the transport seam.
//! - [`h2`]: the HTTP/2 multiplexed connection engine (framing, HPACK,
//!   streams, flow control and the connection demux/mux).

#[doc(inline)]
pub use gantry_core as core;

#[doc(inline)]
pub use gantry_h2 as h2;

pub mod serve;

pub use self::serve::{serve, Server, Service};
