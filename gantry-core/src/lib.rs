//! Gantry runtime services.
//!
//! Everything the protocol muxes need to run but that is not itself a
//! protocol concern lives here: fixed-size byte [`Buffer`]s and the shared
//! [`BufferPool`] with its margin-reserving allocator and wait list, the
//! wrapping millisecond [`Tick`] clock and the [`TimerWheel`], [`Task`]s
//! and [`Tasklet`]s with their per-thread and shared run queues, the
//! [`Worker`] scheduler loop, and the [`Transport`] capability seam that
//! the socket layer plugs into.
//!
//! The execution model is cooperative: one task callback runs at a time on
//! each worker thread and yields by returning. A connection is pinned to a
//! single thread through its task's thread mask and only migrates at idle
//! points.

#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

pub mod buf;
pub mod clock;
pub mod config;
pub mod pool;
pub mod runqueue;
pub mod sched;
pub mod task;
pub mod timer;
pub mod transport;

pub use self::buf::Buffer;
pub use self::clock::{Clock, Tick};
pub use self::config::{ConfigError, RuntimeConfig};
pub use self::pool::{AllocError, BufferPool, WaiterToken};
pub use self::runqueue::RunQueues;
pub use self::sched::{Scheduler, Worker, WorkerCmd, WorkerHandle};
pub use self::task::{Task, TaskAction, TaskCtx, TaskState, Tasklet, WakeCause};
pub use self::timer::TimerWheel;
pub use self::transport::{
    Dir, PipeTransport, ReadStatus, TcpTransport, Transport, WriteStatus,
};
