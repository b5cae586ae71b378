//! Wiring: the scheduler loop driving H2 connections over TCP.
//!
//! One worker thread per configured `nbthread`, each running the
//! cooperative scheduler pass. The listener lives on worker 0 as a task;
//! accepted sockets are shipped round-robin to a worker, wrapped in a
//! [`Connection`] and pinned there through their task's thread mask.
//! Readiness events wake the connection task, which drives demux and mux
//! and hands stream events to the service callback.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;

use gantry_core::sched::{Scheduler, Worker, WorkerHandle};
use gantry_core::task::{Task, TaskAction, TaskState};
use gantry_core::transport::TcpTransport;
use gantry_core::RuntimeConfig;
use gantry_h2::conn::{ConnFlags, ConnStatus, Connection};
use gantry_h2::{H2Config, StreamEvent};

/// Per-event application callback. Runs on the connection's worker
/// thread inside the cooperative model: it must not block.
pub type Service = dyn Fn(&mut Connection<TcpTransport>, StreamEvent) + Send + Sync;

/// Idle connections are timed out after this long without traffic.
const IDLE_TIMEOUT_MS: u32 = 30_000;

static CONN_IDS: AtomicU64 = AtomicU64::new(1);

/// A running engine: worker threads plus the listener.
pub struct Server {
    sched: Arc<Scheduler>,
    handles: Vec<WorkerHandle>,
    threads: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Server {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops every worker loop and joins the threads.
    pub fn stop(self) {
        self.sched.stop();
        for handle in &self.handles {
            // Kick each worker out of its poll sleep.
            handle.send(Box::new(|_| {}));
        }
        for thread in self.threads {
            if thread.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

/// Binds `addr` and runs the engine until [`Server::stop`].
pub fn serve(
    addr: SocketAddr,
    runtime: RuntimeConfig,
    h2: H2Config,
    service: Arc<Service>,
) -> io::Result<Server> {
    runtime
        .validate()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    h2.validate()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let sched = Scheduler::new(runtime.clone());
    let mut workers = Vec::with_capacity(runtime.nbthread);
    let mut handles = Vec::with_capacity(runtime.nbthread);
    for tid in 0..runtime.nbthread {
        let (worker, handle) = Worker::new(tid, sched.clone())?;
        workers.push(worker);
        handles.push(handle);
    }

    let listener = TcpListener::bind(addr)?;
    let local_addr = listener.local_addr()?;
    attach_listener(&handles, listener, h2, service);

    let threads = workers
        .into_iter()
        .map(|mut worker| {
            std::thread::Builder::new()
                .name(format!("gantry-w{}", worker.tid()))
                .spawn(move || worker.run())
        })
        .collect::<io::Result<Vec<_>>>()?;

    tracing::info!(%local_addr, nbthread = runtime.nbthread, "engine listening");
    Ok(Server {
        sched,
        handles,
        threads,
        local_addr,
    })
}

/// Installs the accept task on worker 0.
fn attach_listener(
    handles: &[WorkerHandle],
    listener: TcpListener,
    h2: H2Config,
    service: Arc<Service>,
) {
    let all_handles: Vec<WorkerHandle> = handles.to_vec();
    let rr = Arc::new(AtomicUsize::new(0));
    handles[0].send(Box::new(move |worker: &mut Worker| {
        let cell: Arc<Mutex<Option<TcpListener>>> = Arc::new(Mutex::new(None));
        let task = {
            let cell = cell.clone();
            Task::with(1 << worker.tid(), -64, move |_ctx| {
                let mut guard = cell.lock();
                let Some(listener) = guard.as_mut() else {
                    return TaskAction::Done;
                };
                loop {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "accepted");
                            let tid = rr.fetch_add(1, Ordering::Relaxed) % all_handles.len();
                            let h2 = h2.clone();
                            let service = service.clone();
                            all_handles[tid].send(Box::new(move |w: &mut Worker| {
                                adopt_connection(w, stream, h2, service);
                            }));
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::error!(%e, "accept failed, stopping listener");
                            return TaskAction::Done;
                        }
                    }
                }
                TaskAction::Idle
            })
        };
        let mut listener = listener;
        match worker.register_io(&mut listener, &task) {
            Ok(_token) => {
                *cell.lock() = Some(listener);
                // Catch anything that raced the registration.
                worker.scheduler().wake(&task, TaskState::WOKEN_IO);
            }
            Err(e) => tracing::error!(%e, "listener registration failed"),
        }
    }));
}

struct ConnState {
    conn: Connection<TcpTransport>,
    token: mio::Token,
}

/// Registers an accepted socket on this worker and builds its task.
fn adopt_connection(
    worker: &mut Worker,
    stream: TcpStream,
    h2: H2Config,
    service: Arc<Service>,
) {
    let sched = worker.scheduler().clone();
    let conn_id = CONN_IDS.fetch_add(1, Ordering::Relaxed);
    let mut conn = Connection::new(
        TcpTransport::new(stream),
        sched.pool().clone(),
        h2,
        conn_id,
    );

    let cell: Arc<Mutex<Option<ConnState>>> = Arc::new(Mutex::new(None));
    let home = worker.command_sender();
    let task = {
        let cell = cell.clone();
        let sched = sched.clone();
        Task::with(1 << worker.tid(), 0, move |ctx| {
            let mut guard = cell.lock();
            let Some(state) = guard.as_mut() else {
                return TaskAction::Done;
            };

            let mut status = if ctx.woken.contains(TaskState::WOKEN_TIMER) {
                tracing::debug!(conn_id, "connection timed out");
                state.conn.on_timeout()
            } else if ctx.woken.contains(TaskState::WOKEN_OTHER) {
                // A buffer freed up or another blocking condition
                // cleared; re-enter where the demux left off.
                state.conn.on_unblocked()
            } else {
                state.conn.on_readable()
            };
            if status == ConnStatus::Active {
                status = state.conn.on_writable();
            }

            // Drain events; services queue output, which may complete
            // streams and raise further events.
            loop {
                let mut saw_event = false;
                while let Some(event) = state.conn.poll_event() {
                    saw_event = true;
                    (*service)(&mut state.conn, event);
                }
                if status == ConnStatus::Active {
                    status = state.conn.on_writable();
                }
                if !saw_event || status == ConnStatus::Closed {
                    break;
                }
            }

            match status {
                ConnStatus::Closed => {
                    let token = state.token;
                    *guard = None;
                    // The fd is closed; just free the worker's slot.
                    let _ = home.send(Box::new(move |w: &mut Worker| {
                        w.release_token(token);
                    }));
                    TaskAction::Done
                }
                ConnStatus::Active => {
                    if state
                        .conn
                        .flags()
                        .intersects(ConnFlags::DEM_DALLOC | ConnFlags::MUX_MALLOC)
                    {
                        // Park on the buffer wait list until a release.
                        let sched = sched.clone();
                        let task = ctx.task.clone();
                        let pool = sched.pool().clone();
                        pool.register_waiter(move || {
                            sched.wake(&task, TaskState::WOKEN_OTHER);
                        });
                    }
                    ctx.task.set_expire(ctx.now.add_ms(IDLE_TIMEOUT_MS));
                    TaskAction::Idle
                }
            }
        })
    };

    match worker.register_io(conn.transport_mut().stream_mut(), &task) {
        Ok(token) => {
            *cell.lock() = Some(ConnState { conn, token });
            sched.wake(&task, TaskState::WOKEN_IO);
        }
        Err(e) => {
            tracing::error!(%e, "connection registration failed");
        }
    }
}
