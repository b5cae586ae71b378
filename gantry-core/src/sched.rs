//! The per-thread scheduler loop.
//!
//! Each worker thread runs the same pass: poll I/O readiness, fire
//! expired timers, run ready tasks up to the configured budget, drain the
//! thread's tasklets, then sleep in the poller until the next deadline or
//! wake signal. Callbacks are cooperative: they run to completion and
//! yield by returning.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;

use crate::clock::{Clock, Tick};
use crate::config::RuntimeConfig;
use crate::pool::BufferPool;
use crate::runqueue::RunQueues;
use crate::task::{Task, TaskAction, TaskState, Tasklet, WakeCause};
use crate::timer::TimerWheel;

/// Token reserved for the cross-thread waker in every worker poll.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Process-wide scheduling services shared by all workers.
pub struct Scheduler {
    clock: Clock,
    timers: TimerWheel,
    runqueues: RunQueues,
    pool: Arc<BufferPool>,
    config: RuntimeConfig,
    tasklets: Vec<Mutex<VecDeque<Arc<Tasklet>>>>,
    stopping: AtomicBool,
}

impl Scheduler {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let nbthread = config.nbthread;
        Arc::new(Self {
            clock: Clock::new(),
            timers: TimerWheel::new(),
            runqueues: RunQueues::new(nbthread),
            pool: Arc::new(BufferPool::new(
                config.pool_buffers,
                config.bufsize,
                config.pool_reserve,
            )),
            config,
            tasklets: (0..nbthread).map(|_| Mutex::new(VecDeque::new())).collect(),
            stopping: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    #[must_use]
    pub fn runqueues(&self) -> &RunQueues {
        &self.runqueues
    }

    #[must_use]
    pub fn timers(&self) -> &TimerWheel {
        &self.timers
    }

    /// Wakes a task with the given cause.
    pub fn wake(&self, task: &Arc<Task>, cause: WakeCause) {
        self.runqueues.wakeup(task, cause);
    }

    /// Arms (or re-arms) the task's timer.
    pub fn queue_timer(&self, task: &Arc<Task>, deadline: Tick) {
        self.timers.queue(task, deadline);
    }

    /// Queues a tasklet on `tid`'s list. Contract: called from code
    /// already running on that thread (tasklets never migrate).
    pub fn queue_tasklet(&self, tid: usize, tl: &Arc<Tasklet>) {
        if tl.mark_queued() {
            self.tasklets[tid].lock().push_back(tl.clone());
        }
    }

    /// Asks every worker loop to wind down after its current pass.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("runqueues", &self.runqueues)
            .finish()
    }
}

/// A deferred closure shipped to a specific worker thread, e.g. a freshly
/// accepted connection to adopt.
pub type WorkerCmd = Box<dyn FnOnce(&mut Worker) + Send>;

struct IoEntry {
    task: Arc<Task>,
}

/// One scheduler thread: owns a poller, an I/O registry and the thread's
/// tasklet list; drains its run queue each pass.
pub struct Worker {
    tid: usize,
    sched: Arc<Scheduler>,
    poll: Poll,
    events: Events,
    ios: Slab<IoEntry>,
    cmd_rx: Receiver<WorkerCmd>,
    cmd_tx: Sender<WorkerCmd>,
}

/// Cheap clonable address of a worker: send closures, then kick the
/// waker so a sleeping thread picks them up.
#[derive(Clone)]
pub struct WorkerHandle {
    tid: usize,
    tx: Sender<WorkerCmd>,
    waker: Arc<Waker>,
}

impl WorkerHandle {
    #[must_use]
    pub fn tid(&self) -> usize {
        self.tid
    }

    /// Ships `cmd` to the worker and wakes it.
    pub fn send(&self, cmd: WorkerCmd) {
        if self.tx.send(cmd).is_err() {
            tracing::warn!(tid = self.tid, "worker command channel closed");
            return;
        }
        if let Err(err) = self.waker.wake() {
            tracing::warn!(tid = self.tid, %err, "worker wake failed");
        }
    }
}

impl Worker {
    pub fn new(tid: usize, sched: Arc<Scheduler>) -> io::Result<(Self, WorkerHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        {
            let waker = waker.clone();
            sched.runqueues.set_thread_waker(tid, move || {
                if let Err(err) = waker.wake() {
                    tracing::warn!(%err, "run queue waker failed");
                }
            });
        }
        let handle = WorkerHandle {
            tid,
            tx: cmd_tx.clone(),
            waker,
        };
        Ok((
            Self {
                tid,
                sched,
                poll,
                events: Events::with_capacity(256),
                ios: Slab::new(),
                cmd_rx,
                cmd_tx: handle.tx.clone(),
            },
            handle,
        ))
    }

    #[must_use]
    pub fn tid(&self) -> usize {
        self.tid
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Registers an event source; readiness wakes `task` with `WOKEN_IO`.
    pub fn register_io<S>(&mut self, source: &mut S, task: &Arc<Task>) -> io::Result<Token>
    where
        S: mio::event::Source + ?Sized,
    {
        let entry = self.ios.vacant_entry();
        let token = Token(entry.key());
        self.poll.registry().register(
            source,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        entry.insert(IoEntry { task: task.clone() });
        Ok(token)
    }

    /// Adjusts the interest set of a registered source from the mux's
    /// want-read / want-write flags.
    pub fn update_io<S>(
        &mut self,
        source: &mut S,
        token: Token,
        read: bool,
        write: bool,
    ) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        let interest = match (read, write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            // mio has no empty interest; park on readable-HUP only.
            (false, false) => Interest::READABLE,
        };
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister_io<S>(&mut self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.release_token(token);
        self.poll.registry().deregister(source)
    }

    /// Frees an I/O slot whose file descriptor already closed (closing
    /// the fd removes it from the poller on its own).
    pub fn release_token(&mut self, token: Token) {
        if self.ios.contains(token.0) {
            self.ios.remove(token.0);
        }
    }

    /// Runs scheduler passes until [`Scheduler::stop`] is observed.
    pub fn run(&mut self) {
        while !self.sched.is_stopping() {
            if let Err(err) = self.run_once() {
                tracing::error!(tid = self.tid, %err, "worker poll error");
                break;
            }
        }
    }

    /// One full pass: poll I/O, fire timers, run the queue, run tasklets.
    pub fn run_once(&mut self) -> io::Result<()> {
        let sched = self.sched.clone();
        let rq = sched.runqueues();

        // Adopt anything shipped from other threads before sleeping.
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            cmd(self);
        }

        let next_deadline = sched.timers().next_deadline(sched.now());

        // Publish the sleeping bit before the final emptiness check so a
        // concurrent wakeup either lands in the queue (we see it and poll
        // with a zero timeout) or kicks the waker (poll returns at once).
        rq.set_active(self.tid, false);
        rq.set_sleeping(self.tid, true);
        let pending =
            rq.local_len(self.tid) > 0 || rq.shared_len() > 0 || self.has_tasklets();
        let timeout = if pending {
            Some(Duration::ZERO)
        } else {
            // Cap the park time; timers are re-examined every pass anyway.
            let ms = next_deadline.remaining_ms(sched.now()).unwrap_or(60_000);
            Some(Duration::from_millis(ms.min(60_000) as u64))
        };

        let poll_res = self.poll.poll(&mut self.events, timeout);
        rq.set_sleeping(self.tid, false);
        rq.set_active(self.tid, true);
        match poll_res {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            if let Some(entry) = self.ios.get(event.token().0) {
                rq.wakeup(&entry.task, TaskState::WOKEN_IO);
            }
        }

        let now = sched.now();
        sched.timers().wake_expired(now, |task| {
            rq.wakeup(&task, TaskState::WOKEN_TIMER);
        });

        rq.refill_local(self.tid);
        let mut budget = sched.config().runqueue_depth;
        while budget > 0 {
            let Some((task, woken)) = rq.next_runnable(self.tid) else {
                break;
            };
            budget -= 1;
            if task.is_killed() {
                task.drop_callback();
                task.clear_state(TaskState::RUNNING);
                sched.timers().unlink(&task);
                continue;
            }
            let action = task.run(woken, now);
            match action {
                TaskAction::Done => {
                    task.clear_state(TaskState::RUNNING);
                    sched.timers().unlink(&task);
                }
                TaskAction::Requeue => {
                    if !rq.finish_run(&task) {
                        rq.wakeup(&task, TaskState::WOKEN_OTHER);
                    }
                }
                TaskAction::Idle => {
                    let requeued = rq.finish_run(&task);
                    if !requeued {
                        let expire = task.expire();
                        if !expire.is_eternity() {
                            sched.timers().queue(&task, expire);
                        }
                    }
                }
            }
        }

        self.run_tasklets();
        Ok(())
    }

    fn has_tasklets(&self) -> bool {
        !self.sched.tasklets[self.tid].lock().is_empty()
    }

    fn run_tasklets(&mut self) {
        // Tasklets queued by tasklets run in the same pass, bounded by
        // the same budget discipline as tasks.
        let mut budget = self.sched.config.runqueue_depth;
        loop {
            let tl = { self.sched.tasklets[self.tid].lock().pop_front() };
            let Some(tl) = tl else { break };
            let action = tl.run();
            if action == TaskAction::Requeue {
                self.sched.queue_tasklet(self.tid, &tl);
            }
            budget -= 1;
            if budget == 0 {
                break;
            }
        }
    }

    /// A handle that can ship closures back to this worker.
    #[must_use]
    pub fn command_sender(&self) -> Sender<WorkerCmd> {
        self.cmd_tx.clone()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("tid", &self.tid)
            .field("ios", &self.ios.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_sched(nbthread: usize) -> Arc<Scheduler> {
        Scheduler::new(RuntimeConfig {
            nbthread,
            ..RuntimeConfig::default()
        })
    }

    #[test]
    fn runs_woken_task() {
        let sched = test_sched(1);
        let (mut worker, _handle) = Worker::new(0, sched.clone()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = Task::with(1, 0, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            TaskAction::Idle
        });
        sched.wake(&task, TaskState::WOKEN_MSG);
        worker.run_once().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn requeue_drains_within_the_pass_budget() {
        let sched = test_sched(1);
        let (mut worker, _handle) = Worker::new(0, sched.clone()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = Task::with(1, 0, move |_| {
            let n = h.fetch_add(1, Ordering::SeqCst);
            if n < 2 { TaskAction::Requeue } else { TaskAction::Idle }
        });
        sched.wake(&task, TaskState::WOKEN_MSG);
        // Requeues are picked up again within the same budgeted pass.
        worker.run_once().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn timer_fires_through_pass() {
        let sched = test_sched(1);
        let (mut worker, _handle) = Worker::new(0, sched.clone()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = Task::with(1, 0, move |ctx| {
            assert!(ctx.woken.contains(TaskState::WOKEN_TIMER));
            h.fetch_add(1, Ordering::SeqCst);
            TaskAction::Done
        });
        // Deadline already in the past: fires on the next pass.
        let past = sched.now();
        sched.queue_timer(&task, past);
        worker.run_once().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn killed_task_is_reaped_not_run() {
        let sched = test_sched(1);
        let (mut worker, _handle) = Worker::new(0, sched.clone()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = Task::with(1, 0, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            TaskAction::Idle
        });
        sched.wake(&task, TaskState::WOKEN_MSG);
        task.kill();
        worker.run_once().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tasklet_runs_on_owner_thread() {
        let sched = test_sched(1);
        let (mut worker, _handle) = Worker::new(0, sched.clone()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let tl = Tasklet::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
            TaskAction::Done
        });
        sched.queue_tasklet(0, &tl);
        worker.run_once().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_cmd_is_adopted() {
        let sched = test_sched(1);
        let (mut worker, handle) = Worker::new(0, sched.clone()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        handle.send(Box::new(move |w: &mut Worker| {
            assert_eq!(w.tid(), 0);
            h.fetch_add(1, Ordering::SeqCst);
        }));
        worker.run_once().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
