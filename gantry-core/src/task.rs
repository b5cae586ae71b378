//! Units of scheduled work.
//!
//! A [`Task`] carries atomic state bits, a thread affinity mask, a nice
//! value, an optional expiry and a boxed callback. Tasks may sit in one
//! run queue and one timer queue at a time. A [`Tasklet`] is the light
//! variant: no timer, no cross-thread queuing, always runs on the thread
//! that scheduled it.
//!
//! State invariant: a task with `RUNNING` set is never linked in a run
//! queue by any thread other than the one currently running it. The
//! scheduler enforces this by only requeueing from the running thread
//! after the callback returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::clock::Tick;

bitflags! {
    /// Task state bits, updated atomically.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct TaskState: u32 {
        /// Callback is currently executing.
        const RUNNING     = 0x0001;
        /// Linked in a run queue.
        const QUEUED      = 0x0002;
        /// Linked in the shared (any-thread) run queue.
        const GLOBAL      = 0x0004;
        /// Cancelled; the owner thread frees it instead of requeueing.
        const KILLED      = 0x0008;
        /// Woken by timer expiry.
        const WOKEN_TIMER = 0x0010;
        /// Woken by I/O readiness.
        const WOKEN_IO    = 0x0020;
        /// Woken by a message (inter-task event).
        const WOKEN_MSG   = 0x0040;
        /// Woken for any other reason (buffer available, explicit kick).
        const WOKEN_OTHER = 0x0080;
    }
}

impl TaskState {
    /// All wake-cause bits.
    pub const WOKEN_ANY: Self = Self::WOKEN_TIMER
        .union(Self::WOKEN_IO)
        .union(Self::WOKEN_MSG)
        .union(Self::WOKEN_OTHER);
}

/// Why a task was woken; a subset of [`TaskState`]'s `WOKEN_*` bits.
pub type WakeCause = TaskState;

/// What the callback wants done when it returns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskAction {
    /// Wait for the next wake cause; re-arm the timer from `expire`.
    Idle,
    /// Run again on the next scheduler pass.
    Requeue,
    /// The task is finished; drop its callback and all linkage.
    Done,
}

/// Context handed to a task callback for one activation.
pub struct TaskCtx<'a> {
    /// The task being run, for self-rearming.
    pub task: &'a Arc<Task>,
    /// Snapshot of the wake-cause bits that triggered this activation.
    pub woken: WakeCause,
    /// Scheduler time at the start of the pass.
    pub now: Tick,
}

type TaskFn = Box<dyn FnMut(&TaskCtx<'_>) -> TaskAction + Send>;

/// Where a queued task sits: `thread` is `None` for the shared tree.
#[derive(Debug, Copy, Clone)]
pub(crate) struct RqSlot {
    pub(crate) thread: Option<usize>,
    pub(crate) key: u64,
}

pub struct Task {
    state: AtomicU32,
    thread_mask: AtomicU64,
    nice: i32,
    expire: AtomicU32,
    /// Timer wheel key, if queued there. Guarded by the wheel's own lock
    /// discipline: only mutated while holding the wheel lock.
    pub(crate) wq_key: Mutex<Option<u32>>,
    /// Run queue slot, if queued. Same discipline with the queue locks.
    pub(crate) rq_slot: Mutex<Option<RqSlot>>,
    cb: Mutex<Option<TaskFn>>,
}

impl Task {
    /// Creates a task runnable on any thread with neutral nice.
    pub fn new<F>(cb: F) -> Arc<Self>
    where
        F: FnMut(&TaskCtx<'_>) -> TaskAction + Send + 'static,
    {
        Self::with(u64::MAX, 0, cb)
    }

    /// Creates a task with an explicit thread mask and nice value.
    ///
    /// `nice` is clamped to `[-1024, 1024]`; negative values advance the
    /// task in the run queue, positive values delay it.
    pub fn with<F>(thread_mask: u64, nice: i32, cb: F) -> Arc<Self>
    where
        F: FnMut(&TaskCtx<'_>) -> TaskAction + Send + 'static,
    {
        Arc::new(Self {
            state: AtomicU32::new(0),
            thread_mask: AtomicU64::new(thread_mask),
            nice: nice.clamp(-1024, 1024),
            expire: AtomicU32::new(Tick::ETERNITY.raw()),
            wq_key: Mutex::new(None),
            rq_slot: Mutex::new(None),
            cb: Mutex::new(Some(Box::new(cb))),
        })
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        TaskState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// Atomically ORs bits in; returns the previous state.
    pub(crate) fn or_state(&self, bits: TaskState) -> TaskState {
        TaskState::from_bits_truncate(self.state.fetch_or(bits.bits(), Ordering::AcqRel))
    }

    /// Atomically clears bits; returns the previous state.
    pub(crate) fn clear_state(&self, bits: TaskState) -> TaskState {
        TaskState::from_bits_truncate(self.state.fetch_and(!bits.bits(), Ordering::AcqRel))
    }

    #[must_use]
    pub fn nice(&self) -> i32 {
        self.nice
    }

    #[must_use]
    pub fn thread_mask(&self) -> u64 {
        self.thread_mask.load(Ordering::Relaxed)
    }

    /// Re-pins the task. Only meaningful at idle points; the scheduler
    /// reads the mask on the next wakeup.
    pub fn set_thread_mask(&self, mask: u64) {
        self.thread_mask.store(mask, Ordering::Relaxed);
    }

    #[must_use]
    pub fn expire(&self) -> Tick {
        let raw = self.expire.load(Ordering::Acquire);
        if raw == 0 {
            Tick::ETERNITY
        } else {
            Tick::from_ms(raw)
        }
    }

    /// Sets the deadline the timer wheel will fire this task at. The
    /// wheel rechecks this value on expiry, so moving it forward without
    /// requeueing is allowed (the stale entry gets requeued in place).
    pub fn set_expire(&self, t: Tick) {
        self.expire.store(t.raw(), Ordering::Release);
    }

    /// Marks the task cancelled. Idempotent, callable from any thread. A
    /// queued task is reaped on its next activation; a running one is not
    /// requeued when its callback returns.
    pub fn kill(&self) {
        self.or_state(TaskState::KILLED);
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.state().contains(TaskState::KILLED)
    }

    /// Runs the callback once with the given wake snapshot. Returns
    /// `TaskAction::Done` if the callback is already gone.
    pub(crate) fn run(self: &Arc<Self>, woken: WakeCause, now: Tick) -> TaskAction {
        let mut slot = self.cb.lock();
        let Some(cb) = slot.as_mut() else {
            return TaskAction::Done;
        };
        let ctx = TaskCtx {
            task: self,
            woken,
            now,
        };
        let action = cb(&ctx);
        if action == TaskAction::Done {
            *slot = None;
        }
        action
    }

    /// Drops the callback without running it (cancellation path).
    pub(crate) fn drop_callback(&self) {
        *self.cb.lock() = None;
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state())
            .field("thread_mask", &format_args!("{:#x}", self.thread_mask()))
            .field("nice", &self.nice)
            .field("expire", &self.expire())
            .finish()
    }
}

type TaskletFn = Box<dyn FnMut() -> TaskAction + Send>;

/// The light scheduling unit: no timer, no wait-queue membership, runs on
/// the thread that scheduled it.
pub struct Tasklet {
    state: AtomicU32,
    cb: Mutex<Option<TaskletFn>>,
}

impl Tasklet {
    pub fn new<F>(cb: F) -> Arc<Self>
    where
        F: FnMut() -> TaskAction + Send + 'static,
    {
        Arc::new(Self {
            state: AtomicU32::new(0),
            cb: Mutex::new(Some(Box::new(cb))),
        })
    }

    /// Marks queued; returns false if it already was (no double-queue).
    pub(crate) fn mark_queued(&self) -> bool {
        let prev = self.state.fetch_or(TaskState::QUEUED.bits(), Ordering::AcqRel);
        prev & TaskState::QUEUED.bits() == 0
    }

    pub(crate) fn run(&self) -> TaskAction {
        self.state
            .fetch_and(!TaskState::QUEUED.bits(), Ordering::AcqRel);
        let mut slot = self.cb.lock();
        let Some(cb) = slot.as_mut() else {
            return TaskAction::Done;
        };
        let action = cb();
        if action == TaskAction::Done {
            *slot = None;
        }
        action
    }
}

impl std::fmt::Debug for Tasklet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tasklet")
            .field(
                "state",
                &TaskState::from_bits_truncate(self.state.load(Ordering::Relaxed)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_consumes_callback_on_done() {
        let task = Task::new(|_| TaskAction::Done);
        assert_eq!(task.run(TaskState::WOKEN_OTHER, Tick::from_ms(1)), TaskAction::Done);
        // Second activation finds no callback left.
        assert_eq!(task.run(TaskState::WOKEN_OTHER, Tick::from_ms(2)), TaskAction::Done);
    }

    #[test]
    fn kill_is_idempotent() {
        let task = Task::new(|_| TaskAction::Idle);
        task.kill();
        task.kill();
        assert!(task.is_killed());
    }

    #[test]
    fn tasklet_queues_once() {
        let tl = Tasklet::new(|| TaskAction::Idle);
        assert!(tl.mark_queued());
        assert!(!tl.mark_queued());
        tl.run();
        assert!(tl.mark_queued());
    }

    #[test]
    fn nice_is_clamped() {
        let task = Task::with(1, 90_000, |_| TaskAction::Idle);
        assert_eq!(task.nice(), 1024);
    }
}
