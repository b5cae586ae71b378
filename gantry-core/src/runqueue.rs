//! Per-thread and shared run queues.
//!
//! Each worker thread owns an ordered tree of runnable tasks; one shared
//! tree holds tasks whose thread mask spans several threads. Queue keys
//! come from a global insertion counter shifted by the task's nice value
//! (`offset = queue_len * nice / 32`, nice in [-1024, 1024]), so a heavily
//! niced task can move up to ±32 queue lengths around its natural slot.
//!
//! Wakeup placement: single-thread mask → that thread's tree; otherwise
//! the shared tree plus the `GLOBAL` state bit. If every eligible thread
//! is idle, the lowest-indexed sleeping one is signalled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::task::{RqSlot, Task, TaskState, WakeCause};

type Tree = BTreeMap<u64, Arc<Task>>;
type ThreadWaker = Arc<dyn Fn() + Send + Sync>;

/// Extra entries a refilling thread may grab beyond its average share of
/// the shared tree.
const REFILL_BALANCE: usize = 4;

pub struct RunQueues {
    nbthread: usize,
    shared: Mutex<Tree>,
    locals: Vec<Mutex<Tree>>,
    counter: AtomicU64,
    /// Bit per thread: currently has local work / is in its run pass.
    active: AtomicU64,
    /// Bit per thread: parked in poll with a timeout.
    sleeping: AtomicU64,
    wakers: Mutex<Vec<Option<ThreadWaker>>>,
}

impl RunQueues {
    #[must_use]
    pub fn new(nbthread: usize) -> Self {
        debug_assert!(nbthread >= 1 && nbthread <= 64);
        Self {
            nbthread,
            shared: Mutex::new(Tree::new()),
            locals: (0..nbthread).map(|_| Mutex::new(Tree::new())).collect(),
            // Start high enough that negative nice offsets cannot
            // underflow the key space.
            counter: AtomicU64::new(1 << 32),
            active: AtomicU64::new(0),
            sleeping: AtomicU64::new(0),
            wakers: Mutex::new(vec![None; nbthread]),
        }
    }

    #[must_use]
    pub fn nbthread(&self) -> usize {
        self.nbthread
    }

    /// Installs the wake signal for a worker thread (typically a
    /// `mio::Waker` kick).
    pub fn set_thread_waker<F>(&self, tid: usize, wake: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.wakers.lock()[tid] = Some(Arc::new(wake));
    }

    fn queue_key(&self, task: &Task, queue_len: usize) -> u64 {
        let base = self.counter.fetch_add(1, Ordering::Relaxed);
        let offset = (queue_len as i64) * (task.nice() as i64) / 32;
        base.wrapping_add(offset as u64)
    }

    /// Wakes `task` for `cause`. Already-queued or running tasks only
    /// accumulate the cause bits; the owner requeues them itself.
    pub fn wakeup(&self, task: &Arc<Task>, cause: WakeCause) {
        let prev = task.or_state(TaskState::QUEUED | cause);
        if prev.intersects(TaskState::QUEUED | TaskState::RUNNING) {
            return;
        }
        self.enqueue(task);
    }

    /// Links an already-QUEUED-marked task into the right tree and kicks
    /// a thread if needed.
    pub(crate) fn enqueue(&self, task: &Arc<Task>) {
        let mask = task.thread_mask() & self.thread_mask_all();
        if mask == 0 {
            tracing::error!(?task, "task with empty thread mask, dropping wakeup");
            task.clear_state(TaskState::QUEUED);
            return;
        }
        if mask.count_ones() == 1 {
            let tid = mask.trailing_zeros() as usize;
            {
                let mut local = self.locals[tid].lock();
                let key = self.queue_key(task, local.len());
                let key = unique_key(&local, key);
                local.insert(key, task.clone());
                *task.rq_slot.lock() = Some(RqSlot {
                    thread: Some(tid),
                    key,
                });
            }
            self.kick_if_sleeping(1u64 << tid);
        } else {
            task.or_state(TaskState::GLOBAL);
            {
                let mut shared = self.shared.lock();
                let key = self.queue_key(task, shared.len());
                let key = unique_key(&shared, key);
                shared.insert(key, task.clone());
                *task.rq_slot.lock() = Some(RqSlot { thread: None, key });
            }
            self.kick_if_sleeping(mask);
        }
    }

    fn thread_mask_all(&self) -> u64 {
        if self.nbthread == 64 {
            u64::MAX
        } else {
            (1u64 << self.nbthread) - 1
        }
    }

    /// Signals the lowest-indexed sleeping thread in `mask` if none of
    /// them is already active.
    fn kick_if_sleeping(&self, mask: u64) {
        let active = self.active.load(Ordering::Acquire);
        if active & mask != 0 {
            return;
        }
        let sleeping = self.sleeping.load(Ordering::Acquire) & mask;
        if sleeping == 0 {
            return;
        }
        let tid = sleeping.trailing_zeros() as usize;
        let waker = self.wakers.lock()[tid].clone();
        if let Some(wake) = waker {
            wake();
        }
    }

    /// Removes `task` from whichever queue holds it. Idempotent and safe
    /// from any thread. Running tasks are left alone; the running thread
    /// observes `KILLED` and refrains from requeueing.
    pub fn unlink(&self, task: &Arc<Task>) {
        if task.state().contains(TaskState::RUNNING) {
            return;
        }
        let slot = { task.rq_slot.lock().take() };
        let Some(slot) = slot else {
            task.clear_state(TaskState::QUEUED | TaskState::GLOBAL);
            return;
        };
        match slot.thread {
            Some(tid) => {
                self.locals[tid].lock().remove(&slot.key);
            }
            None => {
                self.shared.lock().remove(&slot.key);
            }
        }
        task.clear_state(TaskState::QUEUED | TaskState::GLOBAL);
    }

    /// Moves up to the caller's fair share of shared-tree entries whose
    /// mask covers `tid` into the local tree.
    pub fn refill_local(&self, tid: usize) {
        let want = {
            let shared = self.shared.lock();
            if shared.is_empty() {
                return;
            }
            shared.len() / self.nbthread + REFILL_BALANCE
        };
        let local_len = self.locals[tid].lock().len();
        if local_len >= want {
            return;
        }
        let mut moved = Vec::new();
        {
            let mut shared = self.shared.lock();
            let bit = 1u64 << tid;
            let keys: Vec<u64> = shared
                .iter()
                .filter(|(_, t)| t.thread_mask() & bit != 0)
                .map(|(k, _)| *k)
                .take(want - local_len)
                .collect();
            for k in keys {
                if let Some(task) = shared.remove(&k) {
                    moved.push((k, task));
                }
            }
        }
        if moved.is_empty() {
            return;
        }
        let mut local = self.locals[tid].lock();
        for (key, task) in moved {
            let key = unique_key(&local, key);
            task.clear_state(TaskState::GLOBAL);
            *task.rq_slot.lock() = Some(RqSlot {
                thread: Some(tid),
                key,
            });
            local.insert(key, task);
        }
    }

    /// Detaches the next runnable task for `tid`, transitioning it
    /// QUEUED → RUNNING and snapshotting (then clearing) its wake bits.
    pub fn next_runnable(&self, tid: usize) -> Option<(Arc<Task>, WakeCause)> {
        let task = {
            let mut local = self.locals[tid].lock();
            let key = *local.keys().next()?;
            let task = local.remove(&key)?;
            *task.rq_slot.lock() = None;
            task
        };
        task.or_state(TaskState::RUNNING);
        let prev = task.clear_state(TaskState::QUEUED | TaskState::GLOBAL | TaskState::WOKEN_ANY);
        Some((task, prev & TaskState::WOKEN_ANY))
    }

    /// Finishes a run: clears RUNNING; if wake causes arrived while the
    /// callback ran, requeues immediately. Returns true if requeued.
    pub fn finish_run(&self, task: &Arc<Task>) -> bool {
        let prev = task.clear_state(TaskState::RUNNING);
        if task.is_killed() {
            task.clear_state(TaskState::QUEUED | TaskState::GLOBAL);
            return false;
        }
        if prev.intersects(TaskState::WOKEN_ANY) || task.state().contains(TaskState::QUEUED) {
            // QUEUED may already be set by a racing wakeup; make sure the
            // task is actually linked.
            task.or_state(TaskState::QUEUED);
            if task.rq_slot.lock().is_none() {
                self.enqueue(task);
            }
            return true;
        }
        false
    }

    #[must_use]
    pub fn local_len(&self, tid: usize) -> usize {
        self.locals[tid].lock().len()
    }

    #[must_use]
    pub fn shared_len(&self) -> usize {
        self.shared.lock().len()
    }

    pub(crate) fn set_active(&self, tid: usize, on: bool) {
        let bit = 1u64 << tid;
        if on {
            self.active.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.active.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    pub(crate) fn set_sleeping(&self, tid: usize, on: bool) {
        let bit = 1u64 << tid;
        if on {
            self.sleeping.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.sleeping.fetch_and(!bit, Ordering::AcqRel);
        }
    }
}

/// Bumps `key` past collisions; the counter makes them near-impossible,
/// but nice offsets can land two tasks on the same slot.
fn unique_key(tree: &Tree, mut key: u64) -> u64 {
    while tree.contains_key(&key) {
        key = key.wrapping_add(1);
    }
    key
}

impl std::fmt::Debug for RunQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunQueues")
            .field("nbthread", &self.nbthread)
            .field("shared_len", &self.shared_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskAction;

    fn idle_task(mask: u64, nice: i32) -> Arc<Task> {
        Task::with(mask, nice, |_| TaskAction::Idle)
    }

    #[test]
    fn single_thread_mask_goes_local() {
        let rq = RunQueues::new(2);
        let t = idle_task(0b01, 0);
        rq.wakeup(&t, TaskState::WOKEN_MSG);
        assert_eq!(rq.local_len(0), 1);
        assert_eq!(rq.shared_len(), 0);
        assert!(!t.state().contains(TaskState::GLOBAL));
    }

    #[test]
    fn wide_mask_goes_shared_with_global_bit() {
        let rq = RunQueues::new(2);
        let t = idle_task(0b11, 0);
        rq.wakeup(&t, TaskState::WOKEN_MSG);
        assert_eq!(rq.shared_len(), 1);
        assert!(t.state().contains(TaskState::GLOBAL));
    }

    #[test]
    fn double_wakeup_queues_once() {
        let rq = RunQueues::new(1);
        let t = idle_task(1, 0);
        rq.wakeup(&t, TaskState::WOKEN_MSG);
        rq.wakeup(&t, TaskState::WOKEN_IO);
        assert_eq!(rq.local_len(0), 1);
        let (task, woken) = rq.next_runnable(0).unwrap();
        // Both causes were accumulated on the single queue entry.
        assert!(woken.contains(TaskState::WOKEN_MSG));
        assert!(woken.contains(TaskState::WOKEN_IO));
        assert!(task.state().contains(TaskState::RUNNING));
    }

    #[test]
    fn negative_nice_runs_first() {
        let rq = RunQueues::new(1);
        // Build up queue length so the nice offset has room to bite.
        for _ in 0..64 {
            rq.wakeup(&idle_task(1, 0), TaskState::WOKEN_MSG);
        }
        let vip = idle_task(1, -1024);
        rq.wakeup(&vip, TaskState::WOKEN_MSG);
        let (first, _) = rq.next_runnable(0).unwrap();
        assert!(Arc::ptr_eq(&first, &vip));
    }

    #[test]
    fn refill_moves_matching_entries() {
        let rq = RunQueues::new(2);
        for _ in 0..6 {
            rq.wakeup(&idle_task(0b11, 0), TaskState::WOKEN_MSG);
        }
        rq.refill_local(1);
        assert!(rq.local_len(1) > 0);
        assert!(rq.shared_len() < 6);
        let (t, _) = rq.next_runnable(1).unwrap();
        assert!(!t.state().contains(TaskState::GLOBAL));
    }

    #[test]
    fn unlink_leaves_running_tasks_alone() {
        let rq = RunQueues::new(1);
        let t = idle_task(1, 0);
        rq.wakeup(&t, TaskState::WOKEN_MSG);
        let (t, _) = rq.next_runnable(0).unwrap();
        t.kill();
        rq.unlink(&t);
        assert!(t.state().contains(TaskState::RUNNING));
        // The running thread notices the kill and does not requeue.
        assert!(!rq.finish_run(&t));
        assert_eq!(rq.local_len(0), 0);
    }

    #[test]
    fn wakeup_during_run_requeues_on_finish() {
        let rq = RunQueues::new(1);
        let t = idle_task(1, 0);
        rq.wakeup(&t, TaskState::WOKEN_MSG);
        let (t, _) = rq.next_runnable(0).unwrap();
        // Wake arrives while the callback is executing.
        rq.wakeup(&t, TaskState::WOKEN_IO);
        assert_eq!(rq.local_len(0), 0);
        assert!(rq.finish_run(&t));
        assert_eq!(rq.local_len(0), 1);
    }
}
