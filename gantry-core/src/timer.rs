//! The timer wheel.
//!
//! An ordered tree of `{deadline tick → tasks}` guarded by a single lock.
//! Expiry scans walk the tree in wrapping order starting a bounded
//! look-back behind `now`, so entries queued shortly before the tick
//! counter wrapped are still found. An entry whose task moved its own
//! `expire` forward since being queued is requeued at the real deadline
//! instead of firing ("stale" entries); one that cleared its `expire` to
//! `ETERNITY` is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::clock::Tick;
use crate::task::Task;

/// How far behind `now` expiry scans reach. Entries can fire at most this
/// late (under extreme scheduling delay) without being lost to wrap
/// ambiguity.
const TIMER_LOOK_BACK: u32 = 1 << 22;

type Slot = SmallVec<[Arc<Task>; 2]>;

#[derive(Default)]
pub struct TimerWheel {
    tree: Mutex<BTreeMap<u32, Slot>>,
}

impl TimerWheel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `task` to fire at `deadline`, also storing the deadline as
    /// the task's `expire`. If the task is already queued earlier, the
    /// existing entry stands (it will requeue itself if stale); if queued
    /// later, it is moved up.
    pub fn queue(&self, task: &Arc<Task>, deadline: Tick) {
        if deadline.is_eternity() {
            self.unlink(task);
            task.set_expire(Tick::ETERNITY);
            return;
        }
        task.set_expire(deadline);
        let mut tree = self.tree.lock();
        let mut key_slot = task.wq_key.lock();
        if let Some(old) = *key_slot {
            if !deadline.is_before(Tick::from_ms(old)) {
                return;
            }
            remove_entry(&mut tree, old, task);
        }
        tree.entry(deadline.raw()).or_default().push(task.clone());
        *key_slot = Some(deadline.raw());
    }

    /// Removes `task` from the wheel if queued. Idempotent, any thread.
    pub fn unlink(&self, task: &Arc<Task>) {
        let mut tree = self.tree.lock();
        let mut key_slot = task.wq_key.lock();
        if let Some(key) = key_slot.take() {
            remove_entry(&mut tree, key, task);
        }
    }

    /// Fires every entry whose deadline passed, invoking `wake` for each
    /// expired task (after unlinking it), and returns the next pending
    /// deadline or `ETERNITY`. Idempotent for a fixed `now`.
    pub fn wake_expired<F>(&self, now: Tick, mut wake: F) -> Tick
    where
        F: FnMut(Arc<Task>),
    {
        let mut to_wake: Vec<Arc<Task>> = Vec::new();
        let next = {
            let mut tree = self.tree.lock();
            let start = now.raw().wrapping_sub(TIMER_LOOK_BACK);

            let mut expired_keys: Vec<u32> = Vec::new();
            let mut next = Tick::ETERNITY;
            for key in wrap_keys(&tree, start) {
                if Tick::from_ms(key).is_expired(now) {
                    expired_keys.push(key);
                } else {
                    next = Tick::from_ms(key);
                    break;
                }
            }

            for key in expired_keys {
                let Some(slot) = tree.remove(&key) else {
                    continue;
                };
                for task in slot {
                    let mut key_slot = task.wq_key.lock();
                    *key_slot = None;
                    let real = task.expire();
                    if real.is_eternity() {
                        // Timer was disarmed after queueing; just unlink.
                        continue;
                    }
                    if real.is_expired(now) {
                        drop(key_slot);
                        to_wake.push(task);
                    } else {
                        // Stale entry: the task pushed its deadline out.
                        tracing::trace!(?real, "requeueing stale timer entry");
                        tree.entry(real.raw()).or_default().push(task.clone());
                        *key_slot = Some(real.raw());
                        next = next.first(real);
                    }
                }
            }

            // A requeued entry may now be the earliest.
            if let Some(key) = wrap_keys(&tree, start).next() {
                next = next.first(Tick::from_ms(key));
            }
            next
        };

        for task in to_wake {
            wake(task);
        }
        next
    }

    /// The earliest pending deadline (which may already have passed), or
    /// `ETERNITY` when nothing is queued.
    #[must_use]
    pub fn next_deadline(&self, now: Tick) -> Tick {
        let tree = self.tree.lock();
        let start = now.raw().wrapping_sub(TIMER_LOOK_BACK);
        let result = match wrap_keys(&tree, start).next() {
            Some(key) => Tick::from_ms(key),
            None => Tick::ETERNITY,
        };
        result
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.lock().is_empty()
    }
}

/// Keys of `tree` in wrapping order starting from `start`.
fn wrap_keys(tree: &BTreeMap<u32, Slot>, start: u32) -> impl Iterator<Item = u32> + '_ {
    tree.range(start..)
        .map(|(k, _)| *k)
        .chain(tree.range(..start).map(|(k, _)| *k))
}

fn remove_entry(tree: &mut BTreeMap<u32, Slot>, key: u32, task: &Arc<Task>) {
    if let Some(slot) = tree.get_mut(&key) {
        slot.retain(|t| !Arc::ptr_eq(t, task));
        if slot.is_empty() {
            tree.remove(&key);
        }
    }
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel")
            .field("entries", &self.tree.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskAction;

    fn noop_task() -> Arc<Task> {
        Task::new(|_| TaskAction::Idle)
    }

    #[test]
    fn fires_in_deadline_order() {
        let wheel = TimerWheel::new();
        let a = noop_task();
        let b = noop_task();
        wheel.queue(&a, Tick::from_ms(200));
        wheel.queue(&b, Tick::from_ms(100));
        let mut fired = Vec::new();
        let next = wheel.wake_expired(Tick::from_ms(150), |t| fired.push(t));
        assert_eq!(fired.len(), 1);
        assert!(Arc::ptr_eq(&fired[0], &b));
        assert_eq!(next, Tick::from_ms(200));
    }

    #[test]
    fn wake_expired_is_idempotent() {
        let wheel = TimerWheel::new();
        let a = noop_task();
        wheel.queue(&a, Tick::from_ms(50));
        let mut count = 0;
        wheel.wake_expired(Tick::from_ms(60), |_| count += 1);
        wheel.wake_expired(Tick::from_ms(60), |_| count += 1);
        assert_eq!(count, 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn stale_entry_requeues_at_real_expire() {
        let wheel = TimerWheel::new();
        let a = noop_task();
        wheel.queue(&a, Tick::from_ms(100));
        // The task pushes its own deadline out without requeueing.
        a.set_expire(Tick::from_ms(500));
        let mut fired = 0;
        let next = wheel.wake_expired(Tick::from_ms(150), |_| fired += 1);
        assert_eq!(fired, 0);
        assert_eq!(next, Tick::from_ms(500));
        let next = wheel.wake_expired(Tick::from_ms(600), |_| fired += 1);
        assert_eq!(fired, 1);
        assert!(next.is_eternity());
    }

    #[test]
    fn disarmed_entry_is_dropped() {
        let wheel = TimerWheel::new();
        let a = noop_task();
        wheel.queue(&a, Tick::from_ms(100));
        a.set_expire(Tick::ETERNITY);
        let mut fired = 0;
        wheel.wake_expired(Tick::from_ms(150), |_| fired += 1);
        assert_eq!(fired, 0);
        assert!(wheel.is_empty());
    }

    #[test]
    fn fires_across_wrap() {
        let wheel = TimerWheel::new();
        let a = noop_task();
        wheel.queue(&a, Tick::from_ms(u32::MAX - 5));
        let mut fired = 0;
        // `now` has wrapped past zero; the old entry must still fire.
        let next = wheel.wake_expired(Tick::from_ms(10), |_| fired += 1);
        assert_eq!(fired, 1);
        assert!(next.is_eternity());
    }

    #[test]
    fn earlier_queue_moves_entry_up() {
        let wheel = TimerWheel::new();
        let a = noop_task();
        wheel.queue(&a, Tick::from_ms(300));
        wheel.queue(&a, Tick::from_ms(100));
        let mut fired = 0;
        wheel.wake_expired(Tick::from_ms(120), |_| fired += 1);
        assert_eq!(fired, 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn unlink_is_idempotent() {
        let wheel = TimerWheel::new();
        let a = noop_task();
        wheel.queue(&a, Tick::from_ms(100));
        wheel.unlink(&a);
        wheel.unlink(&a);
        assert!(wheel.is_empty());
    }
}
