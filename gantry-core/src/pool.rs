//! The shared buffer pool and its wait list.
//!
//! Allocation follows a margin-reservation discipline: `alloc(margin)`
//! hands out a buffer only if at least `margin` buffers remain free after
//! the allocation. Pipelines that need two buffers to make progress
//! allocate the first with a margin of one, which keeps them from
//! deadlocking each other when the pool runs dry.
//!
//! A caller that cannot allocate registers a waiter (a wake callback) on
//! the pool's wait list and must retry after being woken. Releases wake
//! waiters in FIFO order while headroom stays above the pool's reserve
//! threshold.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::buf::Buffer;

/// Failure modes of [`BufferPool::alloc`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Granting the request would leave fewer than `margin` buffers free.
    /// The caller must register a waiter and retry once woken.
    NeedsWait,
}

/// Identifies a registered waiter so it can be deregistered and so a
/// releasing owner can avoid waking itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WaiterToken(u64);

type WakeFn = Box<dyn Fn() + Send + Sync>;

struct Waiter {
    token: u64,
    wake: WakeFn,
}

struct PoolInner {
    free: Vec<Buffer>,
    /// Buffers handed out and not yet released.
    in_use: usize,
    total: usize,
}

impl PoolInner {
    fn free_count(&self) -> usize {
        self.total - self.in_use
    }
}

pub struct BufferPool {
    bufsize: usize,
    /// Headroom kept when waking waiters on release.
    reserve: usize,
    inner: Mutex<PoolInner>,
    waiters: Mutex<VecDeque<Waiter>>,
    next_token: Mutex<u64>,
}

impl BufferPool {
    /// A pool of `total` buffers of `bufsize` bytes each. Buffers are
    /// created lazily on first allocation and cached on release.
    #[must_use]
    pub fn new(total: usize, bufsize: usize, reserve: usize) -> Self {
        Self {
            bufsize,
            reserve,
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                in_use: 0,
                total,
            }),
            waiters: Mutex::new(VecDeque::new()),
            next_token: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn bufsize(&self) -> usize {
        self.bufsize
    }

    /// Buffers currently free.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_count()
    }

    /// Allocates a buffer, keeping at least `margin` buffers free after
    /// this allocation succeeds.
    pub fn alloc(&self, margin: usize) -> Result<Buffer, AllocError> {
        let mut inner = self.inner.lock();
        if inner.free_count() < margin + 1 {
            tracing::debug!(
                free = inner.free_count(),
                margin,
                "buffer pool under margin, caller must wait"
            );
            return Err(AllocError::NeedsWait);
        }
        inner.in_use += 1;
        match inner.free.pop() {
            Some(buf) => Ok(buf),
            None => Ok(Buffer::with_capacity(self.bufsize)),
        }
    }

    /// Non-blocking fast path: takes a cached buffer if one is free, with
    /// no margin check and no waiter registration.
    pub fn alloc_from_cache(&self) -> Option<Buffer> {
        let mut inner = self.inner.lock();
        if inner.free_count() == 0 {
            return None;
        }
        inner.in_use += 1;
        let buf = inner.free.pop();
        match buf {
            Some(buf) => Some(buf),
            None => Some(Buffer::with_capacity(self.bufsize)),
        }
    }

    /// Returns a buffer to the pool and offers the freed headroom to
    /// waiters, skipping `from` (the releasing owner) if given.
    pub fn release(&self, mut buf: Buffer, from: Option<WaiterToken>) {
        buf.reset();
        {
            let mut inner = self.inner.lock();
            debug_assert!(inner.in_use > 0, "release without matching alloc");
            inner.in_use = inner.in_use.saturating_sub(1);
            inner.free.push(buf);
        }
        self.offer_buffers(from, self.reserve);
    }

    /// Registers a wake callback on the wait list; FIFO order. The waiter
    /// is removed before its callback runs, so a woken caller that still
    /// cannot allocate must register again.
    pub fn register_waiter<F>(&self, wake: F) -> WaiterToken
    where
        F: Fn() + Send + Sync + 'static,
    {
        let token = {
            let mut next = self.next_token.lock();
            *next += 1;
            *next
        };
        self.waiters.lock().push_back(Waiter {
            token,
            wake: Box::new(wake),
        });
        WaiterToken(token)
    }

    /// Drops a registered waiter. Idempotent: unknown tokens (already
    /// woken or never registered) are ignored.
    pub fn unregister_waiter(&self, token: WaiterToken) {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| w.token == token.0) {
            waiters.remove(pos);
        }
    }

    /// Pops and wakes waiters while the pool keeps more than `threshold`
    /// buffers of headroom. `from` is never woken by its own release.
    pub fn offer_buffers(&self, from: Option<WaiterToken>, threshold: usize) {
        loop {
            let waiter = {
                let inner = self.inner.lock();
                if inner.free_count() <= threshold {
                    return;
                }
                let mut waiters = self.waiters.lock();
                match from {
                    Some(skip) if waiters.front().is_some_and(|w| w.token == skip.0) => {
                        // Rotate the releasing owner behind the next
                        // waiter instead of waking it with its own buffer.
                        if waiters.len() == 1 {
                            return;
                        }
                        let own = match waiters.pop_front() {
                            Some(w) => w,
                            None => return,
                        };
                        waiters.push_back(own);
                        waiters.pop_front()
                    }
                    _ => waiters.pop_front(),
                }
            };
            match waiter {
                Some(w) => (w.wake)(),
                None => return,
            }
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BufferPool")
            .field("bufsize", &self.bufsize)
            .field("total", &inner.total)
            .field("in_use", &inner.in_use)
            .field("waiters", &self.waiters.lock().len())
            .finish()
    }
}
