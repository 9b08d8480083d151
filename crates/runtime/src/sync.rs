//! Cooperative FIFO resource lock.
//!
//! Unlike a mutex guard, holdership belongs to a *thread*, not a scope:
//! [`ResourceLock::request`] blocks until the calling thread is made holder
//! and [`ResourceLock::release`] hands the lock to the first still-awaiting
//! waiter in FIFO order. Waiters that gave up (timed request) stay queued as
//! cancelled entries and are dropped during the hand-off scan. Value access
//! goes through checked guards so a protocol violation costs an error, not
//! an aliased pointer.

use std::{
    cell::UnsafeCell,
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use tracing::trace;

use crate::error::{Error, Result};

#[derive(Debug)]
struct Waiter {
    thread: ThreadId,
    awaiting: bool,
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<ThreadId>,
    queue: VecDeque<Waiter>,
    shared_borrows: usize,
    exclusive_borrow: bool,
}

/// Thread-owned lock around a value shared with hook callbacks.
///
/// With `SHARED_READS` (the default) any thread may take immutable guards
/// while no exclusive borrow is live; with it off, reads are holder-only
/// like writes.
#[derive(Debug)]
pub struct ResourceLock<T, const SHARED_READS: bool = true> {
    state: Mutex<LockState>,
    handoff: Condvar,
    value: UnsafeCell<T>,
}

// SAFETY: the holdership protocol plus borrow counters serialize access to
// the value cell; T itself still has to be fine to reach from any thread.
unsafe impl<T: Send + Sync, const SHARED_READS: bool> Sync for ResourceLock<T, SHARED_READS> {}

impl<T, const SHARED_READS: bool> ResourceLock<T, SHARED_READS> {
    pub fn new(value: T) -> Self {
        ResourceLock {
            state: Mutex::new(LockState::default()),
            handoff: Condvar::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the calling thread holds the lock.
    pub fn request(&self) -> Result<()> {
        crate::frame!();
        self.request_inner(None)
    }

    /// Blocks like [`ResourceLock::request`], but gives up once `timeout`
    /// has elapsed, leaving a cancelled entry in the queue. A hand-off that
    /// lands exactly at the deadline wins over the timeout. A zero timeout
    /// degenerates to try-lock.
    pub fn request_timeout(&self, timeout: Duration) -> Result<()> {
        crate::frame!();
        self.request_inner(Instant::now().checked_add(timeout))
    }

    fn request_inner(&self, deadline: Option<Instant>) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();

        if state.holder == Some(me) {
            return Err(Error::lock("the resource lock is not re-entrant"));
        }
        if state.holder.is_none() {
            state.holder = Some(me);
            return Ok(());
        }

        state.queue.push_back(Waiter {
            thread: me,
            awaiting: true,
        });
        trace!(thread = ?me, "queued for resource lock");

        loop {
            if state.holder == Some(me) {
                return Ok(());
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        // Cancel in place; release() drops the entry while
                        // scanning for the next still-awaiting waiter.
                        if let Some(waiter) = state
                            .queue
                            .iter_mut()
                            .find(|w| w.thread == me && w.awaiting)
                        {
                            waiter.awaiting = false;
                        }
                        trace!(thread = ?me, "resource lock request timed out");
                        return Err(Error::lock("the lock request timed out"));
                    }

                    state = self
                        .handoff
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    state = self
                        .handoff
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Releases holdership, handing the lock to the first still-awaiting
    /// waiter; cancelled entries ahead of it are dropped on the way.
    pub fn release(&self) -> Result<()> {
        crate::frame!();
        let me = thread::current().id();
        let mut state = self.state();

        if state.holder != Some(me) {
            return Err(Error::lock_access());
        }
        if state.shared_borrows > 0 || state.exclusive_borrow {
            return Err(Error::lock("the value is still borrowed"));
        }

        loop {
            match state.queue.pop_front() {
                Some(waiter) if waiter.awaiting => {
                    state.holder = Some(waiter.thread);
                    trace!(from = ?me, to = ?waiter.thread, "resource lock handed off");
                    self.handoff.notify_all();
                    return Ok(());
                }
                Some(_) => continue,
                None => {
                    state.holder = None;
                    return Ok(());
                }
            }
        }
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<ThreadId> {
        self.state().holder
    }

    /// Number of queued waiters that have not cancelled.
    pub fn waiters(&self) -> usize {
        self.state().queue.iter().filter(|w| w.awaiting).count()
    }

    /// Immutable guard. Fails while an exclusive borrow is live, and, when
    /// `SHARED_READS` is off, for any thread but the holder.
    pub fn get(&self) -> Result<ReadGuard<'_, T, SHARED_READS>> {
        crate::frame!();
        let me = thread::current().id();
        let mut state = self.state();

        if !SHARED_READS && state.holder != Some(me) {
            return Err(Error::lock_access());
        }
        if state.exclusive_borrow {
            return Err(Error::lock("the value is exclusively borrowed"));
        }

        state.shared_borrows += 1;
        Ok(ReadGuard { lock: self })
    }

    /// Mutable guard for the holder. Fails for non-holders and while any
    /// other borrow is live.
    pub fn get_mut(&self) -> Result<WriteGuard<'_, T, SHARED_READS>> {
        crate::frame!();
        let me = thread::current().id();
        let mut state = self.state();

        if state.holder != Some(me) {
            return Err(Error::lock_access());
        }
        if state.exclusive_borrow || state.shared_borrows > 0 {
            return Err(Error::lock("the value is already borrowed"));
        }

        state.exclusive_borrow = true;
        Ok(WriteGuard { lock: self })
    }
}

#[derive(Debug)]
pub struct ReadGuard<'a, T, const SHARED_READS: bool> {
    lock: &'a ResourceLock<T, SHARED_READS>,
}

impl<T, const SHARED_READS: bool> Deref for ReadGuard<'_, T, SHARED_READS> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: shared_borrows > 0 keeps every exclusive borrow out.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, const SHARED_READS: bool> Drop for ReadGuard<'_, T, SHARED_READS> {
    fn drop(&mut self) {
        self.lock.state().shared_borrows -= 1;
    }
}

#[derive(Debug)]
pub struct WriteGuard<'a, T, const SHARED_READS: bool> {
    lock: &'a ResourceLock<T, SHARED_READS>,
}

impl<T, const SHARED_READS: bool> Deref for WriteGuard<'_, T, SHARED_READS> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: exclusive_borrow keeps every other borrow out.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, const SHARED_READS: bool> DerefMut for WriteGuard<'_, T, SHARED_READS> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as for Deref.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T, const SHARED_READS: bool> Drop for WriteGuard<'_, T, SHARED_READS> {
    fn drop(&mut self) {
        self.lock.state().exclusive_borrow = false;
    }
}
