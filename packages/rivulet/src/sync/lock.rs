//! Mutual exclusion with a FIFO queue of waiters.

use super::{
    polling::{poll, Timeout},
    wait_queue::WaitQueue,
};
use crate::error::WouldBlockError;
use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    sync::Mutex,
    task::{Context, Poll},
    time::{Duration, Instant},
};


/// Asynchronous lock granting exactly one holder at a time
///
/// Contended acquirers are queued and served strictly in the order they first polled their
/// [`LockAcquire`] future. Releasing the lock (by dropping the [`LockGuard`]) transfers ownership
/// directly to the oldest waiter, so a newcomer can never overtake the queue.
///
/// There is no timeout on the async path: a guard which is never dropped blocks every later
/// acquirer.
pub struct Lock {
    state: Mutex<LockState>,
}

struct LockState {
    // whether some guard, or some granted-but-not-yet-resolved waiter, owns the lock.
    locked: bool,
    waiters: WaitQueue,
}

impl LockState {
    // pass ownership to the next waiter, or mark free.
    fn release(&mut self) {
        debug_assert!(self.locked, "released a lock that was not held");
        if !self.waiters.hand_off() {
            self.locked = false;
        }
    }
}

impl Lock {
    /// Construct an unlocked lock
    pub fn new() -> Self {
        Lock {
            state: Mutex::new(LockState {
                locked: false,
                waiters: WaitQueue::new(),
            }),
        }
    }

    /// Create a future to acquire the lock
    ///
    /// The future joins the waiter queue the first time it is polled and the lock is not
    /// immediately available. See [`LockAcquire`] for the blocking variants.
    pub fn acquire(&self) -> LockAcquire<'_> {
        LockAcquire {
            lock: self,
            waiter: None,
            done: false,
        }
    }

    /// Acquire the lock only if that is possible without waiting
    pub fn try_acquire(&self) -> Option<LockGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        if state.locked {
            return None;
        }
        debug_assert!(state.waiters.is_empty());
        state.locked = true;
        Some(LockGuard { lock: self })
    }

    /// Whether the lock is currently held (or about to be handed to a waiter)
    pub fn is_locked(&self) -> bool {
        self.state.lock().unwrap().locked
    }

    /// Number of acquirers currently queued
    pub fn waiting(&self) -> usize {
        self.state.lock().unwrap().waiters.len()
    }
}

impl Default for Lock {
    fn default() -> Self {
        Lock::new()
    }
}

impl Debug for Lock {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Lock")
            .field("locked", &state.locked)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}


/// Token proving ownership of a [`Lock`], releasing it when dropped
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl<'a> LockGuard<'a> {
    /// Release the lock
    ///
    /// Equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        self.lock.state.lock().unwrap().release();
    }
}


/// Future for acquiring a [`Lock`]
///
/// Besides being awaited, it can be resolved from a plain thread with [`block`](Self::block) or
/// its bounded variants. If dropped before resolving, it leaves the queue; if ownership had
/// already been handed to it, ownership moves on to the next waiter.
#[must_use = "futures do nothing unless polled"]
pub struct LockAcquire<'a> {
    lock: &'a Lock,
    // id in the wait queue, if enqueued.
    waiter: Option<u64>,
    done: bool,
}

impl<'a> Future for LockAcquire<'a> {
    type Output = LockGuard<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<LockGuard<'a>> {
        let this = self.get_mut();
        // for implementation of FusedFuture
        if this.done {
            return Poll::Pending;
        }
        let mut state = this.lock.state.lock().unwrap();
        match this.waiter {
            None => {
                if !state.locked {
                    state.locked = true;
                    this.done = true;
                    return Poll::Ready(LockGuard { lock: this.lock });
                }
                this.waiter = Some(state.waiters.push(cx.waker()));
                Poll::Pending
            }
            Some(id) => {
                if state.waiters.take_grant(id) {
                    this.waiter = None;
                    this.done = true;
                    return Poll::Ready(LockGuard { lock: this.lock });
                }
                state.waiters.update_waker(id, cx.waker());
                Poll::Pending
            }
        }
    }
}

impl<'a> LockAcquire<'a> {
    /// Block the current thread until the lock is acquired
    pub fn block(mut self) -> LockGuard<'a> {
        poll(&mut self, Timeout::Never).expect("poll timed out with Timeout::Never")
    }

    /// Block until the lock is acquired or the timeout elapses
    pub fn block_timeout(self, timeout: Duration) -> Result<LockGuard<'a>, WouldBlockError> {
        self.block_deadline(Instant::now() + timeout)
    }

    /// Block until the lock is acquired or the deadline is reached
    pub fn block_deadline(mut self, deadline: Instant) -> Result<LockGuard<'a>, WouldBlockError> {
        poll(&mut self, Timeout::At(deadline)).ok_or(WouldBlockError)
    }

    /// Whether this future has already resolved
    pub fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<'a> futures::future::FusedFuture for LockAcquire<'a> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<'a> Drop for LockAcquire<'a> {
    fn drop(&mut self) {
        let Some(id) = self.waiter.take() else { return };
        let mut state = self.lock.state.lock().unwrap();
        if state.waiters.take_grant(id) {
            // we were handed the lock but never observed it
            state.release();
        } else {
            state.waiters.remove(id);
        }
    }
}
