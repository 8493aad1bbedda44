//! Counting semaphore with a FIFO queue of waiters.

use super::{
    polling::{poll, Timeout},
    wait_queue::WaitQueue,
};
use crate::error::{TryAcquireError, WouldBlockError};
use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    sync::Mutex,
    task::{Context, Poll},
    time::{Duration, Instant},
};


/// Asynchronous counting semaphore bounding the number of concurrently held permits
///
/// Waiters are served strictly FIFO. When a permit is released while someone is waiting, it is
/// transferred directly to the oldest waiter rather than being returned to the free count, so a
/// [`try_acquire`](Self::try_acquire) arriving between the release and the waiter's wake-up can
/// never take it.
pub struct Semaphore {
    state: Mutex<SemaphoreState>,
    capacity: usize,
}

struct SemaphoreState {
    // free permits. invariant: count + held permits <= capacity.
    count: usize,
    waiters: WaitQueue,
}

impl SemaphoreState {
    fn release(&mut self, capacity: usize) {
        if !self.waiters.hand_off() {
            self.count += 1;
            debug_assert!(self.count <= capacity, "semaphore released more permits than it has");
        }
    }
}

impl Semaphore {
    /// Construct with `capacity` free permits
    pub fn new(capacity: usize) -> Self {
        Semaphore {
            state: Mutex::new(SemaphoreState {
                count: capacity,
                waiters: WaitQueue::new(),
            }),
            capacity,
        }
    }

    /// Create a future to acquire one permit
    pub fn acquire(&self) -> SemaphoreAcquire<'_> {
        SemaphoreAcquire {
            semaphore: self,
            waiter: None,
            done: false,
        }
    }

    /// Acquire a permit only if that is possible without waiting
    ///
    /// Fails if no permit is free or if other acquirers are already queued.
    pub fn try_acquire(&self) -> Result<Permit<'_>, TryAcquireError> {
        let mut state = self.state.lock().unwrap();
        if state.count == 0 || !state.waiters.is_empty() {
            return Err(TryAcquireError);
        }
        state.count -= 1;
        Ok(Permit { semaphore: self })
    }

    /// Return one permit to the semaphore
    ///
    /// This is the counterpart of [`Permit::forget`]. Releasing more permits than were forgotten
    /// breaks the capacity invariant.
    pub fn release(&self) {
        self.state.lock().unwrap().release(self.capacity);
    }

    /// Number of permits currently free
    pub fn available_permits(&self) -> usize {
        self.state.lock().unwrap().count
    }

    /// Total number of permits this semaphore was created with
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of acquirers currently queued
    pub fn waiting(&self) -> usize {
        self.state.lock().unwrap().waiters.len()
    }
}

impl Debug for Semaphore {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Semaphore")
            .field("capacity", &self.capacity)
            .field("available", &state.count)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}


/// One permit held from a [`Semaphore`], released when dropped
#[must_use = "the permit is released as soon as it is dropped"]
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl<'a> Permit<'a> {
    /// Keep the permit consumed without holding a guard for it
    ///
    /// The permit can later be given back with [`Semaphore::release`].
    pub fn forget(self) {
        mem::forget(self);
    }
}

impl<'a> Drop for Permit<'a> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}


/// Future for acquiring a permit from a [`Semaphore`]
///
/// Same queueing and cancellation behavior as [`LockAcquire`](super::LockAcquire).
#[must_use = "futures do nothing unless polled"]
pub struct SemaphoreAcquire<'a> {
    semaphore: &'a Semaphore,
    waiter: Option<u64>,
    done: bool,
}

impl<'a> Future for SemaphoreAcquire<'a> {
    type Output = Permit<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Permit<'a>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        let mut state = this.semaphore.state.lock().unwrap();
        match this.waiter {
            None => {
                if state.count > 0 && state.waiters.is_empty() {
                    state.count -= 1;
                    this.done = true;
                    return Poll::Ready(Permit { semaphore: this.semaphore });
                }
                this.waiter = Some(state.waiters.push(cx.waker()));
                Poll::Pending
            }
            Some(id) => {
                if state.waiters.take_grant(id) {
                    this.waiter = None;
                    this.done = true;
                    return Poll::Ready(Permit { semaphore: this.semaphore });
                }
                state.waiters.update_waker(id, cx.waker());
                Poll::Pending
            }
        }
    }
}

impl<'a> SemaphoreAcquire<'a> {
    /// Block the current thread until a permit is acquired
    pub fn block(mut self) -> Permit<'a> {
        poll(&mut self, Timeout::Never).expect("poll timed out with Timeout::Never")
    }

    /// Block until a permit is acquired or the timeout elapses
    pub fn block_timeout(self, timeout: Duration) -> Result<Permit<'a>, WouldBlockError> {
        self.block_deadline(Instant::now() + timeout)
    }

    /// Block until a permit is acquired or the deadline is reached
    pub fn block_deadline(mut self, deadline: Instant) -> Result<Permit<'a>, WouldBlockError> {
        poll(&mut self, Timeout::At(deadline)).ok_or(WouldBlockError)
    }

    /// Whether this future has already resolved
    pub fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<'a> futures::future::FusedFuture for SemaphoreAcquire<'a> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<'a> Drop for SemaphoreAcquire<'a> {
    fn drop(&mut self) {
        let Some(id) = self.waiter.take() else { return };
        let mut state = self.semaphore.state.lock().unwrap();
        if state.waiters.take_grant(id) {
            state.release(self.semaphore.capacity);
        } else {
            state.waiters.remove(id);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use futures::{task::noop_waker, FutureExt};
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering::SeqCst},
            Arc,
        },
        thread,
    };

    #[test]
    fn try_acquire_respects_capacity() {
        let sem = Semaphore::new(3);
        let permits: Vec<_> = (0..3).map(|_| sem.try_acquire().unwrap()).collect();
        assert_eq!(sem.try_acquire().err(), Some(TryAcquireError));
        assert_eq!(sem.available_permits(), 0);
        drop(permits);
        assert_eq!(sem.available_permits(), 3);
    }

    #[test]
    fn release_hands_permit_to_oldest_waiter() {
        let sem = Semaphore::new(1);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let permit = sem.acquire().now_or_never().unwrap();
        let mut a = sem.acquire();
        let mut b = sem.acquire();
        assert!(Pin::new(&mut a).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut b).poll(&mut cx).is_pending());

        drop(permit);
        // the released permit belongs to `a` now, not to the free count
        assert_eq!(sem.available_permits(), 0);
        assert!(sem.try_acquire().is_err());
        assert!(Pin::new(&mut b).poll(&mut cx).is_pending());
        let Poll::Ready(permit) = Pin::new(&mut a).poll(&mut cx) else { panic!("not granted") };

        drop(permit);
        assert!(Pin::new(&mut b).poll(&mut cx).is_ready());
    }

    #[test]
    fn forgotten_permit_is_given_back_by_release() {
        let sem = Semaphore::new(2);
        sem.try_acquire().unwrap().forget();
        assert_eq!(sem.available_permits(), 1);
        sem.release();
        assert_eq!(sem.available_permits(), 2);
    }

    #[test]
    fn dropped_waiter_does_not_leak_permit() {
        let sem = Semaphore::new(1);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let permit = sem.try_acquire().unwrap();
        let mut a = sem.acquire();
        assert!(Pin::new(&mut a).poll(&mut cx).is_pending());
        drop(permit);
        drop(a);
        assert_eq!(sem.available_permits(), 1);
        assert_eq!(sem.waiting(), 0);
    }

    #[test]
    fn bounded_concurrency_across_threads() {
        let sem = Arc::new(Semaphore::new(3));
        let held = Arc::new(AtomicUsize::new(0));
        let max_held = Arc::new(AtomicUsize::new(0));

        let joins: Vec<_> = (0..10)
            .map(|_| {
                let sem = Arc::clone(&sem);
                let held = Arc::clone(&held);
                let max_held = Arc::clone(&max_held);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let permit = sem.acquire()
                            .block_timeout(Duration::from_secs(10))
                            .unwrap();
                        let now = held.fetch_add(1, SeqCst) + 1;
                        max_held.fetch_max(now, SeqCst);
                        thread::sleep(Duration::from_micros(200));
                        held.fetch_sub(1, SeqCst);
                        drop(permit);
                    }
                })
            })
            .collect();
        for join in joins {
            join.join().unwrap();
        }
        assert!(max_held.load(SeqCst) <= 3);
        assert_eq!(sem.available_permits(), 3);
    }
}
