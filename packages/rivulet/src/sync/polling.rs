// blocking on futures from plain threads.
//
// design based on pollster crate. unlike a stack-allocated signal, the signal here is reference
// counted and handed out through `std::task::Wake`, so wakers that outlive a timed-out poll are
// harmless and no unsafe code is needed.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex},
    task::{Context, Poll, Wake, Waker},
    time::Instant,
};


// timeout for blocking on a future.
pub(crate) enum Timeout {
    // never time out.
    Never,
    // time out at the given deadline.
    At(Instant),
    // time out if the future cannot be resolved without blocking.
    NonBlocking,
}

// poll the future until it resolves, or return none once the timeout is reached.
//
// on timeout the future is left unresolved; the caller is expected to drop it, which is what
// deregisters it from whatever queue it is waiting in.
pub(crate) fn poll<F>(fut: &mut F, timeout: Timeout) -> Option<F::Output>
where
    F: Future + Unpin,
{
    let signal = Arc::new(Signal {
        state: Mutex::new(State::Empty),
        cond: Condvar::new(),
    });
    let waker = Waker::from(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);

    loop {
        // return if ready
        if let Poll::Ready(output) = Pin::new(&mut *fut).poll(&mut cx) {
            return Some(output);
        }

        // otherwise, block until notification or timeout
        let mut lock = signal.state.lock().unwrap();

        // a notification that arrived while polling means we should poll again right away
        if let State::Notified = *lock {
            *lock = State::Empty;
            continue;
        }

        *lock = State::Waiting;
        match timeout {
            Timeout::Never => {
                while let State::Waiting = *lock {
                    lock = signal.cond.wait(lock).unwrap();
                }
            }
            Timeout::At(deadline) => {
                while let State::Waiting = *lock {
                    let duration = deadline.checked_duration_since(Instant::now())?;
                    let (lock2, wait_result) = signal.cond.wait_timeout(lock, duration).unwrap();
                    lock = lock2;
                    if wait_result.timed_out() && matches!(*lock, State::Waiting) {
                        return None;
                    }
                }
            }
            Timeout::NonBlocking => return None,
        }
        *lock = State::Empty;
    }
}

// synchronization signal state
enum State {
    Empty,
    Waiting,
    Notified,
}

// synchronization signal
struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut lock = self.state.lock().unwrap();
        match *lock {
            State::Notified => (),
            State::Empty => *lock = State::Notified,
            State::Waiting => {
                *lock = State::Empty;
                self.cond.notify_one();
            }
        }
    }
}
