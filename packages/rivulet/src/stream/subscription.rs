//! Spawned drain loops feeding observers.

use super::{Observer, Pull};
use futures::StreamExt;
use tokio::{sync::watch, task::AbortHandle};


/// Handle to a running subscription
///
/// The subscription runs as a spawned task pulling values through the pipeline into an
/// [`Observer`]. It ends by itself when the stream completes or errors. Dropping the handle does
/// not cancel it; call [`unsubscribe`](Self::unsubscribe).
#[derive(Debug)]
pub struct Subscription {
    task: AbortHandle,
    closed: watch::Receiver<bool>,
}

impl Subscription {
    // spawn the drain loop. the pull iterator must already be constructed, so that a subject's
    // reader is attached before this returns.
    //
    // panics if called outside a tokio runtime.
    pub(crate) fn spawn<T: Send + 'static>(pull: Pull<T>, observer: Observer<T>) -> Self {
        let (closed_send, closed) = watch::channel(false);
        // owned by the future from the start, so an abort before its first poll still marks closed
        let guard = ClosedGuard(closed_send);
        let task = tokio::spawn(drain(pull, observer, guard)).abort_handle();
        Subscription { task, closed }
    }

    /// Stop the subscription, without calling any further observer callbacks
    ///
    /// Any subject reader it held is detached once the task is torn down. Idempotent.
    pub fn unsubscribe(&self) {
        self.task.abort();
    }

    /// Whether the subscription has stopped, by completion, error, or unsubscription
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait for the subscription to stop
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        if let Err(e) = closed.wait_for(|&closed| closed).await {
            // the guard always marks closed before dropping the sender
            warn!(%e, "subscription task dropped without marking itself closed");
        };
    }
}

// marks the subscription closed however the drain loop exits, abort included.
struct ClosedGuard(watch::Sender<bool>);

impl Drop for ClosedGuard {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

async fn drain<T>(pull: Pull<T>, observer: Observer<T>, closed: ClosedGuard) {
    let _closed = closed;
    // rebound after the guard so they drop first, detaching any reader before closing
    let mut pull = pull;
    let mut observer = observer;
    loop {
        match pull.next().await {
            Some(Ok(value)) => observer.next(value),
            Some(Err(error)) => {
                drop(pull);
                observer.error(error);
                return;
            }
            None => {
                drop(pull);
                observer.complete();
                return;
            }
        }
    }
}
