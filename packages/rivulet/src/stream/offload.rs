//! Operators running a pipeline stage on a coroutine pool.

use super::{operator, Operator, Pull};
use crate::{
    coroutine::{Coroutine, WorkerLease},
    error::{CoroutineError, StreamError},
};
use futures::{stream, StreamExt};
use std::sync::Arc;


/// Run each value through a registered task, one at a time
///
/// Every value is processed by whichever worker is free, and the next value is not pulled until
/// the previous result is emitted.
pub fn compose<P>(coroutine: Coroutine<P>, task: impl Into<Arc<str>>) -> impl Operator<P, P>
where
    P: Send + 'static,
{
    let task: Arc<str> = task.into();
    operator(move |upstream: Pull<P>| {
        let coroutine = coroutine.clone();
        let task = Arc::clone(&task);
        upstream
            .then(move |item| process(coroutine.clone(), Arc::clone(&task), item))
            .boxed()
    })
}

/// Run up to `limit` values through a registered task concurrently, emitting results in input
/// order
///
/// Panics if `limit` is zero.
pub fn cascade<P>(coroutine: Coroutine<P>, task: impl Into<Arc<str>>, limit: usize) -> impl Operator<P, P>
where
    P: Send + 'static,
{
    assert!(limit > 0, "cascade limit must be non-zero");
    let task: Arc<str> = task.into();
    operator(move |upstream: Pull<P>| {
        let coroutine = coroutine.clone();
        let task = Arc::clone(&task);
        upstream
            .map(move |item| process(coroutine.clone(), Arc::clone(&task), item))
            .buffered(limit)
            .boxed()
    })
}

/// Run every value of a subscription through a registered task on a single leased worker
///
/// The worker is leased when the first value arrives and returned when the subscription ends, so
/// handlers may keep per-subscription state in thread-locals.
pub fn seize<P>(coroutine: Coroutine<P>, task: impl Into<Arc<str>>) -> impl Operator<P, P>
where
    P: Send + 'static,
{
    let task: Arc<str> = task.into();
    operator(move |upstream: Pull<P>| {
        let state = Seized {
            upstream,
            coroutine: coroutine.clone(),
            task: Arc::clone(&task),
            lease: None,
        };
        stream::unfold(state, |mut state| async move {
            let item = state.upstream.next().await?;
            let result = state.step(item).await;
            Some((result, state))
        }).boxed()
    })
}

async fn process<P: Send + 'static>(
    coroutine: Coroutine<P>,
    task: Arc<str>,
    item: Result<P, StreamError>,
) -> Result<P, StreamError> {
    Ok(coroutine.process_task(&task, item?).await?)
}

struct Seized<P> {
    upstream: Pull<P>,
    coroutine: Coroutine<P>,
    task: Arc<str>,
    // returned to the pool when the pull iterator is dropped.
    lease: Option<WorkerLease<P>>,
}

impl<P: Send + 'static> Seized<P> {
    async fn step(&mut self, item: Result<P, StreamError>) -> Result<P, StreamError> {
        let value = item?;
        let lease = match self.lease.take() {
            Some(lease) if !lease.is_retired() => lease,
            _ => {
                let lease = self.coroutine.acquire().await?;
                trace!(worker_id = %lease.worker_id(), task = %self.task, "seized worker for subscription");
                lease
            }
        };
        let result = lease.process(&self.task, value).await;
        match &result {
            Err(CoroutineError::WorkerLost(worker_id)) => {
                debug!(%worker_id, task = %self.task, "seized worker lost, reseizing on next value");
            }
            _ => self.lease = Some(lease),
        }
        Ok(result?)
    }
}
