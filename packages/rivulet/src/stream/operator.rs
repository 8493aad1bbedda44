//! Operators transforming pull iterators.
//!
//! An operator is applied once per subscription, to that subscription's own pull iterator, so
//! stateful operators such as [`take`] or [`scan`] keep separate state for every subscriber.

use super::Pull;
use crate::error::StreamError;
use futures::{future::ready, StreamExt};
use std::sync::Arc;


/// Transformation from one pull iterator into another
pub trait Operator<In, Out>: Send + Sync + 'static {
    /// Wrap the upstream pull iterator of one subscription
    fn apply(&self, upstream: Pull<In>) -> Pull<Out>;
}

/// Operator made from a closure, see [`operator`]
#[derive(Debug, Clone)]
pub struct FnOperator<F>(F);

impl<In, Out, F> Operator<In, Out> for FnOperator<F>
where
    F: Fn(Pull<In>) -> Pull<Out> + Send + Sync + 'static,
{
    fn apply(&self, upstream: Pull<In>) -> Pull<Out> {
        (self.0)(upstream)
    }
}

/// Make an operator from a closure wrapping the upstream pull iterator
pub fn operator<In, Out, F>(f: F) -> FnOperator<F>
where
    F: Fn(Pull<In>) -> Pull<Out> + Send + Sync + 'static,
{
    FnOperator(f)
}

/// Apply `first`, then `second`
pub fn chain<A, B, C, F, G>(first: F, second: G) -> impl Operator<A, C>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    F: Operator<A, B>,
    G: Operator<B, C>,
{
    operator(move |upstream: Pull<A>| second.apply(first.apply(upstream)))
}

/// Transform each value
pub fn map<In, Out, F>(f: F) -> impl Operator<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Out + Send + Sync + 'static,
{
    let f = Arc::new(f);
    operator(move |upstream: Pull<In>| {
        let f = Arc::clone(&f);
        upstream.map(move |item| item.map(|value| f(value))).boxed()
    })
}

/// Transform each value fallibly, turning a failure into a stream error
pub fn try_map<In, Out, F>(f: F) -> impl Operator<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> anyhow::Result<Out> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    operator(move |upstream: Pull<In>| {
        let f = Arc::clone(&f);
        upstream
            .map(move |item| item.and_then(|value| f(value).map_err(StreamError::from)))
            .boxed()
    })
}

/// Pass through only the values matching a predicate. Errors always pass.
pub fn filter<T, F>(predicate: F) -> impl Operator<T, T>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    operator(move |upstream: Pull<T>| {
        let predicate = Arc::clone(&predicate);
        upstream
            .filter(move |item| ready(item.as_ref().map_or(true, |value| predicate(value))))
            .boxed()
    })
}

/// End after the first `n` items
pub fn take<T: Send + 'static>(n: usize) -> impl Operator<T, T> {
    operator(move |upstream: Pull<T>| upstream.take(n).boxed())
}

/// Drop the first `n` values. Errors are never dropped.
pub fn skip<T: Send + 'static>(n: usize) -> impl Operator<T, T> {
    operator(move |upstream: Pull<T>| {
        let mut remaining = n;
        upstream
            .filter(move |item| {
                let keep = match item {
                    Ok(_) if remaining > 0 => {
                        remaining -= 1;
                        false
                    }
                    _ => true,
                };
                ready(keep)
            })
            .boxed()
    })
}

/// Observe each value without changing it
pub fn tap<T, F>(f: F) -> impl Operator<T, T>
where
    T: Send + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    operator(move |upstream: Pull<T>| {
        let f = Arc::clone(&f);
        upstream
            .inspect(move |item| {
                if let Ok(value) = item {
                    f(value);
                }
            })
            .boxed()
    })
}

/// Fold values into an accumulator, emitting the output of each step
///
/// Every subscription starts from its own clone of `init`.
pub fn scan<In, Acc, Out, F>(init: Acc, f: F) -> impl Operator<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
    Acc: Clone + Send + Sync + 'static,
    F: Fn(&mut Acc, In) -> Out + Send + Sync + 'static,
{
    let f = Arc::new(f);
    operator(move |upstream: Pull<In>| {
        let f = Arc::clone(&f);
        let mut acc = init.clone();
        upstream.map(move |item| item.map(|value| f(&mut acc, value))).boxed()
    })
}
