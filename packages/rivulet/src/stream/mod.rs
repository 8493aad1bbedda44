//! Lazy, composable streams and the subjects that feed them.
//!
//! A [`Stream`] is a recipe for making pull iterators: nothing happens until the stream is pulled
//! or subscribed, and every pull or subscription gets a fresh iterator with fresh operator state.
//! Operators are attached with [`Stream::pipe`], which wraps the recipe rather than running
//! anything, so piping is associative.
//!
//! A [`Subject`] is a multicast source whose stream attaches one buffer reader per iterator.

mod observer;
mod offload;
mod operator;
mod subject;
mod subscription;

pub use self::{
    observer::Observer,
    offload::{cascade, compose, seize},
    operator::{chain, filter, map, operator, scan, skip, take, tap, try_map, FnOperator, Operator},
    subject::{ReplaySubject, Subject},
    subscription::Subscription,
};
use crate::error::StreamError;
use futures::{
    future::ready,
    stream::{self, BoxStream},
    StreamExt,
};
use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
};


/// Pull iterator of one subscription
pub type Pull<T> = BoxStream<'static, Result<T, StreamError>>;

/// Lazy stream, see module level docs
pub struct Stream<T> {
    source: Arc<dyn Fn() -> Pull<T> + Send + Sync>,
}

impl<T: Send + 'static> Stream<T> {
    /// Construct from a factory of pull iterators, called once per pull or subscription
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Pull<T> + Send + Sync + 'static,
    {
        Stream { source: Arc::new(factory) }
    }

    /// Stream yielding the items of a collection, cloned afresh for every subscription
    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        Stream::new(move || stream::iter(items.clone()).map(Ok).boxed())
    }

    /// Stream which completes immediately
    pub fn empty() -> Self {
        Stream::new(|| stream::empty().boxed())
    }

    /// Stream which fails immediately with the given error
    pub fn fail(error: StreamError) -> Self {
        Stream::new(move || stream::once(ready(Err(error.clone()))).boxed())
    }

    /// Attach an operator, producing a new stream. Runs nothing.
    pub fn pipe<U, O>(&self, operator: O) -> Stream<U>
    where
        U: Send + 'static,
        O: Operator<T, U>,
    {
        let source = Arc::clone(&self.source);
        Stream::new(move || operator.apply(source()))
    }

    /// Construct a fresh pull iterator
    pub fn pull(&self) -> Pull<T> {
        (self.source)()
    }

    /// Pull this stream into an observer on a spawned task
    ///
    /// The pull iterator is constructed before this returns, so a subject behind this stream
    /// already counts the subscriber.
    ///
    /// Panics if called outside a tokio runtime.
    pub fn subscribe(&self, observer: Observer<T>) -> Subscription {
        Subscription::spawn(self.pull(), observer)
    }
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Stream { source: Arc::clone(&self.source) }
    }
}

impl<T> Debug for Stream<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("Stream { .. }")
    }
}
