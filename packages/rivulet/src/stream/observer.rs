//! Callbacks receiving a stream's output.

use crate::error::StreamError;
use std::fmt::{self, Debug, Formatter};


/// Set of callbacks a subscription feeds
///
/// `next` is called for each value in order. At most one of `error` and `complete` is called,
/// after which nothing else is. An error reaching an observer with no `error` callback is logged.
pub struct Observer<T> {
    next: Option<Box<dyn FnMut(T) + Send>>,
    error: Option<Box<dyn FnOnce(StreamError) + Send>>,
    complete: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Observer<T> {
    /// Construct with no callbacks
    pub fn new() -> Self {
        Observer {
            next: None,
            error: None,
            complete: None,
        }
    }

    /// Construct with only a `next` callback
    pub fn from_fn<F>(next: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        Observer::new().on_next(next)
    }

    /// Set the callback for each value
    pub fn on_next<F>(mut self, next: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        self.next = Some(Box::new(next));
        self
    }

    /// Set the callback for a terminal error
    pub fn on_error<F>(mut self, error: F) -> Self
    where
        F: FnOnce(StreamError) + Send + 'static,
    {
        self.error = Some(Box::new(error));
        self
    }

    /// Set the callback for completion
    pub fn on_complete<F>(mut self, complete: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.complete = Some(Box::new(complete));
        self
    }

    pub(crate) fn next(&mut self, value: T) {
        if let Some(next) = self.next.as_mut() {
            next(value);
        }
    }

    pub(crate) fn error(self, error: StreamError) {
        match self.error {
            Some(on_error) => on_error(error),
            None => error!("unhandled stream error: {:#}", error.inner()),
        }
    }

    pub(crate) fn complete(self) {
        if let Some(complete) = self.complete {
            complete();
        }
    }
}

impl<T> Default for Observer<T> {
    fn default() -> Self {
        Observer::new()
    }
}

impl<T> Debug for Observer<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Observer")
            .field("next", &self.next.is_some())
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .finish()
    }
}
