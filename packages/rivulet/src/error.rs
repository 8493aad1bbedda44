//! Error types

use crate::{buffer::ReaderId, coroutine::WorkerId};
use std::{
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;


// ==== sync errors ====


/// Error for trying to acquire a permit without waiting when none can be granted immediately
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[error("no permit available without waiting")]
pub struct TryAcquireError;

/// Error for a blocking operation not completing by the specified deadline
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[error("operation would block")]
pub struct WouldBlockError;


// ==== stream errors ====


/// Error flowing through a stream pipeline
///
/// One upstream error is delivered to every reader that reaches it, so this is a cheaply
/// clonable, shared handle to an [`anyhow::Error`].
#[derive(Clone)]
pub struct StreamError(Arc<anyhow::Error>);

impl StreamError {
    /// Wrap any error
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StreamError(Arc::new(anyhow::Error::new(error)))
    }

    /// Construct from a printable message
    pub fn msg<M>(message: M) -> Self
    where
        M: Display + Debug + Send + Sync + 'static,
    {
        StreamError(Arc::new(anyhow::Error::msg(message)))
    }

    /// Borrow the underlying error
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempt to downcast the underlying error to a concrete type
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl Debug for StreamError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl Display for StreamError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for StreamError {
    fn from(error: anyhow::Error) -> Self {
        StreamError(Arc::new(error))
    }
}

impl From<CoroutineError> for StreamError {
    fn from(error: CoroutineError) -> Self {
        StreamError::new(error)
    }
}


// ==== buffer errors ====


/// Contract violation when using a buffer or subject
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BufferError {
    /// The buffer was already completed (explicitly or by an error) and accepts no more input
    #[error("buffer is already completed")]
    Completed,
    /// The reader id is not attached to this buffer
    #[error("unknown reader id {0}")]
    UnknownReader(ReaderId),
}

/// Error for reading from a buffer
#[derive(Error, Debug, Clone)]
pub enum ReadError {
    /// The reader reached an error written into the buffer
    #[error(transparent)]
    Upstream(StreamError),
    /// The reader id is not attached to this buffer
    #[error("unknown reader id {0}")]
    UnknownReader(ReaderId),
}


// ==== coroutine errors ====


/// Error for a request to a coroutine pool
#[derive(Error, Debug)]
pub enum CoroutineError {
    /// The pool has been finalized and no longer serves requests
    #[error("coroutine pool has been finalized")]
    Finalized,
    /// No reply arrived within the configured timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The task handler reported an error or panicked
    #[error("task failed on worker {worker_id}: {message}")]
    Task {
        /// Worker which ran the task
        worker_id: WorkerId,
        /// Rendered error or panic message
        message: String,
    },
    /// The task name was never registered
    #[error("no task registered under name {0:?}")]
    UnknownTask(String),
    /// The worker exited before replying
    #[error("worker {0} exited before replying")]
    WorkerLost(WorkerId),
    /// The worker thread could not be spawned
    #[error("failed to spawn worker thread")]
    Spawn(#[source] std::io::Error),
}
