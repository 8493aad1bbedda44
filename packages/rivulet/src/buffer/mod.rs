//! Multi-reader buffers underlying subjects.
//!
//! A buffer is written by one logical producer (a subject serializes its callers) and read by
//! any number of attached readers, each with its own cursor. Two implementations exist:
//!
//! - [`SingleValueBuffer`] keeps only the newest value. Readers that fall behind skip straight to
//!   it, so the writer never waits.
//! - [`ReplayBuffer`] keeps a bounded or unbounded history, replays it to newly attached
//!   readers, and applies backpressure to the writer while every retained slot is still owed to
//!   some reader.

mod replay;
mod single;

pub use self::{
    replay::{Capacity, ReplayBuffer},
    single::SingleValueBuffer,
};
use crate::error::{BufferError, ReadError, StreamError};
use std::{
    fmt::{self, Display, Formatter},
    future::{poll_fn, Future},
    task::{Context, Poll},
};


/// Identifier of a reader attached to a buffer
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ReaderId(pub(crate) u64);

impl Display for ReaderId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Multi-reader buffer with per-reader cursors
///
/// Reads resolve to `Ok(Some(value))` for the next value, `Ok(None)` once the buffer is
/// completed and the reader has caught up, or `Err` when the reader reaches an error written
/// into the buffer. An error is delivered exactly once per reader and implicitly completes the
/// buffer.
pub trait Buffer<T>: Send + Sync + 'static {
    /// Register a new reader and return its id
    fn attach_reader(&self) -> ReaderId;

    /// Remove a reader, releasing anything the writer may be waiting on for its sake
    fn detach_reader(&self, reader: ReaderId) -> Result<(), BufferError>;

    /// Poll the next read for a reader
    fn poll_read(&self, reader: ReaderId, cx: &mut Context) -> Poll<Result<Option<T>, ReadError>>;

    /// Read the next value for a reader, suspending until one is available
    fn read(&self, reader: ReaderId) -> impl Future<Output = Result<Option<T>, ReadError>> + Send + '_ {
        poll_fn(move |cx| self.poll_read(reader, cx))
    }

    /// Write a value, suspending while the buffer applies backpressure
    fn write(&self, value: T) -> impl Future<Output = Result<(), BufferError>> + Send + '_;

    /// Write a terminal error, which also completes the buffer
    fn error(&self, error: StreamError) -> impl Future<Output = Result<(), BufferError>> + Send + '_;

    /// Complete the buffer, so that readers end once they have caught up
    fn complete(&self) -> Result<(), BufferError>;

    /// Whether the buffer has been completed or errored
    fn is_completed(&self) -> bool;

    /// Number of currently attached readers
    fn reader_count(&self) -> usize;
}
