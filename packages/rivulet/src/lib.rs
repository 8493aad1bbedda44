//! Reactive streams over multi-reader buffers, with a worker thread pool for offloading CPU-bound
//! pipeline stages.
//!
//! - [`sync`]: FIFO-fair async [`Lock`] and [`Semaphore`], usable from blocking code too.
//! - [`buffer`]: [`SingleValueBuffer`] and [`ReplayBuffer`], written by one producer and read by
//!   many independent readers.
//! - [`stream`]: lazy [`Stream`]s, [`Subject`]s, operators, and subscriptions.
//! - [`coroutine`]: the [`Coroutine`] worker pool.

#[macro_use]
extern crate tracing;

pub mod buffer;
pub mod coroutine;
pub mod error;
pub mod stream;
pub mod sync;

pub use crate::{
    buffer::{Buffer, Capacity, ReplayBuffer, SingleValueBuffer},
    coroutine::{Coroutine, CoroutineConfig, TaskRegistry, WorkerLease},
    stream::{Observer, Operator, ReplaySubject, Stream, Subject, Subscription},
    sync::{Lock, Semaphore},
};

/// Future types
pub mod future {
    pub use crate::sync::{LockAcquire, SemaphoreAcquire};
}
