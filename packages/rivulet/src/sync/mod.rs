//! Low-level synchronization primitives.
//!
//! Both primitives are plain futures driven by wakers, so they work under any executor. Their
//! acquire futures also expose blocking variants for use from threads with no executor, such as
//! coroutine worker threads.

mod lock;
mod polling;
mod semaphore;
mod wait_queue;

pub use self::{
    lock::{Lock, LockAcquire, LockGuard},
    semaphore::{Permit, Semaphore, SemaphoreAcquire},
};
