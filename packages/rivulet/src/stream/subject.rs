//! Multicast sources backed by a buffer.

use super::{Observer, Pull, Stream, Subscription};
use crate::{
    buffer::{Buffer, Capacity, ReaderId, ReplayBuffer, SingleValueBuffer},
    error::{BufferError, ReadError, StreamError},
    sync::Lock,
};
use futures::{stream, StreamExt};
use std::{
    fmt::{self, Debug, Formatter},
    marker::PhantomData,
    sync::Arc,
};


/// Multicast source: values pushed in are delivered to every attached reader
///
/// Writes (`next`, `error`, `complete`) are serialized so that concurrent producers cannot
/// interleave within the buffer. What a late subscriber sees depends on the buffer: a
/// [`SingleValueBuffer`] (the default) delivers only values written after it attached, a
/// [`ReplayBuffer`] first replays retained history.
pub struct Subject<T, B = SingleValueBuffer<T>> {
    shared: Arc<SubjectShared<B>>,
    _item: PhantomData<fn(T) -> T>,
}

/// Subject which replays history to late subscribers
pub type ReplaySubject<T> = Subject<T, ReplayBuffer<T>>;

struct SubjectShared<B> {
    buffer: B,
    writes: Lock,
}

impl<T: Clone + Send + 'static> Subject<T> {
    /// Construct over a [`SingleValueBuffer`]
    pub fn new() -> Self {
        Subject::with_buffer(SingleValueBuffer::new())
    }
}

impl<T: Clone + Send + 'static> Subject<T, ReplayBuffer<T>> {
    /// Construct over a [`ReplayBuffer`] of the given capacity
    pub fn replay(capacity: Capacity) -> Self {
        Subject::with_buffer(ReplayBuffer::new(capacity))
    }
}

impl<T, B> Subject<T, B>
where
    T: Clone + Send + 'static,
    B: Buffer<T>,
{
    /// Construct over any buffer
    pub fn with_buffer(buffer: B) -> Self {
        Subject {
            shared: Arc::new(SubjectShared { buffer, writes: Lock::new() }),
            _item: PhantomData,
        }
    }

    /// Push a value to every reader, waiting for earlier writes and for buffer backpressure
    pub async fn next(&self, value: T) -> Result<(), BufferError> {
        let _guard = self.shared.writes.acquire().await;
        self.shared.buffer.write(value).await
    }

    /// Push a terminal error, which completes the subject
    pub async fn error(&self, error: StreamError) -> Result<(), BufferError> {
        let _guard = self.shared.writes.acquire().await;
        self.shared.buffer.error(error).await
    }

    /// Complete the subject. Readers end once they have caught up.
    pub async fn complete(&self) -> Result<(), BufferError> {
        let _guard = self.shared.writes.acquire().await;
        self.shared.buffer.complete()
    }

    /// Whether the subject has been completed or errored
    pub fn completed(&self) -> bool {
        self.shared.buffer.is_completed()
    }

    /// Number of attached readers, one per live pull iterator
    pub fn subscriber_count(&self) -> usize {
        self.shared.buffer.reader_count()
    }

    /// The underlying buffer
    pub fn buffer(&self) -> &B {
        &self.shared.buffer
    }

    /// Lazy stream over this subject
    ///
    /// Each pull iterator made from it attaches its own reader, and detaches when dropped.
    pub fn stream(&self) -> Stream<T> {
        let shared = Arc::clone(&self.shared);
        Stream::new(move || read_subject(Arc::clone(&shared)))
    }

    /// Subscribe an observer directly. The reader is attached before this returns.
    ///
    /// Panics if called outside a tokio runtime.
    pub fn subscribe(&self, observer: Observer<T>) -> Subscription {
        self.stream().subscribe(observer)
    }
}

impl<T, B> Clone for Subject<T, B> {
    fn clone(&self) -> Self {
        Subject {
            shared: Arc::clone(&self.shared),
            _item: PhantomData,
        }
    }
}

impl<T: Clone + Send + 'static> Default for Subject<T> {
    fn default() -> Self {
        Subject::new()
    }
}

impl<T, B> Debug for Subject<T, B>
where
    T: Clone + Send + 'static,
    B: Buffer<T>,
{
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Subject")
            .field("subscribers", &self.subscriber_count())
            .field("completed", &self.completed())
            .finish()
    }
}

// detaches the reader when the pull iterator is dropped, however it ends.
struct ReaderGuard<T, B: Buffer<T>> {
    shared: Arc<SubjectShared<B>>,
    reader: ReaderId,
    _item: PhantomData<fn(T) -> T>,
}

impl<T, B: Buffer<T>> Drop for ReaderGuard<T, B> {
    fn drop(&mut self) {
        if let Err(e) = self.shared.buffer.detach_reader(self.reader) {
            trace!(%e, "reader already detached");
        }
    }
}

fn read_subject<T, B>(shared: Arc<SubjectShared<B>>) -> Pull<T>
where
    T: Clone + Send + 'static,
    B: Buffer<T>,
{
    let reader = shared.buffer.attach_reader();
    let guard = ReaderGuard { shared, reader, _item: PhantomData };
    stream::unfold(Some(guard), |guard| async move {
        let guard = guard?;
        let result = guard.shared.buffer.read(guard.reader).await;
        match result {
            Ok(Some(value)) => Some((Ok(value), Some(guard))),
            Ok(None) => None,
            // errors are terminal, so the reader is released right away
            Err(ReadError::Upstream(error)) => Some((Err(error), None)),
            Err(e @ ReadError::UnknownReader(_)) => Some((Err(StreamError::new(e)), None)),
        }
    }).boxed()
}
