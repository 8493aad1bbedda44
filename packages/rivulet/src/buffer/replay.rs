// bounded-or-unbounded multi-reader replay log.
//
// slots are addressed by absolute index (the number of writes before them). the retained slots
// are kept in a deque, `base` being the absolute index of its front. each slot carries a count of
// the readers which still owe it a read: a slot written while n readers are attached starts with
// n. a reader only decrements slots written after it attached, so late readers replaying history
// hold no claim on it.
//
// for bounded buffers, a semaphore tracks free slots. a write takes one permit and keeps it for as
// long as its slot's reader count is non-zero. because every reader moves forward in order, slot
// counts only ever reach zero front to back, so whenever the writer holds a permit and the deque
// is full, the front slot is free to evict.

use super::{Buffer, ReaderId};
use crate::{
    error::{BufferError, ReadError, StreamError},
    sync::Semaphore,
};
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::Mutex,
    task::{Context, Poll, Waker},
};


/// Capacity of a [`ReplayBuffer`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Capacity {
    /// Retain at most this many slots, applying backpressure to the writer
    Bounded(usize),
    /// Retain every slot forever
    Unbounded,
}

impl Capacity {
    /// Construct a bounded capacity
    ///
    /// Panics if `n` is zero, since a zero-slot buffer could never accept a write.
    pub fn bounded(n: usize) -> Self {
        assert!(n > 0, "replay buffer capacity must be non-zero");
        Capacity::Bounded(n)
    }

    /// The bound, if any
    pub fn bound(&self) -> Option<usize> {
        match *self {
            Capacity::Bounded(n) => Some(n),
            Capacity::Unbounded => None,
        }
    }
}


/// Buffer retaining a history of values, replayed to newly attached readers
///
/// A new reader starts at the oldest retained slot, so with a bounded capacity `c` it replays the
/// last `min(c, n)` of `n` writes. For bounded buffers, a write suspends while all `c` slots are
/// still owed to some attached reader, and resumes once the slowest such reader advances or
/// detaches.
pub struct ReplayBuffer<T> {
    capacity: Capacity,
    // free slot permits, for bounded buffers.
    free_slots: Option<Semaphore>,
    state: Mutex<State<T>>,
}

struct State<T> {
    slots: VecDeque<Slot<T>>,
    // absolute index of slots[0].
    base: u64,
    // absolute index one past the newest slot.
    total_written: u64,
    readers: HashMap<ReaderId, Cursor>,
    completed: bool,
    next_reader: u64,
}

struct Slot<T> {
    entry: Entry<T>,
    // attached readers which have not yet consumed this slot, among those counted on it.
    remaining: usize,
}

enum Entry<T> {
    Value(T),
    Error(StreamError),
}

struct Cursor {
    // absolute index of the next slot to read.
    offset: u64,
    // total_written at the time of attaching. the reader is counted on slots at or after this.
    attached_at: u64,
    waker: Option<Waker>,
}

impl<T> State<T> {
    fn wake_all(&mut self) {
        for cursor in self.readers.values_mut() {
            if let Some(waker) = cursor.waker.take() {
                waker.wake();
            }
        }
    }
}

impl<T> ReplayBuffer<T> {
    /// Construct empty with the given capacity
    pub fn new(capacity: Capacity) -> Self {
        if let Capacity::Bounded(n) = capacity {
            assert!(n > 0, "replay buffer capacity must be non-zero");
        }
        ReplayBuffer {
            capacity,
            free_slots: capacity.bound().map(Semaphore::new),
            state: Mutex::new(State {
                slots: VecDeque::new(),
                base: 0,
                total_written: 0,
                readers: HashMap::new(),
                completed: false,
                next_reader: 0,
            }),
        }
    }

    /// Construct empty with a bounded capacity
    pub fn bounded(n: usize) -> Self {
        ReplayBuffer::new(Capacity::bounded(n))
    }

    /// Construct empty with an unbounded capacity
    pub fn unbounded() -> Self {
        ReplayBuffer::new(Capacity::Unbounded)
    }

    /// The configured capacity
    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Number of slots currently retained
    pub fn retained(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    /// Number of values and errors ever written
    pub fn total_written(&self) -> u64 {
        self.state.lock().unwrap().total_written
    }

    // give a slot's permit back to the writer.
    fn free_slot(&self) {
        if let Some(free_slots) = &self.free_slots {
            free_slots.release();
        }
    }

    // write an entry, waiting for a free slot first if bounded.
    async fn push(&self, entry: Entry<T>) -> Result<(), BufferError> {
        if self.state.lock().unwrap().completed {
            return Err(BufferError::Completed);
        }
        if let Some(free_slots) = &self.free_slots {
            free_slots.acquire().await.forget();
        }

        let mut state = self.state.lock().unwrap();
        if state.completed {
            // completed while we were waiting
            drop(state);
            self.free_slot();
            return Err(BufferError::Completed);
        }
        if let Some(bound) = self.capacity.bound() {
            if state.slots.len() == bound {
                let evicted = state.slots.pop_front();
                debug_assert!(evicted.is_some_and(|slot| slot.remaining == 0));
                state.base += 1;
            }
        }
        let remaining = state.readers.len();
        let completes = matches!(entry, Entry::Error(_));
        state.slots.push_back(Slot { entry, remaining });
        state.total_written += 1;
        state.completed |= completes;
        state.wake_all();
        drop(state);
        if remaining == 0 {
            // nobody owes this slot a read, so it is free to evict right away
            self.free_slot();
        }
        Ok(())
    }
}

impl<T: Clone + Send + 'static> Buffer<T> for ReplayBuffer<T> {
    fn attach_reader(&self) -> ReaderId {
        let mut state = self.state.lock().unwrap();
        let id = ReaderId(state.next_reader);
        state.next_reader += 1;
        let cursor = Cursor {
            offset: state.base,
            attached_at: state.total_written,
            waker: None,
        };
        state.readers.insert(id, cursor);
        id
    }

    fn detach_reader(&self, reader: ReaderId) -> Result<(), BufferError> {
        let mut state = self.state.lock().unwrap();
        let cursor = state.readers.remove(&reader).ok_or(BufferError::UnknownReader(reader))?;

        // release this reader's claims on slots it was counted on but never consumed
        let first = cursor.offset.max(cursor.attached_at).max(state.base);
        let base = state.base;
        let mut freed = 0;
        for abs in first..state.total_written {
            let slot = &mut state.slots[(abs - base) as usize];
            slot.remaining -= 1;
            if slot.remaining == 0 {
                freed += 1;
            }
        }
        drop(state);
        for _ in 0..freed {
            self.free_slot();
        }
        Ok(())
    }

    fn poll_read(&self, reader: ReaderId, cx: &mut Context) -> Poll<Result<Option<T>, ReadError>> {
        let mut state = self.state.lock().unwrap();
        let State { slots, base, total_written, readers, completed, .. } = &mut *state;
        let Some(cursor) = readers.get_mut(&reader) else {
            return Poll::Ready(Err(ReadError::UnknownReader(reader)));
        };

        if cursor.offset < *base {
            // only uncounted replay slots can be evicted from under a reader
            debug_assert!(*base <= cursor.attached_at);
            trace!(
                reader = %reader,
                skipped = *base - cursor.offset,
                "replay reader fell behind eviction, fast-forwarding",
            );
            cursor.offset = *base;
        }

        if cursor.offset < *total_written {
            let abs = cursor.offset;
            cursor.offset += 1;
            let counted = abs >= cursor.attached_at;
            let slot = &mut slots[(abs - *base) as usize];
            let result = match &slot.entry {
                Entry::Value(value) => Ok(Some(value.clone())),
                Entry::Error(error) => Err(ReadError::Upstream(error.clone())),
            };
            let freed = if counted {
                slot.remaining -= 1;
                slot.remaining == 0
            } else {
                false
            };
            drop(state);
            if freed {
                self.free_slot();
            }
            return Poll::Ready(result);
        }
        if *completed {
            return Poll::Ready(Ok(None));
        }
        cursor.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn write(&self, value: T) -> impl Future<Output = Result<(), BufferError>> + Send + '_ {
        self.push(Entry::Value(value))
    }

    fn error(&self, error: StreamError) -> impl Future<Output = Result<(), BufferError>> + Send + '_ {
        self.push(Entry::Error(error))
    }

    fn complete(&self) -> Result<(), BufferError> {
        let mut state = self.state.lock().unwrap();
        if state.completed {
            return Err(BufferError::Completed);
        }
        state.completed = true;
        state.wake_all();
        Ok(())
    }

    fn is_completed(&self) -> bool {
        self.state.lock().unwrap().completed
    }

    fn reader_count(&self) -> usize {
        self.state.lock().unwrap().readers.len()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use rand::prelude::*;
    use rand_pcg::Pcg32;
    use std::collections::VecDeque;

    fn new_rng() -> impl Rng {
        Pcg32::from_seed(0xdeadbeefdeadbeefdeadbeefdeadbeefu128.to_le_bytes())
    }

    fn write_now<T: Clone + Send + 'static>(buffer: &ReplayBuffer<T>, value: T) -> bool {
        match buffer.write(value).now_or_never() {
            Some(result) => {
                result.unwrap();
                true
            }
            None => false,
        }
    }

    fn read_now<T: Clone + Send + 'static>(
        buffer: &ReplayBuffer<T>,
        reader: ReaderId,
    ) -> Option<Option<T>> {
        buffer.read(reader).now_or_never().map(|result| result.unwrap())
    }

    fn drain<T: Clone + Send + 'static>(buffer: &ReplayBuffer<T>, reader: ReaderId) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(Some(value)) = read_now(buffer, reader) {
            out.push(value);
        }
        out
    }

    #[test]
    fn late_reader_replays_retained_tail() {
        let buffer = ReplayBuffer::bounded(3);
        let early = buffer.attach_reader();
        for i in 0..10 {
            assert!(write_now(&buffer, i), "write {} blocked", i);
            assert_eq!(read_now(&buffer, early), Some(Some(i)));
        }
        let late = buffer.attach_reader();
        assert_eq!(drain(&buffer, late), vec![7, 8, 9]);
        assert_eq!(buffer.retained(), 3);
        assert_eq!(buffer.total_written(), 10);
    }

    #[test]
    fn writes_without_readers_never_block() {
        let buffer = ReplayBuffer::bounded(2);
        for i in 1..=3 {
            assert!(write_now(&buffer, i));
        }
        let reader = buffer.attach_reader();
        assert_eq!(drain(&buffer, reader), vec![2, 3]);
    }

    #[test]
    fn unbounded_reader_replays_everything() {
        let buffer = ReplayBuffer::unbounded();
        for i in 0..100 {
            assert!(write_now(&buffer, i));
        }
        let reader = buffer.attach_reader();
        assert_eq!(drain(&buffer, reader), (0..100).collect::<Vec<_>>());
        buffer.complete().unwrap();
        assert_eq!(read_now(&buffer, reader), Some(None));
    }

    #[test]
    fn full_buffer_suspends_writer_until_reader_advances() {
        let buffer = ReplayBuffer::bounded(2);
        let reader = buffer.attach_reader();
        assert!(write_now(&buffer, 1));
        assert!(write_now(&buffer, 2));

        let mut blocked = Box::pin(buffer.write(3));
        assert!((&mut blocked).now_or_never().is_none());

        assert_eq!(read_now(&buffer, reader), Some(Some(1)));
        assert_eq!((&mut blocked).now_or_never(), Some(Ok(())));
        assert_eq!(drain(&buffer, reader), vec![2, 3]);
    }

    #[test]
    fn detaching_slow_reader_unblocks_writer() {
        let buffer = ReplayBuffer::bounded(2);
        let slow = buffer.attach_reader();
        let fast = buffer.attach_reader();
        assert!(write_now(&buffer, 1));
        assert!(write_now(&buffer, 2));
        assert_eq!(drain(&buffer, fast), vec![1, 2]);
        assert!(!write_now(&buffer, 3));

        buffer.detach_reader(slow).unwrap();
        assert!(write_now(&buffer, 3));
        assert_eq!(drain(&buffer, fast), vec![3]);
        assert_eq!(buffer.reader_count(), 1);
    }

    #[test]
    fn error_is_replayed_and_completes() {
        let buffer = ReplayBuffer::unbounded();
        let reader = buffer.attach_reader();
        assert!(write_now(&buffer, 1));
        buffer.error(StreamError::msg("bad")).now_or_never().unwrap().unwrap();
        assert!(buffer.is_completed());
        assert_eq!(buffer.write(2).now_or_never(), Some(Err(BufferError::Completed)));

        assert_eq!(read_now(&buffer, reader), Some(Some(1)));
        match buffer.read(reader).now_or_never() {
            Some(Err(ReadError::Upstream(error))) => assert_eq!(error.to_string(), "bad"),
            other => panic!("unexpected read result {:?}", other),
        }
        assert_eq!(read_now(&buffer, reader), Some(None));

        // a reader attaching afterwards still sees the history, error included
        let late = buffer.attach_reader();
        assert_eq!(read_now(&buffer, late), Some(Some(1)));
        assert!(matches!(buffer.read(late).now_or_never(), Some(Err(ReadError::Upstream(_)))));
    }

    #[test]
    fn complete_while_writer_waits_rejects_write() {
        let buffer = ReplayBuffer::bounded(1);
        let reader = buffer.attach_reader();
        assert!(write_now(&buffer, 1));
        let mut blocked = Box::pin(buffer.write(2));
        assert!((&mut blocked).now_or_never().is_none());
        buffer.complete().unwrap();
        assert_eq!(read_now(&buffer, reader), Some(Some(1)));
        assert_eq!((&mut blocked).now_or_never(), Some(Err(BufferError::Completed)));
        assert_eq!(read_now(&buffer, reader), Some(None));
    }

    // model-based stochastic test comparing against per-reader reference queues.
    #[test]
    fn stochastic_equivalence() {
        let mut rng = new_rng();

        for outer in 0..50 {
            let cap = rng.gen_range(1..6);
            let buffer = ReplayBuffer::bounded(cap);
            // reference model: retained history, and per reader its pending values plus the
            // number of those it is counted on (i.e. that it can block the writer for)
            let mut history = VecDeque::<u32>::new();
            let mut readers = Vec::<(ReaderId, VecDeque<u32>)>::new();
            let mut next = 0u32;
            println!("outer loop {}", outer);

            for _ in 0..2_000 {
                let roll = rng.gen_range(0..100);
                if roll < 40 {
                    // write: blocks exactly when some reader still owes a read on `cap` slots
                    let owed = readers.iter().map(|(_, pending)| pending.len()).max().unwrap_or(0);
                    let expect_block = owed >= cap;
                    let wrote = write_now(&buffer, next);
                    assert_eq!(wrote, !expect_block, "write blocking mismatch");
                    if wrote {
                        history.push_back(next);
                        if history.len() > cap {
                            history.pop_front();
                        }
                        for (_, pending) in &mut readers {
                            pending.push_back(next);
                        }
                        next += 1;
                    }
                } else if roll < 85 && !readers.is_empty() {
                    let i = rng.gen_range(0..readers.len());
                    let (id, pending) = &mut readers[i];
                    let expect = pending.pop_front();
                    match read_now(&buffer, *id) {
                        Some(Some(value)) => assert_eq!(Some(value), expect),
                        Some(None) => panic!("buffer ended unexpectedly"),
                        None => assert_eq!(expect, None),
                    }
                } else if roll < 93 || readers.is_empty() {
                    let id = buffer.attach_reader();
                    // replayed values are delivered but not owed, so model them separately
                    let replay = drain(&buffer, id);
                    assert_eq!(replay, history.iter().copied().collect::<Vec<_>>());
                    readers.push((id, VecDeque::new()));
                } else {
                    let i = rng.gen_range(0..readers.len());
                    let (id, _) = readers.swap_remove(i);
                    buffer.detach_reader(id).unwrap();
                }
                assert_eq!(buffer.retained(), history.len());
                assert_eq!(buffer.reader_count(), readers.len());
            }
        }
    }
}
