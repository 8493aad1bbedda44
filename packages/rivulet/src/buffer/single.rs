// one-slot buffer with a monotonic version counter.
//
// every write bumps the version. each reader remembers the last version it observed, and a read
// either returns the current slot (if the reader is behind) or suspends. readers which are more
// than one version behind are fast-forwarded to the newest value, so a write never waits.

use super::{Buffer, ReaderId};
use crate::error::{BufferError, ReadError, StreamError};
use std::{
    collections::HashMap,
    future::{ready, Future},
    sync::Mutex,
    task::{Context, Poll, Waker},
};


/// Buffer holding only the newest value
///
/// Readers attach at the current version, so they only see values written after they attached.
pub struct SingleValueBuffer<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    value: Option<T>,
    // set by an error write. cleared by a value write, but errors complete the buffer so that
    // never happens in practice.
    error: Option<StreamError>,
    // invariant: every reader's last_seen <= version.
    version: u64,
    completed: bool,
    readers: HashMap<ReaderId, ReaderState>,
    next_reader: u64,
}

struct ReaderState {
    last_seen: u64,
    // waker of a suspended read, if any.
    waker: Option<Waker>,
}

impl<T> State<T> {
    // wake every suspended reader.
    fn wake_all(&mut self) {
        for reader in self.readers.values_mut() {
            if let Some(waker) = reader.waker.take() {
                waker.wake();
            }
        }
    }
}

impl<T> SingleValueBuffer<T> {
    /// Construct empty, at version 0
    pub fn new() -> Self {
        SingleValueBuffer {
            state: Mutex::new(State {
                value: None,
                error: None,
                version: 0,
                completed: false,
                readers: HashMap::new(),
                next_reader: 0,
            }),
        }
    }

    /// Current version, incremented by every value or error write
    pub fn version(&self) -> u64 {
        self.state.lock().unwrap().version
    }

    // store a value. never suspends.
    fn write_now(&self, value: T) -> Result<(), BufferError> {
        let mut state = self.state.lock().unwrap();
        if state.completed {
            return Err(BufferError::Completed);
        }
        state.version += 1;
        state.value = Some(value);
        state.error = None;
        state.wake_all();
        Ok(())
    }

    // store an error and complete. never suspends.
    fn error_now(&self, error: StreamError) -> Result<(), BufferError> {
        let mut state = self.state.lock().unwrap();
        if state.completed {
            return Err(BufferError::Completed);
        }
        state.version += 1;
        state.error = Some(error);
        state.completed = true;
        state.wake_all();
        Ok(())
    }
}

impl<T> Default for SingleValueBuffer<T> {
    fn default() -> Self {
        SingleValueBuffer::new()
    }
}

impl<T: Clone + Send + 'static> Buffer<T> for SingleValueBuffer<T> {
    fn attach_reader(&self) -> ReaderId {
        let mut state = self.state.lock().unwrap();
        let id = ReaderId(state.next_reader);
        state.next_reader += 1;
        let last_seen = state.version;
        state.readers.insert(id, ReaderState { last_seen, waker: None });
        id
    }

    fn detach_reader(&self, reader: ReaderId) -> Result<(), BufferError> {
        self.state.lock().unwrap()
            .readers
            .remove(&reader)
            .map(drop)
            .ok_or(BufferError::UnknownReader(reader))
    }

    fn poll_read(&self, reader: ReaderId, cx: &mut Context) -> Poll<Result<Option<T>, ReadError>> {
        let mut state = self.state.lock().unwrap();
        let State { value, error, version, completed, readers, .. } = &mut *state;
        let Some(cursor) = readers.get_mut(&reader) else {
            return Poll::Ready(Err(ReadError::UnknownReader(reader)));
        };
        debug_assert!(cursor.last_seen <= *version);

        if cursor.last_seen < *version {
            // fast-forward to the newest version
            cursor.last_seen = *version;
            if let Some(error) = error {
                return Poll::Ready(Err(ReadError::Upstream(error.clone())));
            }
            let value = value.clone().expect("version advanced without value or error");
            return Poll::Ready(Ok(Some(value)));
        }
        if *completed {
            return Poll::Ready(Ok(None));
        }
        cursor.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn write(&self, value: T) -> impl Future<Output = Result<(), BufferError>> + Send + '_ {
        ready(self.write_now(value))
    }

    fn error(&self, error: StreamError) -> impl Future<Output = Result<(), BufferError>> + Send + '_ {
        ready(self.error_now(error))
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
