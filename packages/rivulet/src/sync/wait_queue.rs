// FIFO queue of suspended acquirers, shared by the lock and the semaphore.
//
// each pending acquire future owns one waiter entry, identified by an id, with a slot for
// storing a Waker. the entries form a queue which is used to achieve fairness: a release never
// makes the resource observably free while someone is waiting, it instead hands ownership to the
// front entry directly by moving it into the granted set. the acquire future then observes the
// grant on its next poll, or passes ownership on if it is dropped first.

use std::{
    collections::{HashSet, VecDeque},
    task::Waker,
};


#[derive(Default)]
pub(crate) struct WaitQueue {
    // entries which have not yet been granted ownership, front to back.
    waiting: VecDeque<Waiter>,
    // ids of entries which have been granted ownership but have not yet observed it.
    granted: HashSet<u64>,
    // next id to mint.
    next_id: u64,
}

struct Waiter {
    id: u64,
    waker: Option<Waker>,
}

impl WaitQueue {
    // construct empty queue.
    pub(crate) fn new() -> Self {
        WaitQueue::default()
    }

    // whether there are entries still waiting to be granted.
    pub(crate) fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    // number of entries still waiting to be granted.
    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }

    // link a new entry to the back of the queue and return its id.
    pub(crate) fn push(&mut self, waker: &Waker) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.waiting.push_back(Waiter { id, waker: Some(waker.clone()) });
        id
    }

    // replace the stored waker of a waiting entry, unless it would wake the same task anyway.
    pub(crate) fn update_waker(&mut self, id: u64, waker: &Waker) {
        if let Some(waiter) = self.waiting.iter_mut().find(|waiter| waiter.id == id) {
            if !waiter.waker.as_ref().is_some_and(|old| old.will_wake(waker)) {
                waiter.waker = Some(waker.clone());
            }
        }
    }

    // if the entry has been granted ownership, claim it.
    pub(crate) fn take_grant(&mut self, id: u64) -> bool {
        self.granted.remove(&id)
    }

    // unlink an entry which has not been granted. returns whether it was found.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let Some(idx) = self.waiting.iter().position(|waiter| waiter.id == id) else {
            return false;
        };
        self.waiting.remove(idx);
        true
    }

    // transfer ownership to the front entry and wake it. returns false if nobody is waiting.
    pub(crate) fn hand_off(&mut self) -> bool {
        let Some(waiter) = self.waiting.pop_front() else { return false };
        self.granted.insert(waiter.id);
        if let Some(waker) = waiter.waker {
            waker.wake();
        }
        true
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    #[test]
    fn hand_off_is_fifo() {
        let waker = noop_waker();
        let mut queue = WaitQueue::new();
        let a = queue.push(&waker);
        let b = queue.push(&waker);
        assert_eq!(queue.len(), 2);

        assert!(queue.hand_off());
        assert!(!queue.take_grant(b));
        assert!(queue.take_grant(a));
        assert!(!queue.take_grant(a));

        assert!(queue.hand_off());
        assert!(queue.take_grant(b));
        assert!(!queue.hand_off());
        assert!(queue.is_empty());
    }

    #[test]
    fn removed_waiter_is_skipped() {
        let waker = noop_waker();
        let mut queue = WaitQueue::new();
        let a = queue.push(&waker);
        let b = queue.push(&waker);
        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert!(queue.hand_off());
        assert!(queue.take_grant(b));
    }
}
