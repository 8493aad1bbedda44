//! Pool of worker threads for offloading CPU-bound work off the async runtime.
//!
//! A [`Coroutine`] maintains up to `concurrency` worker units, each an OS thread. Callers lease a
//! unit with [`acquire`](Coroutine::acquire) (or let [`process_task`](Coroutine::process_task)
//! lease one for a single request), send it requests naming a task from the pool's
//! [`TaskRegistry`], and await the correlated reply. Leases return the unit when dropped. When
//! every unit is busy and the pool is at capacity, acquirers queue in FIFO order.
//!
//! Replies flow back over a single event channel drained by a router task, which resolves pending
//! calls by message id, fans broadcast replies out to listeners, and replaces units which exit.
//!
//! Must be constructed inside a tokio runtime.

mod config;
mod message;
mod registry;
mod worker;

pub use self::{
    config::CoroutineConfig,
    message::{MessageId, Request, RequestKind, Response, WorkerId},
    registry::{BroadcastHandler, TaskHandler, TaskRegistry},
};

use self::{
    message::Event,
    worker::WorkerParams,
};
use crate::error::CoroutineError;
use dashmap::DashMap;
use smallvec::SmallVec;
use std::{
    collections::{HashMap, VecDeque},
    fmt::{self, Debug, Formatter},
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc as std_mpsc,
        Arc,
        Mutex,
        Weak,
    },
};
use tokio::{
    sync::{mpsc, oneshot},
    task::AbortHandle,
};


/// Pool of worker threads, see module level docs
///
/// Cheap to clone. The pool is finalized when the last handle (and last lease) is dropped.
pub struct Coroutine<P>(Arc<Shared<P>>);

/// Exclusive use of one worker unit until dropped
///
/// Dropping the lease returns the unit to the pool: to the oldest queued acquirer if there is one,
/// otherwise to the idle set.
pub struct WorkerLease<P> {
    coroutine: Coroutine<P>,
    // none once the unit has been handed elsewhere.
    worker_id: Option<WorkerId>,
    requests: std_mpsc::Sender<Request<P>>,
}

/// Registration of a broadcast listener
///
/// Dropping this does not unregister the listener; call
/// [`unsubscribe`](BroadcastSubscription::unsubscribe).
pub struct BroadcastSubscription<P> {
    shared: Weak<Shared<P>>,
    id: u64,
}

type Listener<P> = Arc<dyn Fn(WorkerId, &P) + Send + Sync>;

struct Shared<P> {
    config: CoroutineConfig,
    registry: Arc<TaskRegistry<P>>,
    pool: Mutex<Pool<P>>,
    pending: DashMap<MessageId, Pending<P>>,
    listeners: Mutex<Listeners<P>>,
    next_message_id: AtomicU64,
    events: mpsc::UnboundedSender<Event<P>>,
    router: AbortHandle,
}

struct Pool<P> {
    // every live unit, leased or idle.
    workers: HashMap<WorkerId, std_mpsc::Sender<Request<P>>>,
    idle: VecDeque<WorkerId>,
    waiting: VecDeque<oneshot::Sender<WorkerLease<P>>>,
    next_worker_id: u64,
    finalized: bool,
}

struct Pending<P> {
    worker_id: WorkerId,
    reply: oneshot::Sender<Result<P, CoroutineError>>,
}

struct Listeners<P> {
    next_id: u64,
    // (id, only this worker's replies if some, callback)
    entries: Vec<(u64, Option<WorkerId>, Listener<P>)>,
}


// ==== the pool ====


impl<P: Send + 'static> Coroutine<P> {
    /// Construct with the given handlers and configuration. Spawns no worker until one is needed.
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(registry: TaskRegistry<P>, config: CoroutineConfig) -> Self {
        let (events, events_recv) = mpsc::unbounded_channel();
        let shared = Arc::new_cyclic(|weak| Shared {
            config,
            registry: Arc::new(registry),
            pool: Mutex::new(Pool {
                workers: HashMap::new(),
                idle: VecDeque::new(),
                waiting: VecDeque::new(),
                next_worker_id: 0,
                finalized: false,
            }),
            pending: DashMap::new(),
            listeners: Mutex::new(Listeners { next_id: 0, entries: Vec::new() }),
            next_message_id: AtomicU64::new(0),
            events,
            router: tokio::spawn(route(weak.clone(), events_recv)).abort_handle(),
        });
        Coroutine(shared)
    }

    /// Lease a worker unit, spawning one if under capacity or waiting for one otherwise
    ///
    /// Errors with [`CoroutineError::Finalized`] if the pool is or becomes finalized.
    pub async fn acquire(&self) -> Result<WorkerLease<P>, CoroutineError> {
        let wait = {
            let mut pool = self.0.pool.lock().unwrap();
            if pool.finalized {
                return Err(CoroutineError::Finalized);
            }
            if let Some(worker_id) = pool.idle.pop_front() {
                let requests = pool.workers[&worker_id].clone();
                return Ok(self.lease(worker_id, requests));
            }
            if pool.workers.len() < self.0.config.concurrency() {
                let (worker_id, requests) = self.spawn_worker(&mut pool)?;
                return Ok(self.lease(worker_id, requests));
            }
            let (send, recv) = oneshot::channel();
            pool.prune_waiting();
            pool.waiting.push_back(send);
            trace!(waiting = pool.waiting.len(), "all workers busy, queueing acquirer");
            recv
        };
        wait.await.map_err(|_| CoroutineError::Finalized)
    }

    /// Lease a unit, run one task on it, and return the unit
    pub async fn process_task(&self, task: &str, input: P) -> Result<P, CoroutineError> {
        if !self.0.registry.contains(task) {
            return Err(CoroutineError::UnknownTask(task.to_owned()));
        }
        let lease = self.acquire().await?;
        lease.process(task, input).await
    }

    /// Register a callback for broadcast replies from every worker
    pub fn subscribe<F>(&self, callback: F) -> BroadcastSubscription<P>
    where
        F: Fn(WorkerId, &P) + Send + Sync + 'static,
    {
        self.add_listener(None, Arc::new(callback))
    }

    /// Register a callback for broadcast replies from one worker
    pub fn subscribe_worker<F>(&self, worker_id: WorkerId, callback: F) -> BroadcastSubscription<P>
    where
        F: Fn(WorkerId, &P) + Send + Sync + 'static,
    {
        self.add_listener(Some(worker_id), Arc::new(callback))
    }

    /// Shut down every unit and reject every waiting acquirer and pending call with
    /// [`CoroutineError::Finalized`]. Idempotent.
    ///
    /// Units finish the handler they are currently running, if any, before their thread exits.
    pub fn finalize(&self) {
        self.0.finalize();
    }

    /// Whether [`finalize`](Self::finalize) has been called
    pub fn is_finalized(&self) -> bool {
        self.0.pool.lock().unwrap().finalized
    }

    /// Number of live worker units, leased or idle
    pub fn worker_count(&self) -> usize {
        self.0.pool.lock().unwrap().workers.len()
    }

    /// Number of idle worker units
    pub fn idle_count(&self) -> usize {
        self.0.pool.lock().unwrap().idle.len()
    }

    /// Number of acquirers waiting for a unit. Cancelled acquirers are not counted.
    pub fn waiting_count(&self) -> usize {
        let mut pool = self.0.pool.lock().unwrap();
        pool.prune_waiting();
        pool.waiting.len()
    }

    /// Number of task requests awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.0.pending.len()
    }

    /// The pool's configuration
    pub fn config(&self) -> &CoroutineConfig {
        &self.0.config
    }

    fn add_listener(&self, worker: Option<WorkerId>, callback: Listener<P>) -> BroadcastSubscription<P> {
        let mut listeners = self.0.listeners.lock().unwrap();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, worker, callback));
        BroadcastSubscription {
            shared: Arc::downgrade(&self.0),
            id,
        }
    }

    // ==== router side ====

    fn resolve(&self, worker_id: WorkerId, message_id: MessageId, result: Result<P, String>) {
        match self.0.pending.remove(&message_id) {
            Some((_, pending)) => {
                trace!(%worker_id, %message_id, "resolving task reply");
                let result = result.map_err(|message| CoroutineError::Task { worker_id, message });
                let _ = pending.reply.send(result);
            }
            None => trace!(%worker_id, %message_id, "reply to unknown or expired request, dropping"),
        }
    }

    fn notify_listeners(&self, worker_id: WorkerId, payload: &P) {
        let targets: SmallVec<[Listener<P>; 4]> = self.0.listeners.lock().unwrap()
            .entries
            .iter()
            .filter(|(_, worker, _)| worker.map_or(true, |worker| worker == worker_id))
            .map(|(_, _, callback)| Arc::clone(callback))
            .collect();
        if targets.is_empty() {
            trace!(%worker_id, "broadcast reply with no listeners");
        }
        for callback in targets {
            callback(worker_id, payload);
        }
    }

    // take the unit out of the pool, handing a replacement to the oldest waiter if there is one.
    // leaves its pending calls alone, since a retiring unit still replies to the current one.
    fn retire(&self, worker_id: WorkerId) {
        let replacement = {
            let mut pool = self.0.pool.lock().unwrap();
            if pool.workers.remove(&worker_id).is_none() {
                return;
            }
            pool.idle.retain(|&idle| idle != worker_id);
            pool.prune_waiting();
            debug!(%worker_id, workers = pool.workers.len(), "worker retired");
            if !pool.finalized
                && !pool.waiting.is_empty()
                && pool.workers.len() < self.0.config.concurrency()
            {
                Some(self.spawn_worker(&mut pool))
            } else {
                None
            }
        };

        match replacement {
            Some(Ok((replacement, _))) => self.return_worker(replacement),
            Some(Err(e)) => error!(%e, "failed to replace retired worker"),
            None => (),
        }
    }

    fn handle_exit(&self, worker_id: WorkerId) {
        trace!(%worker_id, "worker exited");
        self.retire(worker_id);
        // dropping the reply senders fails the callers with WorkerLost
        self.0.pending.retain(|_, pending| pending.worker_id != worker_id);
    }

    fn spawn_worker(
        &self,
        pool: &mut Pool<P>,
    ) -> Result<(WorkerId, std_mpsc::Sender<Request<P>>), CoroutineError> {
        let worker_id = WorkerId(pool.next_worker_id);
        pool.next_worker_id += 1;
        let requests = worker::spawn(WorkerParams {
            worker_id,
            thread_name: self.0.config.thread_name().to_owned(),
            registry: Arc::clone(&self.0.registry),
            events: self.0.events.clone(),
            retire_on_panic: self.0.config.retire_on_panic(),
        }).map_err(CoroutineError::Spawn)?;
        pool.workers.insert(worker_id, requests.clone());
        debug!(%worker_id, workers = pool.workers.len(), "spawned worker");
        Ok((worker_id, requests))
    }
}

impl<P> Coroutine<P> {
    fn lease(&self, worker_id: WorkerId, requests: std_mpsc::Sender<Request<P>>) -> WorkerLease<P> {
        WorkerLease {
            coroutine: self.clone(),
            worker_id: Some(worker_id),
            requests,
        }
    }

    // give a unit to the oldest waiter still listening, otherwise mark it idle.
    fn return_worker(&self, worker_id: WorkerId) {
        loop {
            let (waiter, requests) = {
                let mut pool = self.0.pool.lock().unwrap();
                if pool.finalized {
                    return;
                }
                let Some(requests) = pool.workers.get(&worker_id).cloned() else {
                    trace!(%worker_id, "returned worker has retired");
                    return;
                };
                match pool.waiting.pop_front() {
                    Some(waiter) => (waiter, requests),
                    None => {
                        pool.idle.push_back(worker_id);
                        return;
                    }
                }
            };
            // sent outside the lock, since a lease dropped by the receiving side re-enters here
            match waiter.send(self.lease(worker_id, requests)) {
                Ok(()) => return,
                Err(mut lease) => lease.disarm(),
            }
        }
    }
}

impl<P: Clone + Send + 'static> Coroutine<P> {
    /// Send a copy of `data` to every live unit, leased or idle, without waiting for replies
    ///
    /// Replies produced by the broadcast handler reach the listeners registered with
    /// [`subscribe`](Self::subscribe). Returns the number of units addressed.
    pub fn broadcast(&self, data: P) -> Result<usize, CoroutineError> {
        let targets: SmallVec<[(WorkerId, std_mpsc::Sender<Request<P>>); 8]> = {
            let pool = self.0.pool.lock().unwrap();
            if pool.finalized {
                return Err(CoroutineError::Finalized);
            }
            pool.workers.iter().map(|(&worker_id, requests)| (worker_id, requests.clone())).collect()
        };
        let mut addressed = 0;
        for (worker_id, requests) in targets {
            let request = Request {
                worker_id,
                message_id: self.0.mint_message_id(),
                payload: data.clone(),
                kind: RequestKind::Broadcast,
            };
            if requests.send(request).is_ok() {
                addressed += 1;
            }
        }
        debug!(addressed, "broadcast sent");
        Ok(addressed)
    }
}

impl<P> Clone for Coroutine<P> {
    fn clone(&self) -> Self {
        Coroutine(Arc::clone(&self.0))
    }
}

impl<P> Debug for Coroutine<P> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let pool = self.0.pool.lock().unwrap();
        f.debug_struct("Coroutine")
            .field("workers", &pool.workers.len())
            .field("idle", &pool.idle.len())
            .field("waiting", &pool.waiting.len())
            .field("pending", &self.0.pending.len())
            .field("finalized", &pool.finalized)
            .finish()
    }
}

impl<P> Shared<P> {
    fn mint_message_id(&self) -> MessageId {
        MessageId(self.next_message_id.fetch_add(1, Ordering::Relaxed))
    }

    fn finalize(&self) {
        let (workers, waiting) = {
            let mut pool = self.pool.lock().unwrap();
            if pool.finalized {
                return;
            }
            pool.finalized = true;
            pool.idle.clear();
            (mem::take(&mut pool.workers), mem::take(&mut pool.waiting))
        };
        debug!(workers = workers.len(), waiting = waiting.len(), "finalizing coroutine pool");
        // closing the waiters' channels fails them with Finalized
        drop(waiting);
        // threads exit once their request channels close
        drop(workers);

        let message_ids: Vec<MessageId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for message_id in message_ids {
            if let Some((_, pending)) = self.pending.remove(&message_id) {
                let _ = pending.reply.send(Err(CoroutineError::Finalized));
            }
        }
        self.listeners.lock().unwrap().entries.clear();
    }
}

impl<P> Pool<P> {
    // forget acquirers whose futures were dropped while waiting.
    fn prune_waiting(&mut self) {
        self.waiting.retain(|waiter| !waiter.is_closed());
    }
}

impl<P> Drop for Shared<P> {
    fn drop(&mut self) {
        self.finalize();
        self.router.abort();
    }
}

// drain worker events until the pool is dropped.
async fn route<P: Send + 'static>(shared: Weak<Shared<P>>, mut events: mpsc::UnboundedReceiver<Event<P>>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let coroutine = Coroutine(shared);
        match event {
            Event::Reply(Response::Task { worker_id, message_id, result }) => {
                coroutine.resolve(worker_id, message_id, result);
            }
            Event::Reply(Response::Broadcast { worker_id, payload, .. }) => {
                coroutine.notify_listeners(worker_id, &payload);
            }
            Event::Retiring(worker_id) => coroutine.retire(worker_id),
            Event::Exited(worker_id) => coroutine.handle_exit(worker_id),
        }
    }
}


// ==== leases ====


// removes the pending entry once the caller stops waiting, whether answered or not.
struct PendingEntry<'a, P> {
    pending: &'a DashMap<MessageId, Pending<P>>,
    message_id: MessageId,
}

impl<'a, P> Drop for PendingEntry<'a, P> {
    fn drop(&mut self) {
        self.pending.remove(&self.message_id);
    }
}

impl<P: Send + 'static> WorkerLease<P> {
    /// Id of the leased unit
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id.expect("lease used after disarm")
    }

    /// Run a registered task on the leased unit and await its correlated reply
    ///
    /// Errors with [`CoroutineError::Timeout`] if no reply arrives within the configured timeout,
    /// in which case the unit stays leased and any late reply is discarded.
    pub async fn process(&self, task: &str, input: P) -> Result<P, CoroutineError> {
        let shared = &self.coroutine.0;
        let task = shared.registry.name(task)
            .ok_or_else(|| CoroutineError::UnknownTask(task.to_owned()))?;
        let worker_id = self.worker_id();
        let message_id = shared.mint_message_id();

        let (send, recv) = oneshot::channel();
        shared.pending.insert(message_id, Pending { worker_id, reply: send });
        let _entry = PendingEntry { pending: &shared.pending, message_id };

        let request = Request { worker_id, message_id, payload: input, kind: RequestKind::Task(task) };
        if self.requests.send(request).is_err() {
            return Err(CoroutineError::WorkerLost(worker_id));
        }
        trace!(%worker_id, %message_id, "dispatched task");

        let timeout = shared.config.timeout();
        match tokio::time::timeout(timeout, recv).await {
            Ok(Ok(result)) => result,
            // reply sender dropped by the router when the unit exited
            Ok(Err(_)) => Err(CoroutineError::WorkerLost(worker_id)),
            Err(_) => {
                warn!(%worker_id, %message_id, ?timeout, "task request timed out");
                Err(CoroutineError::Timeout(timeout))
            }
        }
    }
}

impl<P> WorkerLease<P> {
    // release without returning the unit, which has been handed elsewhere.
    fn disarm(&mut self) {
        self.worker_id = None;
    }

    // whether the unit has left the pool, by retiring or exiting. such a lease can never succeed
    // again.
    pub(crate) fn is_retired(&self) -> bool {
        match self.worker_id {
            Some(worker_id) => !self.coroutine.0.pool.lock().unwrap().workers.contains_key(&worker_id),
            None => true,
        }
    }
}

impl<P> Drop for WorkerLease<P> {
    fn drop(&mut self) {
        if let Some(worker_id) = self.worker_id.take() {
            self.coroutine.return_worker(worker_id);
        }
    }
}

impl<P> Debug for WorkerLease<P> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("WorkerLease").field("worker_id", &self.worker_id).finish()
    }
}

impl<P> BroadcastSubscription<P> {
    /// Stop receiving broadcast replies
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.listeners.lock().unwrap().entries.retain(|&(id, _, _)| id != self.id);
        }
    }
}

impl<P> Debug for BroadcastSubscription<P> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("BroadcastSubscription").field("id", &self.id).finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::AtomicUsize,
        thread,
        time::{Duration, Instant},
    };

    fn registry() -> TaskRegistry<u64> {
        TaskRegistry::new()
            .with_task("double", |x| Ok(x * 2))
            .with_task("sleep", |ms| {
                thread::sleep(Duration::from_millis(ms));
                Ok(ms)
            })
            .with_task("fail", |x| Err(anyhow::anyhow!("bad input {}", x)))
            .with_task("boom", |_| -> anyhow::Result<u64> { panic!("boom") })
    }

    fn config(concurrency: usize) -> CoroutineConfig {
        CoroutineConfig::default()
            .with_concurrency(concurrency)
            .with_thread_name("test-worker")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn round_trip() {
        let coroutine = Coroutine::new(registry(), config(2));
        assert_eq!(coroutine.worker_count(), 0);
        assert_eq!(coroutine.process_task("double", 21).await.unwrap(), 42);
        assert_eq!(coroutine.worker_count(), 1);
        assert_eq!(coroutine.idle_count(), 1);
        assert_eq!(coroutine.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_task_fails_without_leasing() {
        let coroutine = Coroutine::new(registry(), config(2));
        match coroutine.process_task("triple", 1).await {
            Err(CoroutineError::UnknownTask(name)) => assert_eq!(name, "triple"),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(coroutine.worker_count(), 0);
    }

    #[tokio::test]
    async fn handler_error_is_reported() {
        let coroutine = Coroutine::new(registry(), config(1));
        match coroutine.process_task("fail", 3).await {
            Err(CoroutineError::Task { worker_id, message }) => {
                assert_eq!(worker_id, WorkerId(0));
                assert_eq!(message, "bad input 3");
            }
            other => panic!("unexpected result {:?}", other),
        }
        // the unit survives an ordinary error
        assert_eq!(coroutine.process_task("double", 4).await.unwrap(), 8);
        assert_eq!(coroutine.worker_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_calls_are_bounded_and_correlated() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            TaskRegistry::new().with_task("square", move |x: u64| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(x * x)
            })
        };
        let coroutine = Coroutine::new(registry, config(2));

        let calls = (0..5u64).map(|i| coroutine.process_task("square", i));
        let results = futures::future::join_all(calls).await;
        let results: Vec<u64> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(results, vec![0, 1, 4, 9, 16]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(coroutine.worker_count(), 2);
        assert_eq!(coroutine.waiting_count(), 0);
        assert_eq!(coroutine.pending_count(), 0);
    }

    #[tokio::test]
    async fn leased_unit_is_reused() {
        let coroutine = Coroutine::new(registry(), config(4));
        let lease = coroutine.acquire().await.unwrap();
        let worker_id = lease.worker_id();
        for i in 0..3 {
            assert_eq!(lease.process("double", i).await.unwrap(), i * 2);
        }
        drop(lease);
        assert_eq!(coroutine.idle_count(), 1);
        assert_eq!(coroutine.acquire().await.unwrap().worker_id(), worker_id);
        assert_eq!(coroutine.worker_count(), 1);
    }

    #[tokio::test]
    async fn returned_unit_goes_to_oldest_waiter() {
        let coroutine = Coroutine::new(registry(), config(1));
        let lease = coroutine.acquire().await.unwrap();
        let worker_id = lease.worker_id();

        let first = tokio::spawn({
            let coroutine = coroutine.clone();
            async move { coroutine.acquire().await.map(|lease| lease.worker_id()) }
        });
        wait_until(|| coroutine.waiting_count() == 1).await;

        drop(lease);
        assert_eq!(first.await.unwrap().unwrap(), worker_id);
        assert_eq!(coroutine.worker_count(), 1);
        assert_eq!(coroutine.idle_count(), 1);
    }

    #[tokio::test]
    async fn timeout_rejects_call_and_discards_late_reply() {
        let coroutine = Coroutine::new(registry(), config(1).with_timeout(Duration::from_millis(200)));
        match coroutine.process_task("sleep", 600).await {
            Err(CoroutineError::Timeout(timeout)) => assert_eq!(timeout, Duration::from_millis(200)),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(coroutine.pending_count(), 0);
        assert_eq!(coroutine.idle_count(), 1);

        // let the late reply arrive and be dropped
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(coroutine.process_task("double", 5).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn panicking_unit_is_retired_and_replaced() {
        let coroutine = Coroutine::new(registry(), config(1));
        match coroutine.process_task("boom", 0).await {
            Err(CoroutineError::Task { message, .. }) => assert!(message.contains("boom"), "{}", message),
            other => panic!("unexpected result {:?}", other),
        }
        wait_until(|| coroutine.worker_count() == 0).await;

        let lease = coroutine.acquire().await.unwrap();
        assert_eq!(lease.worker_id(), WorkerId(1));
        assert_eq!(lease.process("double", 1).await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_call_survives_retirement_of_the_unit_it_waits_for() {
        for _ in 0..50 {
            let coroutine = Coroutine::new(registry(), config(1));
            let (boom, double) = futures::join!(
                coroutine.process_task("boom", 0),
                coroutine.process_task("double", 4),
            );
            assert!(matches!(boom, Err(CoroutineError::Task { .. })), "{:?}", boom);
            assert_eq!(double.unwrap(), 8);
            assert_eq!(coroutine.worker_count(), 1);
        }
    }

    #[tokio::test]
    async fn cancelled_acquirers_stop_counting_as_waiting() {
        use futures::FutureExt;

        let coroutine = Coroutine::new(registry(), config(1));
        let lease = coroutine.acquire().await.unwrap();
        // polled once, queued, then dropped
        assert!(coroutine.acquire().now_or_never().is_none());
        assert_eq!(coroutine.waiting_count(), 0);

        let waiting = tokio::spawn({
            let coroutine = coroutine.clone();
            async move { coroutine.acquire().await.map(drop) }
        });
        wait_until(|| coroutine.waiting_count() == 1).await;
        waiting.abort();
        wait_until(|| coroutine.waiting_count() == 0).await;

        drop(lease);
        assert_eq!(coroutine.idle_count(), 1);
        assert_eq!(coroutine.worker_count(), 1);
    }

    #[tokio::test]
    async fn panicking_unit_is_kept_without_retirement() {
        let coroutine = Coroutine::new(registry(), config(1).with_retire_on_panic(false));
        assert!(coroutine.process_task("boom", 0).await.is_err());
        let lease = coroutine.acquire().await.unwrap();
        assert_eq!(lease.worker_id(), WorkerId(0));
        assert_eq!(lease.process("double", 2).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_unit_and_listener() {
        let registry = registry().with_broadcast(|worker_id, x| Some(x + worker_id.0));
        let coroutine = Coroutine::new(registry, config(2));
        // spin up both units
        let a = coroutine.acquire().await.unwrap();
        let b = coroutine.acquire().await.unwrap();
        drop((a, b));

        let everyone = Arc::new(Mutex::new(Vec::new()));
        let only_one = Arc::new(Mutex::new(Vec::new()));
        let everyone_sub = coroutine.subscribe({
            let everyone = Arc::clone(&everyone);
            move |worker_id, &reply| everyone.lock().unwrap().push((worker_id, reply))
        });
        let _only_one_sub = coroutine.subscribe_worker(WorkerId(1), {
            let only_one = Arc::clone(&only_one);
            move |worker_id, &reply| only_one.lock().unwrap().push((worker_id, reply))
        });

        assert_eq!(coroutine.broadcast(100).unwrap(), 2);
        wait_until(|| everyone.lock().unwrap().len() == 2 && only_one.lock().unwrap().len() == 1).await;
        let mut seen = everyone.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![(WorkerId(0), 100), (WorkerId(1), 101)]);
        assert_eq!(*only_one.lock().unwrap(), vec![(WorkerId(1), 101)]);

        everyone_sub.unsubscribe();
        assert_eq!(coroutine.broadcast(200).unwrap(), 2);
        wait_until(|| only_one.lock().unwrap().len() == 2).await;
        assert_eq!(everyone.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn finalize_rejects_pending_and_waiting_calls() {
        let coroutine = Coroutine::new(registry(), config(1));
        let lease = coroutine.acquire().await.unwrap();
        let pending = tokio::spawn(async move { lease.process("sleep", 300).await });
        wait_until(|| coroutine.pending_count() == 1).await;
        let waiting = tokio::spawn({
            let coroutine = coroutine.clone();
            async move { coroutine.acquire().await.map(drop) }
        });
        wait_until(|| coroutine.waiting_count() == 1).await;

        coroutine.finalize();
        assert!(coroutine.is_finalized());
        assert!(matches!(pending.await.unwrap(), Err(CoroutineError::Finalized)));
        assert!(matches!(waiting.await.unwrap(), Err(CoroutineError::Finalized)));
        assert!(matches!(coroutine.process_task("double", 1).await, Err(CoroutineError::Finalized)));
        assert!(matches!(coroutine.broadcast(1), Err(CoroutineError::Finalized)));
        assert_eq!(coroutine.worker_count(), 0);
        coroutine.finalize();
    }
}
