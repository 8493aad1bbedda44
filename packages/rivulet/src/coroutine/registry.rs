//! Registry of statically compiled task handlers.

use super::WorkerId;
use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    sync::Arc,
};


/// Handler for a named task, run on a worker thread
pub type TaskHandler<P> = dyn Fn(P) -> anyhow::Result<P> + Send + Sync;

/// Handler for broadcast messages, run on every addressed worker thread
///
/// Returning `Some` sends a broadcast reply to the pool's broadcast listeners.
pub type BroadcastHandler<P> = dyn Fn(WorkerId, P) -> Option<P> + Send + Sync;


/// Named task handlers shared by every worker of a pool
///
/// Tasks are dispatched by name. Handlers are ordinary closures compiled into the program; only
/// their payloads cross the boundary to worker threads.
pub struct TaskRegistry<P> {
    tasks: HashMap<Arc<str>, Arc<TaskHandler<P>>>,
    broadcast: Option<Arc<BroadcastHandler<P>>>,
}

impl<P> TaskRegistry<P> {
    /// Construct empty
    pub fn new() -> Self {
        TaskRegistry {
            tasks: HashMap::new(),
            broadcast: None,
        }
    }

    /// Register a task handler under a name, replacing any previous handler of that name
    pub fn register<F>(&mut self, name: impl Into<Arc<str>>, handler: F) -> &mut Self
    where
        F: Fn(P) -> anyhow::Result<P> + Send + Sync + 'static,
    {
        self.tasks.insert(name.into(), Arc::new(handler));
        self
    }

    /// Ownership-chaining version of [`register`](Self::register)
    pub fn with_task<F>(mut self, name: impl Into<Arc<str>>, handler: F) -> Self
    where
        F: Fn(P) -> anyhow::Result<P> + Send + Sync + 'static,
    {
        self.register(name, handler);
        self
    }

    /// Set the broadcast handler
    pub fn on_broadcast<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(WorkerId, P) -> Option<P> + Send + Sync + 'static,
    {
        self.broadcast = Some(Arc::new(handler));
        self
    }

    /// Ownership-chaining version of [`on_broadcast`](Self::on_broadcast)
    pub fn with_broadcast<F>(mut self, handler: F) -> Self
    where
        F: Fn(WorkerId, P) -> Option<P> + Send + Sync + 'static,
    {
        self.on_broadcast(handler);
        self
    }

    /// Whether a task of this name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Names of all registered tasks
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(|name| &**name)
    }

    // the interned name, for cheap cloning into requests.
    pub(crate) fn name(&self, name: &str) -> Option<Arc<str>> {
        self.tasks.get_key_value(name).map(|(name, _)| Arc::clone(name))
    }

    pub(crate) fn task(&self, name: &str) -> Option<&TaskHandler<P>> {
        self.tasks.get(name).map(|handler| &**handler)
    }

    pub(crate) fn broadcast_handler(&self) -> Option<&BroadcastHandler<P>> {
        self.broadcast.as_deref()
    }
}

impl<P> Default for TaskRegistry<P> {
    fn default() -> Self {
        TaskRegistry::new()
    }
}

impl<P> Debug for TaskRegistry<P> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("broadcast", &self.broadcast.is_some())
            .finish()
    }
}
