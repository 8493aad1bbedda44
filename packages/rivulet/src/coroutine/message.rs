//! Message protocol between the pool and its worker units.
//!
//! Every `Task` request yields exactly one `Task` response, correlated by message id, carrying
//! either the handler's output or a rendered error. `Broadcast` requests yield zero or one
//! `Broadcast` replies, which are not correlated to any pending call.

use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};


/// Identifier of a worker unit within a pool
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WorkerId(pub(crate) u64);

impl Display for WorkerId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique identifier of a message sent to a worker
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub(crate) u64);

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// What a request asks the worker to do
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RequestKind {
    /// Run the registered task of this name on the payload and reply
    Task(Arc<str>),
    /// Hand the payload to the broadcast handler, replying only if it produces something
    Broadcast,
}

/// Message from the pool to a worker
#[derive(Debug, Clone)]
pub struct Request<P> {
    /// Addressed worker
    pub worker_id: WorkerId,
    /// Correlation id
    pub message_id: MessageId,
    /// Input data
    pub payload: P,
    /// Request type
    pub kind: RequestKind,
}

/// Message from a worker to the pool
#[derive(Debug, Clone)]
pub enum Response<P> {
    /// Reply to a `Task` request
    Task {
        /// Replying worker
        worker_id: WorkerId,
        /// Id of the request this answers
        message_id: MessageId,
        /// Handler output, or the rendered error
        result: Result<P, String>,
    },
    /// Reply to a `Broadcast` request
    Broadcast {
        /// Replying worker
        worker_id: WorkerId,
        /// Id of the broadcast request this answers
        message_id: MessageId,
        /// Reply data
        payload: P,
    },
}

impl<P> Response<P> {
    /// Replying worker
    pub fn worker_id(&self) -> WorkerId {
        match *self {
            Response::Task { worker_id, .. } | Response::Broadcast { worker_id, .. } => worker_id,
        }
    }

    /// Id of the request this answers
    pub fn message_id(&self) -> MessageId {
        match *self {
            Response::Task { message_id, .. } | Response::Broadcast { message_id, .. } => message_id,
        }
    }
}

// everything a worker thread reports back to the pool.
pub(crate) enum Event<P> {
    Reply(Response<P>),
    // the worker will stop after its current reply. sent before that reply.
    Retiring(WorkerId),
    // the worker thread has stopped and will never reply again.
    Exited(WorkerId),
}
