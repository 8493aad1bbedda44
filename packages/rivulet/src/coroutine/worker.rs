// worker unit: an OS thread running registered handlers on requests from the pool.
//
// the thread owns the receiving end of its request channel and reports every reply, plus its own
// exit, through the shared event channel. dropping every sender of the request channel makes the
// thread exit once its current handler returns.

use super::{
    message::{Event, Request, RequestKind, Response},
    registry::TaskRegistry,
    WorkerId,
};
use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{mpsc, Arc},
    thread,
};
use tokio::sync::mpsc::UnboundedSender;


pub(crate) struct WorkerParams<P> {
    pub(crate) worker_id: WorkerId,
    pub(crate) thread_name: String,
    pub(crate) registry: Arc<TaskRegistry<P>>,
    pub(crate) events: UnboundedSender<Event<P>>,
    pub(crate) retire_on_panic: bool,
}

// spawn a worker thread, returning the sending end of its request channel.
pub(crate) fn spawn<P: Send + 'static>(params: WorkerParams<P>) -> io::Result<mpsc::Sender<Request<P>>> {
    let (send, recv) = mpsc::channel();
    thread::Builder::new()
        .name(format!("{}-{}", params.thread_name, params.worker_id))
        .spawn(move || run(params, recv))?;
    Ok(send)
}

fn run<P>(params: WorkerParams<P>, requests: mpsc::Receiver<Request<P>>) {
    let WorkerParams { worker_id, registry, events, retire_on_panic, .. } = params;
    trace!(%worker_id, "worker thread started");

    while let Ok(request) = requests.recv() {
        let Request { message_id, payload, kind, .. } = request;
        let mut panicked = false;
        match kind {
            RequestKind::Task(task) => {
                let result = match registry.task(&task) {
                    Some(handler) => match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                        Ok(Ok(output)) => Ok(output),
                        Ok(Err(e)) => Err(format!("{:#}", e)),
                        Err(panic) => {
                            panicked = true;
                            Err(panic_message(&*panic))
                        }
                    },
                    None => Err(format!("no task registered as {:?}", task)),
                };
                if panicked && retire_on_panic {
                    // leave the pool before the caller can hand the lease back
                    let _ = events.send(Event::Retiring(worker_id));
                }
                let response = Response::Task { worker_id, message_id, result };
                if events.send(Event::Reply(response)).is_err() {
                    // pool is gone
                    break;
                }
            }
            RequestKind::Broadcast => {
                let Some(handler) = registry.broadcast_handler() else {
                    continue;
                };
                match panic::catch_unwind(AssertUnwindSafe(|| handler(worker_id, payload))) {
                    Ok(Some(payload)) => {
                        let response = Response::Broadcast { worker_id, message_id, payload };
                        if events.send(Event::Reply(response)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => (),
                    Err(panic) => {
                        warn!(%worker_id, %message_id, "broadcast handler panicked: {}", panic_message(&*panic));
                        panicked = true;
                        if retire_on_panic {
                            let _ = events.send(Event::Retiring(worker_id));
                        }
                    }
                }
            }
        }
        if panicked && retire_on_panic {
            warn!(%worker_id, "retiring worker after handler panic");
            break;
        }
    }

    trace!(%worker_id, "worker thread exiting");
    let _ = events.send(Event::Exited(worker_id));
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {}", message)
    } else {
        "worker panicked".to_owned()
    }
}
