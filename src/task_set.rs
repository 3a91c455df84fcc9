// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE.

// A set of fire-and-forget background tasks local to one connection: export
// `resolveOp`s (§3, "Export"), the embargo `evalLater` trampoline (§4.6), and anything
// else the message loop spawns that must outlive the call that created it but must
// also be torn down synchronously with the rest of the connection's state on
// disconnect (§4.7) rather than drift on as an orphaned `tokio::spawn_local`.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use capnp::Error;
use futures_util::stream::{FuturesUnordered, StreamExt};

/// Receives the outcome of each task as it completes. `RpcSystem`'s connection state
/// implements this to turn a failed `resolveOp` into a connection-level `disconnect`
/// (§7: "Exceptions thrown while sending a `Return` escalate to the connection
/// supervisor and become disconnect" -- the same rule applies to any background task).
pub trait TaskReaper {
    fn task_failed(&mut self, error: Error);
}

type BoxedTask = Pin<Box<dyn Future<Output = Result<(), Error>>>>;

enum Message {
    Task(BoxedTask),
    Terminate,
}

struct Inner {
    tasks: FuturesUnordered<BoxedTask>,
    enqueued: std::collections::VecDeque<Message>,
    terminated: bool,
}

/// A handle used to add new tasks to a `TaskSet`. Cloneable and `'static` so it can be
/// stashed inside the closures that the tables hand out (e.g. an `Export`'s
/// `resolveOp`).
#[derive(Clone)]
pub struct TaskSetHandle {
    inner: Rc<RefCell<Inner>>,
}

impl TaskSetHandle {
    pub fn add<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if !inner.terminated {
            inner.enqueued.push_back(Message::Task(Box::pin(task)));
        }
    }

    /// Stops accepting new tasks and lets any already-running ones drain. Called during
    /// §4.7's `disconnect(e)` after the tables have been emptied.
    pub fn terminate(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.terminated = true;
        inner.enqueued.push_back(Message::Terminate);
    }
}

/// A `Future` that must be polled (typically via `tokio::task::spawn_local`) to drive
/// the queued tasks to completion, reporting each failure to `reaper`.
pub struct TaskSet<R>
where
    R: TaskReaper + 'static,
{
    reaper: R,
    inner: Rc<RefCell<Inner>>,
}

impl<R> TaskSet<R>
where
    R: TaskReaper + 'static,
{
    /// Swaps in a new reaper, used by `RpcSystem::new` to replace the placeholder reaper
    /// (constructed before the connection state it needs to close over exists) with one
    /// that actually holds a weak reference back to it.
    pub fn set_reaper(&mut self, reaper: R) {
        self.reaper = reaper;
    }
}

pub fn task_set<R>(reaper: R) -> (TaskSetHandle, TaskSet<R>)
where
    R: TaskReaper + 'static,
{
    let inner = Rc::new(RefCell::new(Inner {
        tasks: FuturesUnordered::new(),
        enqueued: std::collections::VecDeque::new(),
        terminated: false,
    }));
    (
        TaskSetHandle {
            inner: inner.clone(),
        },
        TaskSet { reaper, inner },
    )
}

impl<R> Future for TaskSet<R>
where
    R: TaskReaper + 'static,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        loop {
            let mut drained_any = false;
            {
                let mut inner = this.inner.borrow_mut();
                while let Some(msg) = inner.enqueued.pop_front() {
                    match msg {
                        Message::Task(t) => inner.tasks.push(t),
                        Message::Terminate => {
                            if inner.tasks.is_empty() {
                                return Poll::Ready(());
                            }
                        }
                    }
                    drained_any = true;
                }
            }
            let next = this.inner.borrow_mut().tasks.poll_next_unpin(cx);
            match next {
                Poll::Ready(Some(Ok(()))) => continue,
                Poll::Ready(Some(Err(e))) => {
                    this.reaper.task_failed(e);
                    continue;
                }
                Poll::Ready(None) => {
                    let inner = this.inner.borrow();
                    if inner.terminated && inner.enqueued.is_empty() {
                        return Poll::Ready(());
                    }
                    if !drained_any {
                        return Poll::Pending;
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
