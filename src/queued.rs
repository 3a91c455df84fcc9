// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE.

//! A pipeline and a client that don't know their final destination yet.
//!
//! `PipelineHook::get_pipelined_cap` is synchronous: it must hand back a
//! `Box<dyn ClientHook>` before the pipeline has resolved. `queued::Client` is that
//! placeholder -- it queues every call made against it (via `SenderQueue`) until the
//! pipeline resolves, then replays the queued calls against the real target in the
//! order they were made. `queued::Pipeline` is the matching placeholder `PipelineHook`:
//! it remembers every `queued::Client` it has handed out so that `complete()` can
//! resolve each of them against the real `PipelineHook` in one pass.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use capnp::Error;
use capnp::any_pointer;
use capnp::capability::{self, Promise};
use capnp::private::capability::{ClientHook, ParamsHook, PipelineHook, PipelineOp, ResultsHook};

use crate::sender_queue::SenderQueue;

type CallArgs = (u64, u16, Box<dyn ParamsHook>, Box<dyn ResultsHook>);

enum ClientState {
    Queued {
        queue: SenderQueue<CallArgs, ()>,
        resolution_queue: SenderQueue<(), Box<dyn ClientHook>>,
    },
    Resolved(Box<dyn ClientHook>),
}

pub struct Client {
    inner: Rc<RefCell<ClientState>>,
}

impl Client {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ClientState::Queued {
                queue: SenderQueue::new(),
                resolution_queue: SenderQueue::new(),
            })),
        }
    }

    pub(crate) fn resolve(&self, target: Box<dyn ClientHook>) {
        let (drained_calls, drained_resolutions) = {
            let mut inner = self.inner.borrow_mut();
            match std::mem::replace(&mut *inner, ClientState::Resolved(target.add_ref())) {
                ClientState::Queued {
                    mut queue,
                    mut resolution_queue,
                } => (
                    queue.drain().collect::<Vec<_>>(),
                    resolution_queue.drain().collect::<Vec<_>>(),
                ),
                ClientState::Resolved(_) => unreachable!("queued::Client resolved twice"),
            }
        };
        for ((interface_id, method_id, params, results), fulfiller) in drained_calls {
            let promise = target.call(interface_id, method_id, params, results);
            tokio::task::spawn_local(async move {
                let _ = promise.await;
                let _ = fulfiller.send(());
            });
        }
        for (_, fulfiller) in drained_resolutions {
            let _ = fulfiller.send(target.add_ref());
        }
    }
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ClientHook for Client {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn new_call(
        &self,
        interface_id: u64,
        method_id: u16,
        size_hint: Option<capnp::MessageSize>,
    ) -> capability::Request<any_pointer::Owned, any_pointer::Owned> {
        if let ClientState::Resolved(ref target) = *self.inner.borrow() {
            return target.new_call(interface_id, method_id, size_hint);
        }
        capability::Request::new(Box::new(crate::local::Request::new(
            interface_id,
            method_id,
            size_hint,
            self.add_ref(),
        )))
    }

    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Box<dyn ParamsHook>,
        results: Box<dyn ResultsHook>,
    ) -> Promise<(), Error> {
        let maybe_target = match *self.inner.borrow() {
            ClientState::Resolved(ref target) => Some(target.add_ref()),
            ClientState::Queued { .. } => None,
        };
        if let Some(target) = maybe_target {
            return target.call(interface_id, method_id, params, results);
        }
        let mut inner = self.inner.borrow_mut();
        match *inner {
            ClientState::Queued { ref mut queue, .. } => {
                Promise::from_future(queue.push((interface_id, method_id, params, results)))
            }
            ClientState::Resolved(_) => unreachable!(),
        }
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    fn get_brand(&self) -> usize {
        0
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        match *self.inner.borrow() {
            ClientState::Resolved(ref target) => Some(target.add_ref()),
            ClientState::Queued { .. } => None,
        }
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>> {
        let mut inner = self.inner.borrow_mut();
        match *inner {
            ClientState::Resolved(ref target) => Some(Promise::ok(target.add_ref())),
            ClientState::Queued {
                ref mut resolution_queue,
                ..
            } => Some(resolution_queue.push(())),
        }
    }

    fn when_resolved(&self) -> Promise<(), Error> {
        crate::rpc::default_when_resolved_impl(self)
    }

    fn is_local_client(&self) -> bool {
        false
    }
}

enum PipelineState {
    Waiting(Vec<(Vec<PipelineOp>, Client)>),
    Resolved(Box<dyn PipelineHook>),
}

pub struct Pipeline {
    inner: Rc<RefCell<PipelineState>>,
}

impl Pipeline {
    pub fn new() -> (Self, Self) {
        let inner = Rc::new(RefCell::new(PipelineState::Waiting(Vec::new())));
        (
            Self {
                inner: inner.clone(),
            },
            Self { inner },
        )
    }

    /// Resolves every `queued::Client` handed out by `get_pipelined_cap` so far against
    /// `target`, and remembers `target` for any future calls.
    pub fn complete(&self, target: Box<dyn PipelineHook>) {
        let waiting = {
            let mut inner = self.inner.borrow_mut();
            match std::mem::replace(&mut *inner, PipelineState::Resolved(target.add_ref())) {
                PipelineState::Waiting(w) => w,
                PipelineState::Resolved(_) => return,
            }
        };
        for (ops, client) in waiting {
            client.resolve(target.get_pipelined_cap(&ops));
        }
    }

    /// Polls `f` to completion in the background so that its side effect -- calling
    /// `complete()` -- happens even if the application never awaits the matching
    /// response future directly (a caller may pipeline several calls through a result
    /// before ever awaiting the call that produces it). If `f` itself fails before
    /// calling `complete`, resolves to a broken pipeline carrying that error so queued
    /// clients don't hang forever.
    pub fn drive<F>(&mut self, f: F)
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = f.await {
                let mut guard = inner.borrow_mut();
                if matches!(*guard, PipelineState::Waiting(_)) {
                    if let PipelineState::Waiting(waiting) =
                        std::mem::replace(&mut *guard, PipelineState::Resolved(Box::new(
                            crate::broken::Pipeline::new(e.clone()),
                        )))
                    {
                        drop(guard);
                        for (_, client) in waiting {
                            client.resolve(Box::new(crate::broken::Client::new(
                                e.clone(),
                                true,
                                0,
                            )));
                        }
                    }
                }
            }
        });
    }
}

impl Clone for Pipeline {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl PipelineHook for Pipeline {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(self.clone())
    }

    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        let mut inner = self.inner.borrow_mut();
        match *inner {
            PipelineState::Resolved(ref target) => target.get_pipelined_cap(ops),
            PipelineState::Waiting(ref mut waiting) => {
                let client = Client::new();
                waiting.push((ops.to_vec(), client.clone()));
                Box::new(client)
            }
        }
    }
}
