// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE.

//! Capabilities and pipelines that are permanently broken, carrying a fixed
//! `capnp::Error`: an unrecognized pipeline op, a miss or misuse on `receiveCap`, a
//! disconnected connection, or a `Pipeline` that has resolved to a failure.

use capnp::Error;
use capnp::any_pointer;
use capnp::capability::{self, Promise};
use capnp::private::capability::{ClientHook, ParamsHook, PipelineHook, PipelineOp, ResultsHook};

/// A capability that fails every call with `error`.
#[derive(Clone)]
pub struct Client {
    error: Error,
    /// Whether this brokenness is itself the terminal resolution of some promise
    /// (as opposed to a transient placeholder that might still become un-broken,
    /// which in practice never happens once a `PromiseClient` commits to `isResolved`,
    /// but the flag lets callers distinguish "answerable now" from "answerable never").
    resolved: bool,
    brand: usize,
}

impl Client {
    pub fn new(error: Error, resolved: bool, brand: usize) -> Self {
        Self {
            error,
            resolved,
            brand,
        }
    }
}

impl ClientHook for Client {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn new_call(
        &self,
        _interface_id: u64,
        _method_id: u16,
        _size_hint: Option<capnp::MessageSize>,
    ) -> capability::Request<any_pointer::Owned, any_pointer::Owned> {
        capability::Request::new(Box::new(Request {
            error: self.error.clone(),
        }))
    }

    fn call(
        &self,
        _interface_id: u64,
        _method_id: u16,
        _params: Box<dyn ParamsHook>,
        _results: Box<dyn ResultsHook>,
    ) -> Promise<(), Error> {
        Promise::err(self.error.clone())
    }

    fn get_ptr(&self) -> usize {
        0
    }

    fn get_brand(&self) -> usize {
        self.brand
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        None
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>> {
        None
    }

    fn when_resolved(&self) -> Promise<(), Error> {
        Promise::err(self.error.clone())
    }

    fn is_local_client(&self) -> bool {
        false
    }
}

struct Request {
    error: Error,
}

impl capnp::private::capability::RequestHook for Request {
    fn get(&mut self) -> any_pointer::Builder {
        // A broken request's params are never inspected by anything but our own
        // `send()`, so an otherwise-unused default message is fine here.
        unreachable!("broken::Request params are never read before send()")
    }
    fn get_brand(&self) -> usize {
        0
    }
    fn send(self: Box<Self>) -> capability::RemotePromise<any_pointer::Owned> {
        let pipeline = any_pointer::Pipeline::new(Box::new(Pipeline::new(self.error.clone())));
        capability::RemotePromise {
            promise: Promise::err(self.error),
            pipeline,
        }
    }
    fn tail_send(self: Box<Self>) -> Option<(u32, Promise<(), Error>, Box<dyn PipelineHook>)> {
        None
    }
}

/// A pipeline whose only possible outcome is `error`, for any sequence of
/// `getPipelinedCap` ops.
#[derive(Clone)]
pub struct Pipeline {
    error: Error,
}

impl Pipeline {
    pub fn new(error: Error) -> Self {
        Self { error }
    }
}

impl PipelineHook for Pipeline {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(self.clone())
    }

    fn get_pipelined_cap(&self, _ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        Box::new(Client::new(self.error.clone(), true, 0))
    }
}
