// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE.

//! The Four Tables engine: one `ConnectionState` per `RpcSystem`, holding the
//! questions/answers/exports/imports tables plus the embargo table, and driving the
//! single message loop that reads off `VatNetwork` and dispatches into them.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::rc::{Rc, Weak};

use capnp::any_pointer;
use capnp::capability::{self, Promise};
use capnp::private::capability::{
    ClientHook, ParamsHook, PipelineHook, PipelineOp, RequestHook, ResponseHook, ResultsHook,
};
use capnp::traits::{Imbue, ImbueMut};
use capnp::{Error, ErrorKind};

use futures_util::future::{select, Either};
use futures_util::{FutureExt, TryFutureExt};
use tokio::sync::oneshot;

use crate::rpc_capnp::{
    call, cap_descriptor, disembargo, exception, finish, message, message_target, payload,
    promised_answer, release, resolve, r#return,
};
use crate::rpc_capnp::call::send_results_to;
use crate::sender_queue::SenderQueue;
use crate::task_set::{self, TaskReaper, TaskSet, TaskSetHandle};
use crate::vat_network::{IncomingMessage, OutgoingMessage, VatNetwork};

type CallArgs = (u64, u16, Box<dyn ParamsHook>, Box<dyn ResultsHook>);

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// An id space this vat allocates itself (exports, questions, embargoes): reuses the
/// smallest free id once its slot is erased, per the invariant that such an id is never
/// reused while any table entry or in-flight message still names it.
struct ExportTable<T> {
    slots: Vec<Option<T>>,
    free: BinaryHeap<Reverse<u32>>,
}

impl<T> ExportTable<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: BinaryHeap::new(),
        }
    }

    fn push(&mut self, value: T) -> u32 {
        if let Some(Reverse(id)) = self.free.pop() {
            self.slots[id as usize] = Some(value);
            id
        } else {
            self.slots.push(Some(value));
            (self.slots.len() - 1) as u32
        }
    }

    fn find(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    fn find_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    fn erase(&mut self, id: u32) -> Option<T> {
        let value = self.slots.get_mut(id as usize).and_then(|s| s.take());
        if value.is_some() {
            if id as usize + 1 == self.slots.len() {
                self.slots.pop();
            } else {
                self.free.push(Reverse(id));
            }
        }
        value
    }

    fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i as u32, v)))
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|v| (i as u32, v)))
    }
}

/// An id space the *peer* allocates (answers, imports): no reuse bookkeeping of our
/// own, just a map.
struct IdTable<T> {
    slots: HashMap<u32, T>,
}

impl<T> IdTable<T> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
    fn find(&self, id: u32) -> Option<&T> {
        self.slots.get(&id)
    }
    fn find_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(&id)
    }
    fn insert(&mut self, id: u32, value: T) {
        self.slots.insert(id, value);
    }
    fn erase(&mut self, id: u32) -> Option<T> {
        self.slots.remove(&id)
    }
}

// ---------------------------------------------------------------------------
// Export / Question / Answer / Import / Embargo
// ---------------------------------------------------------------------------

struct Export {
    client: Box<dyn ClientHook>,
    refcount: u32,
}

struct Question {
    /// `Some` until the matching `Return` is consumed; the call awaiting it. Never set
    /// at the same time as `tail_fulfiller` -- a question is either a normal call or a
    /// tail call, never both.
    response_fulfiller: Option<oneshot::Sender<Result<Box<dyn ResponseHook>, Error>>>,
    /// `Some` for a question opened by `tail_send`: fulfilled by `resultsSentElsewhere`
    /// (the expected outcome) rather than by a `Results` payload.
    tail_fulfiller: Option<oneshot::Sender<Result<(), Error>>>,
    is_awaiting_return: bool,
    is_tail_call: bool,
    /// `true` once our `QuestionRef` has been dropped and a `Finish` sent; the row
    /// survives until the matching `Return` also arrives.
    owner_dropped: bool,
    param_exports: Vec<u32>,
}

/// An application-visible (well, pipeline/promise-visible) handle to a live question.
/// Dropping the last one sends `Finish`.
struct QuestionRef {
    connection_state: Weak<RefCell<ConnectionStateInner>>,
    id: u32,
}

impl Drop for QuestionRef {
    fn drop(&mut self) {
        if let Some(state) = self.connection_state.upgrade() {
            ConnectionState::finish_question(&state, self.id);
        }
    }
}

/// Joins two cancellation flags; only when both are set does the cancellation signal
/// fire. `requested` is set when the peer's `Finish` arrives before our `Return` is
/// sent; `allowed` is set when the application opts in via `allowCancellation()`.
/// Whichever sets the second flag fires the one-shot `fire` channel, racing it against
/// the call's own promise via an exclusive join in `handle_call`'s driving task.
struct CancellationState {
    requested: Cell<bool>,
    allowed: Cell<bool>,
    armed: Cell<bool>,
    fire: RefCell<Option<oneshot::Sender<()>>>,
    /// Whichever path produces this answer's one and only `Return` sets this first;
    /// everyone else (the normal completion path, the cancellation race) checks it to
    /// avoid sending a second `Return` for the same answer.
    return_claimed: Cell<bool>,
}

impl CancellationState {
    fn new() -> (Rc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Rc::new(Self {
                requested: Cell::new(false),
                allowed: Cell::new(false),
                armed: Cell::new(false),
                fire: RefCell::new(Some(tx)),
                return_claimed: Cell::new(false),
            }),
            rx,
        )
    }

    fn mark_requested(&self) {
        self.requested.set(true);
        self.try_fire();
    }

    fn mark_allowed(&self) {
        self.allowed.set(true);
        self.try_fire();
    }

    fn try_fire(&self) {
        if self.requested.get() && self.allowed.get() && !self.armed.get() {
            self.armed.set(true);
            if let Some(tx) = self.fire.borrow_mut().take() {
                let _ = tx.send(());
            }
        }
    }
}

struct Answer {
    active: bool,
    pipeline: Option<Box<dyn PipelineHook>>,
    cancellation: Rc<CancellationState>,
    /// Exports introduced by this answer's own `Return`, released on `Finish`.
    result_exports: Vec<u32>,
    /// Built by `CallResults::drop` but not yet sent: handed off to the driving task in
    /// `handle_call`, which sends it only if the call actually succeeded. Sending the
    /// normal `Return` and sending an error `Return` are mutually exclusive outcomes, so
    /// the `Return` itself can't be assembled until the outcome is known.
    pending_return: Option<Box<dyn OutgoingMessage>>,
    /// `true` once the peer's `Finish` arrived; `false` while the call this answer
    /// belongs to is still running.
    finish_received: bool,
    release_result_caps_on_finish: bool,
    /// `true` once a `Return` has actually gone out for this answer (by whichever of
    /// the normal/error/canceled/tail-call paths got there first).
    return_sent: bool,
    /// Set when the inbound `Call` carried `sendResultsTo.yourself`: the results never
    /// went out as a `Return`, so whoever later receives `takeFromOtherQuestion` naming
    /// this answer's id is handed this instead.
    redirected_results: Option<Result<RedirectedAnswerHandle, Error>>,
}

struct ImportEntry {
    client: Weak<RefCell<ImportClientState>>,
    /// Set only for a `senderPromise` import; fulfilled when the matching `Resolve`
    /// arrives.
    promise_fulfiller: Option<oneshot::Sender<Box<dyn ClientHook>>>,
}

struct Embargo {
    fulfiller: Option<oneshot::Sender<()>>,
}

// ---------------------------------------------------------------------------
// RpcResponse: an incoming Return, kept alive as long as anything still reads it
// ---------------------------------------------------------------------------

struct RpcResponseInner {
    message: Box<dyn IncomingMessage>,
    cap_table: Vec<Option<Box<dyn ClientHook>>>,
}

#[derive(Clone)]
struct RpcResponse {
    inner: Rc<RpcResponseInner>,
}

impl RpcResponse {
    fn content(&self) -> capnp::Result<any_pointer::Reader> {
        let root: message::Reader = self.inner.message.get_body()?.get_as()?;
        let payload = match root.which()? {
            message::Return(r) => match r?.which()? {
                r#return::Results(p) => p?,
                _ => return Err(Error::failed("Return held by RpcResponse is not Results".into())),
            },
            _ => return Err(Error::failed("RpcResponse does not wrap a Return".into())),
        };
        let mut content = payload.get_content()?;
        content.imbue(&self.inner.cap_table);
        Ok(content)
    }
}

impl ResponseHook for RpcResponse {
    fn get(&self) -> capnp::Result<any_pointer::Reader> {
        self.content()
    }
}

/// A copy of a just-finished local call's result content, kept around so
/// `get_pipelined_cap` can navigate into it before (or instead of) the `Return` built
/// from the same results actually reaching the wire: the `Return` itself owns the
/// `OutgoingMessage` that gets sent, so this is a separate, independently-owned copy of
/// the same content plus the capability hooks it points to.
struct LocalAnswerResponse {
    message: capnp::message::Builder<capnp::message::HeapAllocator>,
    cap_table: Vec<Option<Box<dyn ClientHook>>>,
}

impl LocalAnswerResponse {
    fn content(&self) -> capnp::Result<any_pointer::Reader> {
        let mut r: any_pointer::Reader = self.message.get_root_as_reader()?;
        r.imbue(&self.cap_table);
        Ok(r)
    }
}

#[derive(Clone)]
struct LocalAnswerResponseHandle(Rc<LocalAnswerResponse>);

impl ResponseHook for LocalAnswerResponseHandle {
    fn get(&self) -> capnp::Result<any_pointer::Reader> {
        self.0.content()
    }
}

impl PipelineHook for LocalAnswerResponseHandle {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(self.clone())
    }
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        match self.0.content() {
            Ok(r) => r.get_pipelined_cap(ops),
            Err(e) => Box::new(crate::broken::Client::new(e, true, 0)),
        }
    }
}

/// The content of an answer computed for a `Call` that carried `sendResultsTo.yourself`:
/// never wrapped in a `Return`, just a root pointer plus the cap table that imbues it, so
/// whoever receives `takeFromOtherQuestion` naming this answer can read it directly.
struct RedirectedAnswer {
    message: capnp::message::Builder<capnp::message::HeapAllocator>,
    cap_table: Vec<Option<Box<dyn ClientHook>>>,
}

impl RedirectedAnswer {
    fn content(&self) -> capnp::Result<any_pointer::Reader> {
        let mut r: any_pointer::Reader = self.message.get_root_as_reader()?;
        r.imbue(&self.cap_table);
        Ok(r)
    }
}

#[derive(Clone)]
struct RedirectedAnswerHandle(Rc<RedirectedAnswer>);

impl ResponseHook for RedirectedAnswerHandle {
    fn get(&self) -> capnp::Result<any_pointer::Reader> {
        self.0.content()
    }
}

impl PipelineHook for RedirectedAnswerHandle {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(self.clone())
    }
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        match self.0.content() {
            Ok(r) => r.get_pipelined_cap(ops),
            Err(e) => Box::new(crate::broken::Client::new(e, true, 0)),
        }
    }
}

// ---------------------------------------------------------------------------
// ImportClient: a capability hosted by the peer
// ---------------------------------------------------------------------------

struct ImportClientState {
    connection_state: Weak<RefCell<ConnectionStateInner>>,
    import_id: u32,
    brand: usize,
    remote_ref_count: Cell<u32>,
}

impl Drop for ImportClientState {
    fn drop(&mut self) {
        if let Some(state) = self.connection_state.upgrade() {
            let mut inner = state.borrow_mut();
            inner.imports.erase(self.import_id);
            inner.imports_by_ptr.remove(&(self as *const ImportClientState as usize));
            let count = self.remote_ref_count.get();
            if count > 0 {
                inner.send_release(self.import_id, count);
            }
        }
    }
}

struct ImportClient {
    inner: Rc<ImportClientState>,
}

impl Clone for ImportClient {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ClientHook for ImportClient {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn new_call(
        &self,
        interface_id: u64,
        method_id: u16,
        size_hint: Option<capnp::MessageSize>,
    ) -> capability::Request<any_pointer::Owned, any_pointer::Owned> {
        capability::Request::new(Box::new(Request::new(
            self.inner.connection_state.clone(),
            interface_id,
            method_id,
            size_hint,
            MessageTargetKind::ImportedCap(self.inner.import_id),
        )))
    }

    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Box<dyn ParamsHook>,
        results: Box<dyn ResultsHook>,
    ) -> Promise<(), Error> {
        let request = self.new_call(interface_id, method_id, None);
        crate::local::forward_typeless_call(request, params, results)
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    fn get_brand(&self) -> usize {
        self.inner.brand
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        None
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>> {
        None
    }

    fn when_resolved(&self) -> Promise<(), Error> {
        default_when_resolved_impl(self)
    }

    fn is_local_client(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// PipelineClient: the as-yet-unresolved result of a call we made
// ---------------------------------------------------------------------------

struct PipelineClient {
    connection_state: Weak<RefCell<ConnectionStateInner>>,
    question_ref: Rc<QuestionRef>,
    ops: Vec<PipelineOp>,
    brand: usize,
}

impl Clone for PipelineClient {
    fn clone(&self) -> Self {
        Self {
            connection_state: self.connection_state.clone(),
            question_ref: self.question_ref.clone(),
            ops: self.ops.clone(),
            brand: self.brand,
        }
    }
}

impl ClientHook for PipelineClient {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn new_call(
        &self,
        interface_id: u64,
        method_id: u16,
        size_hint: Option<capnp::MessageSize>,
    ) -> capability::Request<any_pointer::Owned, any_pointer::Owned> {
        capability::Request::new(Box::new(Request::new(
            self.connection_state.clone(),
            interface_id,
            method_id,
            size_hint,
            MessageTargetKind::PromisedAnswer(self.question_ref.clone(), self.ops.clone()),
        )))
    }

    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Box<dyn ParamsHook>,
        results: Box<dyn ResultsHook>,
    ) -> Promise<(), Error> {
        let request = self.new_call(interface_id, method_id, None);
        crate::local::forward_typeless_call(request, params, results)
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.question_ref) as usize
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
        default_when_resolved_impl(self)
    }

    fn is_local_client(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// PromiseClient: wraps whichever of the above is current, swapping in the final
// resolution once it's known. Carries the Tribble 4-way race fix.
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum TargetDescriptor {
    Import(u32),
    Answer(u32, Vec<PipelineOp>),
}

struct PromiseClientState {
    inner: Box<dyn ClientHook>,
    unresolved_target: Option<TargetDescriptor>,
    embargo_queue: Option<SenderQueue<CallArgs, ()>>,
    /// Set once a call has actually been routed through `unresolved_target`. The
    /// embargo in `resolve` only needs to exist to order calls that were genuinely
    /// forwarded through the peer; if nothing was ever sent that way there is nothing
    /// for a `Disembargo` loopback to wait behind.
    received_call: bool,
}

pub(crate) struct PromiseClient {
    connection_state: Weak<RefCell<ConnectionStateInner>>,
    state: Rc<RefCell<PromiseClientState>>,
    brand: usize,
}

impl PromiseClient {
    fn new(
        connection_state: Weak<RefCell<ConnectionStateInner>>,
        inner: Box<dyn ClientHook>,
        unresolved_target: TargetDescriptor,
        brand: usize,
    ) -> Self {
        Self {
            connection_state,
            state: Rc::new(RefCell::new(PromiseClientState {
                inner,
                unresolved_target: Some(unresolved_target),
                embargo_queue: None,
                received_call: false,
            })),
            brand,
        }
    }

    /// Called once we learn the final resolution of this promise (a `Resolve` message
    /// for an import, or the first `Return` for a pipeline). If `replacement` turns out
    /// to live somewhere other than this connection (e.g. a capability this vat already
    /// hosts locally) and a call was actually forwarded through `unresolved_target`
    /// while the promise was still pending, that call might still be in flight at the
    /// peer; a loopback `Disembargo` must round-trip before we start routing new calls
    /// directly to `replacement`, or a racing pair of calls could be observed out of
    /// order by the capability that ends up hosting both paths.
    fn resolve(&self, replacement: Box<dyn ClientHook>, is_error: bool) {
        let received_call = self.state.borrow().received_call;
        let needs_embargo =
            !is_error && received_call && replacement.get_brand() != self.brand;
        if !needs_embargo {
            let mut state = self.state.borrow_mut();
            state.unresolved_target = None;
            state.inner = replacement;
            return;
        }
        let Some(connection_state) = self.connection_state.upgrade() else {
            let mut state = self.state.borrow_mut();
            state.inner = replacement;
            state.unresolved_target = None;
            return;
        };
        let target = self.state.borrow().unresolved_target.clone();
        let Some(target) = target else {
            self.state.borrow_mut().inner = replacement;
            return;
        };
        self.state.borrow_mut().embargo_queue = Some(SenderQueue::new());
        let (fulfiller, receiver) = oneshot::channel();
        let embargo_id = {
            let mut inner = connection_state.borrow_mut();
            inner.embargoes.push(Embargo {
                fulfiller: Some(fulfiller),
            })
        };
        {
            let mut inner = connection_state.borrow_mut();
            let mut message = inner.network.new_outgoing_message(None);
            {
                let root: message::Builder = message.get_body().unwrap().init_as();
                let mut disembargo: disembargo::Builder = root.init_disembargo();
                write_message_target(&target, disembargo.reborrow().init_target());
                disembargo.reborrow().init_context().set_sender_loopback(embargo_id);
            }
            let _ = message.send();
        }
        let state = self.state.clone();
        let mut tasks = connection_state.borrow().tasks.clone();
        tasks.add(async move {
            let result = receiver.await;
            let mut s = state.borrow_mut();
            if let Some(mut queue) = s.embargo_queue.take() {
                let drained: Vec<_> = queue.drain().collect();
                let target = replacement.add_ref();
                drop(s);
                if result.is_ok() {
                    for ((interface_id, method_id, params, results), fulfiller) in drained {
                        let promise = target.call(interface_id, method_id, params, results);
                        let _ = promise.await;
                        let _ = fulfiller.send(());
                    }
                }
                state.borrow_mut().inner = replacement.add_ref();
            } else {
                state.borrow_mut().inner = replacement.add_ref();
            }
            state.borrow_mut().unresolved_target = None;
            Ok(())
        });
    }
}

impl Clone for PromiseClient {
    fn clone(&self) -> Self {
        Self {
            connection_state: self.connection_state.clone(),
            state: self.state.clone(),
            brand: self.brand,
        }
    }
}

impl ClientHook for PromiseClient {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn new_call(
        &self,
        interface_id: u64,
        method_id: u16,
        size_hint: Option<capnp::MessageSize>,
    ) -> capability::Request<any_pointer::Owned, any_pointer::Owned> {
        self.state
            .borrow()
            .inner
            .new_call(interface_id, method_id, size_hint)
    }

    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Box<dyn ParamsHook>,
        results: Box<dyn ResultsHook>,
    ) -> Promise<(), Error> {
        let mut state = self.state.borrow_mut();
        state.received_call = true;
        if let Some(ref mut queue) = state.embargo_queue {
            return Promise::from_future(
                queue
                    .push((interface_id, method_id, params, results))
                    .map(|_| Ok(())),
            );
        }
        state.inner.call(interface_id, method_id, params, results)
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.state) as usize
    }

    fn get_brand(&self) -> usize {
        self.brand
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        let state = self.state.borrow();
        if state.unresolved_target.is_none() {
            Some(state.inner.add_ref())
        } else {
            None
        }
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>> {
        None
    }

    fn when_resolved(&self) -> Promise<(), Error> {
        default_when_resolved_impl(self)
    }

    fn is_local_client(&self) -> bool {
        false
    }
}

fn write_message_target(target: &TargetDescriptor, mut builder: message_target::Builder) {
    match target {
        TargetDescriptor::Import(id) => builder.set_imported_cap(*id),
        TargetDescriptor::Answer(question_id, ops) => {
            let mut pa = builder.reborrow().init_promised_answer();
            pa.set_question_id(*question_id);
            write_pipeline_ops(ops, pa.init_transform(ops.len() as u32));
        }
    }
}

fn write_pipeline_ops(ops: &[PipelineOp], mut list: capnp::struct_list::Builder<promised_answer::op::Owned>) {
    for (i, op) in ops.iter().enumerate() {
        let mut b = list.reborrow().get(i as u32);
        match op {
            PipelineOp::Noop => b.set_noop(()),
            PipelineOp::GetPointerField(idx) => b.set_get_pointer_field(*idx),
        }
    }
}

fn read_pipeline_ops(reader: capnp::struct_list::Reader<promised_answer::op::Owned>) -> capnp::Result<Vec<PipelineOp>> {
    let mut ops = Vec::with_capacity(reader.len() as usize);
    for op in reader.iter() {
        ops.push(match op.which()? {
            promised_answer::op::Noop(()) => PipelineOp::Noop,
            promised_answer::op::GetPointerField(idx) => PipelineOp::GetPointerField(idx),
        });
    }
    Ok(ops)
}

/// The common tail of `ClientHook::when_resolved` for every non-local hook in this
/// module: poll `when_more_resolved` until it stops producing a replacement.
pub(crate) fn default_when_resolved_impl(hook: &dyn ClientHook) -> Promise<(), Error> {
    match hook.when_more_resolved() {
        Some(promise) => Promise::from_future(promise.and_then(|next| next.when_resolved())),
        None => Promise::ok(()),
    }
}

// ---------------------------------------------------------------------------
// Outbound Request (RequestHook), targeting either an import or a promised answer
// ---------------------------------------------------------------------------

enum MessageTargetKind {
    ImportedCap(u32),
    PromisedAnswer(Rc<QuestionRef>, Vec<PipelineOp>),
}

pub struct Request {
    connection_state: Weak<RefCell<ConnectionStateInner>>,
    message: capnp::message::Builder<capnp::message::HeapAllocator>,
    cap_table: Vec<Option<Box<dyn ClientHook>>>,
    interface_id: u64,
    method_id: u16,
    target: MessageTargetKind,
}

impl Request {
    fn new(
        connection_state: Weak<RefCell<ConnectionStateInner>>,
        interface_id: u64,
        method_id: u16,
        _size_hint: Option<capnp::MessageSize>,
        target: MessageTargetKind,
    ) -> Self {
        Self {
            connection_state,
            message: capnp::message::Builder::new_default(),
            cap_table: Vec::new(),
            interface_id,
            method_id,
            target,
        }
    }
}

impl RequestHook for Request {
    fn get(&mut self) -> any_pointer::Builder {
        let mut result: any_pointer::Builder = self.message.get_root().unwrap();
        result.imbue_mut(&mut self.cap_table);
        result
    }

    fn get_brand(&self) -> usize {
        0
    }

    fn send(self: Box<Self>) -> capability::RemotePromise<any_pointer::Owned> {
        let Some(connection_state) = self.connection_state.upgrade() else {
            let error = Error::disconnected("connection is gone".into());
            let pipeline = any_pointer::Pipeline::new(Box::new(crate::broken::Pipeline::new(error.clone())));
            return capability::RemotePromise {
                promise: Promise::err(error),
                pipeline,
            };
        };

        let (response_fulfiller, response_receiver) = oneshot::channel();
        let question_id;
        {
            let mut inner = connection_state.borrow_mut();
            question_id = inner.questions.push(Question {
                response_fulfiller: Some(response_fulfiller),
                tail_fulfiller: None,
                is_awaiting_return: true,
                is_tail_call: false,
                owner_dropped: false,
                param_exports: Vec::new(),
            });
            let mut message = inner.network.new_outgoing_message(None);
            let mut exported = Vec::new();
            {
                let root: message::Builder = message.get_body().unwrap().init_as();
                let mut call_builder: call::Builder = root.init_call();
                call_builder.set_question_id(question_id);
                match &self.target {
                    MessageTargetKind::ImportedCap(id) => {
                        call_builder.reborrow().init_target().set_imported_cap(*id);
                    }
                    MessageTargetKind::PromisedAnswer(question_ref, ops) => {
                        let mut pa = call_builder.reborrow().init_target().init_promised_answer();
                        pa.set_question_id(question_ref.id);
                        write_pipeline_ops(ops, pa.init_transform(ops.len() as u32));
                    }
                }
                call_builder.set_interface_id(self.interface_id);
                call_builder.set_method_id(self.method_id);
                call_builder.reborrow().init_send_results_to().set_caller(());
                let mut payload_builder = call_builder.reborrow().init_params();
                let mut content = payload_builder.reborrow().init_content();
                let our_root: any_pointer::Reader = self.message.get_root_as_reader().unwrap();
                content.set_as(our_root).unwrap();
                content.imbue(&self.cap_table);
                let mut cap_table_builder = payload_builder.init_cap_table(self.cap_table.len() as u32);
                for (i, cap) in self.cap_table.iter().enumerate() {
                    let descriptor = cap_table_builder.reborrow().get(i as u32);
                    match cap {
                        Some(hook) => {
                            if let Some(id) = inner.write_descriptor(hook.as_ref(), descriptor) {
                                exported.push(id);
                            }
                        }
                        None => descriptor.init_none(()),
                    }
                }
            }
            if let Some(q) = inner.questions.find_mut(question_id) {
                q.param_exports = exported;
            }
            let _ = message.send();
        }

        let question_ref = Rc::new(QuestionRef {
            connection_state: Rc::downgrade(&connection_state),
            id: question_id,
        });

        let pipeline = Pipeline {
            connection_state: Rc::downgrade(&connection_state),
            question_ref: question_ref.clone(),
        };

        let promise = response_receiver
            .map_err(crate::error::canceled_to_error)
            .map(|r| r.and_then(|inner| inner));

        capability::RemotePromise {
            promise: Promise::from_future(async move {
                let response = promise.await?;
                Ok((capability::Response::new(Box::new(response)), ()))
            }),
            pipeline: any_pointer::Pipeline::new(Box::new(pipeline)),
        }
    }

    /// The fast path for `CallResults::direct_tail_call`: forwards this request as a
    /// fresh `Call` on the *same connection* with `sendResultsTo.yourself`, instead of
    /// waiting for its `Return` and copying the payload into our own results. Returns
    /// `None` only when the connection is already gone, in which case the caller falls
    /// back to an ordinary `send()`.
    fn tail_send(self: Box<Self>) -> Option<(u32, Promise<(), Error>, Box<dyn PipelineHook>)> {
        let connection_state = self.connection_state.upgrade()?;

        let (tail_fulfiller, tail_receiver) = oneshot::channel();
        let question_id;
        {
            let mut inner = connection_state.borrow_mut();
            question_id = inner.questions.push(Question {
                response_fulfiller: None,
                tail_fulfiller: Some(tail_fulfiller),
                is_awaiting_return: true,
                is_tail_call: true,
                owner_dropped: false,
                param_exports: Vec::new(),
            });
            let mut message = inner.network.new_outgoing_message(None);
            let mut exported = Vec::new();
            {
                let root: message::Builder = message.get_body().unwrap().init_as();
                let mut call_builder: call::Builder = root.init_call();
                call_builder.set_question_id(question_id);
                match &self.target {
                    MessageTargetKind::ImportedCap(id) => {
                        call_builder.reborrow().init_target().set_imported_cap(*id);
                    }
                    MessageTargetKind::PromisedAnswer(question_ref, ops) => {
                        let mut pa = call_builder.reborrow().init_target().init_promised_answer();
                        pa.set_question_id(question_ref.id);
                        write_pipeline_ops(ops, pa.init_transform(ops.len() as u32));
                    }
                }
                call_builder.set_interface_id(self.interface_id);
                call_builder.set_method_id(self.method_id);
                call_builder.reborrow().init_send_results_to().set_yourself(());
                let mut payload_builder = call_builder.reborrow().init_params();
                let mut content = payload_builder.reborrow().init_content();
                let our_root: any_pointer::Reader = self.message.get_root_as_reader().unwrap();
                content.set_as(our_root).unwrap();
                content.imbue(&self.cap_table);
                let mut cap_table_builder = payload_builder.init_cap_table(self.cap_table.len() as u32);
                for (i, cap) in self.cap_table.iter().enumerate() {
                    let descriptor = cap_table_builder.reborrow().get(i as u32);
                    match cap {
                        Some(hook) => {
                            if let Some(id) = inner.write_descriptor(hook.as_ref(), descriptor) {
                                exported.push(id);
                            }
                        }
                        None => descriptor.init_none(()),
                    }
                }
            }
            if let Some(q) = inner.questions.find_mut(question_id) {
                q.param_exports = exported;
            }
            let _ = message.send();
        }

        let question_ref = Rc::new(QuestionRef {
            connection_state: Rc::downgrade(&connection_state),
            id: question_id,
        });
        let pipeline = Pipeline {
            connection_state: Rc::downgrade(&connection_state),
            question_ref,
        };
        let promise = Promise::from_future(async move {
            tail_receiver.await.map_err(crate::error::canceled_to_error)?
        });
        Some((question_id, promise, Box::new(pipeline)))
    }
}

// ---------------------------------------------------------------------------
// rpc::Pipeline: the pipeline half of an outbound Request
// ---------------------------------------------------------------------------

struct Pipeline {
    connection_state: Weak<RefCell<ConnectionStateInner>>,
    question_ref: Rc<QuestionRef>,
}

impl Clone for Pipeline {
    fn clone(&self) -> Self {
        Self {
            connection_state: self.connection_state.clone(),
            question_ref: self.question_ref.clone(),
        }
    }
}

impl PipelineHook for Pipeline {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(self.clone())
    }

    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        let brand = self
            .connection_state
            .upgrade()
            .map(|s| s.borrow().brand)
            .unwrap_or(0);
        Box::new(PipelineClient {
            connection_state: self.connection_state.clone(),
            question_ref: self.question_ref.clone(),
            ops: ops.to_vec(),
            brand,
        })
    }
}

// ---------------------------------------------------------------------------
// Inbound call dispatch: CallContext / CallResults
// ---------------------------------------------------------------------------

struct IncomingParams {
    message: Rc<Box<dyn IncomingMessage>>,
    cap_table: Vec<Option<Box<dyn ClientHook>>>,
}

impl ParamsHook for IncomingParams {
    fn get(&self) -> capnp::Result<any_pointer::Reader> {
        let root: message::Reader = self.message.get_body()?.get_as()?;
        let call = match root.which()? {
            message::Call(c) => c?,
            _ => return Err(Error::failed("not a Call".into())),
        };
        let mut content = call.get_params()?.get_content()?;
        content.imbue(&self.cap_table);
        Ok(content)
    }
}

struct CallResults {
    connection_state: Rc<RefCell<ConnectionStateInner>>,
    answer_id: u32,
    message: Option<Box<dyn OutgoingMessage>>,
    cap_table: Vec<Option<Box<dyn ClientHook>>>,
    cancellation: Rc<CancellationState>,
    pipeline: crate::queued::Pipeline,
}

impl ResultsHook for CallResults {
    fn get(&mut self) -> capnp::Result<any_pointer::Builder> {
        let message = self.message.as_mut().unwrap();
        let root: message::Builder = message.get_body()?.get_as()?;
        let ret = match root.which()? {
            message::Return(r) => r?,
            _ => unreachable!(),
        };
        let mut payload = match ret.which()? {
            r#return::Results(p) => p?,
            _ => unreachable!(),
        };
        let mut content = payload.reborrow().init_content();
        content.imbue_mut(&mut self.cap_table);
        Ok(content)
    }

    fn tail_call(self: Box<Self>, request: Box<dyn RequestHook>) -> Promise<(), Error> {
        let (promise, _pipeline) = self.direct_tail_call(request);
        promise
    }

    /// Tries `request`'s same-connection fast path first (`tail_send`); only when
    /// that's unavailable (different connection, or a purely local target) does it fall
    /// back to running the forwarded call normally and copying the result.
    fn direct_tail_call(
        self: Box<Self>,
        request: Box<dyn RequestHook>,
    ) -> (Promise<(), Error>, Box<dyn PipelineHook>) {
        if let Some((question_id, promise, pipeline)) = request.tail_send() {
            // Claim the Return ourselves, right now: no payload traverses this vat, just
            // a pointer at another question's eventual answer.
            if !self.cancellation.return_claimed.replace(true) {
                // Declared before `inner` so it drops (and any `ImportClient` inside it
                // releases) only after `inner`'s borrow ends, not while it's still live.
                let mut dropped_exports = Vec::new();
                let mut inner = self.connection_state.borrow_mut();
                let mut message = inner.network.new_outgoing_message(None);
                {
                    let root: message::Builder = message.get_body().unwrap().init_as();
                    let mut ret: r#return::Builder = root.init_return();
                    ret.set_answer_id(self.answer_id);
                    ret.set_take_from_other_question(question_id);
                }
                let _ = message.send();
                let answer_id = self.answer_id;
                let finish_received = inner.answers.find(answer_id).map(|a| a.finish_received).unwrap_or(false);
                let release = inner
                    .answers
                    .find(answer_id)
                    .map(|a| a.release_result_caps_on_finish)
                    .unwrap_or(true);
                if let Some(answer) = inner.answers.find_mut(answer_id) {
                    answer.return_sent = true;
                }
                if finish_received {
                    dropped_exports = ConnectionState::finalize_answer(&mut inner, answer_id, release);
                }
                drop(inner);
                drop(dropped_exports);
            }
            return (promise, pipeline);
        }
        let capability::RemotePromise { promise, pipeline } = request.send();
        let mut this = self;
        let promise = Promise::from_future(async move {
            let response = promise.await?;
            let mut results = this.get()?;
            results.set_as(response.get()?)?;
            Ok(())
        });
        (promise, pipeline.hook)
    }

    fn allow_cancellation(&self) {
        self.cancellation.mark_allowed();
    }
}

impl Drop for CallResults {
    fn drop(&mut self) {
        // Already handled by the tail-call fast path or by losing the cancellation race:
        // don't build or stash a second Return for this answer. Whatever claimed the
        // return first is responsible for resolving the answer's own pipeline (the
        // tail-call fast path has no local results to pipeline into; the cancellation
        // path sends `canceled` itself), so just unblock anyone waiting on ours.
        if self.cancellation.return_claimed.replace(true) {
            self.pipeline.complete(Box::new(crate::broken::Pipeline::new(Error::failed(
                "this answer's results were redirected elsewhere or the call was canceled \
                 before producing a result to pipeline into"
                    .into(),
            ))));
            return;
        }
        let Some(mut message) = self.message.take() else {
            return;
        };

        // Snapshot the content before writing descriptors into the wire message below,
        // so pipelined calls can navigate it without waiting on (or duplicating) the
        // `Return` that actually gets sent.
        let snapshot_cap_table: Vec<Option<Box<dyn ClientHook>>> =
            self.cap_table.iter().map(|c| c.as_ref().map(|h| h.add_ref())).collect();
        let snapshot_content = message
            .get_body_as_reader()
            .ok()
            .and_then(|r| r.get_as::<message::Reader>().ok())
            .and_then(|root| match root.which() {
                Ok(message::Return(Ok(ret))) => match ret.which() {
                    Ok(r#return::Results(Ok(payload))) => payload.get_content().ok(),
                    _ => None,
                },
                _ => None,
            });
        let snapshot = snapshot_content.and_then(|content| {
            let mut snapshot = capnp::message::Builder::new_default();
            let copied: capnp::Result<()> = (|| {
                let mut root: any_pointer::Builder = snapshot.get_root()?;
                root.set_as(content)?;
                Ok(())
            })();
            copied.ok().map(|()| snapshot)
        });

        let mut result_exports = Vec::new();
        {
            let mut inner = self.connection_state.borrow_mut();
            if let Ok(root) = message.get_body().and_then(|r| r.get_as::<message::Builder<_>>()) {
                if let Ok(message::Return(Ok(ret))) = root.which() {
                    if let Ok(r#return::Results(Ok(payload))) = ret.which() {
                        let cap_table = std::mem::take(&mut self.cap_table);
                        let mut cap_table_builder = payload.init_cap_table(cap_table.len() as u32);
                        for (i, cap) in cap_table.iter().enumerate() {
                            let descriptor = cap_table_builder.reborrow().get(i as u32);
                            match cap {
                                Some(hook) => {
                                    if let Some(id) = inner.write_descriptor(hook.as_ref(), descriptor) {
                                        result_exports.push(id);
                                    }
                                }
                                None => descriptor.init_none(()),
                            }
                        }
                    }
                }
            }
            if let Some(answer) = inner.answers.find_mut(self.answer_id) {
                answer.result_exports = result_exports;
                answer.pending_return = Some(message);
            }
        }

        match snapshot {
            Some(snapshot) => self.pipeline.complete(Box::new(LocalAnswerResponseHandle(Rc::new(
                LocalAnswerResponse {
                    message: snapshot,
                    cap_table: snapshot_cap_table,
                },
            )))),
            None => self.pipeline.complete(Box::new(crate::broken::Pipeline::new(Error::failed(
                "call's results were not a Results payload".into(),
            )))),
        }
    }
}

/// The `ResultsHook` used when the inbound `Call` carried `sendResultsTo.yourself`: the
/// outcome is never sent as a `Return` here, just stashed as the answer's
/// `redirectedResults` and signaled via `Return{resultsSentElsewhere}`.
struct RedirectedResults {
    connection_state: Rc<RefCell<ConnectionStateInner>>,
    answer_id: u32,
    message: Option<capnp::message::Builder<capnp::message::HeapAllocator>>,
    cap_table: Vec<Option<Box<dyn ClientHook>>>,
    cancellation: Rc<CancellationState>,
    pipeline: crate::queued::Pipeline,
}

impl ResultsHook for RedirectedResults {
    fn get(&mut self) -> capnp::Result<any_pointer::Builder> {
        let message = self.message.as_mut().unwrap();
        let mut result: any_pointer::Builder = message.get_root()?;
        result.imbue_mut(&mut self.cap_table);
        Ok(result)
    }

    fn tail_call(self: Box<Self>, request: Box<dyn RequestHook>) -> Promise<(), Error> {
        let (promise, _pipeline) = self.direct_tail_call(request);
        promise
    }

    fn direct_tail_call(
        self: Box<Self>,
        request: Box<dyn RequestHook>,
    ) -> (Promise<(), Error>, Box<dyn PipelineHook>) {
        // A `yourself` call tail-calling further is not worth a second redirect hop;
        // run it inline and copy into our in-memory results, same as the ordinary
        // fallback `CallResults::direct_tail_call` uses.
        let capability::RemotePromise { promise, pipeline } = request.send();
        let mut this = self;
        let promise = Promise::from_future(async move {
            let response = promise.await?;
            let mut results = this.get()?;
            results.set_as(response.get()?)?;
            Ok(())
        });
        (promise, pipeline.hook)
    }

    fn allow_cancellation(&self) {
        self.cancellation.mark_allowed();
    }
}

impl Drop for RedirectedResults {
    fn drop(&mut self) {
        if self.cancellation.return_claimed.replace(true) {
            self.pipeline.complete(Box::new(crate::broken::Pipeline::new(Error::failed(
                "this answer's results were redirected elsewhere or the call was canceled \
                 before producing a result to pipeline into"
                    .into(),
            ))));
            return;
        }
        let message = self.message.take().unwrap();
        let cap_table = std::mem::take(&mut self.cap_table);
        let handle = RedirectedAnswerHandle(Rc::new(RedirectedAnswer { message, cap_table }));
        self.pipeline.complete(Box::new(handle.clone()));
        let mut inner = self.connection_state.borrow_mut();
        let answer_id = self.answer_id;
        if let Some(answer) = inner.answers.find_mut(answer_id) {
            answer.redirected_results = Some(Ok(handle));
        }
        let mut out = inner.network.new_outgoing_message(None);
        {
            let root: message::Builder = out.get_body().unwrap().init_as();
            let mut ret: r#return::Builder = root.init_return();
            ret.set_answer_id(answer_id);
            ret.set_results_sent_elsewhere(());
        }
        let _ = out.send();
        let finish_received = inner.answers.find(answer_id).map(|a| a.finish_received).unwrap_or(false);
        let release = inner
            .answers
            .find(answer_id)
            .map(|a| a.release_result_caps_on_finish)
            .unwrap_or(true);
        if let Some(answer) = inner.answers.find_mut(answer_id) {
            answer.return_sent = true;
        }
        let dropped_exports = if finish_received {
            ConnectionState::finalize_answer(&mut inner, answer_id, release)
        } else {
            Vec::new()
        };
        drop(inner);
        drop(dropped_exports);
    }
}

// ---------------------------------------------------------------------------
// Capability descriptor codec
// ---------------------------------------------------------------------------

impl ConnectionStateInner {
    /// Describes `hook` in an outgoing `CapDescriptor`, allocating a fresh export if
    /// necessary. Returns `Some(id)` only when a *new* export was allocated (so the
    /// caller can track it for `paramExports`/result-export release bookkeeping);
    /// `None` when an existing export's refcount was simply bumped.
    ///
    /// If `hook` is one of our own imports *of this same connection*, it's the peer's
    /// own capability bouncing back to it; describe it as `receiverHosted` instead of
    /// re-exporting it under a fresh id. The matching shortcut for a `PipelineClient`
    /// answer (receiverAnswer) is not implemented (see DESIGN.md).
    fn write_descriptor(
        &mut self,
        hook: &dyn ClientHook,
        mut builder: cap_descriptor::Builder,
    ) -> Option<u32> {
        let ptr = hook.get_ptr();
        if hook.get_brand() == self.brand {
            if let Some(&import_id) = self.imports_by_ptr.get(&ptr) {
                builder.set_receiver_hosted(import_id);
                return None;
            }
        }
        if let Some(&id) = self.exports_by_cap.get(&ptr) {
            if let Some(export) = self.exports.find_mut(id) {
                export.refcount += 1;
            }
            builder.set_sender_hosted(id);
            return None;
        }
        let settled = hook.when_more_resolved().is_none();
        let id = self.exports.push(Export {
            client: hook.add_ref(),
            refcount: 1,
        });
        self.exports_by_cap.insert(ptr, id);
        if settled {
            builder.set_sender_hosted(id);
        } else {
            builder.set_sender_promise(id);
            self.watch_export_resolution(id, hook.add_ref());
        }
        Some(id)
    }

    fn watch_export_resolution(&mut self, export_id: u32, hook: Box<dyn ClientHook>) {
        let Some(promise) = hook.when_more_resolved() else {
            return;
        };
        let weak_self = self.weak_self.clone();
        self.tasks.add(async move {
            let resolved = promise.await;
            let Some(state) = weak_self.upgrade() else {
                return Ok(());
            };
            let mut inner = state.borrow_mut();
            if inner.exports.find(export_id).is_none() {
                return Ok(());
            }
            let mut message = inner.network.new_outgoing_message(None);
            {
                let root: message::Builder = message.get_body().unwrap().init_as();
                let mut resolve_builder: resolve::Builder = root.init_resolve();
                resolve_builder.set_promise_id(export_id);
                match resolved {
                    Ok(replacement) => {
                        let descriptor = resolve_builder.init_cap();
                        inner.write_descriptor(replacement.as_ref(), descriptor);
                    }
                    Err(e) => crate::error::from_error(&e, resolve_builder.init_exception()),
                }
            }
            let _ = message.send();
            Ok(())
        });
    }

    /// Interprets an incoming `CapDescriptor`, importing/looking-up whatever it
    /// references.
    fn receive_cap(&mut self, reader: cap_descriptor::Reader) -> capnp::Result<Box<dyn ClientHook>> {
        Ok(match reader.which()? {
            cap_descriptor::None(()) => {
                Box::new(crate::broken::Client::new(
                    Error::failed("called a null capability".into()),
                    true,
                    0,
                ))
            }
            cap_descriptor::SenderHosted(id) => self.import(id, false),
            cap_descriptor::SenderPromise(id) => self.import(id, true),
            cap_descriptor::ReceiverHosted(id) => match self.exports.find(id) {
                Some(export) => export.client.add_ref(),
                None => Box::new(crate::broken::Client::new(
                    Error::failed(format!("no such export: {id}")),
                    true,
                    0,
                )),
            },
            cap_descriptor::ReceiverAnswer(pa) => {
                let pa = pa?;
                let ops = read_pipeline_ops(pa.get_transform()?)?;
                match self.answers.find(pa.get_question_id()) {
                    Some(answer) => match &answer.pipeline {
                        Some(pipeline) => pipeline.get_pipelined_cap(&ops),
                        None => Box::new(crate::broken::Client::new(
                            Error::failed("answer has no pipeline".into()),
                            true,
                            0,
                        )),
                    },
                    None => Box::new(crate::broken::Client::new(
                        Error::failed("no such answer".into()),
                        true,
                        0,
                    )),
                }
            }
            cap_descriptor::ThirdPartyHosted(tpcd) => self.import(tpcd?.get_vine_id(), false),
        })
    }

    fn import(&mut self, id: u32, is_promise: bool) -> Box<dyn ClientHook> {
        if let Some(existing) = self.imports.find(id).and_then(|e| e.client.upgrade()) {
            return Box::new(ImportClient { inner: existing });
        }
        let state = Rc::new(ImportClientState {
            connection_state: self.weak_self.clone(),
            import_id: id,
            brand: self.brand,
            remote_ref_count: Cell::new(1),
        });
        let base: Box<dyn ClientHook> = Box::new(ImportClient {
            inner: state.clone(),
        });
        self.imports_by_ptr.insert(Rc::as_ptr(&state) as usize, id);
        if is_promise {
            let (fulfiller, receiver) = oneshot::channel::<Box<dyn ClientHook>>();
            self.imports.insert(
                id,
                ImportEntry {
                    client: Rc::downgrade(&state),
                    promise_fulfiller: Some(fulfiller),
                },
            );
            let promise_client = Rc::new(RefCell::new(PromiseClientState {
                inner: base,
                unresolved_target: Some(TargetDescriptor::Import(id)),
                embargo_queue: None,
                received_call: false,
            }));
            let client = PromiseClient {
                connection_state: self.weak_self.clone(),
                state: promise_client.clone(),
                brand: self.brand,
            };
            let weak_client = client.clone();
            self.tasks.add(async move {
                if let Ok(replacement) = receiver.await {
                    weak_client.resolve(replacement, false);
                }
                Ok(())
            });
            Box::new(client)
        } else {
            self.imports.insert(
                id,
                ImportEntry {
                    client: Rc::downgrade(&state),
                    promise_fulfiller: None,
                },
            );
            base
        }
    }

    fn send_release(&mut self, id: u32, count: u32) {
        let mut message = self.network.new_outgoing_message(None);
        {
            let root: message::Builder = message.get_body().unwrap().init_as();
            let mut release_builder: release::Builder = root.init_release();
            release_builder.set_id(id);
            release_builder.set_reference_count(count);
        }
        let _ = message.send();
    }

    fn send_exception_return(&mut self, answer_id: u32, error: &Error) {
        let mut message = self.network.new_outgoing_message(None);
        {
            let root: message::Builder = message.get_body().unwrap().init_as();
            let mut ret: r#return::Builder = root.init_return();
            ret.set_answer_id(answer_id);
            crate::error::from_error(error, ret.init_exception());
        }
        let _ = message.send();
    }

    fn send_canceled_return(&mut self, answer_id: u32) {
        let mut message = self.network.new_outgoing_message(None);
        {
            let root: message::Builder = message.get_body().unwrap().init_as();
            let mut ret: r#return::Builder = root.init_return();
            ret.set_answer_id(answer_id);
            ret.set_canceled(());
        }
        let _ = message.send();
    }
}

// ---------------------------------------------------------------------------
// Connection state + message loop + RpcSystem
// ---------------------------------------------------------------------------

struct ConnectionStateInner {
    weak_self: Weak<RefCell<ConnectionStateInner>>,
    brand: usize,
    bootstrap: Option<Box<dyn ClientHook>>,
    network: Box<dyn VatNetwork>,
    questions: ExportTable<Question>,
    answers: IdTable<Answer>,
    exports: ExportTable<Export>,
    exports_by_cap: HashMap<usize, u32>,
    imports: IdTable<ImportEntry>,
    /// Reverse lookup from an `ImportClient`'s identity (`get_ptr()`) to its import id,
    /// so `write_descriptor` can recognize a capability we're about to send back out
    /// as one the peer already owns (something we hold only as an import *of this
    /// same connection*) and describe it as `receiverHosted` instead of re-exporting
    /// it under a fresh id.
    imports_by_ptr: HashMap<usize, u32>,
    embargoes: ExportTable<Embargo>,
    tasks: TaskSetHandle,
    disconnected: Option<Error>,
}

struct ConnectionState;

impl ConnectionState {
    /// Erases the answer table entry and, unless the peer asked us to keep them alive,
    /// releases the exports its `Return` introduced. Called at whichever of `Return`
    /// completion or peer `Finish` happens second.
    /// Returns the `ClientHook`s of any exports this dropped to zero refcount. Dropping
    /// one of those inline, while the caller's borrow of `inner`'s `RefCell` is still
    /// live, would reenter that same `RefCell` if the hook is an `ImportClient` of this
    /// connection (its `Drop` impl borrows `inner` again) -- callers must hold onto the
    /// returned `Vec` until after their borrow ends, then let it drop.
    #[must_use]
    fn finalize_answer(
        inner: &mut ConnectionStateInner,
        answer_id: u32,
        release_result_caps: bool,
    ) -> Vec<Box<dyn ClientHook>> {
        let mut dropped = Vec::new();
        if let Some(answer) = inner.answers.erase(answer_id) {
            if release_result_caps {
                for id in answer.result_exports {
                    if let Some(export) = inner.exports.find_mut(id) {
                        export.refcount -= 1;
                        if export.refcount == 0 {
                            if let Some(export) = inner.exports.erase(id) {
                                dropped.push(export.client);
                            }
                            inner.exports_by_cap.retain(|_, v| *v != id);
                        }
                    }
                }
            }
        }
        dropped
    }

    fn finish_question(state: &Rc<RefCell<ConnectionStateInner>>, id: u32) {
        let mut erase = false;
        {
            let mut inner = state.borrow_mut();
            if let Some(q) = inner.questions.find_mut(id) {
                q.owner_dropped = true;
                if !q.is_awaiting_return {
                    erase = true;
                }
            }
        }
        {
            let mut inner = state.borrow_mut();
            let mut message = inner.network.new_outgoing_message(None);
            {
                let root: message::Builder = message.get_body().unwrap().init_as();
                let mut finish_builder: finish::Builder = root.init_finish();
                finish_builder.set_question_id(id);
                let is_tail_call = inner.questions.find(id).map(|q| q.is_tail_call).unwrap_or(false);
                finish_builder.set_release_result_caps(!is_tail_call);
            }
            let _ = message.send();
        }
        if erase {
            let mut inner = state.borrow_mut();
            inner.questions.erase(id);
        }
    }

    /// Handles a single incoming `Message`, dispatching to whichever table it targets.
    fn handle_message(
        state: &Rc<RefCell<ConnectionStateInner>>,
        incoming: Box<dyn IncomingMessage>,
    ) -> capnp::Result<()> {
        let incoming = Rc::new(incoming);
        let root: message::Reader = incoming.get_body()?.get_as()?;
        // An unrecognized top-level arm is a version-skew condition, not a protocol
        // violation: echo it back wrapped in `Unimplemented` rather than letting the
        // `NotInSchema` conversion bubble up and disconnect the connection.
        let which = match root.which() {
            Ok(w) => w,
            Err(_not_in_schema) => return Self::send_unimplemented(state, root),
        };
        match which {
            message::Unimplemented(_) => Ok(()),
            message::Abort(reason) => {
                let e = crate::error::to_error(reason?);
                ConnectionState::disconnect(state, e);
                Ok(())
            }
            message::Call(call) => Self::handle_call(state, incoming.clone(), call?),
            message::Return(ret) => Self::handle_return(state, incoming.clone(), ret?),
            message::Finish(finish) => Self::handle_finish(state, finish?),
            message::Resolve(resolve) => Self::handle_resolve(state, resolve?),
            message::Release(release) => Self::handle_release(state, release?),
            message::Disembargo(disembargo) => Self::handle_disembargo(state, disembargo?),
            message::Restore(restore) => Self::handle_restore(state, restore?),
        }
    }

    /// Echoes `original` back as `Message.unimplemented`. Never fatal: a peer sending a
    /// message arm we don't recognize is a version-skew condition, not a
    /// connection-ending protocol violation.
    fn send_unimplemented(
        state: &Rc<RefCell<ConnectionStateInner>>,
        original: message::Reader,
    ) -> capnp::Result<()> {
        let mut inner = state.borrow_mut();
        let mut message = inner.network.new_outgoing_message(None);
        {
            let mut root: message::Builder = message.get_body()?.init_as();
            root.set_unimplemented(original)?;
        }
        let _ = message.send();
        Ok(())
    }

    fn resolve_message_target(
        state: &Rc<RefCell<ConnectionStateInner>>,
        target: message_target::Reader,
    ) -> capnp::Result<Box<dyn ClientHook>> {
        Ok(match target.which()? {
            message_target::ImportedCap(id) => {
                let inner = state.borrow();
                match inner.exports.find(id) {
                    Some(export) => export.client.add_ref(),
                    None => {
                        return Ok(Box::new(crate::broken::Client::new(
                            Error::failed(format!("no such export: {id}")),
                            true,
                            0,
                        )))
                    }
                }
            }
            message_target::PromisedAnswer(pa) => {
                let pa = pa?;
                let ops = read_pipeline_ops(pa.get_transform()?)?;
                let inner = state.borrow();
                match inner.answers.find(pa.get_question_id()) {
                    Some(answer) => match &answer.pipeline {
                        Some(pipeline) => pipeline.get_pipelined_cap(&ops),
                        None => Box::new(crate::broken::Client::new(
                            Error::failed("answer has no pipeline yet".into()),
                            true,
                            0,
                        )),
                    },
                    None => Box::new(crate::broken::Client::new(
                        Error::failed("no such answer".into()),
                        true,
                        0,
                    )),
                }
            }
        })
    }

    fn handle_call(
        state: &Rc<RefCell<ConnectionStateInner>>,
        incoming: Rc<Box<dyn IncomingMessage>>,
        call: call::Reader,
    ) -> capnp::Result<()> {
        let answer_id = call.get_question_id();
        let target = Self::resolve_message_target(state, call.get_target()?)?;

        let mut cap_table = Vec::new();
        {
            let params = call.get_params()?;
            let mut inner = state.borrow_mut();
            for descriptor in params.get_cap_table()?.iter() {
                cap_table.push(Some(inner.receive_cap(descriptor)?));
            }
        }

        let params_hook = Box::new(IncomingParams {
            message: incoming,
            cap_table,
        });

        let send_results_to_yourself =
            matches!(call.get_send_results_to().which()?, send_results_to::Yourself(()));

        let (cancellation, cancel_rx) = CancellationState::new();
        let (placeholder_pipeline, mut driven_pipeline) = crate::queued::Pipeline::new();

        let results_hook: Box<dyn ResultsHook> = if send_results_to_yourself {
            Box::new(RedirectedResults {
                connection_state: state.clone(),
                answer_id,
                message: Some(capnp::message::Builder::new_default()),
                cap_table: Vec::new(),
                cancellation: cancellation.clone(),
                pipeline: placeholder_pipeline.clone(),
            })
        } else {
            let mut response_message = {
                let mut inner = state.borrow_mut();
                let mut message = inner.network.new_outgoing_message(None);
                {
                    let root: message::Builder = message.get_body().unwrap().init_as();
                    let mut ret: r#return::Builder = root.init_return();
                    ret.set_answer_id(answer_id);
                    ret.init_results();
                }
                message
            };
            response_message.get_body()?; // ensure buffer materialized before handoff below
            Box::new(CallResults {
                connection_state: state.clone(),
                answer_id,
                message: Some(response_message),
                cap_table: Vec::new(),
                cancellation: cancellation.clone(),
                pipeline: placeholder_pipeline.clone(),
            })
        };

        let interface_id = call.get_interface_id();
        let method_id = call.get_method_id();
        let promise = target.call(interface_id, method_id, params_hook, results_hook);

        let answer_pipeline: Box<dyn PipelineHook> = Box::new(placeholder_pipeline.clone());

        state.borrow_mut().answers.insert(
            answer_id,
            Answer {
                active: true,
                pipeline: Some(answer_pipeline),
                cancellation,
                result_exports: Vec::new(),
                pending_return: None,
                finish_received: false,
                release_result_caps_on_finish: true,
                return_sent: false,
                redirected_results: None,
            },
        );

        let weak_state = Rc::downgrade(state);
        driven_pipeline.drive(async move {
            match select(promise, cancel_rx).await {
                Either::Left((result, _cancel_rx)) => {
                    // Declared before `inner` so it drops only once `inner`'s borrow has
                    // ended -- a dropped export's client can be an `ImportClient` of this
                    // same connection, whose `Drop` impl borrows `inner` again.
                    let mut dropped_exports = Vec::new();
                    if let Some(s) = weak_state.upgrade() {
                        let mut inner = s.borrow_mut();
                        let already_claimed = inner
                            .answers
                            .find(answer_id)
                            .map(|a| a.cancellation.return_claimed.replace(true))
                            .unwrap_or(true);
                        if !already_claimed {
                            match result {
                                Ok(()) => {
                                    let pending =
                                        inner.answers.find_mut(answer_id).and_then(|a| a.pending_return.take());
                                    if let Some(msg) = pending {
                                        let _ = msg.send();
                                    }
                                }
                                Err(e) => inner.send_exception_return(answer_id, &e),
                            }
                            let finish_received =
                                inner.answers.find(answer_id).map(|a| a.finish_received).unwrap_or(false);
                            let release = inner
                                .answers
                                .find(answer_id)
                                .map(|a| a.release_result_caps_on_finish)
                                .unwrap_or(true);
                            if let Some(answer) = inner.answers.find_mut(answer_id) {
                                answer.return_sent = true;
                            }
                            if finish_received {
                                dropped_exports = ConnectionState::finalize_answer(&mut inner, answer_id, release);
                            }
                        }
                        if let Some(answer) = inner.answers.find_mut(answer_id) {
                            answer.active = false;
                        }
                    }
                }
                Either::Right((_, call_future)) => {
                    let mut dropped_exports = Vec::new();
                    if let Some(s) = weak_state.upgrade() {
                        let mut inner = s.borrow_mut();
                        let already_claimed = inner
                            .answers
                            .find(answer_id)
                            .map(|a| a.cancellation.return_claimed.replace(true))
                            .unwrap_or(true);
                        if !already_claimed {
                            inner.send_canceled_return(answer_id);
                            let finish_received =
                                inner.answers.find(answer_id).map(|a| a.finish_received).unwrap_or(false);
                            let release = inner
                                .answers
                                .find(answer_id)
                                .map(|a| a.release_result_caps_on_finish)
                                .unwrap_or(true);
                            if let Some(answer) = inner.answers.find_mut(answer_id) {
                                answer.return_sent = true;
                            }
                            if finish_received {
                                dropped_exports = ConnectionState::finalize_answer(&mut inner, answer_id, release);
                            }
                        }
                        if let Some(answer) = inner.answers.find_mut(answer_id) {
                            answer.active = false;
                        }
                    }
                    // Stop the call's own side effects now that we've answered `canceled`.
                    drop(call_future);
                }
            }
            Ok(())
        });

        Ok(())
    }

    fn handle_return(
        state: &Rc<RefCell<ConnectionStateInner>>,
        incoming: Rc<Box<dyn IncomingMessage>>,
        ret: r#return::Reader,
    ) -> capnp::Result<()> {
        let question_id = ret.get_answer_id();
        let (response_fulfiller, tail_fulfiller) = {
            let mut inner = state.borrow_mut();
            match inner.questions.find_mut(question_id) {
                Some(q) => (q.response_fulfiller.take(), q.tail_fulfiller.take()),
                None => (None, None),
            }
        };

        if let Some(tail_fulfiller) = tail_fulfiller {
            // A question opened by `tail_send` must be answered with
            // `resultsSentElsewhere`, never a direct result.
            let result = match ret.which()? {
                r#return::ResultsSentElsewhere(()) => Ok(()),
                r#return::Exception(e) => Err(crate::error::to_error(e?)),
                r#return::Canceled(()) => Err(Error::failed("call canceled by peer".into())),
                _ => Err(Error::failed(
                    "tail call answered with a direct result instead of resultsSentElsewhere".into(),
                )),
            };
            let _ = tail_fulfiller.send(result);
        } else if let Some(fulfiller) = response_fulfiller {
            let result: Result<Box<dyn ResponseHook>, Error> = match ret.which()? {
                r#return::Results(payload) => {
                    let payload = payload?;
                    let mut cap_table = Vec::new();
                    {
                        let mut inner = state.borrow_mut();
                        for descriptor in payload.get_cap_table()?.iter() {
                            cap_table.push(Some(inner.receive_cap(descriptor)?));
                        }
                    }
                    Ok(Box::new(RpcResponse {
                        inner: Rc::new(RpcResponseInner {
                            message: Box::new(incoming) as Box<dyn IncomingMessage>,
                            cap_table,
                        }),
                    }))
                }
                r#return::Exception(e) => Err(crate::error::to_error(e?)),
                r#return::Canceled(()) => Err(Error::failed("call canceled by peer".into())),
                r#return::ResultsSentElsewhere(()) => Err(Error::failed(
                    "resultsSentElsewhere received for a question that wasn't a tail call".into(),
                )),
                r#return::TakeFromOtherQuestion(other_id) => {
                    let inner = state.borrow();
                    match inner.answers.find(other_id) {
                        Some(answer) => match &answer.redirected_results {
                            Some(Ok(handle)) => Ok(Box::new(handle.clone()) as Box<dyn ResponseHook>),
                            Some(Err(e)) => Err(e.clone()),
                            None => Err(Error::failed(
                                "takeFromOtherQuestion referenced an answer with no redirected results yet".into(),
                            )),
                        },
                        None => Err(Error::failed(format!("takeFromOtherQuestion: no such answer {other_id}"))),
                    }
                }
            };
            let _ = fulfiller.send(result);
        } else {
            return Ok(());
        }

        if ret.get_release_param_caps() {
            // Declared before `inner` so any dropped export's client -- possibly an
            // `ImportClient` of this connection, whose `Drop` impl borrows `inner` again --
            // drops only after `inner`'s borrow has ended.
            let mut dropped_exports = Vec::new();
            let mut inner = state.borrow_mut();
            let exports = inner.questions.find(question_id).map(|q| q.param_exports.clone());
            if let Some(exports) = exports {
                for id in exports {
                    if let Some(export) = inner.exports.find_mut(id) {
                        export.refcount -= 1;
                        if export.refcount == 0 {
                            if let Some(export) = inner.exports.erase(id) {
                                dropped_exports.push(export.client);
                            }
                            inner.exports_by_cap.retain(|_, v| *v != id);
                        }
                    }
                }
            }
            drop(inner);
            drop(dropped_exports);
        }

        let mut erase = false;
        {
            let mut inner = state.borrow_mut();
            if let Some(q) = inner.questions.find_mut(question_id) {
                q.is_awaiting_return = false;
                if q.owner_dropped {
                    erase = true;
                }
            }
        }
        if erase {
            state.borrow_mut().questions.erase(question_id);
        }
        Ok(())
    }

    fn handle_finish(
        state: &Rc<RefCell<ConnectionStateInner>>,
        finish: finish::Reader,
    ) -> capnp::Result<()> {
        let answer_id = finish.get_question_id();
        let release_result_caps = finish.get_release_result_caps();
        // Declared before `inner` so any dropped export's client -- possibly an
        // `ImportClient` of this connection, whose `Drop` impl borrows `inner` again --
        // drops only after `inner`'s borrow has ended.
        let mut dropped_exports = Vec::new();
        let mut inner = state.borrow_mut();
        let Some(answer) = inner.answers.find_mut(answer_id) else {
            // No such answer: either it was never opened, or it was already finalized by
            // an earlier Finish -- a peer is only ever supposed to send one. Either way
            // this is a protocol violation, not something to silently ignore.
            return Err(Error::failed(format!("finish for unknown or already-finished answer {answer_id}")));
        };
        if answer.return_sent {
            // The later of Finish/Return finalizes the answer; Return already went out,
            // so do it now.
            dropped_exports = ConnectionState::finalize_answer(&mut inner, answer_id, release_result_caps);
        } else {
            // Return hasn't gone out yet: remember the peer's choice for when it does,
            // and record half of the cancellation join -- the other half,
            // `allowCancellation`, comes from the application via `CallResults`.
            answer.finish_received = true;
            answer.release_result_caps_on_finish = release_result_caps;
            let cancellation = answer.cancellation.clone();
            cancellation.mark_requested();
        }
        drop(inner);
        drop(dropped_exports);
        Ok(())
    }

    fn handle_resolve(
        state: &Rc<RefCell<ConnectionStateInner>>,
        resolve: resolve::Reader,
    ) -> capnp::Result<()> {
        let promise_id = resolve.get_promise_id();
        let (replacement, is_error) = match resolve.which()? {
            resolve::Cap(c) => {
                let mut inner = state.borrow_mut();
                (inner.receive_cap(c?)?, false)
            }
            resolve::Exception(e) => (
                Box::new(crate::broken::Client::new(crate::error::to_error(e?), true, 0))
                    as Box<dyn ClientHook>,
                true,
            ),
        };
        let fulfiller = {
            let mut inner = state.borrow_mut();
            inner
                .imports
                .find_mut(promise_id)
                .and_then(|entry| entry.promise_fulfiller.take())
        };
        if let Some(fulfiller) = fulfiller {
            let _ = fulfiller.send(replacement);
        }
        let _ = is_error;
        Ok(())
    }

    fn handle_release(
        state: &Rc<RefCell<ConnectionStateInner>>,
        release: release::Reader,
    ) -> capnp::Result<()> {
        let id = release.get_id();
        let count = release.get_reference_count();
        // Declared before `inner` so a dropped export's client -- possibly an
        // `ImportClient` of this connection, whose `Drop` impl borrows `inner` again --
        // drops only after `inner`'s borrow has ended.
        let mut dropped_export = None;
        let mut inner = state.borrow_mut();
        if let Some(export) = inner.exports.find_mut(id) {
            export.refcount = export.refcount.saturating_sub(count);
            if export.refcount == 0 {
                let ptr = export.client.get_ptr();
                dropped_export = inner.exports.erase(id);
                inner.exports_by_cap.remove(&ptr);
            }
        }
        drop(inner);
        drop(dropped_export);
        Ok(())
    }

    fn handle_disembargo(
        state: &Rc<RefCell<ConnectionStateInner>>,
        disembargo: disembargo::Reader,
    ) -> capnp::Result<()> {
        match disembargo.get_context().which()? {
            disembargo::context::SenderLoopback(embargo_id) => {
                // We are asked to loop a Disembargo back once every call we've already
                // queued against `target` has drained, proving no call addressed via the
                // old path can still arrive after this echo.
                let target = Self::resolve_message_target(state, disembargo.get_target()?)?;
                let mut inner = state.borrow_mut();
                let mut message = inner.network.new_outgoing_message(None);
                {
                    let root: message::Builder = message.get_body().unwrap().init_as();
                    let mut out: disembargo::Builder = root.init_disembargo();
                    write_message_target(
                        &match disembargo.get_target()?.which()? {
                            message_target::ImportedCap(id) => TargetDescriptor::Import(id),
                            message_target::PromisedAnswer(pa) => {
                                let pa = pa?;
                                TargetDescriptor::Answer(
                                    pa.get_question_id(),
                                    read_pipeline_ops(pa.get_transform()?)?,
                                )
                            }
                        },
                        out.reborrow().init_target(),
                    );
                    out.reborrow().init_context().set_receiver_loopback(embargo_id);
                }
                let _ = target;
                let _ = message.send();
                Ok(())
            }
            disembargo::context::ReceiverLoopback(embargo_id) => {
                let fulfiller = {
                    let mut inner = state.borrow_mut();
                    inner
                        .embargoes
                        .find_mut(embargo_id)
                        .and_then(|e| e.fulfiller.take())
                };
                state.borrow_mut().embargoes.erase(embargo_id);
                if let Some(fulfiller) = fulfiller {
                    let _ = fulfiller.send(());
                }
                Ok(())
            }
        }
    }

    fn handle_restore(
        state: &Rc<RefCell<ConnectionStateInner>>,
        restore: crate::rpc_capnp::restore::Reader,
    ) -> capnp::Result<()> {
        let question_id = restore.get_question_id();
        let mut inner = state.borrow_mut();
        let mut message = inner.network.new_outgoing_message(None);
        {
            let root: message::Builder = message.get_body().unwrap().init_as();
            let mut ret: r#return::Builder = root.init_return();
            ret.set_answer_id(question_id);
            match inner.bootstrap.as_ref() {
                Some(bootstrap) => {
                    let bootstrap = bootstrap.add_ref();
                    let mut payload: payload::Builder = ret.init_results();
                    let content = payload.reborrow().init_content();
                    let mut cap_table = payload.init_cap_table(1);
                    let descriptor = cap_table.reborrow().get(0);
                    inner.write_descriptor(bootstrap.as_ref(), descriptor);
                    let _ = content;
                }
                None => {
                    crate::error::from_error(
                        &Error::failed("no bootstrap interface registered".into()),
                        ret.init_exception(),
                    );
                }
            }
        }
        let _ = message.send();
        Ok(())
    }

    /// Teardown order: reject every live handle *while the tables are still populated*
    /// (so lookups by id still resolve), then swap each table for an empty one and only
    /// drop the old contents once our own `RefCell` borrow has ended. A
    /// `QuestionRef`/`ImportClientState` destructor that fires while a table is being
    /// dropped calls back into `borrow_mut()` on this same cell (see `finish_question`,
    /// `ImportClientState::drop`); dropping the old tables before releasing `inner`
    /// would make that a reentrant borrow and panic.
    fn disconnect(state: &Rc<RefCell<ConnectionStateInner>>, error: Error) {
        let (old_answers, old_exports, old_imports, old_embargoes) = {
            let mut inner = state.borrow_mut();
            if inner.disconnected.is_some() {
                return;
            }
            inner.disconnected = Some(error.clone());

            let question_ids: Vec<u32> = inner.questions.iter().map(|(id, _)| id).collect();
            for id in question_ids {
                if let Some(q) = inner.questions.find_mut(id) {
                    if let Some(f) = q.response_fulfiller.take() {
                        let _ = f.send(Err(error.clone()));
                    }
                    if let Some(f) = q.tail_fulfiller.take() {
                        let _ = f.send(Err(error.clone()));
                    }
                }
            }

            for (_, entry) in inner.imports.slots.iter_mut() {
                if let Some(f) = entry.promise_fulfiller.take() {
                    let _ = f.send(Box::new(crate::broken::Client::new(error.clone(), false, 0)));
                }
            }
            for (_, embargo) in inner.embargoes.iter_mut() {
                if let Some(f) = embargo.fulfiller.take() {
                    let _ = f.send(());
                }
            }

            let old_answers = std::mem::replace(&mut inner.answers, IdTable::new());
            let old_exports = std::mem::replace(&mut inner.exports, ExportTable::new());
            inner.exports_by_cap.clear();
            let old_imports = std::mem::replace(&mut inner.imports, IdTable::new());
            inner.imports_by_ptr.clear();
            let old_embargoes = std::mem::replace(&mut inner.embargoes, ExportTable::new());
            inner.tasks.terminate();

            (old_answers, old_exports, old_imports, old_embargoes)
            // `inner` (the RefMut) is dropped here, at the end of this block.
        };
        drop(old_answers);
        drop(old_exports);
        drop(old_imports);
        drop(old_embargoes);
    }
}

struct Reaper {
    connection_state: Weak<RefCell<ConnectionStateInner>>,
}

impl TaskReaper for Reaper {
    fn task_failed(&mut self, error: Error) {
        if let Some(state) = self.connection_state.upgrade() {
            ConnectionState::disconnect(&state, error);
        }
    }
}

/// Owns one connection's tables and runs its message loop. Construct with
/// [`RpcSystem::new`] and hand it to `tokio::task::spawn_local` (it is itself a
/// `Future<Output = ()>`) or simply `.await` it directly in test code.
pub struct RpcSystem {
    connection_state: Rc<RefCell<ConnectionStateInner>>,
    tasks: TaskSet<Reaper>,
}

impl RpcSystem {
    pub fn new(network: Box<dyn VatNetwork>, bootstrap: Option<Box<dyn ClientHook>>) -> Self {
        let brand = Box::into_raw(Box::new(())) as usize;
        let (tasks_handle, tasks) = task_set::task_set(Reaper {
            connection_state: Weak::new(),
        });
        let connection_state = Rc::new_cyclic(|weak| {
            RefCell::new(ConnectionStateInner {
                weak_self: weak.clone(),
                brand,
                bootstrap,
                network,
                questions: ExportTable::new(),
                answers: IdTable::new(),
                exports: ExportTable::new(),
                exports_by_cap: HashMap::new(),
                imports: IdTable::new(),
                imports_by_ptr: HashMap::new(),
                embargoes: ExportTable::new(),
                tasks: tasks_handle,
                disconnected: None,
            })
        });

        let weak_for_reaper = Rc::downgrade(&connection_state);
        let mut tasks = tasks;
        tasks.set_reaper(Reaper {
            connection_state: weak_for_reaper,
        });

        let loop_state = connection_state.clone();
        connection_state.borrow().tasks.clone().add(Box::pin(async move {
            loop {
                let next = {
                    let mut inner = loop_state.borrow_mut();
                    if inner.disconnected.is_some() {
                        return Ok(());
                    }
                    inner.network.receive_incoming_message()
                };
                match next.await {
                    Ok(Some(incoming)) => {
                        if let Err(e) = ConnectionState::handle_message(&loop_state, incoming) {
                            ConnectionState::disconnect(&loop_state, e);
                        }
                    }
                    Ok(None) => {
                        ConnectionState::disconnect(
                            &loop_state,
                            Error::disconnected("peer closed the connection".into()),
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        ConnectionState::disconnect(&loop_state, e);
                        return Ok(());
                    }
                }
            }
        }));

        Self {
            connection_state,
            tasks,
        }
    }

    /// Requests the peer's bootstrap capability. Can be called any number of times;
    /// each call sends a fresh `Restore` message (functioning here purely as a
    /// bootstrap request -- see DESIGN.md).
    pub fn bootstrap<T>(&mut self) -> T
    where
        T: capability::FromClientHook,
    {
        let connection_state = self.connection_state.clone();
        let (response_fulfiller, response_receiver) = oneshot::channel();
        let question_id = {
            let mut inner = connection_state.borrow_mut();
            let mut message = inner.network.new_outgoing_message(None);
            let question_id = inner.questions.push(Question {
                response_fulfiller: Some(response_fulfiller),
                tail_fulfiller: None,
                is_awaiting_return: true,
                is_tail_call: false,
                owner_dropped: false,
                param_exports: Vec::new(),
            });
            {
                let root: message::Builder = message.get_body().unwrap().init_as();
                let mut restore: crate::rpc_capnp::restore::Builder = root.init_restore();
                restore.set_question_id(question_id);
            }
            let _ = message.send();
            question_id
        };

        let question_ref = Rc::new(QuestionRef {
            connection_state: Rc::downgrade(&connection_state),
            id: question_id,
        });
        let pipeline = Pipeline {
            connection_state: Rc::downgrade(&connection_state),
            question_ref,
        };
        let _ = response_receiver;
        T::new(pipeline.get_pipelined_cap(&[]))
    }
}

impl std::future::Future for RpcSystem {
    type Output = ();
    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.tasks).poll(cx)
    }
}

