// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE.

//! `Server` implementations backing `test_capnp`, used only by this crate's own test
//! suite to exercise the engine against a real `VatNetwork` rather than mocking the
//! four tables directly.

use capnp::capability::{FromClientHook, Promise};
use capnp::private::capability::ClientHook;
use capnp::Error;

use futures_util::FutureExt;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::test_capnp::{bootstrap, test_call_order, test_extends, test_interface, test_pipeline, test_tail_callee, test_tail_caller};

#[derive(Default, Clone)]
pub struct Bootstrap;

impl bootstrap::Server for Bootstrap {
    async fn test_interface(
        self: Rc<Self>,
        _params: bootstrap::TestInterfaceParams,
        mut results: bootstrap::TestInterfaceResults,
    ) -> Result<(), Error> {
        results.get().set_cap(crate::new_client(TestInterface::new()));
        Ok(())
    }

    async fn test_extends(
        self: Rc<Self>,
        _params: bootstrap::TestExtendsParams,
        mut results: bootstrap::TestExtendsResults,
    ) -> Result<(), Error> {
        results.get().set_cap(crate::new_client(TestExtends));
        Ok(())
    }

    async fn test_pipeline(
        self: Rc<Self>,
        _params: bootstrap::TestPipelineParams,
        mut results: bootstrap::TestPipelineResults,
    ) -> Result<(), Error> {
        results.get().set_cap(crate::new_client(TestPipeline::default()));
        Ok(())
    }

    async fn test_call_order(
        self: Rc<Self>,
        _params: bootstrap::TestCallOrderParams,
        mut results: bootstrap::TestCallOrderResults,
    ) -> Result<(), Error> {
        results.get().set_cap(crate::new_client(TestCallOrder::new()));
        Ok(())
    }

    async fn test_tail_callee(
        self: Rc<Self>,
        _params: bootstrap::TestTailCalleeParams,
        mut results: bootstrap::TestTailCalleeResults,
    ) -> Result<(), Error> {
        results
            .get()
            .set_cap(crate::new_client(TestTailCallee::new()));
        Ok(())
    }

    async fn test_tail_caller(
        self: Rc<Self>,
        _params: bootstrap::TestTailCallerParams,
        mut results: bootstrap::TestTailCallerResults,
    ) -> Result<(), Error> {
        results
            .get()
            .set_cap(crate::new_client(TestTailCaller::new()));
        Ok(())
    }
}

/// Plain capability with no pipelining or cancellation surface of its own; used to
/// check basic call dispatch (`foo`), error propagation (`bar`), and default-less
/// struct params (`baz`).
#[derive(Default, Clone)]
pub struct TestInterface {
    call_count: Rc<Cell<u64>>,
    never_return_canceled: Rc<Cell<bool>>,
}

impl TestInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_call_count(&self) -> Rc<Cell<u64>> {
        self.call_count.clone()
    }

    /// Set once a pending `neverReturn` call's future has been dropped as a result of
    /// the caller abandoning its response promise.
    pub fn never_return_was_canceled(&self) -> Rc<Cell<bool>> {
        self.never_return_canceled.clone()
    }

    fn increment_call_count(&self) {
        self.call_count.set(self.call_count.get() + 1);
    }
}

struct CancelGuard(Rc<Cell<bool>>);

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

impl test_interface::Server for TestInterface {
    async fn foo(
        self: Rc<Self>,
        params: test_interface::FooParams,
        mut results: test_interface::FooResults,
    ) -> Result<(), Error> {
        self.increment_call_count();
        let params = params.get()?;
        if params.get_i() != 123 {
            return Err(Error::failed("expected i to equal 123".to_string()));
        }
        if !params.get_j() {
            return Err(Error::failed("expected j to be true".to_string()));
        }
        results.get().set_x("foo".into());
        Ok(())
    }

    async fn bar(
        self: Rc<Self>,
        _params: test_interface::BarParams,
        _results: test_interface::BarResults,
    ) -> Result<(), Error> {
        self.increment_call_count();
        Err(Error::unimplemented("bar is not implemented".to_string()))
    }

    async fn baz(
        self: Rc<Self>,
        params: test_interface::BazParams,
        _results: test_interface::BazResults,
    ) -> Result<(), Error> {
        self.increment_call_count();
        if params.get()?.get_s()? != "bazzed" {
            return Err(Error::failed("expected s to equal 'bazzed'".to_string()));
        }
        Ok(())
    }

    async fn never_return(
        self: Rc<Self>,
        _params: test_interface::NeverReturnParams,
        results: test_interface::NeverReturnResults,
    ) -> Result<(), Error> {
        self.increment_call_count();
        results.hook.allow_cancellation();
        let _guard = CancelGuard(self.never_return_canceled.clone());
        std::future::pending::<Result<(), Error>>().await
    }
}

#[derive(Clone)]
pub struct TestExtends;

impl test_interface::Server for TestExtends {
    async fn foo(
        self: Rc<Self>,
        params: test_interface::FooParams,
        mut results: test_interface::FooResults,
    ) -> Result<(), Error> {
        let params = params.get()?;
        if params.get_i() != 321 {
            return Err(Error::failed("expected i to equal 321".to_string()));
        }
        if params.get_j() {
            return Err(Error::failed("expected j to be false".to_string()));
        }
        results.get().set_x("bar".into());
        Ok(())
    }

    async fn bar(
        self: Rc<Self>,
        _params: test_interface::BarParams,
        _results: test_interface::BarResults,
    ) -> Result<(), Error> {
        Err(Error::unimplemented("bar is not implemented".to_string()))
    }

    async fn baz(
        self: Rc<Self>,
        _params: test_interface::BazParams,
        _results: test_interface::BazResults,
    ) -> Result<(), Error> {
        Err(Error::unimplemented("baz is not implemented".to_string()))
    }

    async fn never_return(
        self: Rc<Self>,
        _params: test_interface::NeverReturnParams,
        _results: test_interface::NeverReturnResults,
    ) -> Result<(), Error> {
        Err(Error::unimplemented("neverReturn is not implemented".to_string()))
    }
}

impl test_extends::Server for TestExtends {
    async fn qux(
        self: Rc<Self>,
        _params: test_extends::QuxParams,
        _results: test_extends::QuxResults,
    ) -> Result<(), Error> {
        Err(Error::unimplemented("qux is not implemented".to_string()))
    }

    async fn corge(
        self: Rc<Self>,
        _params: test_extends::CorgeParams,
        _results: test_extends::CorgeResults,
    ) -> Result<(), Error> {
        Err(Error::unimplemented("corge is not implemented".to_string()))
    }

    async fn grault(
        self: Rc<Self>,
        _params: test_extends::GraultParams,
        mut results: test_extends::GraultResults,
    ) -> Result<(), Error> {
        let mut results = results.get();
        results.set_i(12345);
        results.set_s("bound to extend".into());
        Ok(())
    }
}

/// Exercises pipelined calls into a capability handed back in the same `Call`: its
/// `getCap` dials `inCap.foo()` itself before returning, and the `outBox.cap` it
/// returns is a second capability (`TestExtends`), so a caller pipelining into
/// `outBox.cap.foo()` without waiting for `getCap` to resolve has to ride a
/// `PipelineClient` through this method's still-in-flight returned capability.
#[derive(Default, Clone)]
pub struct TestPipeline {
    /// The `queued::Client` backing the most recent still-unresolved `delayedEcho`
    /// call, paired with the real capability it will resolve to once
    /// `releaseDelayedEcho` arrives.
    pending_delayed_echo: Rc<RefCell<Option<(crate::queued::Client, Box<dyn ClientHook>)>>>,
}

impl test_pipeline::Server for TestPipeline {
    async fn get_cap(
        self: Rc<Self>,
        params: test_pipeline::GetCapParams,
        mut results: test_pipeline::GetCapResults,
    ) -> Result<(), Error> {
        if params.get()?.get_n() != 234 {
            return Err(Error::failed("expected n to equal 234".to_string()));
        }
        let cap = params.get()?.get_in_cap()?;
        let mut request = cap.foo_request();
        request.get().set_i(123);
        request.get().set_j(true);

        request
            .send()
            .promise
            .map(move |response| {
                if response?.get()?.get_x()? != "foo" {
                    return Err(Error::failed("expected x to equal 'foo'".to_string()));
                }
                results.get().set_s("bar".into());
                results.get().init_out_box().set_cap(crate::new_client(TestExtends));
                Ok(())
            })
            .await
    }

    async fn get_null_cap(
        self: Rc<Self>,
        _params: test_pipeline::GetNullCapParams,
        _results: test_pipeline::GetNullCapResults,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn echo(
        self: Rc<Self>,
        params: test_pipeline::EchoParams,
        mut results: test_pipeline::EchoResults,
    ) -> Result<(), Error> {
        results.get().set_cap(params.get()?.get_cap()?);
        Ok(())
    }

    async fn delayed_echo(
        self: Rc<Self>,
        params: test_pipeline::DelayedEchoParams,
        mut results: test_pipeline::DelayedEchoResults,
    ) -> Result<(), Error> {
        let target = params.get()?.get_cap()?.client.hook;
        let queued_client = crate::queued::Client::new();
        results
            .get()
            .set_cap(test_call_order::Client::new(Box::new(queued_client.clone())));
        *self.pending_delayed_echo.borrow_mut() = Some((queued_client, target));
        Ok(())
    }

    async fn release_delayed_echo(
        self: Rc<Self>,
        _params: test_pipeline::ReleaseDelayedEchoParams,
        _results: test_pipeline::ReleaseDelayedEchoResults,
    ) -> Result<(), Error> {
        if let Some((queued_client, target)) = self.pending_delayed_echo.borrow_mut().take() {
            queued_client.resolve(target);
        }
        Ok(())
    }
}

/// Hands back a strictly increasing sequence number per call so a test can confirm
/// that calls issued back-to-back on the same capability are actually delivered in
/// issue order (the invariant a disembargo is there to protect once a promise
/// resolves to a locally-hosted object).
#[derive(Default, Clone)]
pub struct TestCallOrder {
    count: Rc<RefCell<u32>>,
}

impl TestCallOrder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl test_call_order::Server for TestCallOrder {
    async fn get_call_sequence(
        self: Rc<Self>,
        _params: test_call_order::GetCallSequenceParams,
        mut results: test_call_order::GetCallSequenceResults,
    ) -> Result<(), Error> {
        let mut count = self.count.borrow_mut();
        results.get().set_n(*count);
        *count += 1;
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct TestTailCallee {
    call_count: Rc<Cell<u32>>,
}

impl TestTailCallee {
    pub fn new() -> Self {
        Self::default()
    }
}

impl test_tail_callee::Server for TestTailCallee {
    async fn foo(
        self: Rc<Self>,
        params: test_tail_callee::FooParams,
        mut results: test_tail_callee::FooResults,
    ) -> Result<(), Error> {
        self.call_count.set(self.call_count.get() + 1);
        let params = params.get()?;
        let i = params.get_i();
        let t = params.get_t()?.to_str()?;
        let mut results = results.get();
        results.set_i(i);
        let t = format!("{t} processed by TestTailCallee");
        results.set_t(t[..].into());
        results.set_c(crate::new_client(TestCallOrder::new()));
        Ok(())
    }
}

/// Receives a call whose *caller* asked for results to go directly to the original
/// requester (`Call.sendResultsTo.yourself`) rather than looping back through here:
/// `foo` forwards straight into `callee.foo()` via `tail_call()`, so this capability's
/// own `Return` never carries a results payload at all.
#[derive(Default, Clone)]
pub struct TestTailCaller;

impl TestTailCaller {
    pub fn new() -> Self {
        Self::default()
    }
}

impl test_tail_caller::Server for TestTailCaller {
    async fn foo(
        self: Rc<Self>,
        params: test_tail_caller::FooParams,
        results: test_tail_caller::FooResults,
    ) -> Result<(), Error> {
        let params = params.get()?;
        let i = params.get_i();
        let callee = params.get_callee()?;

        let mut request = callee.foo_request();
        request.get().set_i(i);
        request.get().set_t("from TestTailCaller".into());

        results.hook.tail_call(request.hook).await
    }
}
