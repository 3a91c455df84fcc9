// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE.

//! End-to-end exercises of the Four Tables engine over a real (in-memory) two-party
//! connection, rather than against the tables directly: each test drives the public
//! `RpcSystem`/`VatNetwork` surface the way `demos/hello-world` does, just over
//! `tokio::io::duplex` instead of a `TcpStream`.

use std::cell::Cell;
use std::rc::Rc;

use capnp::capability::FromClientHook;

use capnp_rpc::rpc_twoparty_capnp::Side;
use capnp_rpc::test_capnp::{bootstrap, test_call_order, test_extends, test_interface};
use capnp_rpc::test_support::{Bootstrap, TestCallOrder, TestInterface};
use capnp_rpc::{twoparty, RpcSystem, VatNetwork};

/// Connects a client and server `RpcSystem` over an in-memory duplex pipe, with the
/// server's bootstrap capability backed by `test_support::Bootstrap`. Both systems run
/// as detached `spawn_local` tasks for the life of the enclosing `LocalSet`.
async fn connected_bootstrap() -> bootstrap::Client {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let (client_reader, client_writer) = tokio::io::split(client_stream);
    let (server_reader, server_writer) = tokio::io::split(server_stream);

    let client_network = twoparty::VatNetwork::new(client_reader, client_writer, Side::Client, Default::default());
    let server_network = twoparty::VatNetwork::new(server_reader, server_writer, Side::Server, Default::default());

    let server_bootstrap: bootstrap::Client = capnp_rpc::new_client(Bootstrap);
    let server_rpc_system = RpcSystem::new(Box::new(server_network), Some(server_bootstrap.client));
    tokio::task::spawn_local(server_rpc_system);

    let mut client_rpc_system = RpcSystem::new(Box::new(client_network), None);
    let bootstrap_client: bootstrap::Client = client_rpc_system.bootstrap();
    tokio::task::spawn_local(client_rpc_system);

    bootstrap_client
}

/// Like `connected_bootstrap`, but the server's bootstrap capability is a directly
/// constructed `TestInterface`, bypassing the `Bootstrap` indirection so the test can
/// keep its own handle on the server-side call counter and cancellation flag.
async fn connected_test_interface() -> (test_interface::Client, Rc<Cell<u64>>, Rc<Cell<bool>>) {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let (client_reader, client_writer) = tokio::io::split(client_stream);
    let (server_reader, server_writer) = tokio::io::split(server_stream);

    let client_network = twoparty::VatNetwork::new(client_reader, client_writer, Side::Client, Default::default());
    let server_network = twoparty::VatNetwork::new(server_reader, server_writer, Side::Server, Default::default());

    let server_impl = TestInterface::new();
    let call_count = server_impl.get_call_count();
    let canceled = server_impl.never_return_was_canceled();
    let server_client: test_interface::Client = capnp_rpc::new_client(server_impl);

    let server_rpc_system = RpcSystem::new(Box::new(server_network), Some(server_client.client));
    tokio::task::spawn_local(server_rpc_system);

    let mut client_rpc_system = RpcSystem::new(Box::new(client_network), None);
    let client: test_interface::Client = client_rpc_system.bootstrap();
    tokio::task::spawn_local(client_rpc_system);

    (client, call_count, canceled)
}

#[tokio::test(flavor = "current_thread")]
async fn basic_call() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let (test_interface, call_count, _canceled) = connected_test_interface().await;

            let mut request = test_interface.foo_request();
            request.get().set_i(123);
            request.get().set_j(true);
            let response = request.send().promise.await.expect("foo should succeed");
            assert_eq!(response.get().unwrap().get_x().unwrap().to_str().unwrap(), "foo");

            let bar_result = test_interface.bar_request().send().promise.await;
            assert!(bar_result.is_err(), "bar() is unimplemented and should reject");

            assert_eq!(call_count.get(), 2);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn pipelining() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let bootstrap_client = connected_bootstrap().await;

            let in_cap: test_interface::Client = bootstrap_client
                .test_interface_request()
                .send()
                .promise
                .await
                .unwrap()
                .get()
                .unwrap()
                .get_cap()
                .unwrap();
            let pipeline_cap: capnp_rpc::test_capnp::test_pipeline::Client = bootstrap_client
                .test_pipeline_request()
                .send()
                .promise
                .await
                .unwrap()
                .get()
                .unwrap()
                .get_cap()
                .unwrap();

            let mut request = pipeline_cap.get_cap_request();
            request.get().set_n(234);
            request.get().set_in_cap(in_cap);

            // Pipeline straight into the still-unresolved `outBox.cap` without awaiting
            // `get_cap` first -- this is what a promise pipeline is for.
            let remote = request.send();
            let out_box_cap = remote.pipeline.get_out_box().get_cap();

            let mut foo_request = out_box_cap.foo_request();
            foo_request.get().set_i(321);
            foo_request.get().set_j(false);
            let foo_promise = foo_request.send().promise;

            let extends_cap = out_box_cap.cast_to::<test_extends::Client>();
            let grault_promise = extends_cap.grault_request().send().promise;

            let (response, foo_response, grault_response) =
                futures_util::future::join3(remote.promise, foo_promise, grault_promise).await;

            assert_eq!(response.unwrap().get().unwrap().get_s().unwrap().to_str().unwrap(), "bar");
            assert_eq!(foo_response.unwrap().get().unwrap().get_x().unwrap().to_str().unwrap(), "bar");

            let grault_response = grault_response.unwrap();
            let grault = grault_response.get().unwrap();
            assert_eq!(grault.get_i(), 12345);
            assert_eq!(grault.get_s().unwrap().to_str().unwrap(), "bound to extend");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn disconnect_mid_pipeline() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
            let (client_reader, client_writer) = tokio::io::split(client_stream);
            let (server_reader, server_writer) = tokio::io::split(server_stream);

            let client_network = twoparty::VatNetwork::new(client_reader, client_writer, Side::Client, Default::default());
            let server_network = twoparty::VatNetwork::new(server_reader, server_writer, Side::Server, Default::default());

            // Grabbed off the concrete network before it is boxed into the `RpcSystem` --
            // the signal itself is reference-counted and outlives the network object.
            let client_on_disconnect = client_network.on_disconnect();

            let server_bootstrap: bootstrap::Client = capnp_rpc::new_client(Bootstrap);
            let server_rpc_system = RpcSystem::new(Box::new(server_network), Some(server_bootstrap.client));
            let server_task = tokio::task::spawn_local(server_rpc_system);

            let mut client_rpc_system = RpcSystem::new(Box::new(client_network), None);
            let bootstrap_client: bootstrap::Client = client_rpc_system.bootstrap();
            tokio::task::spawn_local(client_rpc_system);

            // A live pipelined capability, obtained without awaiting anything yet.
            let pipeline_cap = bootstrap_client.test_interface_request().send().pipeline.get_cap();

            // Simulate the peer shutting its write side: tear down the server end of the
            // connection out from under the client.
            server_task.abort();
            let _ = server_task.await;

            client_on_disconnect.await.expect("on_disconnect should resolve Ok on a clean EOF");

            let rejected = pipeline_cap.foo_request().send().promise.await;
            assert!(rejected.is_err(), "pipelined calls issued after disconnect must reject");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn promise_race_embargo() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let bootstrap_client = connected_bootstrap().await;
            let pipeline_cap: capnp_rpc::test_capnp::test_pipeline::Client = bootstrap_client
                .test_pipeline_request()
                .send()
                .promise
                .await
                .unwrap()
                .get()
                .unwrap()
                .get_cap()
                .unwrap();

            // A capability hosted by *this* (client) process, handed to the server and
            // then echoed straight back. While the echo call is in flight, the promise
            // the client holds for its result is a *remote* promise; calls pipelined
            // through it have to cross to the server and back again as reverse calls.
            // Once it resolves, it turns out to name an object the client already hosts
            // locally -- exactly the "Tribble 4-way race" setup the disembargo protocol
            // exists to close off.
            let local_impl = TestInterface::new();
            let call_count = local_impl.get_call_count();
            let local_client: test_interface::Client = capnp_rpc::new_client(local_impl);

            let mut request = pipeline_cap.echo_request();
            request.get().set_cap(local_client.clone());
            let remote = request.send();

            let pipelined = remote.pipeline.get_cap();
            let mut pipelined_calls = Vec::new();
            for _ in 0..3 {
                let mut call = pipelined.foo_request();
                call.get().set_i(123);
                call.get().set_j(true);
                pipelined_calls.push(call.send().promise);
            }

            let echoed: test_interface::Client = remote.promise.await.unwrap().get().unwrap().get_cap().unwrap();

            for result in futures_util::future::join_all(pipelined_calls).await {
                result.expect("pipelined calls through the not-yet-resolved echo must land");
            }

            // A direct call on the now-resolved handle must still land correctly; the
            // embargo roundtrip is what guarantees it can't have overtaken the three
            // calls above.
            let mut direct = echoed.foo_request();
            direct.get().set_i(123);
            direct.get().set_j(true);
            direct.send().promise.await.expect("direct call on the resolved capability should succeed");

            assert_eq!(call_count.get(), 4);
        })
        .await;
}

/// Exercises `PromiseClient::resolve`'s embargo specifically: unlike
/// `promise_race_embargo` above (which resolves through a `PipelineClient` and so
/// never touches that code path), this drives a `senderPromise` import to resolution
/// and checks that the embargoed calls are not just delivered but delivered in order.
#[tokio::test(flavor = "current_thread")]
async fn promise_resolve_embargo_preserves_call_order() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let bootstrap_client = connected_bootstrap().await;
            let pipeline_cap: capnp_rpc::test_capnp::test_pipeline::Client = bootstrap_client
                .test_pipeline_request()
                .send()
                .promise
                .await
                .unwrap()
                .get()
                .unwrap()
                .get_cap()
                .unwrap();

            // A call-order capability hosted by *this* (client) process, handed to the
            // server as `delayedEcho`'s argument. The server returns a promise for it
            // that stays unresolved until `releaseDelayedEcho` is called, so the three
            // pipelined calls below have to cross to the server and loop back as
            // reverse calls while the promise is still a `senderPromise` import on this
            // end -- once the server resolves it back to this same local capability,
            // the disembargo round trip is what keeps a direct call on the now-resolved
            // handle from overtaking them.
            let local_client: test_call_order::Client = capnp_rpc::new_client(TestCallOrder::new());

            let mut request = pipeline_cap.delayed_echo_request();
            request.get().set_cap(local_client.clone());
            let remote = request.send();

            let promised = remote.pipeline.get_cap();
            let mut pipelined_calls = Vec::new();
            for i in 0..3 {
                let mut call = promised.get_call_sequence_request();
                call.get().set_expected(i);
                pipelined_calls.push(call.send().promise);
            }

            // Only now tell the server to resolve the promise. On the same connection
            // this is guaranteed to arrive after the three calls pipelined above.
            pipeline_cap
                .release_delayed_echo_request()
                .send()
                .promise
                .await
                .expect("releaseDelayedEcho should succeed");

            let resolved: test_call_order::Client = remote.promise.await.unwrap().get().unwrap().get_cap().unwrap();

            let mut sequence = Vec::new();
            for result in futures_util::future::join_all(pipelined_calls).await {
                let response = result.expect("pipelined calls through the not-yet-resolved promise must land");
                sequence.push(response.get().unwrap().get_n());
            }

            let mut direct = resolved.get_call_sequence_request();
            direct.get().set_expected(3);
            let direct_response = direct
                .send()
                .promise
                .await
                .expect("direct call on the resolved capability should succeed");
            sequence.push(direct_response.get().unwrap().get_n());

            assert_eq!(
                sequence,
                vec![0, 1, 2, 3],
                "a direct call must not overtake calls forwarded while the promise was still unresolved"
            );
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn tail_call() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let bootstrap_client = connected_bootstrap().await;

            let callee = bootstrap_client
                .test_tail_callee_request()
                .send()
                .promise
                .await
                .unwrap()
                .get()
                .unwrap()
                .get_cap()
                .unwrap();
            let caller = bootstrap_client
                .test_tail_caller_request()
                .send()
                .promise
                .await
                .unwrap()
                .get()
                .unwrap()
                .get_cap()
                .unwrap();

            let mut request = caller.foo_request();
            request.get().set_i(456);
            request.get().set_callee(callee);

            let response = request.send().promise.await.expect("tail call should succeed");
            let response = response.get().unwrap();
            assert_eq!(response.get_i(), 456);
            let t = response.get_t().unwrap().to_str().unwrap();
            assert!(t.contains("from TestTailCaller"));
            assert!(t.contains("processed by TestTailCallee"));

            let call_order = response.get_c().unwrap();
            let mut seq_request = call_order.get_call_sequence_request();
            seq_request.get().set_expected(0);
            let seq_response = seq_request.send().promise.await.unwrap();
            assert_eq!(seq_response.get().unwrap().get_n(), 0);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn cancellation() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let (test_interface, _call_count, canceled) = connected_test_interface().await;

            assert!(!canceled.get());

            let response_promise = test_interface.never_return_request().send().promise;
            // Let the `Call` actually cross the wire and start executing before we
            // abandon it.
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;

            drop(response_promise);

            // Dropping the response promise only requests cancellation (the other half
            // of the two-flag join is the callee's own opt-in); give the connection's
            // own tasks a turn to act on it.
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;

            assert!(canceled.get(), "server should notice the call was abandoned");

            // The connection must still be fully usable afterwards.
            let mut request = test_interface.foo_request();
            request.get().set_i(123);
            request.get().set_j(true);
            let response = request.send().promise.await.expect("connection should survive a canceled call");
            assert_eq!(response.get().unwrap().get_x().unwrap().to_str().unwrap(), "foo");
        })
        .await;
}
