// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE.

//! Four Tables engine for the Cap'n Proto RPC protocol.
//!
//! This crate implements the per-connection state machine described in `rpc.capnp`:
//! promise-pipelined method invocation, capability reference counting across the
//! questions/answers/exports/imports tables, and the disembargo protocol that keeps
//! call ordering correct when a promise resolves to a locally-hosted object. It does
//! not implement a transport; [`VatNetwork`] is the trait this crate programs against,
//! and [`twoparty`] is the one concrete two-party implementation it ships.

pub mod rpc_capnp {
    include!(concat!(env!("OUT_DIR"), "/rpc_capnp.rs"));
}

pub mod rpc_twoparty_capnp {
    include!(concat!(env!("OUT_DIR"), "/rpc_twoparty_capnp.rs"));
}

#[doc(hidden)]
pub mod test_capnp {
    include!(concat!(env!("OUT_DIR"), "/test_capnp.rs"));
}

mod broken;
mod error;
mod local;
mod queued;
mod rpc;
mod sender_queue;
mod split;
mod task_set;
pub mod twoparty;
mod vat_network;

#[doc(hidden)]
pub mod test_support;

pub use crate::local::{new_client, ImbuedMessageBuilder};
pub use crate::rpc::RpcSystem;
pub use crate::vat_network::{IncomingMessage, OutgoingMessage, VatNetwork};

/// Unwraps a `Result`, returning a broken `Promise` carrying the error on `Err`.
///
/// Used throughout promise-building code (and by application `Server` impls) the same
/// way `?` is used in a function returning `Result`: `pry!` is for the places that
/// instead have to return a `capnp::capability::Promise`.
#[macro_export]
macro_rules! pry {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return ::capnp::capability::Promise::err(e.into()),
        }
    };
}
