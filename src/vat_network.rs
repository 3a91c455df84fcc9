// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE.

//! The transport interfaces this engine programs against. The transport itself --
//! async byte streams, framing -- is out of scope; what lives here is just the trait
//! boundary the Four Tables engine sits on top of. `crate::twoparty` is the one
//! concrete implementation this crate ships, matching every demo and test
//! (`twoparty::VatNetwork::new(reader, writer, side, options)`).

use capnp::any_pointer;
use capnp::capability::Promise;
use capnp::message::ReaderOptions;
use capnp::Error;

/// One message being written out. Mirrors `capnp::message::Builder`: callers fill in
/// `get_body()` then call `send()` once.
pub trait OutgoingMessage {
    fn get_body(&mut self) -> capnp::Result<any_pointer::Builder>;
    fn get_body_as_reader(&self) -> capnp::Result<any_pointer::Reader>;

    /// Actually writes the message to the wire. The returned promise resolves once the
    /// write has been handed to the transport (not necessarily flushed all the way to
    /// the peer's kernel buffer).
    fn send(self: Box<Self>) -> Promise<(), Error>;

    /// Best-effort size hint, used only for diagnostics/logging by callers that want
    /// one; this layer never inspects it.
    fn size_in_words(&self) -> usize;
}

/// One message that arrived off the wire, already framed and decoded into a capnp
/// message.
pub trait IncomingMessage {
    fn get_body(&self) -> capnp::Result<any_pointer::Reader>;
}

/// A single bidirectional, message-framed connection to one peer vat. `RpcSystem` owns
/// exactly one of these per connection -- see DESIGN.md for why this crate does not
/// additionally provide a multi-connection accept-loop container of its own.
pub trait VatNetwork {
    /// Allocates a new message to be filled in and eventually passed to
    /// `OutgoingMessage::send`. `size_hint`, if given, is in words.
    fn new_outgoing_message(&mut self, size_hint: Option<usize>) -> Box<dyn OutgoingMessage>;

    /// Waits for the next message to arrive. Resolves to `None` at a clean end of
    /// stream.
    fn receive_incoming_message(
        &mut self,
    ) -> Promise<Option<Box<dyn IncomingMessage>>, Error>;

    /// Resolves once the connection has been lost (read or write side), independent of
    /// whether the application has called anything else.
    fn on_disconnect(&self) -> Promise<(), Error>;

    /// Resolves once all outstanding writes have drained and no further traffic will be
    /// generated. Application code awaits this after releasing its last capability
    /// reference to know it is safe to drop the network without losing a final
    /// `Release`/`Finish`.
    fn on_drained(&self) -> Promise<(), Error>;

    fn reader_options(&self) -> ReaderOptions;
}
