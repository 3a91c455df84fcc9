// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE.

//! The one concrete [`VatNetwork`] this crate ships: a direct connection between
//! exactly two vats, addressed by [`rpc_twoparty_capnp::Side`] (there being only ever
//! two possible peers, `VatId` carries no further information -- see
//! `schema/rpc-twoparty.capnp`). Built on a split `AsyncRead`/`AsyncWrite` pair and
//! framed with `capnp_futures`' message (de)serialization.

use std::cell::RefCell;
use std::rc::Rc;

use capnp::any_pointer;
use capnp::capability::Promise;
use capnp::message::{Builder, HeapAllocator, ReaderOptions};
use capnp::Error;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::rpc_twoparty_capnp::Side;
use crate::vat_network::{IncomingMessage as IncomingMessageTrait, OutgoingMessage as OutgoingMessageTrait, VatNetwork as VatNetworkTrait};

type MessageBuilder = Builder<HeapAllocator>;

struct OutgoingMessage {
    message: MessageBuilder,
    sender: capnp_futures::write_queue::Sender<MessageBuilder>,
}

impl OutgoingMessageTrait for OutgoingMessage {
    fn get_body(&mut self) -> capnp::Result<any_pointer::Builder> {
        self.message.get_root()
    }

    fn get_body_as_reader(&self) -> capnp::Result<any_pointer::Reader> {
        self.message.get_root_as_reader()
    }

    fn send(self: Box<Self>) -> Promise<(), Error> {
        let Self { message, mut sender } = *self;
        Promise::from_future(async move {
            sender.send(message).await?;
            Ok(())
        })
    }

    fn size_in_words(&self) -> usize {
        self.message.size_in_words()
    }
}

struct IncomingMessage {
    message: ::capnp::message::Reader<::capnp::serialize::OwnedSegments>,
}

impl IncomingMessageTrait for IncomingMessage {
    fn get_body(&self) -> capnp::Result<any_pointer::Reader> {
        self.message.get_root()
    }
}

/// Fires exactly once; every call to `subscribe()` before or after that point observes
/// the same outcome. Backs `on_disconnect`/`on_drained`, both of which can be (and
/// routinely are) awaited from more than one place.
#[derive(Clone)]
struct OnceSignal {
    sender: Rc<watch::Sender<Option<Result<(), Error>>>>,
}

impl OnceSignal {
    fn new() -> Self {
        Self {
            sender: Rc::new(watch::Sender::new(None)),
        }
    }

    fn fire(&self, result: Result<(), Error>) {
        self.sender.send_if_modified(|slot| {
            if slot.is_some() {
                false
            } else {
                *slot = Some(result);
                true
            }
        });
    }

    fn wait(&self) -> Promise<(), Error> {
        let mut receiver = self.sender.subscribe();
        Promise::from_future(async move {
            loop {
                if let Some(ref result) = *receiver.borrow() {
                    return result.clone();
                }
                if receiver.changed().await.is_err() {
                    return Err(Error::disconnected("network was dropped".into()));
                }
            }
        })
    }
}

/// A two-party [`VatNetwork`] over a split `AsyncRead`/`AsyncWrite` transport, e.g. the
/// two halves of a `TcpStream` after `.into_split()`. One instance is constructed per
/// accepted or outbound connection and handed to [`crate::RpcSystem::new`].
pub struct VatNetwork<R>
where
    R: AsyncRead + Unpin + 'static,
{
    reader: Rc<RefCell<R>>,
    sender: capnp_futures::write_queue::Sender<MessageBuilder>,
    side: Side,
    reader_options: ReaderOptions,
    on_disconnect: OnceSignal,
    on_drained: OnceSignal,
}

impl<R> VatNetwork<R>
where
    R: AsyncRead + Unpin + 'static,
{
    /// `side` breaks the symmetry between the two endpoints of a connection with no
    /// other addressing information (`schema/rpc-twoparty.capnp`'s `VatId`): whichever
    /// side calls `bootstrap()` first still gets the fixed bootstrap capability the
    /// other side was constructed with, so `side` itself carries no protocol behavior
    /// in this crate beyond being available for the application to branch on.
    pub fn new<W>(reader: R, writer: W, side: Side, reader_options: ReaderOptions) -> Self
    where
        W: AsyncWrite + Unpin + 'static,
    {
        let (sender, write_queue) = capnp_futures::write_queue::write_queue(writer);
        let on_disconnect = OnceSignal::new();
        let on_drained = OnceSignal::new();
        let write_driver_disconnect = on_disconnect.clone();
        let write_driver_drained = on_drained.clone();
        // `write_queue` does nothing on its own: it must be polled for queued messages
        // to actually reach `writer`. Spawned here (rather than stashed as a field) so
        // `Sender::send` futures can resolve without the caller separately driving us.
        tokio::task::spawn_local(async move {
            // `write_queue` only resolves once every `Sender` clone -- ours and every
            // in-flight `OutgoingMessage`'s -- has been dropped and the last queued write
            // has gone out, i.e. exactly the "no further traffic" condition `on_drained`
            // promises.
            match write_queue.await {
                Ok(()) => write_driver_drained.fire(Ok(())),
                Err(e) => write_driver_disconnect.fire(Err(e)),
            }
        });

        Self {
            reader: Rc::new(RefCell::new(reader)),
            sender,
            side,
            reader_options,
            on_disconnect,
            on_drained,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }
}

impl<R> VatNetworkTrait for VatNetwork<R>
where
    R: AsyncRead + Unpin + 'static,
{
    fn new_outgoing_message(&mut self, _size_hint: Option<usize>) -> Box<dyn OutgoingMessageTrait> {
        Box::new(OutgoingMessage {
            message: Builder::new_default(),
            sender: self.sender.clone(),
        })
    }

    fn receive_incoming_message(&mut self) -> Promise<Option<Box<dyn IncomingMessageTrait>>, Error> {
        let reader = self.reader.clone();
        let options = self.reader_options;
        let on_disconnect = self.on_disconnect.clone();
        Promise::from_future(async move {
            let mut guard = reader.borrow_mut();
            let result = capnp_futures::serialize::read_message(&mut *guard, options).await;
            match result {
                Ok(Some(message)) => Ok(Some(Box::new(IncomingMessage { message }) as Box<dyn IncomingMessageTrait>)),
                Ok(None) => {
                    on_disconnect.fire(Ok(()));
                    Ok(None)
                }
                Err(e) => {
                    on_disconnect.fire(Err(e.clone()));
                    Err(e)
                }
            }
        })
    }

    fn on_disconnect(&self) -> Promise<(), Error> {
        self.on_disconnect.wait()
    }

    fn on_drained(&self) -> Promise<(), Error> {
        self.on_drained.wait()
    }

    fn reader_options(&self) -> ReaderOptions {
        self.reader_options
    }
}
