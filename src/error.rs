// Conversion between `capnp::Error`, the in-process error currency used everywhere else
// in this crate, and `rpc_capnp::exception`, the wire representation of an `Exception`.
// Adapted to the `capnp::ErrorKind` taxonomy that the Rust port uses in place of kj's
// `Nature`/`Durability` pair.

use capnp::{Error, ErrorKind};

use crate::rpc_capnp::exception;

/// Durability as carried on the wire. `capnp::Error` has no durability field of its own,
/// so we fold it into the reason string the same way upstream kj exceptions do it:
/// nothing forces durability information through `?`-propagated application errors, but
/// the RPC layer itself only ever produces `Permanent` exceptions (disconnects,
/// protocol violations) -- temporary/overloaded are reserved for application code that
/// wants to signal retryability and are preserved verbatim on a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Permanent,
    Temporary,
    Overloaded,
}

/// Reads a `rpc_capnp::exception::Reader` off the wire into a `capnp::Error`, tagging
/// the reason with a "remote exception: " prefix so that a caller can tell a local
/// failure from one that happened on the other end of the connection.
pub fn to_error(reader: exception::Reader) -> Error {
    let reason = reader
        .get_reason()
        .and_then(|t| t.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|_| "(malformed exception reason)".to_string());
    Error::failed(format!("remote exception: {reason}"))
}

/// Writes a `capnp::Error` out to the wire, recovering `isCallersFault` from
/// `ErrorKind` the way the original maps `kj::Exception::Nature::PRECONDITION`.
pub fn from_error(error: &Error, mut builder: exception::Builder) {
    builder.set_reason(error.extra.as_str().into());
    builder.set_is_callers_fault(matches!(
        error.kind,
        ErrorKind::Failed | ErrorKind::Unimplemented
    ));
    builder.set_durability(exception::Durability::Permanent);
}

/// A one-shot channel's `Canceled` is not an application-visible failure mode in this
/// protocol -- anywhere we await a `oneshot::Receiver` that can only be dropped by our
/// own table teardown, map it to the same "disconnected" failure a live connection
/// would have produced.
pub fn canceled_to_error(_: tokio::sync::oneshot::error::RecvError) -> Error {
    Error::disconnected("RPC system's state has already been torn down".into())
}
