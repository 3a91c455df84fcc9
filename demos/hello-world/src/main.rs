// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE.

pub mod hello_world_capnp {
    include!(concat!(env!("OUT_DIR"), "/hello_world_capnp.rs"));
}

pub mod client;
pub mod server;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = ::std::env::args().collect();
    if args.len() < 2 {
        println!("usage: {} [client | server] ADDRESS[:PORT]", args[0]);
        return Ok(());
    }

    match args[1].as_str() {
        "client" => client::main().await,
        "server" => server::main().await,
        word => Err(format!("unrecognized mode: {word}").into()),
    }
}
