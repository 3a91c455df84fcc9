// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see LICENSE.

use capnp_rpc::{rpc_twoparty_capnp, twoparty, RpcSystem};

use crate::hello_world_capnp::hello_world;

use std::net::ToSocketAddrs;

pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = ::std::env::args().collect();
    if args.len() != 4 {
        println!("usage: {} client HOST:PORT NAME", args[0]);
        return Ok(());
    }

    let addr = args[2]
        .to_socket_addrs()?
        .next()
        .expect("could not parse address");
    let name = args[3].clone();

    tokio::task::LocalSet::new()
        .run_until(async move {
            let stream = tokio::net::TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            let network = Box::new(twoparty::VatNetwork::new(
                reader,
                writer,
                rpc_twoparty_capnp::Side::Client,
                Default::default(),
            ));
            let mut rpc_system = RpcSystem::new(network, None);
            let hello_world: hello_world::Client = rpc_system.bootstrap();
            tokio::task::spawn_local(rpc_system);

            let mut request = hello_world.say_hello_request();
            request.get().init_request().set_name(name[..].into());

            let reply = request.send().promise.await?;
            println!("{}", reply.get()?.get_reply()?.get_message()?.to_str()?);

            Ok(())
        })
        .await
}
