fn main() {
    capnpc::CompilerCommand::new()
        .file("schema/rpc.capnp")
        .file("schema/rpc-twoparty.capnp")
        .file("schema/test.capnp")
        .run()
        .expect("compiling rpc schema");
}
