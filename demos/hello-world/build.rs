fn main() {
    capnpc::CompilerCommand::new()
        .file("schema/hello-world.capnp")
        .run()
        .expect("compiling hello-world schema");
}
