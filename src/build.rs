extern crate capnpc;

fn main() {
    capnpc::CompilerCommand::new()
        .src_prefix("schema")
        .file("schema/dare.capnp")
        .run()
        .expect("capnp schema compile failed");
}
