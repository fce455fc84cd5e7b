//! Compiles the vendored payment-node protocol buffers using tonic-build.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Point prost/tonic at a vendored protoc so the build does not rely on a
    // system-installed protobuf compiler.
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", protoc);
        }
    }

    // The harness is a pure client; never generate server stubs.
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/paynode.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/");
    Ok(())
}
