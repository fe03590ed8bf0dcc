/// Builds the gRPC client and server code for `hash.proto` and
/// `parhash.proto` using `tonic-prost-build`.
///
/// # Byte Field Optimization
///
/// Every `bytes` field is mapped to `Bytes` (from the `bytes` crate) instead of
/// `Vec<u8>`. Buffers are forwarded from the public request to the backend
/// requests, and hashes from backend responses to the public response, so
/// reference-counted buffers avoid a copy at each hop.
///
/// # Files and Paths
///
/// - Proto files: `proto/hash.proto`, `proto/parhash.proto`
/// - Includes: `proto/`
///
/// # Output
///
/// Generated code is included by `src/common/proto.rs` via
/// `tonic::include_proto!`, together with an encoded file descriptor set for
/// gRPC reflection.
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("parhash_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();

    config
        .bytes(["."])
        .file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(
            config,
            &["proto/hash.proto", "proto/parhash.proto"],
            &["proto"],
        )
        .unwrap();

    // tonic-build names each per-method wrapper struct `{Method}Svc`, which
    // shadows the service trait when the service is named `<rpc>Svc`. Rename
    // the function-local wrapper so the generated server code compiles; wire
    // names and the public API are unchanged.
    for (file, name) in [("hashsvc.rs", "HashSvc"), ("parhashsvc.rs", "ParallelHashSvc")] {
        let path = out_dir.join(file);
        let code = std::fs::read_to_string(&path).unwrap();
        let code = code
            .replace(&format!("struct {name}<"), &format!("struct {name}Method<"))
            .replace(&format!("for {name}<T>"), &format!("for {name}Method<T>"))
            .replace(&format!("= {name}(inner)"), &format!("= {name}Method(inner)"));
        std::fs::write(&path, code).unwrap();
    }
}
