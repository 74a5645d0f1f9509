use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Vendored protoc unless the environment already points at one
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    // Well-known types (google/protobuf/struct.proto) ship with the vendored includes
    let includes = [PathBuf::from("proto"), protoc_bin_vendored::include_path()?];

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[PathBuf::from("proto/toolmesh.proto")], &includes)?;
    Ok(())
}
