fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=src/proto/identify.proto");

    protobuf_codegen::Codegen::new()
        .protoc()
        .protoc_path(&protoc_bin_vendored::protoc_bin_path()?)
        .include("src/proto")
        .input("src/proto/identify.proto")
        .cargo_out_dir("proto")
        .run_from_script();

    Ok(())
}
