use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let onnx_dir = Path::new("libs/onnx");
    println!("cargo:rerun-if-changed={}", onnx_dir.join("onnx.proto3").display());
    prost_build::Config::new()
        .protoc_executable(protoc_bin_vendored::protoc_bin_path()?)
        .compile_protos(&[onnx_dir.join("onnx.proto3")], &[onnx_dir])?;
    Ok(())
}
