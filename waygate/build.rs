//! Generates the VLESS gRPC transport's client stub from `proto/tun.proto`.
//! Mirrors the teacher's top-level `build.rs` (xDS codegen via `tonic-build`).

fn main() -> Result<(), anyhow::Error> {
	let proto_file = std::env::current_dir()?.join("proto/tun.proto");
	let include_dir = std::env::current_dir()?.join("proto");

	tonic_build::configure()
		.build_server(false)
		.build_client(true)
		.compile_protos(&[proto_file.to_str().unwrap()], &[include_dir.to_str().unwrap()])?;

	println!("cargo:rerun-if-changed={}", proto_file.to_str().unwrap());
	Ok(())
}
