use std::io::Result;

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=proto/pluginrpc.proto");

    let mut prost_build = prost_build::Config::new();
    prost_build.btree_map(["."]);

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_with_config(prost_build, &["proto/pluginrpc.proto"], &["proto/"])?;

    Ok(())
}
