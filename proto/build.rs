fn main() -> std::io::Result<()> {
    // `adv.rs` is checked in. Regenerate it only when `GENERATE_PROTO` is set,
    // which requires `protoc` on the PATH.
    if std::env::var("GENERATE_PROTO").is_err() {
        println!("cargo:rerun-if-changed=build.rs");
        return Ok(());
    }

    println!("cargo:rerun-if-changed=src/adv.proto");
    println!("cargo:warning=GENERATE_PROTO is set, regenerating proto definitions...");

    let mut config = prost_build::Config::new();
    config.type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]");
    config.out_dir("src/");

    config.compile_protos(&["src/adv.proto"], &["src/"])?;
    Ok(())
}
