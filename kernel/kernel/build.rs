fn main() {
    println!("cargo:rerun-if-changed=linker.ld");
    // The linker script only applies to the bare-metal target; hosted
    // builds produce an inert binary.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg=-T{manifest_dir}/linker.ld");
    }
}
