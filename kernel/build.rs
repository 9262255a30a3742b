fn main() {
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| String::from("kernel"));
    if os == "none" && arch == "x86_64" {
        // Tell cargo to pass the linker script to the linker..
        println!("cargo:rustc-link-arg-bins=-T{dir}/linker.ld");
    }
    // ..and to re-run if it changes.
    println!("cargo:rerun-if-changed=linker.ld");
}
