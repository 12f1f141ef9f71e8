fn main() {
    // Driver plugins resolve the host buffer API (instrument_host_buffer_create)
    // against the loading executable, which requires its dynamic symbols to be
    // exported.
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "linux" || target_os == "android" {
        println!("cargo:rustc-link-arg-bins=-rdynamic");
    }
}
