fn main() {
    println!("cargo:rerun-if-env-changed=SEP256_LIB_DIR");

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let enclave = std::env::var_os("CARGO_FEATURE_SECURE_ENCLAVE").is_some();
    if target_os == "macos" && enclave {
        if let Ok(dir) = std::env::var("SEP256_LIB_DIR") {
            println!("cargo:rustc-link-search=native={dir}");
        }
        println!("cargo:rustc-link-lib=dylib=SEP256");
    }
}
