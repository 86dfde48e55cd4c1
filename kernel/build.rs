use std::{env, path::PathBuf};

fn main() {
    let target = env::var("TARGET").expect("TARGET not set");

    // Get the manifest directory (where Cargo.toml is)
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set");
    let kernel_dir = PathBuf::from(manifest_dir);

    // The linker script only applies to the freestanding AArch64 image.
    // Host builds (unit tests, coverage) use the default host linking.
    if target.contains("aarch64") && target.contains("none") {
        let linker_script = kernel_dir.join("src/arch/aarch64/link.ld");
        println!("cargo:rustc-link-arg=-T{}", linker_script.display());
    }

    // Rebuild if linker script changes
    println!("cargo:rerun-if-changed=src/arch/aarch64/link.ld");
}
