//! Build script for windump-core
//!
//! This script checks system requirements before compilation:
//! - Minimum Rust version (C string literals and `<[u8]>::trim_ascii` need Rust 1.80.0+)
//! - Target support (Windows and Unix have capture backends)
//!
//! ## Requirements
//!
//! - **Rust**: 1.80.0 or newer
//! - **Windows**: `dbghelp.dll` at runtime (ships with the OS)
//! - **Unix**: `sigaction`; `/proc` adds the module list and registers to dumps on Linux

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    // Check minimum Rust version
    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 80, 0);

        if rustc_version < min_rust_version {
            panic!("windump-core requires Rust {min_rust_version} or newer, found {rustc_version}");
        }
    } else {
        // If we can't get version (e.g., in some build environments), just warn
        println!("cargo:warning=could not verify Rust version");
    }

    check_target_support();
}

fn check_target_support()
{
    let family = std::env::var("CARGO_CFG_TARGET_FAMILY").unwrap_or_default();
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    if !family.split(',').any(|family| family == "unix" || family == "windows") {
        println!("cargo:warning=windump-core has no crash capture backend for target_os={os}");
    } else if family.split(',').any(|family| family == "unix") && os != "linux" && os != "android" {
        // Dumps still get system info, the exception and the stack
        println!("cargo:warning=no /proc on target_os={os}: dumps will not carry modules or registers");
    }
}
