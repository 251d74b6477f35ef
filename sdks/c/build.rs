use std::env;
use std::path::PathBuf;

fn main() {
    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let header = PathBuf::from(&crate_dir).join("include").join("usm.h");
    std::fs::create_dir_all(header.parent().unwrap()).expect("Failed to create include directory");

    let mut config = cbindgen::Config {
        language: cbindgen::Language::C,
        include_guard: Some("USM_H".to_string()),
        pragma_once: true,
        cpp_compat: true,
        documentation: true,
        autogen_warning: Some(
            "/* Generated by cbindgen from sdks/c/src/ffi.rs. Do not edit. */".to_string(),
        ),
        sys_includes: vec!["stdint.h".to_string(), "stddef.h".to_string()],
        no_includes: true,
        ..Default::default()
    };
    // `UsmErrorCode_NotFound` rather than a bare `NotFound` in C.
    config.enumeration.prefix_with_name = true;

    cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
        .expect("Unable to generate C bindings")
        .write_to_file(&header);

    println!("cargo:rerun-if-changed=src/");
}
