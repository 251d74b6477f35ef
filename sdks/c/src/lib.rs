//! C SDK for USM
//!
//! This crate provides C FFI bindings for the USM service manager,
//! building the C shared library and static library artifacts.

pub mod ffi;
mod registry;

// Re-export all FFI symbols
pub use ffi::*;
