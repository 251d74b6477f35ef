//! USM Shared - code common to the core, the C SDK and the CLI
//!
//! This crate contains the error taxonomy and the constants that must agree
//! on both sides of the C boundary.

pub mod constants;
pub mod errors;

pub use errors::{ProbeError, SignalError, SpawnError, UsmError, UsmResult};
