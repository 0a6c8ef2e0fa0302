//! Shared definitions for the kiln JIT.
//!
//! This crate holds the error taxonomy every compilation pass reports
//! through. Passes live in `kiln_jit`; they only depend on the types here
//! to classify failures.

pub mod error;

pub use error::{CompileError, CompileResult, Location};
