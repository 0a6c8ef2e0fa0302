//! Optimizing JIT mid-end and backend for Kiln.
//!
//! Compiler pipeline with:
//! - Instruction-list HIR with explicit CFG and tau proof operands
//! - Tau simplification, scalar evolution, dependence analysis
//! - Loop auto-vectorization with runtime alias tests
//! - Callback-driven instruction selection
//! - Profile-guided block layout and IPF-style prolog/epilog generation
#![deny(unsafe_op_in_unsafe_fn)]
pub mod backend;
pub mod codegen;
pub mod ir;
pub mod opt;

pub use kiln_core::{CompileError, CompileResult};
