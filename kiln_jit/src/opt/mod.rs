//! Mid-end optimization passes over HIR.
//!
//! - `simplify_taus`: removes redundant type and non-null guards
//! - `scev`: scalar evolution (chains of recurrences)
//! - `vectorize`: dependence analysis and loop vectorization
//! - `out_of_ssa`: lowers phis and SSA variables before selection
//! - `pipeline`: runs passes in order and hands the result to the backend

pub mod out_of_ssa;
pub mod pipeline;
pub mod scev;
pub mod simplify_taus;
pub mod vectorize;

use crate::ir::MethodIr;
use kiln_core::CompileResult;

pub use out_of_ssa::{OutOfSsa, OutOfSsaStats};
pub use pipeline::{compile_full, compile_minimal, Compiled, PassStat, Pipeline, PipelineConfig, PipelineStats};
pub use simplify_taus::{SimplifyTaus, TauStats};
pub use vectorize::{Vectorize, VectorizeConfig, VectorizeStats};

/// A transformation over one method.
///
/// `run` returns whether the IR changed. Analysis give-ups are handled inside
/// the pass; only internal errors are returned.
pub trait OptimizationPass {
    fn name(&self) -> &'static str;

    fn run(&mut self, ir: &mut MethodIr) -> CompileResult<bool>;
}
