//! Compilation Pipeline.
//!
//! Runs the mid-end over one method and hands the result to the backend.
//!
//! # Stages
//!
//! 1. **Tau simplification**: drop guards proven redundant
//! 2. **Vectorization**: innermost loops, give-ups logged and skipped
//! 3. **Out-of-SSA**: phis become variable copies
//! 4. **Selection**: HIR drives the IPF code generator
//! 5. **Layout**: blocks linearized, branches fixed up
//!
//! Prolog and epilog generation needs allocated registers and runs after
//! register allocation, outside this pipeline.
//!
//! Each stage runs inside its own `debug_span!`. An internal compiler error
//! is logged at `error` level and aborts only this method.

use super::out_of_ssa::{OutOfSsa, OutOfSsaStats};
use super::simplify_taus::{SimplifyTaus, TauStats};
use super::vectorize::{Vectorize, VectorizeConfig, VectorizeStats};
use super::OptimizationPass;
use crate::backend::ipf::IpfCodeGen;
use crate::backend::layout::{linearize, LayoutConfig, LayoutStats, LayoutStrategy};
use crate::backend::machine::MachineCfg;
use crate::codegen::{select_method, SelectStats, SelectorConfig};
use crate::ir::MethodIr;
use kiln_core::{CompileError, CompileResult};

use std::time::{Duration, Instant};
use tracing::{debug, debug_span, error};

// =============================================================================
// Pipeline Configuration
// =============================================================================

/// Configuration for the compilation pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Run tau simplification.
    pub simplify_taus: bool,

    /// Vectorizer settings; `enabled: false` skips the stage.
    pub vectorize: VectorizeConfig,

    pub selector: SelectorConfig,

    pub layout: LayoutConfig,

    /// Collect timing statistics.
    pub collect_timing: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            simplify_taus: true,
            vectorize: VectorizeConfig::default(),
            selector: SelectorConfig::default(),
            layout: LayoutConfig::default(),
            collect_timing: true,
        }
    }
}

impl PipelineConfig {
    /// Create a minimal configuration (fewer passes for faster compile).
    pub fn minimal() -> Self {
        Self {
            simplify_taus: true,
            vectorize: VectorizeConfig::disabled(),
            selector: SelectorConfig::default(),
            layout: LayoutConfig::with_strategy(LayoutStrategy::Topological),
            collect_timing: false,
        }
    }

    /// Create a full optimization configuration.
    pub fn full() -> Self {
        Self {
            selector: SelectorConfig::sinking(),
            layout: LayoutConfig::with_strategy(LayoutStrategy::Auto),
            ..Default::default()
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from a single stage.
#[derive(Debug, Clone)]
pub struct PassStat {
    /// Stage name.
    pub name: &'static str,
    /// Whether it changed the method.
    pub changed: bool,
    /// Time spent, zero when timing is off.
    pub time: Duration,
}

/// Statistics from the entire pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub tau: TauStats,
    pub vectorize: VectorizeStats,
    pub out_of_ssa: OutOfSsaStats,
    pub select: SelectStats,
    /// `None` until layout has run.
    pub layout: Option<LayoutStats>,
    pub passes: Vec<PassStat>,
    pub total_time: Duration,
}

impl PipelineStats {
    /// Whether any mid-end stage changed the method.
    pub fn changed(&self) -> bool {
        self.passes.iter().any(|p| p.changed)
    }
}

/// A compiled method: the laid-out machine CFG and what it took.
#[derive(Debug)]
pub struct Compiled {
    pub cfg: MachineCfg,
    pub stats: PipelineStats,
}

// =============================================================================
// Pipeline
// =============================================================================

/// The compilation pipeline.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a new pipeline with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pipeline with custom configuration.
    pub fn with_config(config: PipelineConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the mid-end: taus, vectorization, out-of-SSA. The method is
    /// phi-free afterwards.
    pub fn optimize(&self, ir: &mut MethodIr, stats: &mut PipelineStats) -> CompileResult<()> {
        if self.config.simplify_taus {
            let mut pass = SimplifyTaus::new();
            self.run_pass(&mut pass, ir, stats)?;
            stats.tau = pass.stats().clone();
        }
        if self.config.vectorize.enabled {
            let mut pass = Vectorize::with_config(self.config.vectorize.clone());
            self.run_pass(&mut pass, ir, stats)?;
            stats.vectorize = pass.stats().clone();
        }
        let mut pass = OutOfSsa::new();
        self.run_pass(&mut pass, ir, stats)?;
        stats.out_of_ssa = pass.stats().clone();
        Ok(())
    }

    /// Compile one method down to a laid-out machine CFG.
    pub fn compile(&self, ir: &mut MethodIr) -> CompileResult<Compiled> {
        let start = Instant::now();
        let mut stats = PipelineStats::default();
        self.optimize(ir, &mut stats)?;

        let mut cg = IpfCodeGen::new();
        {
            let span = debug_span!("select", method = %ir.name);
            let _guard = span.enter();
            stats.select = select_method(ir, &mut cg, &self.config.selector).map_err(|e| report(&ir.name, e))?;
        }
        let mut cfg = cg.finish();
        {
            let span = debug_span!("layout", method = %ir.name);
            let _guard = span.enter();
            stats.layout = Some(linearize(&mut cfg, &self.config.layout).map_err(|e| report(&ir.name, e))?);
        }

        stats.total_time = start.elapsed();
        debug!(
            method = %ir.name,
            vectorized = stats.vectorize.loops_vectorized,
            guards_removed = stats.tau.guards_removed,
            nodes = cfg.node_count(),
            "compiled"
        );
        Ok(Compiled { cfg, stats })
    }

    fn run_pass<P: OptimizationPass>(
        &self,
        pass: &mut P,
        ir: &mut MethodIr,
        stats: &mut PipelineStats,
    ) -> CompileResult<()> {
        let name = pass.name();
        let span = debug_span!("pass", pass = name, method = %ir.name);
        let _guard = span.enter();

        let start = self.config.collect_timing.then(Instant::now);
        let changed = pass.run(ir).map_err(|e| report(&ir.name, e))?;
        stats.passes.push(PassStat {
            name,
            changed,
            time: start.map(|s| s.elapsed()).unwrap_or_default(),
        });
        Ok(())
    }
}

/// Log internal errors before they leave the pipeline.
fn report(method: &str, e: CompileError) -> CompileError {
    if e.is_internal() {
        error!(method, pass = e.pass(), error = %e, "internal compiler error");
    }
    e
}

// =============================================================================
// Quick Compile Functions
// =============================================================================

/// Compile with [`PipelineConfig::full`].
pub fn compile_full(ir: &mut MethodIr) -> CompileResult<Compiled> {
    Pipeline::with_config(PipelineConfig::full()).compile(ir)
}

/// Compile with [`PipelineConfig::minimal`].
pub fn compile_minimal(ir: &mut MethodIr) -> CompileResult<Compiled> {
    Pipeline::with_config(PipelineConfig::minimal()).compile(ir)
}
