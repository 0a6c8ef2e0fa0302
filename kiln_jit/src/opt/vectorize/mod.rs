//! Loop Vectorization Pass
//!
//! Rewrites innermost counted loops so that one trip through the body
//! performs `VF` iterations of the original loop:
//!
//! - `loop_info`: shape checks and preheader creation
//! - `dependence`: data-dependence graph over the body (scalar and memory)
//! - `scc`: dependence cycles
//! - `plan`: per-instruction actions and emission order
//! - `transform`: vector body, adjusted exit test, scalar epilogue
//!
//! # Example
//!
//! ```text
//! Before:
//!   for i in 0..n:
//!       b[i] = a[i] + 1
//!
//! After (VF = 4):
//!   if a == b: goto epilogue
//!   for i in 0..n - n % 4 step 4:
//!       b[i..i+4] = a[i..i+4] + [1, 1, 1, 1]
//!   epilogue:
//!   for i in i..n:
//!       b[i] = a[i] + 1
//! ```
//!
//! Loops outside the handled shape are left alone; the reason is logged at
//! debug level.

pub mod dependence;
pub mod loop_info;
pub mod plan;
pub mod scc;
pub mod transform;

use crate::ir::cfg::{DominatorTree, LoopId, LoopTree};
use crate::ir::method::{BlockId, MethodIr};
use crate::opt::scev::ScalarEvolution;
use crate::opt::OptimizationPass;
use kiln_core::{CompileError, CompileResult};
use rustc_hash::FxHashSet;
use tracing::debug;

pub use dependence::{Ddg, DdgEdge, DdgNode, DepKind, Direction};
pub use loop_info::LoopInfo;
pub use plan::{Action, PlanStep, VectorPlan};
pub use transform::Rewritten;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the loop vectorizer.
#[derive(Debug, Clone)]
pub struct VectorizeConfig {
    /// Run the pass at all.
    pub enabled: bool,
    /// Width of a vector register in bits.
    pub vector_width_bits: u32,
    /// Smallest vectorization factor worth the epilogue.
    pub min_profitable_vf: u32,
    /// Loops with more body instructions are not analyzed.
    pub max_body_insts: usize,
    /// Guard the vector loop with base-inequality tests where that breaks a
    /// dependence cycle.
    pub allow_runtime_alias_tests: bool,
}

impl Default for VectorizeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vector_width_bits: 128,
            min_profitable_vf: 2,
            max_body_insts: 256,
            allow_runtime_alias_tests: true,
        }
    }
}

impl VectorizeConfig {
    /// 64-bit vector registers.
    pub fn narrow() -> Self {
        Self {
            vector_width_bits: 64,
            ..Default::default()
        }
    }

    /// 256-bit vector registers.
    pub fn wide() -> Self {
        Self {
            vector_width_bits: 256,
            max_body_insts: 512,
            ..Default::default()
        }
    }

    /// Never emit runtime tests; loops needing them stay scalar where the
    /// dependence demands it.
    pub fn conservative() -> Self {
        Self {
            allow_runtime_alias_tests: false,
            min_profitable_vf: 4,
            max_body_insts: 64,
            ..Default::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from the loop vectorizer.
#[derive(Debug, Clone, Default)]
pub struct VectorizeStats {
    /// Number of loops analyzed.
    pub loops_analyzed: usize,
    /// Number of loops successfully vectorized.
    pub loops_vectorized: usize,
    /// Loops outside the handled shape or with blocking dependences.
    pub loops_rejected_unsafe: usize,
    /// Loops where no operation vectorizes at a useful factor.
    pub loops_rejected_unprofitable: usize,
    /// Total vector operations created.
    pub vector_ops_created: usize,
    /// Runtime alias tests guarding vector loops.
    pub alias_tests_emitted: usize,
}

impl VectorizeStats {
    /// Merge statistics from another instance.
    pub fn merge(&mut self, other: &VectorizeStats) {
        self.loops_analyzed += other.loops_analyzed;
        self.loops_vectorized += other.loops_vectorized;
        self.loops_rejected_unsafe += other.loops_rejected_unsafe;
        self.loops_rejected_unprofitable += other.loops_rejected_unprofitable;
        self.vector_ops_created += other.vector_ops_created;
        self.alias_tests_emitted += other.alias_tests_emitted;
    }

    /// Get the vectorization success rate.
    pub fn success_rate(&self) -> f32 {
        if self.loops_analyzed == 0 {
            0.0
        } else {
            self.loops_vectorized as f32 / self.loops_analyzed as f32
        }
    }
}

/// Why a loop was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Unsafe,
    Unprofitable,
}

// =============================================================================
// Main Pass
// =============================================================================

/// Loop vectorization pass.
pub struct Vectorize {
    config: VectorizeConfig,
    stats: VectorizeStats,
}

impl Vectorize {
    pub fn new() -> Self {
        Self::with_config(VectorizeConfig::default())
    }

    pub fn with_config(config: VectorizeConfig) -> Self {
        Self {
            config,
            stats: VectorizeStats::default(),
        }
    }

    pub fn config(&self) -> &VectorizeConfig {
        &self.config
    }

    pub fn stats(&self) -> &VectorizeStats {
        &self.stats
    }

    pub fn loops_vectorized(&self) -> usize {
        self.stats.loops_vectorized
    }

    /// Analyze and rewrite one loop. Give-ups leave the IR semantically
    /// unchanged.
    fn vectorize_loop(
        &self,
        ir: &mut MethodIr,
        header: BlockId,
    ) -> Result<Rewritten, (Rejection, CompileError)> {
        let unsafe_ = |e: CompileError| (Rejection::Unsafe, e);

        let dom = DominatorTree::compute(ir);
        let mut loops = LoopTree::compute(ir, &dom);
        let lp = find_loop(&loops, header).map_err(unsafe_)?;
        if LoopInfo::normalize(ir, &loops, lp).map_err(unsafe_)? {
            let dom = DominatorTree::compute(ir);
            loops = LoopTree::compute(ir, &dom);
        }
        let lp = find_loop(&loops, header).map_err(unsafe_)?;

        let info = LoopInfo::analyze(ir, &loops, lp).map_err(unsafe_)?;
        let size: usize = info.body.iter().map(|&b| ir.block(b).insts.len()).sum();
        if size > self.config.max_body_insts {
            return Err(unsafe_(CompileError::unsupported(
                PASS,
                format!("body has {size} instructions"),
            )));
        }

        let mut se = ScalarEvolution::new(ir, &loops);
        let Some(trip) = se.number_of_iterations(lp, info.exit_branch, info.stay_on_true) else {
            return Err(unsafe_(CompileError::unsupported(PASS, "trip count not computable")));
        };
        let ddg = Ddg::compute_ddg_for(ir, &loops, &info, &mut se).map_err(unsafe_)?;
        let plan = plan::plan(ir, &info, &se, &ddg, &self.config).map_err(|e| (Rejection::Unprofitable, e))?;
        let pool = se.into_pool();

        transform::transform(ir, &info, &ddg, &plan, &trip, &pool).map_err(unsafe_)
    }
}

const PASS: &str = "vectorize";

fn find_loop(loops: &LoopTree, header: BlockId) -> CompileResult<LoopId> {
    match loops.loop_with_header(header) {
        Some(lp) => Ok(lp),
        None => Err(CompileError::unsupported(PASS, "loop disappeared")),
    }
}

impl Default for Vectorize {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for Vectorize {
    fn name(&self) -> &'static str {
        PASS
    }

    fn run(&mut self, ir: &mut MethodIr) -> CompileResult<bool> {
        if !self.config.enabled {
            return Ok(false);
        }

        // Headers already visited, including the epilogues created here.
        let mut seen: FxHashSet<BlockId> = FxHashSet::default();
        let mut changed = false;
        loop {
            let dom = DominatorTree::compute(ir);
            let loops = LoopTree::compute(ir, &dom);
            let next = loops
                .innermost_loops()
                .map(|lp| loops.get(lp).header)
                .find(|h| !seen.contains(h));
            let Some(header) = next else { break };
            seen.insert(header);
            self.stats.loops_analyzed += 1;

            match self.vectorize_loop(ir, header) {
                Ok(done) => {
                    debug!(
                        method = %ir.name,
                        header = header.index(),
                        vector_ops = done.vector_ops,
                        alias_tests = done.alias_tests,
                        "loop vectorized"
                    );
                    seen.insert(done.epilogue_header);
                    self.stats.loops_vectorized += 1;
                    self.stats.vector_ops_created += done.vector_ops;
                    self.stats.alias_tests_emitted += done.alias_tests;
                    changed = true;
                }
                Err((_, e)) if e.is_internal() => return Err(e),
                Err((why, e)) => {
                    debug!(method = %ir.name, header = header.index(), reason = %e, "loop not vectorized");
                    match why {
                        Rejection::Unsafe => self.stats.loops_rejected_unsafe += 1,
                        Rejection::Unprofitable => self.stats.loops_rejected_unprofitable += 1,
                    }
                }
            }
        }
        Ok(changed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::interp::{Interpreter, Value};
    use crate::ir::opcode::{CmpMod, Opcode};
    use crate::ir::types::TypeManager;

    #[test]
    fn test_config_default() {
        let config = VectorizeConfig::default();
        assert!(config.enabled);
        assert_eq!(config.vector_width_bits, 128);
        assert_eq!(config.min_profitable_vf, 2);
        assert!(config.allow_runtime_alias_tests);
    }

    #[test]
    fn test_config_presets() {
        assert_eq!(VectorizeConfig::narrow().vector_width_bits, 64);
        assert_eq!(VectorizeConfig::wide().vector_width_bits, 256);
        assert!(!VectorizeConfig::conservative().allow_runtime_alias_tests);
        assert!(!VectorizeConfig::disabled().enabled);
    }

    #[test]
    fn test_stats_merge() {
        let mut stats1 = VectorizeStats {
            loops_analyzed: 10,
            loops_vectorized: 5,
            ..Default::default()
        };
        let stats2 = VectorizeStats {
            loops_analyzed: 20,
            loops_vectorized: 15,
            alias_tests_emitted: 2,
            ..Default::default()
        };
        stats1.merge(&stats2);
        assert_eq!(stats1.loops_analyzed, 30);
        assert_eq!(stats1.loops_vectorized, 20);
        assert_eq!(stats1.alias_tests_emitted, 2);
    }

    #[test]
    fn test_stats_success_rate() {
        let stats = VectorizeStats {
            loops_analyzed: 10,
            loops_vectorized: 7,
            ..Default::default()
        };
        assert!((stats.success_rate() - 0.7).abs() < 0.001);
        assert_eq!(VectorizeStats::default().success_rate(), 0.0);
    }

    /// `for i in 0..n { dst[i] = src[i] * 3 }`
    fn triple(tm: TypeManager) -> MethodIr {
        let mut tm = tm;
        let i32_ = tm.int32();
        let arr = tm.array_of(i32_);
        let void = tm.void();
        let mut ir = MethodIr::new("triple", tm, void);
        let mut b = IrBuilder::new(&mut ir);
        let src = b.def_arg(arr, 0);
        let dst = b.def_arg(arr, 1);
        let n = b.def_arg(i32_, 2);
        let zero = b.i32(0);
        let one = b.i32(1);
        let three = b.i32(3);
        let (h, body, x) = (b.new_block(), b.new_block(), b.new_block());
        b.jump(h);
        b.switch_to(h);
        let i = b.phi(i32_, &[zero]);
        b.branch(CmpMod::Lt, i, Some(n), body, x, 0.9);
        b.switch_to(body);
        let safe = b.tau_safe();
        let from = b.ld_elem_addr(src, i);
        let v = b.ld_ind(i32_, from, safe, safe);
        let w = b.mul(v, three);
        let to = b.ld_elem_addr(dst, i);
        b.st_ind(w, to, safe, safe);
        let next = b.add(i, one);
        b.jump(h);
        b.switch_to(x);
        b.ret(None);
        let phi = ir.opnd(i).def.unwrap();
        ir.inst_mut(phi).srcs.push(next);
        ir
    }

    fn run_triple(ir: &MethodIr, n: i64) -> (Vec<Value>, u64) {
        let arg0 = ir
            .linked_insts()
            .find(|&i| ir.inst(i).opcode == Opcode::DefArg)
            .and_then(|i| ir.inst(i).dst)
            .unwrap();
        let arr = ir.opnd_ty(arg0);
        let mut interp = Interpreter::new(ir);
        let src = interp.alloc_array(arr, (0..n).map(Value::Int).collect());
        let dst = interp.alloc_array(arr, vec![Value::Int(0); n as usize]);
        interp.run(&[src, dst.clone(), Value::Int(n)]).unwrap();
        (interp.array(&dst).unwrap().to_vec(), interp.vector_ops())
    }

    #[test]
    fn test_pass_vectorizes_and_preserves_results() {
        let reference = triple(TypeManager::new());
        let mut ir = triple(TypeManager::new());
        let mut pass = Vectorize::new();
        assert!(pass.run(&mut ir).unwrap());
        // The epilogue is not revisited.
        assert_eq!(pass.stats().loops_analyzed, 1);
        assert_eq!(pass.loops_vectorized(), 1);
        assert!(pass.stats().vector_ops_created >= 3);

        for n in [0, 1, 3, 4, 7, 64, 103] {
            let (expected, _) = run_triple(&reference, n);
            let (got, vops) = run_triple(&ir, n);
            assert_eq!(got, expected, "n = {n}");
            if n >= 4 {
                assert!(vops > 0, "n = {n}");
            }
        }
    }

    #[test]
    fn test_disabled_pass_does_nothing() {
        let mut ir = triple(TypeManager::new());
        let before = ir.num_blocks();
        let mut pass = Vectorize::with_config(VectorizeConfig::disabled());
        assert!(!pass.run(&mut ir).unwrap());
        assert_eq!(ir.num_blocks(), before);
        assert_eq!(pass.stats().loops_analyzed, 0);
    }

    #[test]
    fn test_unprofitable_loop_counted() {
        // 8-bit registers hold no 32-bit lane.
        let mut ir = triple(TypeManager::new());
        let mut pass = Vectorize::with_config(VectorizeConfig {
            vector_width_bits: 8,
            ..Default::default()
        });
        assert!(!pass.run(&mut ir).unwrap());
        assert_eq!(pass.stats().loops_rejected_unprofitable, 1);
        assert_eq!(pass.loops_vectorized(), 0);
    }
}
