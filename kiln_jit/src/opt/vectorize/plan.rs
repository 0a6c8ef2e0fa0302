//! Per-instruction vectorization actions.
//!
//! Every instruction on a dependence cycle is unrolled: its copies for the
//! `VF` iterations run one after the other in the original order. The rest
//! pick an action from what they compute:
//!
//! | Action      | When                                                  |
//! |-------------|-------------------------------------------------------|
//! | `Nothing`   | invariant: no variant input, not a store              |
//! | `OnDemand`  | an address only feeding loads, stores or addresses    |
//! | `Vectorize` | a lanewise operation, or a unit-stride load or store  |
//! | `Unroll`    | everything else                                       |
//!
//! The loop's vectorization factor is the largest factor any node asks for;
//! nodes asking for a different one are unrolled.

use super::dependence::{is_address, Ddg, DdgEdgeId, DdgNodeId};
use super::loop_info::LoopInfo;
use super::scc::{find_sccs, Sccs};
use super::VectorizeConfig;
use crate::ir::inst::OpndId;
use crate::ir::method::MethodIr;
use crate::ir::opcode::{Opcode, OverflowMod};
use crate::opt::scev::{Expr, ScalarEvolution};
use kiln_core::{unsupported, CompileResult};
use rustc_hash::FxHashSet;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

const PASS: &str = "vectorize";

/// What the transformation does with one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Loop invariant: emitted once per vector iteration.
    Nothing,
    /// Recomputed for each lane where a lane is needed.
    OnDemand,
    /// One scalar copy per lane.
    Unroll,
    /// One vector instruction covering this many lanes.
    Vectorize(u32),
}

/// One step of the emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    Node(DdgNodeId),
    /// A dependence cycle, emitted iteration by iteration.
    Cycle(Vec<DdgNodeId>),
}

/// Everything the transformation needs to rewrite a loop.
#[derive(Debug, Clone)]
pub struct VectorPlan {
    pub actions: Vec<Action>,
    pub common_vf: u32,
    pub order: Vec<PlanStep>,
    /// Base pairs checked for inequality before entering the vector loop.
    pub alias_tests: Vec<(OpndId, OpndId)>,
    /// Alias-test edges the plan relies on being absent.
    pub ignored: FxHashSet<DdgEdgeId>,
}

impl VectorPlan {
    pub fn action(&self, n: DdgNodeId) -> Action {
        self.actions[n.as_usize()]
    }

    /// Number of nodes vectorized.
    pub fn vectorized(&self) -> usize {
        self.actions.iter().filter(|a| matches!(a, Action::Vectorize(_))).count()
    }
}

/// Decide an action for every node of `ddg`.
pub fn plan(
    ir: &MethodIr,
    info: &LoopInfo,
    se: &ScalarEvolution<'_>,
    ddg: &Ddg,
    config: &VectorizeConfig,
) -> CompileResult<VectorPlan> {
    let mut ignored: FxHashSet<DdgEdgeId> = FxHashSet::default();
    let mut sccs = find_sccs(ddg, &ignored);

    // Cycles through edges a runtime test can disprove: drop those edges and
    // look again.
    if config.allow_runtime_alias_tests {
        for (id, e) in ddg.edges() {
            if e.needs_alias_test && sccs.same(e.from, e.to) {
                ignored.insert(id);
            }
        }
        if !ignored.is_empty() {
            sccs = find_sccs(ddg, &ignored);
            // Keep a test only where it split the cycle. Restored edges lie
            // inside one component, so the partition stands.
            ignored.retain(|&id| {
                let e = ddg.edge(id);
                !sccs.same(e.from, e.to)
            });
        }
    }

    let mut alias_tests: Vec<(OpndId, OpndId)> = Vec::new();
    for &id in &ignored {
        let e = ddg.edge(id);
        let (Some(a), Some(b)) = (
            ddg.node(e.from).memory().and_then(|m| m.base),
            ddg.node(e.to).memory().and_then(|m| m.base),
        ) else {
            unsupported!(PASS, "alias test without bases");
        };
        let pair = if a < b { (a, b) } else { (b, a) };
        if !alias_tests.contains(&pair) {
            alias_tests.push(pair);
        }
    }
    alias_tests.sort();

    let order = emission_order(ddg, &sccs, &ignored);
    let mut actions = vec![Action::Unroll; ddg.len()];
    for step in &order {
        let PlanStep::Node(n) = *step else { continue };
        if sccs.in_cycle(ddg, n, &ignored) {
            continue;
        }
        actions[n.as_usize()] = choose(ir, info, se, ddg, &actions, &ignored, n, config);
    }

    let common_vf = actions
        .iter()
        .filter_map(|a| match a {
            Action::Vectorize(vf) => Some(*vf),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    for a in &mut actions {
        if matches!(*a, Action::Vectorize(vf) if vf != common_vf) {
            *a = Action::Unroll;
        }
    }
    if common_vf < 2 || common_vf < config.min_profitable_vf {
        unsupported!(PASS, "no profitable vector operation (vf {common_vf})");
    }

    Ok(VectorPlan {
        actions,
        common_vf,
        order,
        alias_tests,
        ignored,
    })
}

#[allow(clippy::too_many_arguments)]
fn choose(
    ir: &MethodIr,
    info: &LoopInfo,
    se: &ScalarEvolution<'_>,
    ddg: &Ddg,
    actions: &[Action],
    ignored: &FxHashSet<DdgEdgeId>,
    n: DdgNodeId,
    config: &VectorizeConfig,
) -> Action {
    let node = ddg.node(n);
    let inst = ir.inst(node.inst);
    let live_preds = || node.preds.iter().filter(|e| !ignored.contains(e)).map(|&e| ddg.edge(e));

    let uses_header_phi = inst
        .srcs
        .iter()
        .any(|&s| ir.def_of(s).is_some_and(|d| d.block == info.header && d.opcode == Opcode::Phi));
    if !node.is_store() && !uses_header_phi && live_preds().all(|e| actions[e.from.as_usize()] == Action::Nothing) {
        return Action::Nothing;
    }

    if is_address(inst.opcode) && node.succs.iter().all(|&e| !ddg.edge(e).computation_relevant) {
        return Action::OnDemand;
    }

    let lanes_for = |bits: Option<u32>| match bits {
        Some(b) if b > 0 && config.vector_width_bits % b == 0 => Action::Vectorize(config.vector_width_bits / b),
        _ => Action::Unroll,
    };
    let types = &ir.types;
    match inst.opcode {
        Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::And
        | Opcode::Or
        | Opcode::Xor
        | Opcode::Min
        | Opcode::Max
        | Opcode::Neg
        | Opcode::Not
        | Opcode::Abs => {
            // Overflow-checked arithmetic raises per lane.
            if inst.modifier.overflow != OverflowMod::None {
                return Action::Unroll;
            }
            let ty = inst.ty;
            if !types.is_integer(ty) && !types.is_floating(ty) {
                return Action::Unroll;
            }
            lanes_for(types.bit_width(ty))
        }
        Opcode::TauLdInd | Opcode::TauStInd => {
            let Some(m) = node.memory() else { return Action::Unroll };
            let unit = m.index.is_some_and(|ix| match se.pool().get(ix) {
                Expr::PolyChrec { right, lp, .. } => lp == info.lp && se.pool().as_integer(right) == Some(1),
                _ => false,
            });
            let ty = m.elem_ty;
            if !unit || !m.is_element() || !(types.is_integer(ty) || types.is_floating(ty)) {
                return Action::Unroll;
            }
            lanes_for(types.bit_width(ty))
        }
        _ => Action::Unroll,
    }
}

/// Topological order of the components, preferring the component whose
/// earliest instruction comes first in the program.
fn emission_order(ddg: &Ddg, sccs: &Sccs, ignored: &FxHashSet<DdgEdgeId>) -> Vec<PlanStep> {
    let nc = sccs.components.len();
    let mut indegree = vec![0usize; nc];
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); nc];
    for (id, e) in ddg.edges() {
        if ignored.contains(&id) {
            continue;
        }
        let (a, b) = (sccs.comp_of[e.from.as_usize()], sccs.comp_of[e.to.as_usize()]);
        if a != b {
            succs[a].push(b);
            indegree[b] += 1;
        }
    }
    let first = |c: usize| sccs.components[c][0];
    let mut ready: BinaryHeap<Reverse<(DdgNodeId, usize)>> = (0..nc)
        .filter(|&c| indegree[c] == 0)
        .map(|c| Reverse((first(c), c)))
        .collect();
    let mut order = Vec::with_capacity(nc);
    while let Some(Reverse((_, c))) = ready.pop() {
        let comp = &sccs.components[c];
        order.push(if comp.len() == 1 {
            PlanStep::Node(comp[0])
        } else {
            PlanStep::Cycle(comp.clone())
        });
        for &s in &succs[c] {
            indegree[s] -= 1;
            if indegree[s] == 0 {
                ready.push(Reverse((first(s), s)));
            }
        }
    }
    order
}

// =============================================================================
// Tests
// =============================================================================
