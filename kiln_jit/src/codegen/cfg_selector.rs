//! CFG-level selection: nodes, edges, variables, then block contents.
//!
//! Nodes are generated in reverse postorder, so the backend's dense node ids
//! follow RPO with the entry first. Edges are replayed with their kind and
//! probability, or `-1.0` when the method carries no profile. Unreachable
//! blocks are not reported.

use super::callback::{CodeGenCallback, EdgeTag, NodeKind, OpType, VarHandle};
use super::selector::InstSelector;
use super::{SelectStats, SelectorConfig};
use crate::ir::inst::{OpndId, OpndKind, Payload};
use crate::ir::method::{BlockId, BlockKind, EdgeKind, MethodIr};
use crate::ir::opcode::Opcode;
use kiln_core::CompileResult;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

/// Probability reported for every edge of a method without a profile.
pub const NO_PROFILE: f64 = -1.0;

fn node_kind(ir: &MethodIr, b: BlockId) -> NodeKind {
    if b == ir.entry {
        return NodeKind::Entry;
    }
    if ir.unwind == Some(b) {
        return NodeKind::Unwind;
    }
    match ir.block(b).kind {
        BlockKind::Block => NodeKind::Block,
        BlockKind::Dispatch => NodeKind::Dispatch,
        BlockKind::Exit => NodeKind::Exit,
    }
}

fn edge_tag(kind: EdgeKind) -> EdgeTag {
    match kind {
        EdgeKind::Unconditional => EdgeTag::Unconditional,
        EdgeKind::True => EdgeTag::True,
        EdgeKind::False => EdgeTag::False,
        EdgeKind::Switch => EdgeTag::Switch,
        EdgeKind::Dispatch => EdgeTag::Dispatch,
        EdgeKind::Catch { priority, exception } => EdgeTag::Catch { priority, exception },
    }
}

/// Argument types in position order.
fn arg_types(ir: &MethodIr) -> SmallVec<[OpType; 8]> {
    let mut args: SmallVec<[(u32, OpType); 8]> = ir
        .block(ir.entry)
        .insts
        .iter()
        .filter_map(|&i| {
            let inst = ir.inst(i);
            match (inst.opcode, &inst.payload) {
                (Opcode::DefArg, Payload::Arg(n)) => Some((*n, OpType::of(&ir.types, inst.ty))),
                _ => None,
            }
        })
        .collect();
    args.sort_by_key(|&(n, _)| n);
    args.into_iter().map(|(_, t)| t).collect()
}

/// Declare one backend variable per HIR variable. SSA versions share their
/// base variable's handle.
fn declare_vars<C: CodeGenCallback>(ir: &MethodIr, cb: &mut C) -> FxHashMap<OpndId, VarHandle> {
    let mut vars: FxHashMap<OpndId, VarHandle> = FxHashMap::default();
    for v in ir.opnd_ids() {
        if ir.opnd(v).kind == OpndKind::Var {
            let ty = OpType::of(&ir.types, ir.opnd_ty(v));
            vars.insert(v, cb.declare_var(ty));
        }
    }
    for v in ir.opnd_ids() {
        if let OpndKind::SsaVar { var } = ir.opnd(v).kind {
            if let Some(&h) = vars.get(&var) {
                vars.insert(v, h);
            }
        }
    }
    vars
}

/// Drive `cb` over the whole method.
pub fn select_method<C: CodeGenCallback>(
    ir: &MethodIr,
    cb: &mut C,
    config: &SelectorConfig,
) -> CompileResult<SelectStats> {
    let ret = OpType::of(&ir.types, ir.ret_type);
    cb.method_start(&ir.name, &arg_types(ir), ret);
    let vars = declare_vars(ir, cb);

    let rpo = ir.rpo();
    let mut nodes: FxHashMap<BlockId, u32> = FxHashMap::default();
    for &b in &rpo {
        let id = cb.gen_node(node_kind(ir, b), b.index(), ir.block(b).exec_count);
        nodes.insert(b, id);
    }

    let mut edges = 0;
    for &b in &rpo {
        for &e in &ir.block(b).out_edges {
            let edge = ir.edge(e);
            let Some(&to) = nodes.get(&edge.target) else { continue };
            let prob = if ir.has_profile { edge.prob } else { NO_PROFILE };
            cb.gen_edge(nodes[&b], to, edge_tag(edge.kind), prob);
            edges += 1;
        }
    }

    let mut sel = InstSelector::new(ir, cb, *config, &vars, &nodes);
    for &b in &rpo {
        sel.select_block(b, nodes[&b])?;
    }
    sel.callback().method_end();

    let mut stats = sel.stats;
    stats.nodes = rpo.len();
    stats.edges = edges;
    stats.vars = vars.values().collect::<rustc_hash::FxHashSet<_>>().len();
    debug!(
        method = %ir.name,
        nodes = stats.nodes,
        insts = stats.insts_lowered,
        sunk = stats.constants_sunk,
        "selected"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::callback::recorder::Recorder;
    use crate::ir::builder::IrBuilder;
    use crate::ir::opcode::CmpMod;
    use crate::ir::types::TypeManager;

    fn diamond(profile: bool) -> MethodIr {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("diamond", tm, i32_);
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(i32_, 0);
        let zero = b.i32(0);
        let (l, r) = (b.new_block(), b.new_block());
        b.branch(CmpMod::Lt, a, Some(zero), l, r, 0.25);
        b.switch_to(l);
        b.ret(Some(zero));
        b.switch_to(r);
        b.ret(Some(a));
        ir.has_profile = profile;
        ir
    }

    #[test]
    fn test_nodes_follow_rpo_with_entry_first() {
        let ir = diamond(false);
        let mut rec = Recorder::default();
        let stats = select_method(&ir, &mut rec, &SelectorConfig::default()).unwrap();
        assert_eq!(rec.nodes.len(), 4);
        assert_eq!(rec.nodes[0], NodeKind::Entry);
        assert_eq!(*rec.nodes.last().unwrap(), NodeKind::Exit);
        assert_eq!(stats.nodes, 4);
        assert_eq!(stats.edges, 4);
        // Edges only point forward in RPO here.
        assert!(rec.edges.iter().all(|&(f, t, _, _)| f < t));
    }

    #[test]
    fn test_missing_profile_reports_sentinel_probability() {
        let ir = diamond(false);
        let mut rec = Recorder::default();
        select_method(&ir, &mut rec, &SelectorConfig::default()).unwrap();
        assert!(rec.edges.iter().all(|&(_, _, _, p)| p == NO_PROFILE));
    }

    #[test]
    fn test_profile_probabilities_are_forwarded() {
        let ir = diamond(true);
        let mut rec = Recorder::default();
        select_method(&ir, &mut rec, &SelectorConfig::default()).unwrap();
        let t = rec.edges.iter().find(|e| e.2 == EdgeTag::True).unwrap();
        let f = rec.edges.iter().find(|e| e.2 == EdgeTag::False).unwrap();
        assert_eq!(t.3, 0.25);
        assert_eq!(f.3, 0.75);
    }

    #[test]
    fn test_throw_reaches_unwind_node() {
        let mut tm = TypeManager::new();
        let root = tm.root_class();
        let cls = tm.define_class("Oops", Some(root), false);
        let ty = tm.object_type(cls);
        let void = tm.void();
        let mut ir = MethodIr::new("throws", tm, void);
        let mut b = IrBuilder::new(&mut ir);
        let o = b.new_obj(ty);
        b.throw(o, None);
        let mut rec = Recorder::default();
        select_method(&ir, &mut rec, &SelectorConfig::default()).unwrap();
        assert_eq!(rec.nodes, vec![NodeKind::Entry, NodeKind::Unwind, NodeKind::Exit]);
        assert!(rec.edges.iter().any(|e| e.2 == EdgeTag::Dispatch));
        assert_eq!(rec.count("throw"), 1);
    }

    #[test]
    fn test_versions_share_base_variable() {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("vars", tm, i32_);
        let var = ir.new_var(i32_);
        let (v1, v2) = (ir.new_ssa_var(var), ir.new_ssa_var(var));
        let mut b = IrBuilder::new(&mut ir);
        let one = b.i32(1);
        b.st_var(v1, one);
        let x = b.ld_var(v1);
        b.st_var(v2, x);
        let y = b.ld_var(v2);
        b.ret(Some(y));
        let mut rec = Recorder::default();
        let stats = select_method(&ir, &mut rec, &SelectorConfig::default()).unwrap();
        assert_eq!(stats.vars, 1);
        assert_eq!(rec.count("var"), 1);
        let stores: Vec<&String> = rec.log.iter().filter(|l| l.starts_with("stvar")).collect();
        assert_eq!(stores.len(), 2);
        assert_eq!(stores[0].split(' ').nth(1), stores[1].split(' ').nth(1));
    }
}
