//! Rewriting a planned loop into vector form.
//!
//! ```text
//!          P: n = max(iters, 0); bound' = bound - (n % VF) * step
//!          |  [base_a == base_b] --true--> EP
//!          v
//!   +----> H [phis; branch against bound']  ---exit---> EP [phis]
//!   |      |                                             |
//!   |      B1: VF iterations at once                     v
//!   +------+                               +-----------> H' [phis; original branch] ---> X
//!                                          |             |
//!                                          +---- B1'.. <-+
//! ```
//!
//! The vector loop stops before the last `n % VF` iterations; the scalar
//! epilogue H'/B' runs them, and runs the whole loop when a runtime alias
//! test fails.

use super::dependence::{Ddg, DdgNodeId};
use super::loop_info::LoopInfo;
use super::plan::{Action, PlanStep, VectorPlan};
use crate::ir::inst::{ConstValue, InstId, OpndId, OpndKind, Payload};
use crate::ir::method::{BlockId, EdgeId, EdgeKind, MethodIr};
use crate::ir::opcode::{CmpMod, InstFlags, Modifier, Opcode};
use crate::ir::types::TypeId;
use crate::opt::scev::{materialize, ExprPool, TripCount};
use kiln_core::{ice, unsupported, CompileResult, Location};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

const PASS: &str = "vectorize";

/// What the rewrite produced.
#[derive(Debug, Clone, Copy)]
pub struct Rewritten {
    /// Header of the scalar epilogue loop.
    pub epilogue_header: BlockId,
    /// Vector instructions emitted in the loop body.
    pub vector_ops: usize,
    pub alias_tests: usize,
}

/// A header phi with its incoming values, captured before any edge moves.
#[derive(Debug, Clone, Copy)]
struct HeaderPhi {
    inst: InstId,
    dst: OpndId,
    init: OpndId,
    back: OpndId,
}

/// Rewrite the loop of `info` according to `plan`.
pub fn transform(
    ir: &mut MethodIr,
    info: &LoopInfo,
    ddg: &Ddg,
    plan: &VectorPlan,
    trip: &TripCount,
    pool: &ExprPool,
) -> CompileResult<Rewritten> {
    let vf = plan.common_vf;
    let branch = info.exit_branch;
    let cmp = match ir.inst(branch).modifier.cmp {
        Some(c) => c,
        None => ice!(PASS, Location::Inst(branch.index()), "exit branch without relation"),
    };
    let iv = ir.inst(branch).srcs.get(trip.iv_src).copied();
    let Some(iv) = iv else {
        ice!(PASS, Location::Inst(branch.index()), "induction variable operand out of range");
    };
    let iv_ty = ir.opnd_ty(iv);
    let bound = if cmp.is_unary() {
        None
    } else {
        let b = ir.inst(branch).src(1 - trip.iv_src);
        if ir.def_of(b).is_some_and(|d| info.contains(d.block)) {
            unsupported!(PASS, "loop bound computed inside the loop");
        }
        Some(b)
    };

    for b in info.blocks() {
        for &i in &ir.block(b).insts {
            if let Some(d) = ir.inst(i).dst {
                if ir.opnd(d).kind == OpndKind::Var {
                    unsupported!(PASS, "loop defines an unversioned variable");
                }
            }
        }
    }

    let mut phis = Vec::new();
    for p in info.header_phis(ir) {
        let (Some(dst), Some(init), Some(back)) = (ir.inst(p).dst, info.init_src(ir, p), info.back_src(ir, p)) else {
            ice!(PASS, Location::Inst(p.index()), "malformed header phi");
        };
        phis.push(HeaderPhi { inst: p, dst, init, back });
    }

    // Vector loop bound, computed in the preheader. Nothing else changes
    // until it is known to be expressible.
    let pre = info.preheader;
    let push = |ir: &mut MethodIr, op: Opcode, m: Modifier, srcs: &[OpndId], payload: Payload| {
        let dst = ir.new_temp(iv_ty);
        let inst = ir.create_inst(op, m, iv_ty, Some(dst), srcs, payload);
        ir.append_before_terminator(pre, inst);
        dst
    };
    let n = materialize(ir, pool, trip.iterations, iv_ty, pre)?;
    let zero = push(ir, Opcode::LdConstant, Modifier::NONE, &[], Payload::Const(ConstValue::Int(0)));
    let n = push(ir, Opcode::Max, Modifier::NONE, &[n, zero], Payload::None);
    let vfc = push(ir, Opcode::LdConstant, Modifier::NONE, &[], Payload::Const(ConstValue::Int(vf as i64)));
    let safe = ir.find_or_create_tau_safe();
    let signed = Modifier::NONE.with_flags(InstFlags::SIGNED);
    let rem = push(ir, Opcode::TauRem, signed, &[n, vfc, safe], Payload::None);
    let step = push(ir, Opcode::LdConstant, Modifier::NONE, &[], Payload::Const(ConstValue::Int(trip.step)));
    let skipped = push(ir, Opcode::Mul, Modifier::NONE, &[rem, step], Payload::None);
    let old_bound = match bound {
        Some(b) => b,
        None => zero,
    };
    let new_bound = push(ir, Opcode::Sub, Modifier::NONE, &[old_bound, skipped], Payload::None);

    let epilogue = clone_loop(ir, info, &phis)?;
    {
        let inst = ir.inst_mut(branch);
        if cmp.is_unary() {
            inst.modifier.cmp = Some(if cmp == CmpMod::NonZero { CmpMod::Ne } else { CmpMod::Eq });
            inst.srcs = SmallVec::from_slice(&[iv, new_bound]);
        } else {
            inst.srcs[1 - trip.iv_src] = new_bound;
        }
    }

    // Runtime alias tests: any pair of equal bases goes straight to the
    // epilogue.
    let ep = epilogue.entry;
    let void = ir.types.void();
    let mut cur = pre;
    let mut entry_edge = info.preheader_edge;
    for &(a, b) in &plan.alias_tests {
        let mid = ir.split_edge(entry_edge);
        let Some(&link) = ir.block(mid).out_edges.first() else {
            ice!(PASS, Location::Block(mid.index()), "split block without successor");
        };
        let test = ir.create_inst(Opcode::Branch, Modifier::cmp(CmpMod::Eq), void, None, &[a, b], Payload::None);
        ir.append_inst(cur, test);
        {
            let e = ir.edge_mut(entry_edge);
            e.kind = EdgeKind::False;
            e.prob = 0.99;
        }
        ir.add_edge(cur, ep, EdgeKind::True, 0.01);
        cur = mid;
        entry_edge = link;
    }

    // Epilogue entry phis: the loop's initial values when a test failed,
    // the vector loop's final values otherwise.
    let in_edges: SmallVec<[EdgeId; 4]> = ir.block(ep).in_edges.iter().copied().collect();
    for (hp, &ep_dst) in phis.iter().zip(&epilogue.entry_values) {
        let srcs: SmallVec<[OpndId; 4]> = in_edges
            .iter()
            .map(|&e| if ir.edge(e).source == info.header { hp.dst } else { hp.init })
            .collect();
        let ty = ir.opnd_ty(hp.dst);
        let phi = ir.create_inst(Opcode::Phi, Modifier::NONE, ty, Some(ep_dst), &srcs, Payload::None);
        ir.append_inst(ep, phi);
    }

    // Vector body.
    let body: Vec<InstId> = info.body.iter().flat_map(|&b| ir.block(b).insts.clone()).collect();
    let mut sources = FxHashMap::default();
    for &i in &body {
        sources.insert(i, ir.inst(i).srcs.clone());
        ir.unlink(i);
    }
    let Some(&target) = info.body.first() else {
        ice!(PASS, Location::Block(info.header.index()), "loop without body");
    };
    let mut rw = Rewriter {
        ir: &mut *ir,
        info,
        ddg,
        plan,
        vf,
        vector_entry: cur,
        target,
        phis: phis.iter().map(|p| (p.dst, p.back)).collect(),
        sources,
        unrolled: FxHashMap::default(),
        vectors: FxHashMap::default(),
        lanes: FxHashMap::default(),
        packed: FxHashMap::default(),
        vector_ops: 0,
    };
    for step in &plan.order {
        match step {
            PlanStep::Node(n) => rw.emit_node(*n)?,
            PlanStep::Cycle(nodes) => {
                for k in 0..vf {
                    for &n in nodes {
                        rw.emit_lane(n, k)?;
                    }
                }
            }
        }
    }

    // Carried values leave the body from the last lane.
    let latch_slot = match rw.ir.in_edge_index(info.latch_edge) {
        Some(s) => s,
        None => ice!(PASS, Location::Block(info.header.index()), "latch edge not into header"),
    };
    for hp in &phis {
        let last = rw.lane(hp.back, vf - 1)?;
        rw.ir.inst_mut(hp.inst).srcs[latch_slot] = last;
    }
    let vector_ops = rw.vector_ops;

    ir.verify()?;
    Ok(Rewritten {
        epilogue_header: epilogue.header,
        vector_ops,
        alias_tests: plan.alias_tests.len(),
    })
}

// =============================================================================
// Epilogue
// =============================================================================

struct Epilogue {
    /// Block entering the cloned loop, holding its entry phis.
    entry: BlockId,
    header: BlockId,
    /// Destination of the entry phi for each header phi.
    entry_values: Vec<OpndId>,
}

fn fresh(ir: &mut MethodIr, v: OpndId) -> CompileResult<OpndId> {
    let ty = ir.opnd_ty(v);
    Ok(match ir.opnd(v).kind {
        OpndKind::Temp => ir.new_temp(ty),
        OpndKind::SsaVar { var } => ir.new_ssa_var(var),
        OpndKind::Var => ice!(PASS, Location::Inst(v.index()), "variable without SSA version"),
    })
}

/// Copy header and body into a new scalar loop entered through a fresh
/// block, move the loop exit to the copy, and point every use after the
/// loop at the copy's values.
fn clone_loop(ir: &mut MethodIr, info: &LoopInfo, phis: &[HeaderPhi]) -> CompileResult<Epilogue> {
    let blocks: Vec<BlockId> = info.blocks().collect();
    let mut bmap: FxHashMap<BlockId, BlockId> = FxHashMap::default();
    for &b in &blocks {
        let nb = ir.new_block();
        bmap.insert(b, nb);
    }
    let entry = ir.new_block();
    let header = bmap[&info.header];

    let mut vmap: FxHashMap<OpndId, OpndId> = FxHashMap::default();
    for &b in &blocks {
        for i in ir.block(b).insts.clone() {
            if let Some(d) = ir.inst(i).dst {
                let nd = fresh(ir, d)?;
                vmap.insert(d, nd);
            }
        }
    }
    for &b in &blocks {
        for i in ir.block(b).insts.clone() {
            let srcs: SmallVec<[OpndId; 4]> = ir.inst(i).srcs.iter().map(|s| *vmap.get(s).unwrap_or(s)).collect();
            let dst = ir.inst(i).dst.map(|d| vmap[&d]);
            let copy = ir.clone_inst(i, dst, &srcs);
            ir.append_inst(bmap[&b], copy);
        }
    }

    // Header phis of the copy: [entry block, latch].
    let mut entry_values = Vec::with_capacity(phis.len());
    for hp in phis {
        let ep_dst = fresh(ir, hp.dst)?;
        entry_values.push(ep_dst);
        let copy = vmap[&hp.dst];
        let Some(copy_inst) = ir.opnd(copy).def else {
            ice!(PASS, Location::Inst(hp.inst.index()), "cloned phi has no definition");
        };
        let back = *vmap.get(&hp.back).unwrap_or(&hp.back);
        ir.inst_mut(copy_inst).srcs = SmallVec::from_slice(&[ep_dst, back]);
    }

    ir.add_edge(entry, header, EdgeKind::Unconditional, 1.0);
    for &b in &blocks {
        for e in ir.block(b).out_edges.clone() {
            let (target, kind, prob) = {
                let edge = ir.edge(e);
                (edge.target, edge.kind, edge.prob)
            };
            if e == info.exit_edge {
                continue;
            }
            let Some(&t) = bmap.get(&target) else {
                ice!(PASS, Location::Block(b.index()), "unexpected loop exit");
            };
            ir.add_edge(bmap[&b], t, kind, prob);
        }
    }

    let inside: FxHashSet<BlockId> = blocks.iter().chain(bmap.values()).copied().chain([entry]).collect();
    let outside: Vec<InstId> = ir
        .linked_insts()
        .filter(|&i| !inside.contains(&ir.inst(i).block))
        .collect();
    for i in outside {
        for s in ir.inst_mut(i).srcs.iter_mut() {
            if let Some(&n) = vmap.get(s) {
                *s = n;
            }
        }
    }

    let (exit_kind, exit_prob) = {
        let e = ir.edge(info.exit_edge);
        (e.kind, e.prob)
    };
    ir.move_edge_source(info.exit_edge, header);
    ir.add_edge(info.header, entry, exit_kind, exit_prob);

    Ok(Epilogue {
        entry,
        header,
        entry_values,
    })
}

// =============================================================================
// Body rewriting
// =============================================================================

struct Rewriter<'a> {
    ir: &'a mut MethodIr,
    info: &'a LoopInfo,
    ddg: &'a Ddg,
    plan: &'a VectorPlan,
    vf: u32,
    /// Block for loop-invariant vectors. It runs only once every alias
    /// test has passed.
    vector_entry: BlockId,
    /// Block receiving the rewritten body.
    target: BlockId,
    /// Header phi destination to back-edge source.
    phis: FxHashMap<OpndId, OpndId>,
    /// Body sources as they were before any lane was emitted.
    sources: FxHashMap<InstId, SmallVec<[OpndId; 4]>>,
    /// Per-lane results of unrolled nodes.
    unrolled: FxHashMap<DdgNodeId, SmallVec<[Option<OpndId>; 8]>>,
    /// Results of vectorized nodes.
    vectors: FxHashMap<DdgNodeId, OpndId>,
    /// Lane values produced on demand or by extraction.
    lanes: FxHashMap<(OpndId, u32), OpndId>,
    /// Vectors packed from scalars.
    packed: FxHashMap<OpndId, OpndId>,
    vector_ops: usize,
}

impl Rewriter<'_> {
    fn append(&mut self, inst: InstId) {
        self.ir.append_before_terminator(self.target, inst);
    }

    fn sources(&self, inst: InstId) -> SmallVec<[OpndId; 4]> {
        match self.sources.get(&inst) {
            Some(s) => s.clone(),
            None => self.ir.inst(inst).srcs.clone(),
        }
    }

    fn vector_type(&mut self, elem: TypeId) -> TypeId {
        self.ir.types.vector(elem, self.vf as u8)
    }

    fn emit_node(&mut self, n: DdgNodeId) -> CompileResult<()> {
        match self.plan.action(n) {
            Action::Nothing => {
                let inst = self.ddg.node(n).inst;
                self.append(inst);
                Ok(())
            }
            Action::OnDemand => Ok(()),
            Action::Unroll => {
                for k in 0..self.vf {
                    self.emit_lane(n, k)?;
                }
                Ok(())
            }
            Action::Vectorize(_) => self.emit_vector(n),
        }
    }

    /// Scalar copy of node `n` for lane `k`. Lane 0 reuses the original.
    fn emit_lane(&mut self, n: DdgNodeId, k: u32) -> CompileResult<()> {
        let inst = self.ddg.node(n).inst;
        let srcs = self.sources(inst);
        let mut lane_srcs: SmallVec<[OpndId; 4]> = SmallVec::with_capacity(srcs.len());
        for s in srcs {
            lane_srcs.push(self.lane(s, k)?);
        }
        let dst = self.ir.inst(inst).dst;
        let (copy, result) = if k == 0 {
            self.ir.inst_mut(inst).srcs = lane_srcs;
            (inst, dst)
        } else {
            let nd = match dst {
                Some(d) => Some(fresh(self.ir, d)?),
                None => None,
            };
            (self.ir.clone_inst(inst, nd, &lane_srcs), nd)
        };
        self.append(copy);
        self.unrolled.entry(n).or_default().push(result);
        Ok(())
    }

    fn emit_vector(&mut self, n: DdgNodeId) -> CompileResult<()> {
        let inst = self.ddg.node(n).inst;
        let (op, modifier, ty, payload) = {
            let i = self.ir.inst(inst);
            (i.opcode, i.modifier, i.ty, i.payload.clone())
        };
        let srcs = self.sources(inst);
        let mut vsrcs: SmallVec<[OpndId; 4]> = SmallVec::with_capacity(srcs.len());
        match op {
            Opcode::TauLdInd => {
                for s in srcs {
                    vsrcs.push(self.lane(s, 0)?);
                }
            }
            Opcode::TauStInd => {
                for (pos, s) in srcs.into_iter().enumerate() {
                    vsrcs.push(if pos == 0 { self.vec(s)? } else { self.lane(s, 0)? });
                }
            }
            _ => {
                for s in srcs {
                    vsrcs.push(self.vec(s)?);
                }
            }
        }
        let (vty, dst) = if op == Opcode::TauStInd {
            (ty, None)
        } else {
            let vty = self.vector_type(ty);
            (vty, Some(self.ir.new_temp(vty)))
        };
        let v = self.ir.create_inst(op, modifier, vty, dst, &vsrcs, payload);
        self.append(v);
        if let Some(d) = dst {
            self.vectors.insert(n, d);
        }
        self.vector_ops += 1;
        Ok(())
    }

    /// Scalar value of `v` in lane `k` of the current vector iteration.
    fn lane(&mut self, v: OpndId, k: u32) -> CompileResult<OpndId> {
        if let Some(&x) = self.lanes.get(&(v, k)) {
            return Ok(x);
        }
        let Some(def) = self.ir.opnd(v).def else {
            return Ok(v);
        };
        let Some(n) = self.ddg.node_of_inst(def) else {
            if let Some(&back) = self.phis.get(&v) {
                return if k == 0 { Ok(v) } else { self.lane(back, k - 1) };
            }
            return Ok(v);
        };
        let x = match self.plan.action(n) {
            Action::Nothing => return Ok(v),
            Action::Unroll => {
                let got = self.unrolled.get(&n).and_then(|l| l.get(k as usize).copied().flatten());
                match got {
                    Some(x) => return Ok(x),
                    None => ice!(PASS, Location::Inst(def.index()), "lane {k} used before it is computed"),
                }
            }
            Action::OnDemand => {
                let srcs = self.sources(def);
                let mut lane_srcs: SmallVec<[OpndId; 4]> = SmallVec::with_capacity(srcs.len());
                for s in srcs {
                    lane_srcs.push(self.lane(s, k)?);
                }
                let nd = fresh(self.ir, v)?;
                let copy = self.ir.clone_inst(def, Some(nd), &lane_srcs);
                self.append(copy);
                nd
            }
            Action::Vectorize(_) => {
                let Some(&vec) = self.vectors.get(&n) else {
                    ice!(PASS, Location::Inst(def.index()), "vector used before it is computed");
                };
                let ty = self.ir.opnd_ty(v);
                let nd = self.ir.new_temp(ty);
                let x = self
                    .ir
                    .create_inst(Opcode::VecExtract, Modifier::NONE, ty, Some(nd), &[vec], Payload::Lane(k));
                self.append(x);
                nd
            }
        };
        self.lanes.insert((v, k), x);
        Ok(x)
    }

    /// Vector holding `v` for every lane of the current vector iteration.
    fn vec(&mut self, v: OpndId) -> CompileResult<OpndId> {
        if let Some(&x) = self.packed.get(&v) {
            return Ok(x);
        }
        let def = self.ir.opnd(v).def;
        if let Some(n) = def.and_then(|d| self.ddg.node_of_inst(d)) {
            if let Some(&x) = self.vectors.get(&n) {
                return Ok(x);
            }
        }
        let invariant = def.map_or(true, |d| !self.info.contains(self.ir.inst(d).block));
        let ty = self.ir.opnd_ty(v);
        let vty = self.vector_type(ty);
        let lanes: SmallVec<[OpndId; 8]> = if invariant {
            SmallVec::from_elem(v, self.vf as usize)
        } else {
            let mut l = SmallVec::new();
            for k in 0..self.vf {
                l.push(self.lane(v, k)?);
            }
            l
        };
        let dst = self.ir.new_temp(vty);
        let pack = self
            .ir
            .create_inst(Opcode::VecPack, Modifier::NONE, vty, Some(dst), &lanes, Payload::None);
        if invariant {
            self.ir.append_before_terminator(self.vector_entry, pack);
        } else {
            self.append(pack);
        }
        self.packed.insert(v, dst);
        Ok(dst)
    }
}

// =============================================================================
// Tests
// =============================================================================
