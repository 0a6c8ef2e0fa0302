//! Data dependence graph of a loop body.
//!
//! One node per instruction of the body, phis and the exit branch excluded.
//! Edges are oriented so the source always runs first: its direction is `=`
//! for a dependence inside one iteration and `>` when the destination runs in
//! a later iteration. An edge whose direction cannot be pinned down (`*`) is
//! always materialized in both orientations.
//!
//! # Algorithm
//!
//! 1. Scalar edges: from the instruction defining an operand to each of its
//!    users. A use of a header phi is a use of the phi's back-edge source one
//!    iteration earlier.
//! 2. Memory edges, for every pair of accesses with at least one write:
//!    - different element types, or a field against an array element,
//!      never overlap
//!    - GCD test on the affine index functions
//!    - ZIV: same location in every iteration
//!    - strong SIV: equal constant step `a`, constant base difference `c`,
//!      exact distance `-c / a`
//!    - everything else (MIV, symbolic distance) depends in both directions
//!
//! Accesses through two distinct loop-invariant bases are tested as if the
//! bases were equal; their edges are marked as removable by a runtime check
//! that the bases differ.
//!
//! # References
//!
//! - Goff, Kennedy, Tseng: "Practical Dependence Testing"
//! - "Optimizing Compilers for Modern Architectures" - Allen & Kennedy

use super::loop_info::LoopInfo;
use crate::ir::arena::{Arena, Id};
use crate::ir::cfg::{LoopId, LoopTree};
use crate::ir::inst::{InstId, OpndId, Payload};
use crate::ir::method::MethodIr;
use crate::ir::opcode::Opcode;
use crate::ir::types::{FieldId, TypeId};
use crate::opt::scev::{ExprId, ScalarEvolution};
use kiln_core::{unsupported, CompileResult};
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};

const PASS: &str = "vectorize";

// =============================================================================
// Direction and Distance
// =============================================================================

/// Relation between the source iteration and the destination iteration of a
/// dependence, at one loop level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Destination in an earlier iteration.
    Lt,
    /// Same iteration.
    Eq,
    /// Destination in a later iteration.
    Gt,
    Le,
    Ge,
    /// Different iterations.
    Ne,
    /// Unknown.
    Star,
}

impl Direction {
    /// Direction of the same dependence read from destination to source.
    pub fn reverse(self) -> Direction {
        match self {
            Direction::Lt => Direction::Gt,
            Direction::Gt => Direction::Lt,
            Direction::Le => Direction::Ge,
            Direction::Ge => Direction::Le,
            d => d,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Direction::Lt => "<",
            Direction::Eq => "=",
            Direction::Gt => ">",
            Direction::Le => "<=",
            Direction::Ge => ">=",
            Direction::Ne => "<>",
            Direction::Star => "*",
        }
    }
}

/// Classification of a dependence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// Through an SSA value.
    Scalar,
    /// Write then read (true dependence).
    Flow,
    /// Read then write.
    Anti,
    /// Write then write.
    Output,
}

// =============================================================================
// Nodes and Edges
// =============================================================================

pub type DdgNodeId = Id<DdgNode>;
pub type DdgEdgeId = Id<DdgEdge>;

/// A memory access split into base and index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemAccess {
    /// Array or object reference; `None` for statics and opaque addresses.
    pub base: Option<OpndId>,
    pub field: Option<FieldId>,
    /// Evolution of the element index. `None` for fields or when the index
    /// is not analyzable.
    pub index: Option<ExprId>,
    /// Address operand when the address could not be decomposed.
    pub opaque: Option<OpndId>,
    pub elem_ty: TypeId,
    pub is_write: bool,
    /// The base is defined outside the loop.
    pub invariant_base: bool,
}

impl MemAccess {
    pub fn is_element(&self) -> bool {
        self.field.is_none() && self.opaque.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeKind {
    ScalarWithScev(ExprId),
    ScalarWithoutScev,
    Memory(MemAccess),
}

#[derive(Debug, Clone)]
pub struct DdgNode {
    pub inst: InstId,
    pub kind: NodeKind,
    pub preds: SmallVec<[DdgEdgeId; 4]>,
    pub succs: SmallVec<[DdgEdgeId; 4]>,
}

impl DdgNode {
    pub fn memory(&self) -> Option<&MemAccess> {
        match &self.kind {
            NodeKind::Memory(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_store(&self) -> bool {
        self.memory().is_some_and(|m| m.is_write)
    }
}

#[derive(Debug, Clone)]
pub struct DdgEdge {
    pub from: DdgNodeId,
    pub to: DdgNodeId,
    pub kind: DepKind,
    /// One entry per loop of the nest, outermost first.
    pub directions: SmallVec<[Direction; 2]>,
    /// Iteration distance in the innermost loop, when exact.
    pub distance: Option<i64>,
    /// The destination consumes the value, rather than using it as an
    /// address or a proof.
    pub computation_relevant: bool,
    /// A runtime check that the two bases differ removes this edge.
    pub needs_alias_test: bool,
}

impl DdgEdge {
    pub fn inner_direction(&self) -> Direction {
        self.directions.last().copied().unwrap_or(Direction::Star)
    }

    /// Directions read from `to` back to `from`.
    pub fn reversed_directions(&self) -> SmallVec<[Direction; 2]> {
        self.directions.iter().map(|d| d.reverse()).collect()
    }
}

// =============================================================================
// Graph
// =============================================================================

/// Dependence graph of one loop.
#[derive(Debug, Clone)]
pub struct Ddg {
    nodes: Arena<DdgNode>,
    edges: Arena<DdgEdge>,
    by_inst: FxHashMap<InstId, DdgNodeId>,
    depth: usize,
}

/// Outcome of testing one pair of accesses.
enum PairDep {
    None,
    /// Edge from the first to the second access.
    Forward(Direction, Option<i64>),
    /// Edge from the second to the first.
    Backward(Direction, Option<i64>),
    /// Same location in every iteration.
    SameLocation,
    Unknown,
}

impl Ddg {
    /// Build the graph for the loop described by `info`.
    ///
    /// Fails with `Unsupported` on any instruction outside the modelled set:
    /// calls other than allocation-safe helpers, explicit checks, monitors,
    /// allocation, variable traffic, and non-header phis.
    pub fn compute_ddg_for(
        ir: &MethodIr,
        loops: &LoopTree,
        info: &LoopInfo,
        se: &mut ScalarEvolution<'_>,
    ) -> CompileResult<Ddg> {
        let mut levels: SmallVec<[LoopId; 4]> = smallvec![info.lp];
        let mut cur = loops.get(info.lp).parent;
        while let Some(p) = cur {
            levels.push(p);
            cur = loops.get(p).parent;
        }
        levels.reverse();

        let mut ddg = Ddg {
            nodes: Arena::new(),
            edges: Arena::new(),
            by_inst: FxHashMap::default(),
            depth: levels.len(),
        };

        for &b in &info.body {
            for &i in &ir.block(b).insts {
                let kind = classify(ir, info, se, i)?;
                let id = ddg.nodes.alloc(DdgNode {
                    inst: i,
                    kind,
                    preds: SmallVec::new(),
                    succs: SmallVec::new(),
                });
                ddg.by_inst.insert(i, id);
            }
        }

        ddg.add_scalar_edges(ir, info)?;
        ddg.add_memory_edges(se, &levels);
        Ok(ddg)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (DdgNodeId, &DdgNode)> {
        self.nodes.iter()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = DdgNodeId> {
        self.nodes.ids()
    }

    pub fn node(&self, id: DdgNodeId) -> &DdgNode {
        &self.nodes[id]
    }

    pub fn edge(&self, id: DdgEdgeId) -> &DdgEdge {
        &self.edges[id]
    }

    pub fn edges(&self) -> impl Iterator<Item = (DdgEdgeId, &DdgEdge)> {
        self.edges.iter()
    }

    pub fn node_of_inst(&self, inst: InstId) -> Option<DdgNodeId> {
        self.by_inst.get(&inst).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of loops in the nest.
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn add_edge(&mut self, edge: DdgEdge) -> DdgEdgeId {
        let (from, to) = (edge.from, edge.to);
        let id = self.edges.alloc(edge);
        self.nodes[from].succs.push(id);
        self.nodes[to].preds.push(id);
        id
    }

    fn directions(&self, inner: Direction) -> SmallVec<[Direction; 2]> {
        let mut d: SmallVec<[Direction; 2]> = smallvec![Direction::Eq; self.depth - 1];
        d.push(inner);
        d
    }

    // -------------------------------------------------------------------------
    // Scalar dependences
    // -------------------------------------------------------------------------

    fn add_scalar_edges(&mut self, ir: &MethodIr, info: &LoopInfo) -> CompileResult<()> {
        let tau = ir.types.tau();
        let ids: Vec<DdgNodeId> = self.nodes.ids().collect();
        for to in ids {
            let inst = ir.inst(self.nodes[to].inst);
            let user_is_address = is_address(inst.opcode);
            for (pos, &src) in inst.srcs.iter().enumerate() {
                let relevant = !user_is_address && !is_address_operand(inst.opcode, pos) && ir.opnd_ty(src) != tau;
                let Some(def) = ir.opnd(src).def else { continue };
                if let Some(&from) = self.by_inst.get(&def) {
                    self.add_edge(DdgEdge {
                        from,
                        to,
                        kind: DepKind::Scalar,
                        directions: self.directions(Direction::Eq),
                        distance: Some(0),
                        computation_relevant: relevant,
                        needs_alias_test: false,
                    });
                    continue;
                }
                if ir.inst(def).block != info.header || ir.inst(def).opcode != Opcode::Phi {
                    continue;
                }
                let Some(back) = info.back_src(ir, def) else {
                    unsupported!(PASS, "header phi without a back-edge source");
                };
                let Some(back_def) = ir.opnd(back).def else { continue };
                if let Some(&from) = self.by_inst.get(&back_def) {
                    self.add_edge(DdgEdge {
                        from,
                        to,
                        kind: DepKind::Scalar,
                        directions: self.directions(Direction::Gt),
                        distance: Some(1),
                        computation_relevant: relevant,
                        needs_alias_test: false,
                    });
                } else if ir.inst(back_def).block == info.header {
                    unsupported!(PASS, "header phi fed by another header phi");
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Memory dependences
    // -------------------------------------------------------------------------

    fn add_memory_edges(&mut self, se: &mut ScalarEvolution<'_>, levels: &[LoopId]) {
        let mems: Vec<(DdgNodeId, MemAccess)> = self
            .nodes
            .iter()
            .filter_map(|(id, n)| n.memory().map(|m| (id, *m)))
            .collect();
        for (i, &(x, mx)) in mems.iter().enumerate() {
            for &(y, my) in &mems[i + 1..] {
                if !mx.is_write && !my.is_write {
                    continue;
                }
                let (dep, alias) = test_pair(se, levels, &mx, &my);
                let kind_xy = dep_kind(&mx, &my);
                let kind_yx = dep_kind(&my, &mx);
                let mut pending: SmallVec<[(DdgNodeId, DdgNodeId, DepKind, Direction, Option<i64>); 2]> = SmallVec::new();
                match dep {
                    PairDep::None => {}
                    PairDep::Forward(d, dist) => pending.push((x, y, kind_xy, d, dist)),
                    PairDep::Backward(d, dist) => pending.push((y, x, kind_yx, d, dist)),
                    PairDep::SameLocation => {
                        pending.push((x, y, kind_xy, Direction::Ge, None));
                        pending.push((y, x, kind_yx, Direction::Gt, None));
                    }
                    PairDep::Unknown => {
                        pending.push((x, y, kind_xy, Direction::Star, None));
                        pending.push((y, x, kind_yx, Direction::Star, None));
                    }
                }
                for (from, to, kind, inner, distance) in pending {
                    self.add_edge(DdgEdge {
                        from,
                        to,
                        kind,
                        directions: self.directions(inner),
                        distance,
                        computation_relevant: true,
                        needs_alias_test: alias,
                    });
                }
            }
        }
    }
}

fn dep_kind(from: &MemAccess, to: &MemAccess) -> DepKind {
    match (from.is_write, to.is_write) {
        (true, true) => DepKind::Output,
        (true, false) => DepKind::Flow,
        _ => DepKind::Anti,
    }
}

/// Dependence between two accesses, `x` first in program order. The flag
/// says whether the result assumed two distinct bases may be equal.
fn test_pair(se: &mut ScalarEvolution<'_>, levels: &[LoopId], x: &MemAccess, y: &MemAccess) -> (PairDep, bool) {
    if x.elem_ty != y.elem_ty {
        return (PairDep::None, false);
    }
    match (x.field, y.field) {
        (Some(f), Some(g)) if f != g => return (PairDep::None, false),
        (Some(_), None) | (None, Some(_)) if x.opaque.is_none() && y.opaque.is_none() => {
            return (PairDep::None, false)
        }
        _ => {}
    }
    if x.opaque.is_some() || y.opaque.is_some() {
        let same = x.opaque.is_some() && x.opaque == y.opaque && x.invariant_base;
        return (if same { PairDep::SameLocation } else { PairDep::Unknown }, false);
    }
    if !x.invariant_base || !y.invariant_base {
        return (PairDep::Unknown, false);
    }
    let alias = x.base != y.base;

    if !x.is_element() {
        return (PairDep::SameLocation, alias);
    }
    let (Some(fx), Some(fy)) = (x.index, y.index) else {
        return (PairDep::Unknown, alias);
    };
    (test_indices(se, levels, fx, fy), alias)
}

fn test_indices(se: &mut ScalarEvolution<'_>, levels: &[LoopId], fx: ExprId, fy: ExprId) -> PairDep {
    if !se.pool().gcd_may_depend(fx, fy) {
        return PairDep::None;
    }
    let (Some((bx, sx)), Some((by, sy))) = (se.pool().affine_terms(fx), se.pool().affine_terms(fy)) else {
        return PairDep::Unknown;
    };
    let pool = se.pool_mut();
    let zero = pool.integer(0);
    let step = |steps: &SmallVec<[(LoopId, ExprId); 2]>, lp: LoopId| {
        steps.iter().find(|(l, _)| *l == lp).map_or(zero, |&(_, s)| s)
    };
    // Every enclosing loop must advance both accesses identically, otherwise
    // the distance differs between outer iterations.
    let Some((&inner, outer)) = levels.split_last() else {
        return PairDep::Unknown;
    };
    if outer.iter().any(|&l| step(&sx, l) != step(&sy, l)) {
        return PairDep::Unknown;
    }
    let (Some(ax), Some(ay)) = (pool.as_integer(step(&sx, inner)), pool.as_integer(step(&sy, inner))) else {
        return PairDep::Unknown;
    };
    let diff = pool.sub(by, bx);
    let Some(c) = pool.as_integer(diff) else {
        return PairDep::Unknown;
    };
    if ax != ay {
        return PairDep::Unknown;
    }
    let a = ax;
    if a == 0 {
        return if c == 0 { PairDep::SameLocation } else { PairDep::None };
    }
    if c % a != 0 {
        return PairDep::None;
    }
    // x at iteration k touches the same element as y at iteration k + d.
    let d = -c / a;
    match d {
        0 => PairDep::Forward(Direction::Eq, Some(0)),
        d if d > 0 => PairDep::Forward(Direction::Gt, Some(d)),
        d => PairDep::Backward(Direction::Gt, Some(-d)),
    }
}

// =============================================================================
// Instruction classification
// =============================================================================

/// Opcodes computing addresses.
pub fn is_address(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::LdElemAddr | Opcode::AddScaledIndex | Opcode::LdArrayBaseAddr | Opcode::LdFieldAddr | Opcode::LdStaticAddr
    )
}

/// Source positions holding an address or a proof.
fn is_address_operand(op: Opcode, pos: usize) -> bool {
    match op {
        Opcode::TauLdInd => true,
        Opcode::TauStInd => pos > 0,
        _ => false,
    }
}

fn classify(ir: &MethodIr, info: &LoopInfo, se: &mut ScalarEvolution<'_>, i: InstId) -> CompileResult<NodeKind> {
    let inst = ir.inst(i);
    let op = inst.opcode;
    match op {
        Opcode::Phi => unsupported!(PASS, "phi outside the loop header"),
        Opcode::VmHelperCall => match inst.payload {
            Payload::Helper(h) if h.is_alloc_safe() => {}
            _ => unsupported!(PASS, "call with unknown side effects"),
        },
        Opcode::DirectCall | Opcode::IndirectCall => unsupported!(PASS, "call with unknown side effects"),
        Opcode::NewObj | Opcode::NewArray => unsupported!(PASS, "allocation in loop body"),
        Opcode::LdVar | Opcode::StVar => unsupported!(PASS, "variable access in loop body"),
        Opcode::TauMonitorEnter | Opcode::TauMonitorExit => unsupported!(PASS, "monitor in loop body"),
        _ if op.is_terminator() => unsupported!(PASS, "{} in loop body", op.name()),
        _ if op.is_check() => unsupported!(PASS, "{} in loop body", op.name()),
        _ => {}
    }

    match op {
        Opcode::TauLdInd => return Ok(NodeKind::Memory(access(ir, info, se, inst.src(0), inst.ty, false))),
        Opcode::TauStInd => {
            let ty = ir.opnd_ty(inst.src(0));
            return Ok(NodeKind::Memory(access(ir, info, se, inst.src(1), ty, true)));
        }
        _ => {}
    }
    if let Some(d) = inst.dst {
        if let Some(e) = se.analyze(d, info.lp) {
            return Ok(NodeKind::ScalarWithScev(e));
        }
    }
    Ok(NodeKind::ScalarWithoutScev)
}

fn is_invariant(ir: &MethodIr, info: &LoopInfo, v: OpndId) -> bool {
    ir.opnd(v).def.map_or(true, |d| !info.contains(ir.inst(d).block))
}

/// Split an address into base and index.
fn access(
    ir: &MethodIr,
    info: &LoopInfo,
    se: &mut ScalarEvolution<'_>,
    addr: OpndId,
    elem_ty: TypeId,
    is_write: bool,
) -> MemAccess {
    let mut m = MemAccess {
        base: None,
        field: None,
        index: None,
        opaque: None,
        elem_ty,
        is_write,
        invariant_base: true,
    };
    let def = ir.def_of(addr);
    match def.map(|d| (d.opcode, d)) {
        Some((Opcode::LdElemAddr, d)) => {
            m.base = Some(d.src(0));
            m.index = se.analyze(d.src(1), info.lp);
        }
        Some((Opcode::AddScaledIndex, d)) => {
            let ptr = d.src(0);
            m.base = match ir.def_of(ptr) {
                Some(p) if p.opcode == Opcode::LdArrayBaseAddr => Some(p.src(0)),
                _ => Some(ptr),
            };
            m.index = se.analyze(d.src(1), info.lp);
        }
        Some((Opcode::LdFieldAddr, d)) => {
            m.base = Some(d.src(0));
            if let Payload::Field(f) = d.payload {
                m.field = Some(f);
            }
        }
        Some((Opcode::LdStaticAddr, d)) => {
            if let Payload::Field(f) = d.payload {
                m.field = Some(f);
            }
        }
        _ => {
            m.opaque = Some(addr);
            m.invariant_base = is_invariant(ir, info, addr);
            return m;
        }
    }
    if m.field.is_none() && m.base.is_none() {
        m.opaque = Some(addr);
    }
    if let Some(b) = m.base {
        m.invariant_base = is_invariant(ir, info, b);
    }
    m
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::cfg::DominatorTree;
    use crate::ir::opcode::CmpMod;
    use crate::ir::types::TypeManager;

    /// `for i in 0..n { body(b, i) }` over int32 arrays `a` and `b`.
    fn array_loop(emit_body: impl FnOnce(&mut IrBuilder<'_>, [OpndId; 3])) -> MethodIr {
        let mut tm = TypeManager::new();
        let i32_ = tm.int32();
        let arr = tm.array_of(i32_);
        let void = tm.void();
        let mut ir = MethodIr::new("loop", tm, void);
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(arr, 0);
        let bb = b.def_arg(arr, 1);
        let n = b.def_arg(i32_, 2);
        let zero = b.i32(0);
        let one = b.i32(1);
        let (h, body, x) = (b.new_block(), b.new_block(), b.new_block());
        b.jump(h);
        b.switch_to(h);
        let i = b.phi(i32_, &[zero]);
        b.branch(CmpMod::Lt, i, Some(n), body, x, 0.9);
        b.switch_to(body);
        emit_body(&mut b, [a, bb, i]);
        let next = b.add(i, one);
        b.jump(h);
        b.switch_to(x);
        b.ret(None);
        let phi = ir.opnd(i).def.unwrap();
        ir.inst_mut(phi).srcs.push(next);
        ir
    }

    fn load(b: &mut IrBuilder<'_>, arr: OpndId, idx: OpndId) -> OpndId {
        let ty = b.ir().types.int32();
        let safe = b.tau_safe();
        let addr = b.ld_elem_addr(arr, idx);
        b.ld_ind(ty, addr, safe, safe)
    }

    fn store(b: &mut IrBuilder<'_>, arr: OpndId, idx: OpndId, v: OpndId) {
        let safe = b.tau_safe();
        let addr = b.ld_elem_addr(arr, idx);
        b.st_ind(v, addr, safe, safe);
    }

    fn ddg_of(ir: &MethodIr) -> Ddg {
        let dom = DominatorTree::compute(ir);
        let loops = LoopTree::compute(ir, &dom);
        let lp = loops.innermost_loops().next().unwrap();
        let info = LoopInfo::analyze(ir, &loops, lp).unwrap();
        let mut se = ScalarEvolution::new(ir, &loops);
        Ddg::compute_ddg_for(ir, &loops, &info, &mut se).unwrap()
    }

    fn memory_edges(ddg: &Ddg) -> Vec<&DdgEdge> {
        ddg.edges().map(|(_, e)| e).filter(|e| e.kind != DepKind::Scalar).collect()
    }

    #[test]
    fn test_store_then_load_of_previous_element() {
        // a[i] = 7; t = a[i - 1]
        let ir = array_loop(|b, [a, _, i]| {
            let seven = b.i32(7);
            store(b, a, i, seven);
            let one = b.i32(1);
            let prev = b.sub(i, one);
            load(b, a, prev);
        });
        let ddg = ddg_of(&ir);
        let mem = memory_edges(&ddg);
        assert_eq!(mem.len(), 1);
        let e = mem[0];
        assert_eq!(e.kind, DepKind::Flow);
        assert!(ddg.node(e.from).is_store());
        assert_eq!(e.directions.as_slice(), &[Direction::Gt]);
        assert_eq!(e.reversed_directions().as_slice(), &[Direction::Lt]);
        assert_eq!(e.distance, Some(1));
        assert!(!e.needs_alias_test);
    }

    #[test]
    fn test_load_then_store_same_element() {
        // a[i] = a[i] + 1
        let ir = array_loop(|b, [a, _, i]| {
            let v = load(b, a, i);
            let one = b.i32(1);
            let w = b.add(v, one);
            store(b, a, i, w);
        });
        let ddg = ddg_of(&ir);
        let mem = memory_edges(&ddg);
        assert_eq!(mem.len(), 1);
        assert_eq!(mem[0].kind, DepKind::Anti);
        assert_eq!(mem[0].inner_direction(), Direction::Eq);
    }

    #[test]
    fn test_distinct_bases_need_alias_test() {
        // b[i + 1] = a[i] + 1
        let ir = array_loop(|b, [a, bb, i]| {
            let v = load(b, a, i);
            let one = b.i32(1);
            let w = b.add(v, one);
            let j = b.add(i, one);
            store(b, bb, j, w);
        });
        let ddg = ddg_of(&ir);
        let mem = memory_edges(&ddg);
        assert_eq!(mem.len(), 1);
        let e = mem[0];
        assert!(e.needs_alias_test);
        assert!(ddg.node(e.from).is_store());
        assert_eq!(e.kind, DepKind::Flow);
        assert_eq!(e.distance, Some(1));
    }

    #[test]
    fn test_gcd_proves_independence() {
        // a[2i] = a[2i + 1]
        let ir = array_loop(|b, [a, _, i]| {
            let one = b.i32(1);
            let two = b.i32(2);
            let even = b.mul(i, two);
            let odd = b.add(even, one);
            let v = load(b, a, odd);
            store(b, a, even, v);
        });
        assert!(memory_edges(&ddg_of(&ir)).is_empty());
    }

    #[test]
    fn test_invariant_location_depends_both_ways() {
        // a[0] = a[0] + i
        let ir = array_loop(|b, [a, _, i]| {
            let zero = b.i32(0);
            let v = load(b, a, zero);
            let w = b.add(v, i);
            store(b, a, zero, w);
        });
        let ddg = ddg_of(&ir);
        let mem = memory_edges(&ddg);
        assert_eq!(mem.len(), 2);
        let dirs: Vec<Direction> = mem.iter().map(|e| e.inner_direction()).collect();
        assert!(dirs.contains(&Direction::Ge) && dirs.contains(&Direction::Gt));
    }

    #[test]
    fn test_reads_never_depend() {
        let ir = array_loop(|b, [a, _, i]| {
            load(b, a, i);
            load(b, a, i);
        });
        assert!(memory_edges(&ddg_of(&ir)).is_empty());
    }

    #[test]
    fn test_induction_update_carries_self_edge() {
        let ir = array_loop(|_, _| {});
        let ddg = ddg_of(&ir);
        assert_eq!(ddg.len(), 1);
        let (_, e) = ddg.edges().next().unwrap();
        assert_eq!(e.from, e.to);
        assert_eq!(e.inner_direction(), Direction::Gt);
        let (_, n) = ddg.nodes().next().unwrap();
        assert!(matches!(n.kind, NodeKind::ScalarWithScev(_)));
    }

    #[test]
    fn test_call_gives_up() {
        let ir = array_loop(|b, _| {
            let i32_ = b.ir().types.int32();
            let m = b.ir().types.define_method("callee", None, Vec::new(), i32_, true);
            b.call(m, &[], &[]);
        });
        let dom = DominatorTree::compute(&ir);
        let loops = LoopTree::compute(&ir, &dom);
        let lp = loops.innermost_loops().next().unwrap();
        let info = LoopInfo::analyze(&ir, &loops, lp).unwrap();
        let mut se = ScalarEvolution::new(&ir, &loops);
        let err = Ddg::compute_ddg_for(&ir, &loops, &info, &mut se).unwrap_err();
        assert!(!err.is_internal());
    }
}
