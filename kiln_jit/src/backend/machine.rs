//! Machine-level control flow graph.
//!
//! The backend's view of a method after instruction selection: nodes hold
//! machine instructions over virtual or physical registers, edges keep the
//! HIR edge kinds and probabilities. Block layout threads the nodes into a
//! single chain through [`CgNode::layout_succ`].
//!
//! A conditional branch is two instructions: a compare that writes a
//! predicate pair and a branch guarded by the first predicate. The branch
//! target is implicit in the node's true edge, so inverting a branch is a
//! swap of the compare's two predicate results plus a swap of the edge kinds.

use super::ipf::registers::Reg;
use crate::codegen::callback::{EdgeTag, NodeKind};
use crate::ir::arena::{Arena, Id};
use crate::ir::inst::VmHelper;
use crate::ir::types::{FieldId, MethodId, TypeId};
use bitflags::bitflags;
use smallvec::SmallVec;
use std::fmt;

pub type NodeId = Id<CgNode>;
pub type MEdgeId = Id<MEdge>;

// =============================================================================
// Instructions
// =============================================================================

/// Compare relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpRel {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Ltu,
    Leu,
    Gtu,
    Geu,
}

impl CmpRel {
    fn suffix(self) -> &'static str {
        match self {
            CmpRel::Eq => "eq",
            CmpRel::Ne => "ne",
            CmpRel::Lt => "lt",
            CmpRel::Le => "le",
            CmpRel::Gt => "gt",
            CmpRel::Ge => "ge",
            CmpRel::Ltu => "ltu",
            CmpRel::Leu => "leu",
            CmpRel::Gtu => "gtu",
            CmpRel::Geu => "geu",
        }
    }
}

/// Runtime entry points reached with `br.call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeFn {
    Div,
    Rem,
    UDiv,
    URem,
    FDiv,
    FRem,
    NewObj,
    NewArray,
    MonitorEnter,
    MonitorExit,
    Throw,
    ThrowNull,
    ThrowBounds,
    ThrowDivZero,
    CheckCast,
    AsType,
    InstanceOf,
}

/// Link-time symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    Method(MethodId),
    Helper(VmHelper),
    Runtime(RuntimeFn),
    Static(FieldId),
    Type(TypeId),
    /// String literal table entry.
    Str(u32),
    /// Base of the compressed heap.
    HeapBase,
}

/// A machine operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    FImm(f64),
    /// `[reg]`
    Mem(Reg),
    Sym(Symbol),
    Node(NodeId),
    /// The whole predicate file, `pr`.
    Preds,
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Self {
        Operand::Reg(r)
    }
}

/// Machine opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mnemonic {
    Add,
    Adds,
    Sub,
    Shladd,
    And,
    Andcm,
    Or,
    Xor,
    Shl,
    Shr,
    ShrU,
    /// Sign extend from `n` bytes.
    Sxt(u8),
    /// Zero extend from `n` bytes.
    Zxt(u8),
    Mov,
    Movl,
    Alloc,
    /// Integer compare of `width` bytes into a predicate pair.
    Cmp { rel: CmpRel, width: u8 },
    Fcmp(CmpRel),
    Ld(u8),
    St(u8),
    Ldf(u8),
    Stf(u8),
    /// Move a general register into the significand of a float register.
    Setf,
    Getf,
    /// Integer multiply-add in the float unit, low half.
    XmaL,
    /// High half, signed or unsigned.
    XmaH { unsigned: bool },
    Fadd,
    Fsub,
    Fmpy,
    Fneg,
    Fabs,
    Fmin,
    Fmax,
    /// Int to float.
    FcvtXf,
    /// Float to int, truncating.
    FcvtFx,
    /// Float precision change.
    Fnorm,
    Padd(u8),
    Psub(u8),
    Pmpy(u8),
    Pmin(u8),
    Pmax(u8),
    Pack,
    Extr,
    Br,
    BrCond,
    BrCall,
    BrRet,
    BrTable,
    Nop,
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Mnemonic::Add => write!(f, "add"),
            Mnemonic::Adds => write!(f, "adds"),
            Mnemonic::Sub => write!(f, "sub"),
            Mnemonic::Shladd => write!(f, "shladd"),
            Mnemonic::And => write!(f, "and"),
            Mnemonic::Andcm => write!(f, "andcm"),
            Mnemonic::Or => write!(f, "or"),
            Mnemonic::Xor => write!(f, "xor"),
            Mnemonic::Shl => write!(f, "shl"),
            Mnemonic::Shr => write!(f, "shr"),
            Mnemonic::ShrU => write!(f, "shr.u"),
            Mnemonic::Sxt(n) => write!(f, "sxt{n}"),
            Mnemonic::Zxt(n) => write!(f, "zxt{n}"),
            Mnemonic::Mov => write!(f, "mov"),
            Mnemonic::Movl => write!(f, "movl"),
            Mnemonic::Alloc => write!(f, "alloc"),
            Mnemonic::Cmp { rel, width: 4 } => write!(f, "cmp4.{}", rel.suffix()),
            Mnemonic::Cmp { rel, .. } => write!(f, "cmp.{}", rel.suffix()),
            Mnemonic::Fcmp(rel) => write!(f, "fcmp.{}", rel.suffix()),
            Mnemonic::Ld(n) => write!(f, "ld{n}"),
            Mnemonic::St(n) => write!(f, "st{n}"),
            Mnemonic::Ldf(16) => write!(f, "ldf"),
            Mnemonic::Stf(16) => write!(f, "stf"),
            Mnemonic::Ldf(n) => write!(f, "ldf{}", if n == 4 { "s" } else { "d" }),
            Mnemonic::Stf(n) => write!(f, "stf{}", if n == 4 { "s" } else { "d" }),
            Mnemonic::Setf => write!(f, "setf.sig"),
            Mnemonic::Getf => write!(f, "getf.sig"),
            Mnemonic::XmaL => write!(f, "xma.l"),
            Mnemonic::XmaH { unsigned: false } => write!(f, "xma.h"),
            Mnemonic::XmaH { unsigned: true } => write!(f, "xma.hu"),
            Mnemonic::Fadd => write!(f, "fadd"),
            Mnemonic::Fsub => write!(f, "fsub"),
            Mnemonic::Fmpy => write!(f, "fmpy"),
            Mnemonic::Fneg => write!(f, "fneg"),
            Mnemonic::Fabs => write!(f, "fabs"),
            Mnemonic::Fmin => write!(f, "fmin"),
            Mnemonic::Fmax => write!(f, "fmax"),
            Mnemonic::FcvtXf => write!(f, "fcvt.xf"),
            Mnemonic::FcvtFx => write!(f, "fcvt.fx.trunc"),
            Mnemonic::Fnorm => write!(f, "fnorm"),
            Mnemonic::Padd(n) => write!(f, "padd{n}"),
            Mnemonic::Psub(n) => write!(f, "psub{n}"),
            Mnemonic::Pmpy(n) => write!(f, "pmpy{n}"),
            Mnemonic::Pmin(n) => write!(f, "pmin{n}"),
            Mnemonic::Pmax(n) => write!(f, "pmax{n}"),
            Mnemonic::Pack => write!(f, "pack"),
            Mnemonic::Extr => write!(f, "extr"),
            Mnemonic::Br => write!(f, "br"),
            Mnemonic::BrCond => write!(f, "br.cond"),
            Mnemonic::BrCall => write!(f, "br.call"),
            Mnemonic::BrRet => write!(f, "br.ret"),
            Mnemonic::BrTable => write!(f, "br.table"),
            Mnemonic::Nop => write!(f, "nop"),
        }
    }
}

bitflags! {
    /// Machine instruction attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MFlags: u8 {
        /// Trap on signed overflow.
        const OVF_SIGNED = 1 << 0;
        /// Trap on unsigned overflow.
        const OVF_UNSIGNED = 1 << 1;
        /// NaT-preserving spill or fill.
        const SPILL = 1 << 2;
        /// Operates on a compressed reference.
        const COMPRESSED = 1 << 3;
        /// Emitted by the prolog.
        const PROLOG = 1 << 4;
        /// Emitted by an epilog.
        const EPILOG = 1 << 5;
    }
}

/// A machine instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct MInst {
    pub op: Mnemonic,
    /// Qualifying predicate; `p0` always executes.
    pub qp: Reg,
    pub dsts: SmallVec<[Operand; 2]>,
    pub srcs: SmallVec<[Operand; 4]>,
    pub flags: MFlags,
    pub bc_offset: Option<u32>,
}

impl MInst {
    pub fn new(op: Mnemonic, dsts: &[Operand], srcs: &[Operand]) -> Self {
        MInst {
            op,
            qp: Reg::P0,
            dsts: SmallVec::from_slice(dsts),
            srcs: SmallVec::from_slice(srcs),
            flags: MFlags::empty(),
            bc_offset: None,
        }
    }

    pub fn with_qp(mut self, qp: Reg) -> Self {
        self.qp = qp;
        self
    }

    pub fn with_flags(mut self, flags: MFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Unconditional jump along the node's unconditional edge.
    pub fn jump() -> Self {
        MInst::new(Mnemonic::Br, &[], &[])
    }

    /// Control never falls out of the node after this instruction.
    pub fn ends_flow(&self) -> bool {
        self.qp == Reg::P0 && matches!(self.op, Mnemonic::Br | Mnemonic::BrRet | Mnemonic::BrTable)
    }

    /// Every register operand, qualifying predicate included.
    pub fn regs(&self) -> impl Iterator<Item = Reg> + '_ {
        std::iter::once(self.qp)
            .chain(self.dsts.iter().chain(self.srcs.iter()).filter_map(|o| match *o {
                Operand::Reg(r) | Operand::Mem(r) => Some(r),
                _ => None,
            }))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Imm(i) => write!(f, "{i}"),
            Operand::FImm(x) => write!(f, "{x}"),
            Operand::Mem(r) => write!(f, "[{r}]"),
            Operand::Sym(s) => write!(f, "@{s:?}"),
            Operand::Node(n) => write!(f, "L{}", n.index()),
            Operand::Preds => write!(f, "pr"),
        }
    }
}

impl fmt::Display for MInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.qp != Reg::P0 {
            write!(f, "({}) ", self.qp)?;
        }
        write!(f, "{}", self.op)?;
        if self.flags.contains(MFlags::SPILL) {
            let fill = matches!(self.op, Mnemonic::Ld(_) | Mnemonic::Ldf(_));
            write!(f, "{}", if fill { ".fill" } else { ".spill" })?;
        }
        let list = |f: &mut fmt::Formatter<'_>, ops: &[Operand]| -> fmt::Result {
            for (i, o) in ops.iter().enumerate() {
                write!(f, "{}{o}", if i == 0 { " " } else { ", " })?;
            }
            Ok(())
        };
        list(f, &self.dsts[..])?;
        if !self.dsts.is_empty() && !self.srcs.is_empty() {
            write!(f, " =")?;
        }
        list(f, &self.srcs[..])
    }
}

// =============================================================================
// Graph
// =============================================================================

/// A machine CFG node.
#[derive(Debug, Clone)]
pub struct CgNode {
    pub kind: NodeKind,
    pub insts: Vec<MInst>,
    pub in_edges: SmallVec<[MEdgeId; 2]>,
    pub out_edges: SmallVec<[MEdgeId; 2]>,
    pub exec_count: f64,
    /// Next node in the final code order.
    pub layout_succ: Option<NodeId>,
    /// Byte offset within the method, once laid out.
    pub code_offset: Option<u32>,
    pub code_size: u32,
    /// HIR block this node was selected from, or the id of the node it was
    /// split off for synthesized blocks.
    pub persistent_id: u32,
}

impl CgNode {
    /// Nodes that never hold code.
    pub fn is_codeless(&self) -> bool {
        matches!(self.kind, NodeKind::Exit | NodeKind::Unwind | NodeKind::Dispatch)
    }
}

/// A machine CFG edge.
#[derive(Debug, Clone)]
pub struct MEdge {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeTag,
    /// Taken probability, negative when unknown.
    pub prob: f64,
}

/// Machine CFG of one method.
#[derive(Debug, Clone)]
pub struct MachineCfg {
    pub name: String,
    nodes: Arena<CgNode>,
    edges: Arena<MEdge>,
    pub entry: NodeId,
    pub exit: Option<NodeId>,
    pub has_profile: bool,
    /// Integer plus float arguments the method receives.
    pub num_args: u8,
    /// Arguments of the widest call made.
    pub max_out_args: u8,
    pub spill_slots: u32,
}

impl MachineCfg {
    /// Bytes per instruction bundle.
    pub const BUNDLE_SIZE: u32 = 16;
    pub const SLOTS_PER_BUNDLE: u32 = 3;

    pub fn new(name: impl Into<String>) -> Self {
        MachineCfg {
            name: name.into(),
            nodes: Arena::new(),
            edges: Arena::new(),
            entry: NodeId::INVALID,
            exit: None,
            has_profile: false,
            num_args: 0,
            max_out_args: 0,
            spill_slots: 0,
        }
    }

    pub fn add_node(&mut self, kind: NodeKind, persistent_id: u32, exec_count: f64) -> NodeId {
        let id = self.nodes.alloc(CgNode {
            kind,
            insts: Vec::new(),
            in_edges: SmallVec::new(),
            out_edges: SmallVec::new(),
            exec_count,
            layout_succ: None,
            code_offset: None,
            code_size: 0,
            persistent_id,
        });
        match kind {
            NodeKind::Entry => self.entry = id,
            NodeKind::Exit => self.exit = Some(id),
            _ => {}
        }
        id
    }

    pub fn add_edge(&mut self, source: NodeId, target: NodeId, kind: EdgeTag, prob: f64) -> MEdgeId {
        let id = self.edges.alloc(MEdge {
            source,
            target,
            kind,
            prob,
        });
        self.nodes[source].out_edges.push(id);
        self.nodes[target].in_edges.push(id);
        id
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &CgNode {
        &self.nodes[id]
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut CgNode {
        &mut self.nodes[id]
    }

    #[inline]
    pub fn edge(&self, id: MEdgeId) -> &MEdge {
        &self.edges[id]
    }

    #[inline]
    pub fn edge_mut(&mut self, id: MEdgeId) -> &mut MEdge {
        &mut self.edges[id]
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        self.nodes.ids()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn succs(&self, n: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[n].out_edges.iter().map(move |&e| self.edges[e].target)
    }

    pub fn preds(&self, n: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[n].in_edges.iter().map(move |&e| self.edges[e].source)
    }

    pub fn out_edge_of_kind(&self, n: NodeId, kind: EdgeTag) -> Option<MEdgeId> {
        self.nodes[n]
            .out_edges
            .iter()
            .copied()
            .find(|&e| self.edges[e].kind == kind)
    }

    /// Point `e` at `target`.
    pub fn retarget_edge(&mut self, e: MEdgeId, target: NodeId) {
        let old = self.edges[e].target;
        self.nodes[old].in_edges.retain(|x| *x != e);
        self.edges[e].target = target;
        self.nodes[target].in_edges.push(e);
    }

    /// Put a fresh empty block on `e` and return it. The new block leaves
    /// through an unconditional edge; `e` keeps its kind.
    pub fn split_edge(&mut self, e: MEdgeId) -> NodeId {
        let MEdge { source, target, prob, .. } = *self.edge(e);
        let count = self.nodes[source].exec_count * prob.max(0.0);
        let persistent_id = self.nodes[source].persistent_id;
        let mid = self.add_node(NodeKind::Block, persistent_id, count);
        self.retarget_edge(e, mid);
        self.add_edge(mid, target, EdgeTag::Unconditional, 1.0);
        mid
    }

    /// Nodes in postorder from the entry.
    pub fn postorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        if !self.entry.is_valid() {
            return order;
        }
        let mut visited = vec![false; self.nodes.len()];
        let mut stack: Vec<(NodeId, usize)> = vec![(self.entry, 0)];
        visited[self.entry.as_usize()] = true;
        while let Some(top) = stack.last_mut() {
            let (n, next) = *top;
            let out = &self.nodes[n].out_edges;
            if next < out.len() {
                let t = self.edges[out[next]].target;
                top.1 += 1;
                if !visited[t.as_usize()] {
                    visited[t.as_usize()] = true;
                    stack.push((t, 0));
                }
            } else {
                order.push(n);
                stack.pop();
            }
        }
        order
    }

    pub fn rpo(&self) -> Vec<NodeId> {
        let mut order = self.postorder();
        order.reverse();
        order
    }

    pub fn append(&mut self, n: NodeId, inst: MInst) {
        self.nodes[n].insts.push(inst);
    }

    pub fn last_inst(&self, n: NodeId) -> Option<&MInst> {
        self.nodes[n].insts.last()
    }

    /// Whether any node calls out.
    pub fn has_call(&self) -> bool {
        self.nodes
            .iter()
            .any(|(_, n)| n.insts.iter().any(|i| i.op == Mnemonic::BrCall))
    }

    /// Every register operand in the method.
    pub fn regs(&self) -> impl Iterator<Item = Reg> + '_ {
        self.nodes.iter().flat_map(|(_, n)| n.insts.iter().flat_map(|i| i.regs()))
    }

    // -------------------------------------------------------------------------
    // Branches
    // -------------------------------------------------------------------------

    /// Index of the compare feeding the node's conditional branch.
    fn branch_compare(&self, n: NodeId) -> Option<usize> {
        let insts = &self.nodes[n].insts;
        let br = insts.iter().rposition(|i| i.op == Mnemonic::BrCond)?;
        let qp = Operand::Reg(insts[br].qp);
        insts[..br].iter().rposition(|i| {
            matches!(i.op, Mnemonic::Cmp { .. } | Mnemonic::Fcmp(_)) && i.dsts.len() == 2 && i.dsts[0] == qp
        })
    }

    /// Whether the node ends in a conditional branch that can be inverted.
    pub fn can_invert(&self, n: NodeId) -> bool {
        self.branch_compare(n).is_some()
    }

    /// Negate the node's conditional branch: the compare's predicate results
    /// trade places and the true and false edges trade kinds.
    pub fn invert_branch(&mut self, n: NodeId) -> bool {
        let Some(cmp) = self.branch_compare(n) else {
            return false;
        };
        let (Some(t), Some(f)) = (
            self.out_edge_of_kind(n, EdgeTag::True),
            self.out_edge_of_kind(n, EdgeTag::False),
        ) else {
            return false;
        };
        self.nodes[n].insts[cmp].dsts.swap(0, 1);
        self.edges[t].kind = EdgeTag::False;
        self.edges[f].kind = EdgeTag::True;
        true
    }

    // -------------------------------------------------------------------------
    // Layout
    // -------------------------------------------------------------------------

    /// Nodes in code order, following `layout_succ` from the entry.
    pub fn layout_order(&self) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut seen = vec![false; self.nodes.len()];
        let mut cur = Some(self.entry).filter(|e| e.is_valid());
        while let Some(n) = cur {
            if std::mem::replace(&mut seen[n.as_usize()], true) {
                break;
            }
            order.push(n);
            cur = self.nodes[n].layout_succ;
        }
        order
    }

    /// Assign bundle-granular offsets and sizes along the layout chain.
    pub fn assign_code_offsets(&mut self) -> u32 {
        let mut offset = 0;
        for n in self.layout_order() {
            let slots = self.nodes[n].insts.len() as u32;
            let size = slots.div_ceil(Self::SLOTS_PER_BUNDLE) * Self::BUNDLE_SIZE;
            let node = &mut self.nodes[n];
            node.code_offset = Some(offset);
            node.code_size = size;
            offset += size;
        }
        offset
    }
}

impl fmt::Display for MachineCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "method {}:", self.name)?;
        let mut order = self.layout_order();
        if order.len() <= 1 {
            order = self.rpo();
        }
        for n in order {
            writeln!(f, "L{}:", n.index())?;
            for inst in &self.nodes[n].insts {
                writeln!(f, "    {inst}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr(n: u32) -> Reg {
        Reg::Virtual {
            class: super::super::ipf::registers::RegClass::Predicate,
            index: n,
        }
    }

    fn diamond() -> (MachineCfg, [NodeId; 4]) {
        let mut cfg = MachineCfg::new("d");
        let e = cfg.add_node(NodeKind::Entry, 0, 10.0);
        let t = cfg.add_node(NodeKind::Block, 1, 3.0);
        let f = cfg.add_node(NodeKind::Block, 2, 7.0);
        let x = cfg.add_node(NodeKind::Exit, 3, 10.0);
        cfg.add_edge(e, t, EdgeTag::True, 0.3);
        cfg.add_edge(e, f, EdgeTag::False, 0.7);
        cfg.add_edge(t, x, EdgeTag::Unconditional, 1.0);
        cfg.add_edge(f, x, EdgeTag::Unconditional, 1.0);
        let cmp = MInst::new(
            Mnemonic::Cmp { rel: CmpRel::Lt, width: 8 },
            &[pr(0).into(), pr(1).into()],
            &[Reg::Gr(32).into(), Reg::ZERO.into()],
        );
        cfg.append(e, cmp);
        cfg.append(e, MInst::new(Mnemonic::BrCond, &[], &[]).with_qp(pr(0)));
        (cfg, [e, t, f, x])
    }

    #[test]
    fn test_rpo_starts_at_entry() {
        let (cfg, [e, _, _, x]) = diamond();
        let rpo = cfg.rpo();
        assert_eq!(rpo.len(), 4);
        assert_eq!(rpo[0], e);
        assert_eq!(rpo[3], x);
    }

    #[test]
    fn test_invert_swaps_predicates_and_edges() {
        let (mut cfg, [e, t, f, _]) = diamond();
        assert!(cfg.can_invert(e));
        assert!(cfg.invert_branch(e));
        let cmp = &cfg.node(e).insts[0];
        assert_eq!(cmp.dsts[0], Operand::Reg(pr(1)));
        assert_eq!(cmp.dsts[1], Operand::Reg(pr(0)));
        let te = cfg.out_edge_of_kind(e, EdgeTag::True).unwrap();
        let fe = cfg.out_edge_of_kind(e, EdgeTag::False).unwrap();
        assert_eq!(cfg.edge(te).target, f);
        assert_eq!(cfg.edge(fe).target, t);
    }

    #[test]
    fn test_split_edge_inserts_block() {
        let (mut cfg, [e, t, _, _]) = diamond();
        let te = cfg.out_edge_of_kind(e, EdgeTag::True).unwrap();
        let mid = cfg.split_edge(te);
        assert_eq!(cfg.edge(te).target, mid);
        assert_eq!(cfg.edge(te).kind, EdgeTag::True);
        assert_eq!(cfg.succs(mid).collect::<Vec<_>>(), vec![t]);
        assert!((cfg.node(mid).exec_count - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_code_offsets_follow_layout() {
        let (mut cfg, [e, t, f, x]) = diamond();
        cfg.node_mut(e).layout_succ = Some(f);
        cfg.node_mut(f).layout_succ = Some(t);
        cfg.node_mut(t).layout_succ = Some(x);
        for _ in 0..4 {
            cfg.append(f, MInst::new(Mnemonic::Nop, &[], &[]));
        }
        let total = cfg.assign_code_offsets();
        assert_eq!(cfg.node(e).code_offset, Some(0));
        assert_eq!(cfg.node(f).code_offset, Some(16));
        assert_eq!(cfg.node(f).code_size, 32);
        assert_eq!(total, 48);
    }

    #[test]
    fn test_display_shows_predicates() {
        let (cfg, [e, ..]) = diamond();
        assert_eq!(cfg.node(e).insts[1].to_string(), "(%p0) br.cond");
        assert_eq!(cfg.node(e).insts[0].to_string(), "cmp.lt %p0, %p1 = r32, r0");
    }
}
