//! Method IR: instruction lists in basic blocks over an explicit CFG.
//!
//! # Structure
//!
//! ```text
//!   MethodIr
//!   ├── blocks  Arena<Block>   (Block | Dispatch | Exit)
//!   ├── edges   Arena<Edge>    (kind + probability)
//!   ├── insts   Arena<Inst>    (linked into block lists)
//!   ├── opnds   Arena<Opnd>    (temps, vars, SSA var versions)
//!   └── types   TypeManager
//! ```
//!
//! Phi sources are positional: source `i` of a phi flows in along
//! `in_edges[i]` of its block. Every edge mutation below keeps that
//! correspondence.

use super::arena::{Arena, BitSet, Id};
use super::inst::{Inst, InstId, Opnd, OpndId, OpndKind, Payload};
use super::opcode::{Modifier, Opcode};
use super::types::{TypeId, TypeManager};
use kiln_core::{CompileError, CompileResult, Location};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;

pub type BlockId = Id<Block>;
pub type EdgeId = Id<Edge>;

// =============================================================================
// Blocks and Edges
// =============================================================================

/// Kind of CFG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// Straight-line code.
    Block,
    /// Exception dispatch point; holds no code.
    Dispatch,
    /// The unique method exit.
    Exit,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    pub insts: Vec<InstId>,
    pub in_edges: SmallVec<[EdgeId; 2]>,
    pub out_edges: SmallVec<[EdgeId; 2]>,
    /// Profile execution count, 0 without a profile.
    pub exec_count: f64,
}

/// Kind of CFG edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EdgeKind {
    Unconditional,
    /// Taken when the block's branch condition holds.
    True,
    /// Taken when the block's branch condition fails.
    False,
    /// One case of a `Switch`.
    Switch,
    /// To an exception dispatch node.
    Dispatch,
    /// From a dispatch node into a handler.
    Catch { priority: u32, exception: TypeId },
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub source: BlockId,
    pub target: BlockId,
    pub kind: EdgeKind,
    /// Probability of leaving `source` along this edge.
    pub prob: f64,
}

// =============================================================================
// Method IR
// =============================================================================

/// The IR of one method under compilation.
#[derive(Debug, Clone)]
pub struct MethodIr {
    pub name: String,
    pub types: TypeManager,
    pub ret_type: TypeId,
    pub entry: BlockId,
    pub exit: BlockId,
    /// Dispatch node receiving exceptions that leave the method.
    pub unwind: Option<BlockId>,
    /// Whether block counts and edge probabilities come from a profile.
    pub has_profile: bool,
    blocks: Arena<Block>,
    edges: Arena<Edge>,
    insts: Arena<Inst>,
    opnds: Arena<Opnd>,
}

impl MethodIr {
    /// Create a method with an empty entry block and the exit node.
    pub fn new(name: &str, types: TypeManager, ret_type: TypeId) -> Self {
        let mut ir = MethodIr {
            name: name.to_string(),
            types,
            ret_type,
            entry: BlockId::INVALID,
            exit: BlockId::INVALID,
            unwind: None,
            has_profile: false,
            blocks: Arena::new(),
            edges: Arena::new(),
            insts: Arena::new(),
            opnds: Arena::new(),
        };
        ir.entry = ir.new_block();
        ir.exit = ir.alloc_block(BlockKind::Exit);
        ir
    }

    fn alloc_block(&mut self, kind: BlockKind) -> BlockId {
        self.blocks.alloc(Block {
            kind,
            insts: Vec::new(),
            in_edges: SmallVec::new(),
            out_edges: SmallVec::new(),
            exec_count: 0.0,
        })
    }

    pub fn new_block(&mut self) -> BlockId {
        self.alloc_block(BlockKind::Block)
    }

    pub fn new_dispatch(&mut self) -> BlockId {
        self.alloc_block(BlockKind::Dispatch)
    }

    /// The method-level unwind node, created on first request.
    pub fn unwind_node(&mut self) -> BlockId {
        if let Some(u) = self.unwind {
            return u;
        }
        let u = self.new_dispatch();
        self.add_edge(u, self.exit, EdgeKind::Unconditional, 1.0);
        self.unwind = Some(u);
        u
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id]
    }

    #[inline]
    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id]
    }

    #[inline]
    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        &mut self.edges[id]
    }

    #[inline]
    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id]
    }

    #[inline]
    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id]
    }

    #[inline]
    pub fn opnd(&self, id: OpndId) -> &Opnd {
        &self.opnds[id]
    }

    #[inline]
    pub fn opnd_ty(&self, id: OpndId) -> TypeId {
        self.opnds[id].ty
    }

    /// Defining instruction of an operand, if it is still linked.
    pub fn def_of(&self, id: OpndId) -> Option<&Inst> {
        self.opnds[id]
            .def
            .map(|d| &self.insts[d])
            .filter(|i| i.is_linked())
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        self.blocks.ids()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    pub fn num_opnds(&self) -> usize {
        self.opnds.len()
    }

    pub fn opnd_ids(&self) -> impl Iterator<Item = OpndId> {
        self.opnds.ids()
    }

    /// Linked instructions, block by block.
    pub fn linked_insts(&self) -> impl Iterator<Item = InstId> + '_ {
        self.blocks.iter().flat_map(|(_, b)| b.insts.iter().copied())
    }

    pub fn succs(&self, b: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks[b].out_edges.iter().map(|&e| self.edges[e].target)
    }

    pub fn preds(&self, b: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks[b].in_edges.iter().map(|&e| self.edges[e].source)
    }

    /// Out-edge of `b` with the given kind.
    pub fn out_edge_of_kind(&self, b: BlockId, kind: EdgeKind) -> Option<EdgeId> {
        self.blocks[b]
            .out_edges
            .iter()
            .copied()
            .find(|&e| self.edges[e].kind == kind)
    }

    /// Last instruction of `b` if it is a terminator.
    pub fn terminator(&self, b: BlockId) -> Option<InstId> {
        self.blocks[b]
            .insts
            .last()
            .copied()
            .filter(|&i| self.insts[i].opcode.is_terminator())
    }

    /// Leading phi instructions of `b`.
    pub fn phis(&self, b: BlockId) -> impl Iterator<Item = InstId> + '_ {
        self.blocks[b]
            .insts
            .iter()
            .copied()
            .take_while(|&i| self.insts[i].opcode == Opcode::Phi)
    }

    /// Position of `e` among the in-edges of its target.
    pub fn in_edge_index(&self, e: EdgeId) -> Option<usize> {
        let target = self.edges[e].target;
        self.blocks[target].in_edges.iter().position(|&x| x == e)
    }

    // -------------------------------------------------------------------------
    // Operands
    // -------------------------------------------------------------------------

    pub fn new_temp(&mut self, ty: TypeId) -> OpndId {
        self.opnds.alloc(Opnd {
            ty,
            kind: OpndKind::Temp,
            def: None,
        })
    }

    pub fn new_var(&mut self, ty: TypeId) -> OpndId {
        self.opnds.alloc(Opnd {
            ty,
            kind: OpndKind::Var,
            def: None,
        })
    }

    /// A fresh SSA version of `var`.
    pub fn new_ssa_var(&mut self, var: OpndId) -> OpndId {
        let ty = self.opnds[var].ty;
        self.opnds.alloc(Opnd {
            ty,
            kind: OpndKind::SsaVar { var },
            def: None,
        })
    }

    /// Change the storage class of an operand in place.
    pub fn set_opnd_kind(&mut self, id: OpndId, kind: OpndKind) {
        self.opnds[id].kind = kind;
    }

    // -------------------------------------------------------------------------
    // Instructions
    // -------------------------------------------------------------------------

    /// Create an unlinked instruction. Its destination records it as definer.
    pub fn create_inst(
        &mut self,
        opcode: Opcode,
        modifier: Modifier,
        ty: TypeId,
        dst: Option<OpndId>,
        srcs: &[OpndId],
        payload: Payload,
    ) -> InstId {
        let id = self.insts.alloc(Inst {
            opcode,
            modifier,
            ty,
            dst,
            srcs: SmallVec::from_slice(srcs),
            payload,
            block: BlockId::INVALID,
            bc_offset: None,
        });
        if let Some(d) = dst {
            self.opnds[d].def = Some(id);
        }
        id
    }

    /// Duplicate an instruction with new operands. The copy is unlinked.
    pub fn clone_inst(&mut self, inst: InstId, dst: Option<OpndId>, srcs: &[OpndId]) -> InstId {
        let src = &self.insts[inst];
        let (opcode, modifier, ty, payload, bc) =
            (src.opcode, src.modifier, src.ty, src.payload.clone(), src.bc_offset);
        let id = self.create_inst(opcode, modifier, ty, dst, srcs, payload);
        self.insts[id].bc_offset = bc;
        id
    }

    pub fn append_inst(&mut self, block: BlockId, inst: InstId) {
        self.insts[inst].block = block;
        self.blocks[block].insts.push(inst);
    }

    /// Append before the block's terminator, if it has one.
    pub fn append_before_terminator(&mut self, block: BlockId, inst: InstId) {
        let pos = match self.terminator(block) {
            Some(_) => self.blocks[block].insts.len() - 1,
            None => self.blocks[block].insts.len(),
        };
        self.insert_at(block, pos, inst);
    }

    /// Insert after the block's leading phis.
    pub fn insert_after_phis(&mut self, block: BlockId, inst: InstId) {
        let pos = self.phis(block).count();
        self.insert_at(block, pos, inst);
    }

    pub fn insert_at(&mut self, block: BlockId, pos: usize, inst: InstId) {
        self.insts[inst].block = block;
        self.blocks[block].insts.insert(pos, inst);
    }

    fn position(&self, inst: InstId) -> Option<(BlockId, usize)> {
        let block = self.insts[inst].block;
        if !block.is_valid() {
            return None;
        }
        self.blocks[block]
            .insts
            .iter()
            .position(|&i| i == inst)
            .map(|p| (block, p))
    }

    pub fn insert_before(&mut self, anchor: InstId, inst: InstId) {
        if let Some((b, p)) = self.position(anchor) {
            self.insert_at(b, p, inst);
        }
    }

    pub fn insert_after(&mut self, anchor: InstId, inst: InstId) {
        if let Some((b, p)) = self.position(anchor) {
            self.insert_at(b, p + 1, inst);
        }
    }

    /// Remove an instruction from its block. The arena slot remains.
    pub fn unlink(&mut self, inst: InstId) {
        if let Some((b, p)) = self.position(inst) {
            self.blocks[b].insts.remove(p);
        }
        self.insts[inst].block = BlockId::INVALID;
    }

    /// Replace source `old` with `new` in every linked instruction.
    pub fn replace_uses(&mut self, old: OpndId, new: OpndId) {
        let ids: Vec<InstId> = self.linked_insts().collect();
        for i in ids {
            for s in self.insts[i].srcs.iter_mut() {
                if *s == old {
                    *s = new;
                }
            }
        }
    }

    /// Users of every operand, over linked instructions.
    pub fn compute_uses(&self) -> FxHashMap<OpndId, SmallVec<[InstId; 4]>> {
        let mut uses: FxHashMap<OpndId, SmallVec<[InstId; 4]>> = FxHashMap::default();
        for i in self.linked_insts() {
            for &s in &self.insts[i].srcs {
                let list = uses.entry(s).or_default();
                if !list.contains(&i) {
                    list.push(i);
                }
            }
        }
        uses
    }

    // -------------------------------------------------------------------------
    // Edges
    // -------------------------------------------------------------------------

    pub fn add_edge(&mut self, source: BlockId, target: BlockId, kind: EdgeKind, prob: f64) -> EdgeId {
        let e = self.edges.alloc(Edge {
            source,
            target,
            kind,
            prob,
        });
        self.blocks[source].out_edges.push(e);
        self.blocks[target].in_edges.push(e);
        e
    }

    /// Drop phi source `index` in every phi of `block`.
    fn remove_phi_sources(&mut self, block: BlockId, index: usize) {
        let phis: SmallVec<[InstId; 8]> = self.phis(block).collect();
        for phi in phis {
            if index < self.insts[phi].srcs.len() {
                self.insts[phi].srcs.remove(index);
            }
        }
    }

    /// Detach `e` from both endpoints, dropping its phi sources at the target.
    pub fn remove_edge(&mut self, e: EdgeId) {
        let Edge { source, target, .. } = self.edges[e];
        if let Some(pos) = self.in_edge_index(e) {
            self.blocks[target].in_edges.remove(pos);
            self.remove_phi_sources(target, pos);
        }
        self.blocks[source].out_edges.retain(|x| *x != e);
    }

    /// Point `e` at a new target. Phi sources at the old target are dropped;
    /// the caller supplies sources for phis at the new target.
    pub fn retarget_edge(&mut self, e: EdgeId, new_target: BlockId) {
        let old = self.edges[e].target;
        if let Some(pos) = self.in_edge_index(e) {
            self.blocks[old].in_edges.remove(pos);
            self.remove_phi_sources(old, pos);
        }
        self.edges[e].target = new_target;
        self.blocks[new_target].in_edges.push(e);
    }

    /// Move the tail of `e` to another block, keeping its target position.
    pub fn move_edge_source(&mut self, e: EdgeId, new_source: BlockId) {
        let old = self.edges[e].source;
        self.blocks[old].out_edges.retain(|x| *x != e);
        self.edges[e].source = new_source;
        self.blocks[new_source].out_edges.push(e);
    }

    /// Insert an empty block on `e`.
    ///
    /// `e` keeps its kind and now ends at the new block; a fresh
    /// unconditional edge takes its slot among the old target's in-edges, so
    /// phis there are unaffected.
    pub fn split_edge(&mut self, e: EdgeId) -> BlockId {
        let target = self.edges[e].target;
        let pos = self.in_edge_index(e);
        let mid = self.new_block();
        self.blocks[mid].exec_count = self.blocks[self.edges[e].source].exec_count * self.edges[e].prob.max(0.0);
        let link = self.edges.alloc(Edge {
            source: mid,
            target,
            kind: EdgeKind::Unconditional,
            prob: 1.0,
        });
        self.blocks[mid].out_edges.push(link);
        match pos {
            Some(p) => self.blocks[target].in_edges[p] = link,
            None => self.blocks[target].in_edges.push(link),
        }
        self.edges[e].target = mid;
        self.blocks[mid].in_edges.push(e);
        mid
    }

    // -------------------------------------------------------------------------
    // Traversal
    // -------------------------------------------------------------------------

    /// Blocks reachable from the entry, in postorder.
    pub fn postorder(&self) -> Vec<BlockId> {
        let mut visited = BitSet::with_capacity(self.blocks.len());
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited.insert(self.entry.as_usize());
        while let Some(&mut (b, ref mut next)) = stack.last_mut() {
            let outs = &self.blocks[b].out_edges;
            if *next < outs.len() {
                let succ = self.edges[outs[*next]].target;
                *next += 1;
                if visited.insert(succ.as_usize()) {
                    stack.push((succ, 0));
                }
            } else {
                order.push(b);
                stack.pop();
            }
        }
        order
    }

    /// Blocks reachable from the entry, in reverse postorder.
    pub fn rpo(&self) -> Vec<BlockId> {
        let mut order = self.postorder();
        order.reverse();
        order
    }

    // -------------------------------------------------------------------------
    // Method-wide singletons
    // -------------------------------------------------------------------------

    /// The `TauSafe` sentinel, found or created right after the entry
    /// block's leading argument definitions.
    pub fn find_or_create_tau_safe(&mut self) -> OpndId {
        let entry = self.entry;
        let mut pos = 0;
        for (i, &inst) in self.blocks[entry].insts.iter().enumerate() {
            match self.insts[inst].opcode {
                Opcode::TauSafe => {
                    if let Some(d) = self.insts[inst].dst {
                        return d;
                    }
                }
                Opcode::DefArg => pos = i + 1,
                _ => {}
            }
        }
        let tau = self.types.tau();
        let dst = self.new_temp(tau);
        let inst = self.create_inst(Opcode::TauSafe, Modifier::NONE, tau, Some(dst), &[], Payload::None);
        self.insert_at(entry, pos, inst);
        dst
    }

    // -------------------------------------------------------------------------
    // Consistency
    // -------------------------------------------------------------------------

    /// Check structural invariants: phi arity, edge symmetry, terminators.
    pub fn verify(&self) -> CompileResult<()> {
        const PASS: &str = "verify";
        for (b, block) in self.blocks.iter() {
            for &e in &block.out_edges {
                if self.edges[e].source != b || !self.blocks[self.edges[e].target].in_edges.contains(&e) {
                    return Err(CompileError::internal(PASS, Location::Block(b.index()), "dangling out-edge"));
                }
            }
            for (pos, &i) in block.insts.iter().enumerate() {
                let inst = &self.insts[i];
                if inst.block != b {
                    return Err(CompileError::internal(PASS, Location::Inst(i.index()), "wrong block link"));
                }
                if inst.opcode == Opcode::Phi && inst.srcs.len() != block.in_edges.len() {
                    return Err(CompileError::internal(
                        PASS,
                        Location::Inst(i.index()),
                        format!("phi has {} sources, block has {} preds", inst.srcs.len(), block.in_edges.len()),
                    ));
                }
                if inst.opcode.is_terminator() && pos + 1 != block.insts.len() {
                    return Err(CompileError::internal(PASS, Location::Inst(i.index()), "terminator not last"));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Dump
// =============================================================================

impl fmt::Display for MethodIr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "method {}:", self.name)?;
        for b in self.rpo() {
            let block = &self.blocks[b];
            write!(f, "  B{} ({:?})", b.index(), block.kind)?;
            let preds: Vec<String> = self.preds(b).map(|p| format!("B{}", p.index())).collect();
            if !preds.is_empty() {
                write!(f, " <- {}", preds.join(", "))?;
            }
            writeln!(f)?;
            for &i in &block.insts {
                let inst = &self.insts[i];
                write!(f, "    ")?;
                if let Some(d) = inst.dst {
                    write!(f, "t{} = ", d.index())?;
                }
                write!(f, "{}", inst.opcode.name())?;
                if let Some(c) = inst.modifier.cmp {
                    write!(f, ".{c:?}")?;
                }
                for s in &inst.srcs {
                    write!(f, " t{}", s.index())?;
                }
                match &inst.payload {
                    Payload::None => {}
                    Payload::Const(c) => write!(f, " {c:?}")?,
                    Payload::Type(t) => write!(f, " :{}", self.types.name(*t))?,
                    other => write!(f, " {other:?}")?,
                }
                writeln!(f)?;
            }
            for &e in &block.out_edges {
                let edge = &self.edges[e];
                writeln!(f, "    -> B{} {:?} p={:.2}", edge.target.index(), edge.kind, edge.prob)?;
            }
        }
        Ok(())
    }
}
