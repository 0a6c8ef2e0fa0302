//! Loop shape required by the vectorizer.
//!
//! ```text
//!        P (preheader)
//!        |
//!   +--> H [phis; branch]  ---exit--->  X
//!   |    | stay
//!   |    B1 -> B2 -> ... -> Bk (latch)
//!   +------------------------+
//! ```
//!
//! One entry edge from a preheader with no other successors, one back edge,
//! one exit edge leaving from the header's branch, and a body that is a
//! straight chain of blocks. The header holds only phis and the branch.

use crate::ir::cfg::{LoopId, LoopTree};
use crate::ir::inst::{InstId, OpndId};
use crate::ir::method::{BlockId, EdgeId, EdgeKind, MethodIr};
use crate::ir::opcode::Opcode;
use kiln_core::{unsupported, CompileResult};

const PASS: &str = "vectorize";

/// Structural facts about a vectorizable loop.
#[derive(Debug, Clone)]
pub struct LoopInfo {
    pub lp: LoopId,
    pub header: BlockId,
    pub preheader: BlockId,
    pub preheader_edge: EdgeId,
    pub latch: BlockId,
    pub latch_edge: EdgeId,
    pub exit_edge: EdgeId,
    pub exit_branch: InstId,
    /// Whether the branch's true edge stays in the loop.
    pub stay_on_true: bool,
    /// Body blocks in chain order, header excluded.
    pub body: Vec<BlockId>,
}

impl LoopInfo {
    /// Give the loop a dedicated preheader by splitting a critical entry
    /// edge. Returns whether the CFG changed.
    pub fn normalize(ir: &mut MethodIr, loops: &LoopTree, lp: LoopId) -> CompileResult<bool> {
        let l = loops.get(lp);
        let entries: Vec<EdgeId> = ir
            .block(l.header)
            .in_edges
            .iter()
            .copied()
            .filter(|&e| !l.contains(ir.edge(e).source))
            .collect();
        let [entry] = entries[..] else {
            unsupported!(PASS, "loop has {} entry edges", entries.len());
        };
        let source = ir.edge(entry).source;
        if ir.block(source).out_edges.len() == 1 && ir.terminator(source).is_none() {
            return Ok(false);
        }
        ir.split_edge(entry);
        Ok(true)
    }

    /// Check the loop shape and record its parts.
    pub fn analyze(ir: &MethodIr, loops: &LoopTree, lp: LoopId) -> CompileResult<LoopInfo> {
        let l = loops.get(lp);
        if !l.is_innermost() {
            unsupported!(PASS, "loop is not innermost");
        }
        let header = l.header;
        let [latch_edge] = l.back_edges[..] else {
            unsupported!(PASS, "loop has {} back edges", l.back_edges.len());
        };

        let mut preheader_edge = None;
        for &e in &ir.block(header).in_edges {
            if e != latch_edge {
                if preheader_edge.replace(e).is_some() {
                    unsupported!(PASS, "loop has several entry edges");
                }
            }
        }
        let Some(preheader_edge) = preheader_edge else {
            unsupported!(PASS, "loop has no entry edge");
        };
        let preheader = ir.edge(preheader_edge).source;
        if ir.block(preheader).out_edges.len() != 1 || ir.terminator(preheader).is_some() {
            unsupported!(PASS, "loop has no dedicated preheader");
        }

        let mut exits = Vec::new();
        for &b in &l.blocks {
            for &e in &ir.block(b).out_edges {
                if !l.contains(ir.edge(e).target) {
                    exits.push(e);
                }
            }
        }
        let [exit_edge] = exits[..] else {
            unsupported!(PASS, "loop has {} exit edges", exits.len());
        };
        if ir.edge(exit_edge).source != header {
            unsupported!(PASS, "loop does not exit from its header");
        }
        let Some(exit_branch) = ir.terminator(header).filter(|&t| ir.inst(t).opcode == Opcode::Branch) else {
            unsupported!(PASS, "loop header does not end in a conditional branch");
        };
        for &i in &ir.block(header).insts {
            let op = ir.inst(i).opcode;
            if op != Opcode::Phi && i != exit_branch {
                unsupported!(PASS, "loop header computes {}", op.name());
            }
        }
        let stay_on_true = match ir.edge(exit_edge).kind {
            EdgeKind::False => true,
            EdgeKind::True => false,
            _ => unsupported!(PASS, "unexpected exit edge kind"),
        };

        // Walk the body chain from the stay edge back to the header.
        let stay = ir
            .block(header)
            .out_edges
            .iter()
            .copied()
            .find(|&e| e != exit_edge);
        let Some(stay) = stay else {
            unsupported!(PASS, "loop header has no in-loop successor");
        };
        let mut body = Vec::new();
        let mut cur = ir.edge(stay).target;
        while cur != header {
            let block = ir.block(cur);
            if block.in_edges.len() != 1 || block.out_edges.len() != 1 {
                unsupported!(PASS, "loop body is not straight-line");
            }
            if body.len() >= l.blocks.len() {
                unsupported!(PASS, "loop body does not return to its header");
            }
            body.push(cur);
            cur = ir.edge(block.out_edges[0]).target;
        }
        let Some(&latch) = body.last() else {
            unsupported!(PASS, "loop has an empty body");
        };
        if ir.edge(latch_edge).source != latch || body.len() + 1 != l.blocks.len() {
            unsupported!(PASS, "loop body is not straight-line");
        }

        Ok(LoopInfo {
            lp,
            header,
            preheader,
            preheader_edge,
            latch,
            latch_edge,
            exit_edge,
            exit_branch,
            stay_on_true,
            body,
        })
    }

    /// Header and body blocks.
    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        std::iter::once(self.header).chain(self.body.iter().copied())
    }

    pub fn contains(&self, b: BlockId) -> bool {
        b == self.header || self.body.contains(&b)
    }

    pub fn header_phis(&self, ir: &MethodIr) -> Vec<InstId> {
        ir.phis(self.header).collect()
    }

    /// Source of a header phi flowing in from the preheader.
    pub fn init_src(&self, ir: &MethodIr, phi: InstId) -> Option<OpndId> {
        let k = ir.in_edge_index(self.preheader_edge)?;
        ir.inst(phi).srcs.get(k).copied()
    }

    /// Source of a header phi flowing around the back edge.
    pub fn back_src(&self, ir: &MethodIr, phi: InstId) -> Option<OpndId> {
        let k = ir.in_edge_index(self.latch_edge)?;
        ir.inst(phi).srcs.get(k).copied()
    }
}
