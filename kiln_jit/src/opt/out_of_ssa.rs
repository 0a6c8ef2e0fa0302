//! Out-of-SSA translation.
//!
//! Removes every phi so the instruction selector sees straight-line blocks
//! joined by edges:
//!
//! - A phi over temporaries gets a fresh variable. Each predecessor stores
//!   its incoming value into the variable just before leaving, and the phi
//!   becomes a load of the variable. Critical edges are split first so the
//!   store runs only on its own edge.
//! - A phi over SSA versions of a variable is dropped, and every version is
//!   renamed back to its base variable.
//!
//! Temporaries are never overwritten, so phis reading each other's results
//! in the same block need no copy ordering.

use crate::ir::inst::{InstId, OpndId, OpndKind, Payload};
use crate::ir::method::{BlockId, EdgeId, MethodIr};
use crate::ir::opcode::{Modifier, Opcode};
use crate::opt::OptimizationPass;
use kiln_core::{ice, CompileResult, Location};
use smallvec::SmallVec;
use tracing::debug;

const PASS: &str = "out-of-ssa";

/// Statistics from out-of-SSA translation.
#[derive(Debug, Clone, Default)]
pub struct OutOfSsaStats {
    pub temp_phis: usize,
    pub var_phis: usize,
    pub vars_created: usize,
    pub edges_split: usize,
    pub versions_renamed: usize,
}

/// Out-of-SSA pass.
#[derive(Debug, Default)]
pub struct OutOfSsa {
    stats: OutOfSsaStats,
}

impl OutOfSsa {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &OutOfSsaStats {
        &self.stats
    }

    /// Edges into `block`, split where the source has other successors.
    fn incoming(&mut self, ir: &mut MethodIr, block: BlockId) -> SmallVec<[EdgeId; 4]> {
        let edges: SmallVec<[EdgeId; 4]> = ir.block(block).in_edges.iter().copied().collect();
        for &e in &edges {
            let source = ir.edge(e).source;
            if ir.block(source).out_edges.len() > 1 {
                ir.split_edge(e);
                self.stats.edges_split += 1;
            }
        }
        ir.block(block).in_edges.iter().copied().collect()
    }

    fn lower_temp_phis(&mut self, ir: &mut MethodIr, block: BlockId) -> CompileResult<()> {
        let phis: SmallVec<[InstId; 4]> = ir
            .phis(block)
            .filter(|&p| ir.inst(p).dst.is_some_and(|d| ir.opnd(d).kind == OpndKind::Temp))
            .collect();
        if phis.is_empty() {
            return Ok(());
        }
        let edges = self.incoming(ir, block);
        for phi in phis {
            let (ty, srcs) = {
                let i = ir.inst(phi);
                (i.ty, i.srcs.clone())
            };
            if srcs.len() != edges.len() {
                ice!(PASS, Location::Inst(phi.index()), "phi has {} sources for {} edges", srcs.len(), edges.len());
            }
            let var = ir.new_var(ty);
            self.stats.vars_created += 1;
            for (&e, &src) in edges.iter().zip(srcs.iter()) {
                let pred = ir.edge(e).source;
                let st = ir.create_inst(Opcode::StVar, Modifier::NONE, ty, Some(var), &[src], Payload::None);
                ir.append_before_terminator(pred, st);
            }
            let load = ir.inst_mut(phi);
            load.opcode = Opcode::LdVar;
            load.srcs = SmallVec::from_slice(&[var]);
            self.stats.temp_phis += 1;
        }
        // Loads replaced phis in place; keep them after any var phis left.
        let insts: Vec<InstId> = ir.block(block).insts.clone();
        let (phis, rest): (Vec<InstId>, Vec<InstId>) =
            insts.into_iter().partition(|&i| ir.inst(i).opcode == Opcode::Phi);
        ir.block_mut(block).insts = phis.into_iter().chain(rest).collect();
        Ok(())
    }

    fn drop_var_phis(&mut self, ir: &mut MethodIr, block: BlockId) {
        let phis: SmallVec<[InstId; 4]> = ir.phis(block).collect();
        for phi in phis {
            ir.unlink(phi);
            self.stats.var_phis += 1;
        }
    }

    fn rename_versions(&mut self, ir: &mut MethodIr) {
        let base = |ir: &MethodIr, v: OpndId| match ir.opnd(v).kind {
            OpndKind::SsaVar { var } => Some(var),
            _ => None,
        };
        let insts: Vec<InstId> = ir.linked_insts().collect();
        for inst in insts {
            if let Some(d) = ir.inst(inst).dst {
                if let Some(v) = base(ir, d) {
                    ir.inst_mut(inst).dst = Some(v);
                    self.stats.versions_renamed += 1;
                }
            }
            for k in 0..ir.inst(inst).srcs.len() {
                let s = ir.inst(inst).src(k);
                if let Some(v) = base(ir, s) {
                    ir.inst_mut(inst).srcs[k] = v;
                    self.stats.versions_renamed += 1;
                }
            }
        }
    }
}

impl OptimizationPass for OutOfSsa {
    fn name(&self) -> &'static str {
        PASS
    }

    fn run(&mut self, ir: &mut MethodIr) -> CompileResult<bool> {
        let before = self.stats.clone();
        for block in ir.rpo() {
            self.lower_temp_phis(ir, block)?;
        }
        for block in ir.rpo() {
            self.drop_var_phis(ir, block);
        }
        self.rename_versions(ir);
        debug!(
            method = %ir.name,
            temp_phis = self.stats.temp_phis - before.temp_phis,
            var_phis = self.stats.var_phis - before.var_phis,
            split = self.stats.edges_split - before.edges_split,
            "left SSA"
        );
        Ok(self.stats.temp_phis > before.temp_phis
            || self.stats.var_phis > before.var_phis
            || self.stats.versions_renamed > before.versions_renamed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::interp::{Interpreter, Value};
    use crate::ir::opcode::CmpMod;
    use crate::ir::types::TypeManager;

    fn no_phis(ir: &MethodIr) -> bool {
        ir.linked_insts().all(|i| ir.inst(i).opcode != Opcode::Phi)
    }

    /// `s = 0; for i in 0..n { s += i }; return s` with temp phis.
    fn sum_loop() -> MethodIr {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("sum", tm, i32_);
        let mut b = IrBuilder::new(&mut ir);
        let n = b.def_arg(i32_, 0);
        let zero = b.i32(0);
        let one = b.i32(1);
        let (h, body, exit) = (b.new_block(), b.new_block(), b.new_block());
        b.jump(h);
        b.switch_to(h);
        let i_next = b.ir().new_temp(i32_);
        let s_next = b.ir().new_temp(i32_);
        let i = b.phi(i32_, &[zero, i_next]);
        let s = b.phi(i32_, &[zero, s_next]);
        b.branch(CmpMod::Lt, i, Some(n), body, exit, 0.9);
        b.switch_to(body);
        let s2 = b.add(s, i);
        let i2 = b.add(i, one);
        b.ir().replace_uses(s_next, s2);
        b.ir().replace_uses(i_next, i2);
        b.jump(h);
        b.switch_to(exit);
        b.ret(Some(s));
        ir
    }

    #[test]
    fn test_temp_phis_become_variables() {
        let reference = sum_loop();
        let mut ir = sum_loop();
        let mut pass = OutOfSsa::new();
        assert!(pass.run(&mut ir).unwrap());
        ir.verify().unwrap();
        assert!(no_phis(&ir));
        assert_eq!(pass.stats().temp_phis, 2);
        assert_eq!(pass.stats().vars_created, 2);
        // Neither edge into the header is critical.
        assert_eq!(pass.stats().edges_split, 0);

        for n in [0, 1, 7] {
            let expected = Interpreter::new(&reference).run(&[Value::Int(n)]).unwrap();
            assert_eq!(Interpreter::new(&ir).run(&[Value::Int(n)]).unwrap(), expected);
        }
    }

    /// `x = a < 0 ? 1 : (a == 0 ? 2 : 3)` where the entry jumps straight
    /// into the join, making its edge critical.
    fn critical() -> MethodIr {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("critical", tm, i32_);
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(i32_, 0);
        let zero = b.i32(0);
        let one = b.i32(1);
        let two = b.i32(2);
        let three = b.i32(3);
        let (other, join) = (b.new_block(), b.new_block());
        b.branch(CmpMod::Lt, a, Some(zero), join, other, 0.5);
        b.switch_to(other);
        let (two_b, three_b) = (b.new_block(), b.new_block());
        b.branch(CmpMod::Eq, a, Some(zero), two_b, three_b, 0.5);
        b.switch_to(two_b);
        b.jump(join);
        b.switch_to(three_b);
        b.jump(join);
        b.switch_to(join);
        let x = b.phi(i32_, &[one, two, three]);
        b.ret(Some(x));
        ir
    }

    #[test]
    fn test_critical_edge_is_split() {
        let reference = critical();
        let mut ir = critical();
        let mut pass = OutOfSsa::new();
        pass.run(&mut ir).unwrap();
        ir.verify().unwrap();
        assert!(no_phis(&ir));
        assert_eq!(pass.stats().edges_split, 1);
        // The branch block itself holds no store.
        let entry_stores = ir
            .block(ir.entry)
            .insts
            .iter()
            .filter(|&&i| ir.inst(i).opcode == Opcode::StVar)
            .count();
        assert_eq!(entry_stores, 0);

        for a in [-5, 0, 5] {
            let expected = Interpreter::new(&reference).run(&[Value::Int(a)]).unwrap();
            assert_eq!(Interpreter::new(&ir).run(&[Value::Int(a)]).unwrap(), expected);
        }
    }

    #[test]
    fn test_versions_collapse_to_base_variable() {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("versions", tm, i32_);
        let var = ir.new_var(i32_);
        let (v1, v2, v3) = (ir.new_ssa_var(var), ir.new_ssa_var(var), ir.new_ssa_var(var));
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(i32_, 0);
        let zero = b.i32(0);
        let (l, r, join) = (b.new_block(), b.new_block(), b.new_block());
        b.branch(CmpMod::Lt, a, Some(zero), l, r, 0.5);
        b.switch_to(l);
        let ten = b.i32(10);
        b.st_var(v1, ten);
        b.jump(join);
        b.switch_to(r);
        let twenty = b.i32(20);
        b.st_var(v2, twenty);
        b.jump(join);
        b.switch_to(join);
        b.phi_into(v3, &[v1, v2]);
        let x = b.ld_var(v3);
        b.ret(Some(x));
        let reference = ir.clone();

        let mut pass = OutOfSsa::new();
        pass.run(&mut ir).unwrap();
        assert!(no_phis(&ir));
        assert_eq!(pass.stats().var_phis, 1);
        assert_eq!(pass.stats().vars_created, 0);
        for i in ir.linked_insts() {
            let inst = ir.inst(i);
            for o in inst.dst.iter().chain(inst.srcs.iter()) {
                assert!(!matches!(ir.opnd(*o).kind, OpndKind::SsaVar { .. }));
            }
        }
        for a in [-1, 1] {
            let expected = Interpreter::new(&reference).run(&[Value::Int(a)]).unwrap();
            assert_eq!(Interpreter::new(&ir).run(&[Value::Int(a)]).unwrap(), expected);
        }
    }

    #[test]
    fn test_straight_line_is_unchanged() {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("flat", tm, i32_);
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(i32_, 0);
        let y = b.add(a, a);
        b.ret(Some(y));
        assert!(!OutOfSsa::new().run(&mut ir).unwrap());
    }
}
