//! Scalar evolution.
//!
//! `analyze(v, L)` describes how an integer operand evolves across the
//! iterations of loop `L`, as a chain of recurrences over `L` whose
//! coefficients are loop parameters (values fixed while `L` runs) or chrecs
//! of enclosing loops:
//!
//! ```text
//!   i  = phi(0, i + 4)      =>  {0, +, 4}_L
//!   j  = i * 2 + 1          =>  {1, +, 8}_L
//!   k  = n + i              =>  {n, +, 4}_L
//! ```
//!
//! Anything outside the supported pattern set yields `None`: non-integer
//! operands, loads and calls inside the loop, phis that are not at the loop
//! header, multi-entry or multi-latch header phis, and recurrences whose step
//! is not itself invariant in the loop.

pub mod expr;
pub mod iterations;
pub mod materialize;

pub use expr::{gcd, BinOp, Expr, ExprId, ExprPool, Poly};
pub use iterations::TripCount;
pub use materialize::materialize;

use crate::ir::cfg::{LoopId, LoopTree};
use crate::ir::inst::{ConstValue, Inst, OpndId, OpndKind, Payload};
use crate::ir::method::MethodIr;
use crate::ir::opcode::Opcode;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Scalar-evolution analysis over one method.
pub struct ScalarEvolution<'a> {
    ir: &'a MethodIr,
    loops: &'a LoopTree,
    pool: ExprPool,
    memo: FxHashMap<(OpndId, LoopId), Option<ExprId>>,
    /// Header phis whose recurrence is being traced; they read as their own
    /// symbolic value until the trace completes.
    tracing: SmallVec<[OpndId; 4]>,
}

impl<'a> ScalarEvolution<'a> {
    pub fn new(ir: &'a MethodIr, loops: &'a LoopTree) -> Self {
        ScalarEvolution {
            ir,
            loops,
            pool: ExprPool::new(loops.parents()),
            memo: FxHashMap::default(),
            tracing: SmallVec::new(),
        }
    }

    pub fn pool(&self) -> &ExprPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ExprPool {
        &mut self.pool
    }

    pub fn into_pool(self) -> ExprPool {
        self.pool
    }

    /// Evolution of `v` over `lp`, or `None` if it cannot be determined.
    pub fn analyze(&mut self, v: OpndId, lp: LoopId) -> Option<ExprId> {
        if !self.ir.types.is_integer(self.ir.opnd_ty(v)) {
            return None;
        }
        if self.tracing.is_empty() {
            if let Some(&r) = self.memo.get(&(v, lp)) {
                return r;
            }
        }
        let r = self.compute(v, lp);
        if self.tracing.is_empty() {
            self.memo.insert((v, lp), r);
        }
        r
    }

    fn compute(&mut self, v: OpndId, lp: LoopId) -> Option<ExprId> {
        let ir = self.ir;
        let Some(inst) = ir.def_of(v) else {
            // Mutable variables have no single definition.
            return match ir.opnd(v).kind {
                OpndKind::Var => None,
                _ => Some(self.pool.variable(v)),
            };
        };
        let block = inst.block;
        if !self.loops.get(lp).contains(block) {
            return Some(self.outside(v, inst, lp));
        }
        match inst.opcode {
            Opcode::LdConstant => match inst.payload {
                Payload::Const(ConstValue::Int(c)) => Some(self.pool.integer(c)),
                _ => None,
            },
            Opcode::Copy | Opcode::StVar => self.analyze(inst.src(0), lp),
            Opcode::LdVar => match ir.opnd(inst.src(0)).kind {
                OpndKind::SsaVar { .. } => self.analyze(inst.src(0), lp),
                _ => None,
            },
            Opcode::Conv => {
                let from = ir.types.bit_width(ir.opnd_ty(inst.src(0)))?;
                let to = ir.types.bit_width(inst.ty)?;
                if to < from {
                    return None;
                }
                self.analyze(inst.src(0), lp)
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                let a = self.analyze(inst.src(0), lp)?;
                let b = self.analyze(inst.src(1), lp)?;
                let op = match inst.opcode {
                    Opcode::Add => BinOp::Add,
                    Opcode::Sub => BinOp::Sub,
                    _ => BinOp::Mul,
                };
                // A product of two evolutions in the same loop is of second
                // degree; consumers only handle affine steps.
                Some(self.pool.op(op, a, b)).filter(|&e| self.pool.is_first_degree(e))
            }
            Opcode::Neg => {
                let a = self.analyze(inst.src(0), lp)?;
                Some(self.pool.neg(a))
            }
            Opcode::Shl => {
                let a = self.analyze(inst.src(0), lp)?;
                let s = self.analyze(inst.src(1), lp)?;
                let f = self.shift_factor(s)?;
                Some(self.pool.mul(a, f))
            }
            Opcode::ShlAdd => {
                let a = self.analyze(inst.src(0), lp)?;
                let s = self.analyze(inst.src(1), lp)?;
                let b = self.analyze(inst.src(2), lp)?;
                let f = self.shift_factor(s)?;
                let m = self.pool.mul(a, f);
                Some(self.pool.add(m, b))
            }
            Opcode::Phi => self.header_phi(v, inst, lp),
            _ => None,
        }
    }

    fn shift_factor(&mut self, s: ExprId) -> Option<ExprId> {
        match self.pool.as_integer(s) {
            Some(k) if (0..63).contains(&k) => Some(self.pool.integer(1i64 << k)),
            _ => None,
        }
    }

    /// `v` is defined outside `lp`: describe it over the innermost enclosing
    /// loop that defines it, or as a parameter.
    fn outside(&mut self, v: OpndId, inst: &Inst, lp: LoopId) -> ExprId {
        let loops = self.loops;
        let mut cur = loops.get(lp).parent;
        while let Some(p) = cur {
            if loops.get(p).contains(inst.block) {
                if let Some(e) = self.analyze(v, p) {
                    return e;
                }
                return self.pool.variable(v);
            }
            cur = loops.get(p).parent;
        }
        self.parameter(v)
    }

    /// A loop-invariant operand. Constants fold and multiplies are expanded
    /// so that the GCD test sees their factors.
    fn parameter(&mut self, v: OpndId) -> ExprId {
        let ir = self.ir;
        let Some(inst) = ir.def_of(v) else {
            return self.pool.variable(v);
        };
        match (inst.opcode, &inst.payload) {
            (Opcode::LdConstant, Payload::Const(ConstValue::Int(c))) => self.pool.integer(*c),
            (Opcode::Mul, _) if ir.types.is_integer(inst.ty) => {
                let a = self.parameter(inst.src(0));
                let b = self.parameter(inst.src(1));
                self.pool.mul(a, b)
            }
            (Opcode::Shl, _) if ir.types.is_integer(inst.ty) => {
                let a = self.parameter(inst.src(0));
                let s = self.parameter(inst.src(1));
                match self.shift_factor(s) {
                    Some(f) => self.pool.mul(a, f),
                    None => self.pool.variable(v),
                }
            }
            _ => self.pool.variable(v),
        }
    }

    fn header_phi(&mut self, v: OpndId, inst: &Inst, lp: LoopId) -> Option<ExprId> {
        if self.tracing.contains(&v) {
            return Some(self.pool.variable(v));
        }
        let (ir, loops) = (self.ir, self.loops);
        let l = loops.get(lp);
        if inst.block != l.header {
            return None;
        }
        let mut init = None;
        let mut back = None;
        for (k, &e) in ir.block(inst.block).in_edges.iter().enumerate() {
            let src = *inst.srcs.get(k)?;
            let slot = if l.contains(ir.edge(e).source) { &mut back } else { &mut init };
            if slot.replace(src).is_some() {
                return None;
            }
        }
        let (init, back) = (init?, back?);
        let init_e = self.analyze(init, lp)?;
        self.tracing.push(v);
        let stepped = self.analyze(back, lp);
        self.tracing.pop();
        let marker = self.pool.variable(v);
        let step = self.pool.sub(stepped?, marker);
        if self.pool.mentions(step, v) || self.pool.varies_in(step, lp) {
            return None;
        }
        Some(self.pool.chrec(init_e, step, lp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::cfg::DominatorTree;
    use crate::ir::opcode::CmpMod;
    use crate::ir::types::TypeManager;

    /// `for (i = 0; i < n; i += step) { j = i*2 + 1; k = i*i }`
    fn counted_loop(step: i32) -> (MethodIr, [OpndId; 4]) {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let void = tm.void();
        let mut ir = MethodIr::new("loop", tm, void);
        let mut b = IrBuilder::new(&mut ir);
        let n = b.def_arg(i32_, 0);
        let zero = b.i32(0);
        let header = b.new_block();
        let body = b.new_block();
        let exit = b.new_block();
        b.jump(header);
        b.switch_to(header);
        let i = b.phi(i32_, &[zero]);
        b.branch(CmpMod::Lt, i, Some(n), body, exit, 0.9);
        b.switch_to(body);
        let two = b.i32(2);
        let one = b.i32(1);
        let i2 = b.mul(i, two);
        let j = b.add(i2, one);
        let k = b.mul(i, i);
        let c = b.i32(step);
        let next = b.add(i, c);
        b.jump(header);
        b.switch_to(exit);
        b.ret(None);
        let phi = ir.opnd(i).def.unwrap();
        ir.inst_mut(phi).srcs.push(next);
        (ir, [i, j, k, n])
    }

    #[test]
    fn test_basic_induction_variable() {
        let (ir, [i, j, _, n]) = counted_loop(3);
        let dom = DominatorTree::compute(&ir);
        let loops = LoopTree::compute(&ir, &dom);
        let lp = loops.ids().next().unwrap();
        let mut se = ScalarEvolution::new(&ir, &loops);

        let ei = se.analyze(i, lp).unwrap();
        let p = se.pool_mut();
        let (c0, c1, c3, c6) = (p.integer(0), p.integer(1), p.integer(3), p.integer(6));
        assert_eq!(ei, p.chrec(c0, c3, lp));

        let ej = se.analyze(j, lp).unwrap();
        assert_eq!(ej, se.pool_mut().chrec(c1, c6, lp));

        let en = se.analyze(n, lp).unwrap();
        assert_eq!(se.pool().get(en), Expr::Variable(n));
    }

    #[test]
    fn test_quadratic_has_no_evolution() {
        let (ir, [i, _, k, _]) = counted_loop(1);
        let dom = DominatorTree::compute(&ir);
        let loops = LoopTree::compute(&ir, &dom);
        let lp = loops.ids().next().unwrap();
        let mut se = ScalarEvolution::new(&ir, &loops);
        se.analyze(i, lp).unwrap();
        assert!(se.analyze(k, lp).is_none());

        // The folding rule itself still builds the second-degree chrec.
        let ei = se.analyze(i, lp).unwrap();
        let p = se.pool_mut();
        let sq = p.mul(ei, ei);
        assert!(!p.is_first_degree(sq));
        assert!(p.is_first_degree(ei));
    }
}
