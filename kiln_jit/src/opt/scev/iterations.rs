//! Number of iterations of a counted loop.
//!
//! The loop must leave through a branch comparing an affine induction
//! variable `{s, +, d}_L` with a bound `B` invariant in `L`. The branch is
//! first normalized to the relation under which control *stays* in the loop,
//! with the induction variable on the left. The body then runs
//!
//! ```text
//!   iv <  B, d > 0:   (B - s + d - 1) / d
//!   iv <= B, d > 0:   (B - s + d) / d
//!   iv >  B, d < 0:   (s - B + |d| - 1) / |d|
//!   iv >= B, d < 0:   (s - B + |d|) / |d|
//!   iv != B, d = 1:   B - s          (d = -1: s - B)
//! ```
//!
//! times. The results are not clamped: a non-positive value means the body
//! never runs, and callers materializing the count take `max(n, 0)`.

use super::expr::ExprId;
use super::ScalarEvolution;
use crate::ir::cfg::LoopId;
use crate::ir::inst::InstId;
use crate::ir::opcode::{CmpMod, Opcode};

/// Iteration count of a loop together with the exit test it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripCount {
    /// Number of times the loop body runs.
    pub iterations: ExprId,
    /// Relation under which the loop continues, induction variable first.
    pub stay: CmpMod,
    /// The induction variable's evolution.
    pub iv: ExprId,
    /// Its constant step.
    pub step: i64,
    /// The bound it is compared against.
    pub bound: ExprId,
    /// Source index of the induction variable in the exit branch.
    pub iv_src: usize,
}

impl ScalarEvolution<'_> {
    /// Iteration count of `lp` exiting through `branch`. `stay_on_true` says
    /// whether the branch's true edge remains in the loop.
    pub fn number_of_iterations(&mut self, lp: LoopId, branch: InstId, stay_on_true: bool) -> Option<TripCount> {
        let ir = self.ir;
        let inst = ir.inst(branch);
        if inst.opcode != Opcode::Branch {
            return None;
        }
        let cmp = inst.modifier.cmp?;
        let cmp = if stay_on_true { cmp } else { cmp.negate() };

        let (iv, bound, stay, iv_src) = if cmp.is_unary() {
            // Only `iv != 0` has a closed form.
            if cmp != CmpMod::NonZero {
                return None;
            }
            let iv = self.analyze(inst.src(0), lp)?;
            let zero = self.pool.integer(0);
            (iv, zero, CmpMod::Ne, 0)
        } else {
            let a = self.analyze(inst.src(0), lp)?;
            let b = self.analyze(inst.src(1), lp)?;
            match (self.pool.varies_in(a, lp), self.pool.varies_in(b, lp)) {
                (true, false) => (a, b, cmp, 0),
                (false, true) => (b, a, cmp.swap(), 1),
                _ => return None,
            }
        };
        if stay.is_unsigned() {
            return None;
        }
        let (start, step_e, l) = self.pool.as_affine(iv)?;
        if l != lp || self.pool.varies_in(bound, lp) {
            return None;
        }
        let step = self.pool.as_integer(step_e)?;

        let p = &mut self.pool;
        let iterations = match stay {
            CmpMod::Lt | CmpMod::Le if step > 0 => {
                // (B - s + d - adj) / d
                let adj = if stay == CmpMod::Lt { 1 } else { 0 };
                let dist = p.sub(bound, start);
                let k = p.integer(step - adj);
                let num = p.add(dist, k);
                let d = p.integer(step);
                p.div(num, d)
            }
            CmpMod::Gt | CmpMod::Ge if step < 0 => {
                let adj = if stay == CmpMod::Gt { 1 } else { 0 };
                let dist = p.sub(start, bound);
                let k = p.integer(-step - adj);
                let num = p.add(dist, k);
                let d = p.integer(-step);
                p.div(num, d)
            }
            CmpMod::Ne if step == 1 => p.sub(bound, start),
            CmpMod::Ne if step == -1 => p.sub(start, bound),
            _ => return None,
        };
        Some(TripCount {
            iterations,
            stay,
            iv,
            step,
            bound,
            iv_src,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::cfg::{DominatorTree, LoopTree};
    use crate::ir::method::MethodIr;
    use crate::ir::types::TypeManager;

    /// `for (i = start; i <cmp> bound; i += step)`; returns the exit branch.
    fn loop_with(start: i32, bound: Option<i32>, cmp: CmpMod, step: i32, stay_on_true: bool) -> (MethodIr, InstId) {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let void = tm.void();
        let mut ir = MethodIr::new("loop", tm, void);
        let mut b = IrBuilder::new(&mut ir);
        let n = match bound {
            Some(v) => b.i32(v),
            None => b.def_arg(i32_, 0),
        };
        let s = b.i32(start);
        let header = b.new_block();
        let body = b.new_block();
        let exit = b.new_block();
        b.jump(header);
        b.switch_to(header);
        let i = b.phi(i32_, &[s]);
        let br = if stay_on_true {
            b.branch(cmp, i, Some(n), body, exit, 0.9)
        } else {
            b.branch(cmp.negate(), i, Some(n), exit, body, 0.1)
        };
        b.switch_to(body);
        let c = b.i32(step);
        let next = b.add(i, c);
        b.jump(header);
        b.switch_to(exit);
        b.ret(None);
        let phi = ir.opnd(i).def.unwrap();
        ir.inst_mut(phi).srcs.push(next);
        (ir, br)
    }

    fn count(start: i32, bound: i32, cmp: CmpMod, step: i32, stay_on_true: bool) -> Option<i64> {
        let (ir, br) = loop_with(start, Some(bound), cmp, step, stay_on_true);
        let dom = DominatorTree::compute(&ir);
        let loops = LoopTree::compute(&ir, &dom);
        let lp = loops.ids().next().unwrap();
        let mut se = ScalarEvolution::new(&ir, &loops);
        let tc = se.number_of_iterations(lp, br, stay_on_true)?;
        se.pool().as_integer(tc.iterations)
    }

    #[test]
    fn test_constant_trip_counts() {
        assert_eq!(count(0, 256, CmpMod::Lt, 1, true), Some(256));
        assert_eq!(count(0, 10, CmpMod::Lt, 3, true), Some(4));
        assert_eq!(count(0, 9, CmpMod::Le, 3, true), Some(4));
        assert_eq!(count(10, 0, CmpMod::Gt, -2, true), Some(5));
        assert_eq!(count(10, 0, CmpMod::Ge, -2, true), Some(6));
        assert_eq!(count(3, 8, CmpMod::Ne, 1, true), Some(5));
        // Exit on `i >= 10` is stay on `i < 10`.
        assert_eq!(count(0, 10, CmpMod::Lt, 1, false), Some(10));
    }

    #[test]
    fn test_unsupported_forms() {
        assert_eq!(count(0, 10, CmpMod::Ne, 2, true), None);
        assert_eq!(count(0, 10, CmpMod::LtUn, 1, true), None);
        assert_eq!(count(0, 10, CmpMod::Lt, -1, true), None);
    }

    #[test]
    fn test_symbolic_bound() {
        let (ir, br) = loop_with(0, None, CmpMod::Lt, 4, true);
        let dom = DominatorTree::compute(&ir);
        let loops = LoopTree::compute(&ir, &dom);
        let lp = loops.ids().next().unwrap();
        let mut se = ScalarEvolution::new(&ir, &loops);
        let tc = se.number_of_iterations(lp, br, true).unwrap();
        assert_eq!(tc.step, 4);
        assert_eq!(tc.iv_src, 0);
        // (n + 3) / 4 stays a division.
        assert!(se.pool().as_integer(tc.iterations).is_none());
        assert!(se.pool().has_chrec(tc.iv));
    }
}
