//! Turning expressions back into HIR.

use super::expr::{BinOp, Expr, ExprId, ExprPool};
use crate::ir::inst::{ConstValue, OpndId, Payload};
use crate::ir::method::{BlockId, MethodIr};
use crate::ir::opcode::{InstFlags, Modifier, Opcode};
use crate::ir::types::TypeId;
use kiln_core::{unsupported, CompileResult};
use rustc_hash::FxHashMap;

/// Emit code computing `e` as a value of integer type `ty` at the end of
/// `block` (before its terminator, if any).
///
/// Variables must be available in `block`. Chrecs have no value outside
/// their loop and are rejected. Divisions use the tau-safe sentinel: the
/// divisors produced by scalar evolution are non-zero constants.
pub fn materialize(ir: &mut MethodIr, pool: &ExprPool, e: ExprId, ty: TypeId, block: BlockId) -> CompileResult<OpndId> {
    let mut done = FxHashMap::default();
    emit(ir, pool, e, ty, block, &mut done)
}

fn emit(
    ir: &mut MethodIr,
    pool: &ExprPool,
    e: ExprId,
    ty: TypeId,
    block: BlockId,
    done: &mut FxHashMap<ExprId, OpndId>,
) -> CompileResult<OpndId> {
    if let Some(&v) = done.get(&e) {
        return Ok(v);
    }
    let v = match pool.get(e) {
        Expr::Integer(c) => push(ir, block, Opcode::LdConstant, Modifier::NONE, ty, &[], Payload::Const(ConstValue::Int(c))),
        Expr::Variable(v) => {
            if ir.opnd_ty(v) == ty {
                v
            } else {
                let m = Modifier::NONE.with_flags(InstFlags::SIGNED);
                push(ir, block, Opcode::Conv, m, ty, &[v], Payload::Type(ty))
            }
        }
        Expr::Op { op, lhs, rhs } => {
            let a = emit(ir, pool, lhs, ty, block, done)?;
            let b = emit(ir, pool, rhs, ty, block, done)?;
            match op {
                BinOp::Add => push(ir, block, Opcode::Add, Modifier::NONE, ty, &[a, b], Payload::None),
                BinOp::Sub => push(ir, block, Opcode::Sub, Modifier::NONE, ty, &[a, b], Payload::None),
                BinOp::Mul => push(ir, block, Opcode::Mul, Modifier::NONE, ty, &[a, b], Payload::None),
                BinOp::Div => {
                    if pool.as_integer(rhs).map_or(true, |d| d == 0) {
                        unsupported!("materialize", "division by a non-constant");
                    }
                    let tau = ir.find_or_create_tau_safe();
                    let m = Modifier::NONE.with_flags(InstFlags::SIGNED);
                    push(ir, block, Opcode::TauDiv, m, ty, &[a, b, tau], Payload::None)
                }
            }
        }
        Expr::PolyChrec { .. } => {
            unsupported!("materialize", "chrec {} has no value outside its loop", pool.display(e));
        }
    };
    done.insert(e, v);
    Ok(v)
}

fn push(
    ir: &mut MethodIr,
    block: BlockId,
    opcode: Opcode,
    modifier: Modifier,
    ty: TypeId,
    srcs: &[OpndId],
    payload: Payload,
) -> OpndId {
    let dst = ir.new_temp(ty);
    let inst = ir.create_inst(opcode, modifier, ty, Some(dst), srcs, payload);
    ir.append_before_terminator(block, inst);
    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::interp::{Interpreter, Value};
    use crate::ir::types::TypeManager;

    #[test]
    fn test_materialized_ceiling_division() {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("m", tm, i32_);
        let n = IrBuilder::new(&mut ir).def_arg(i32_, 0);

        let mut pool = ExprPool::new(Vec::new());
        let vn = pool.variable(n);
        let three = pool.integer(3);
        let four = pool.integer(4);
        let num = pool.add(vn, three);
        let e = pool.div(num, four);

        let entry = ir.entry;
        let v = materialize(&mut ir, &pool, e, i32_, entry).unwrap();
        IrBuilder::new(&mut ir).ret(Some(v));
        ir.verify().unwrap();

        for (input, expect) in [(0, 0), (1, 1), (4, 1), (5, 2), (256, 64)] {
            let mut interp = Interpreter::new(&ir);
            assert_eq!(interp.run(&[Value::Int(input)]).unwrap(), Some(Value::Int(expect)));
        }
    }

    #[test]
    fn test_chrec_is_rejected() {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("m", tm, i32_);
        let mut pool = ExprPool::new(vec![None]);
        let (z, o) = (pool.integer(0), pool.integer(1));
        let c = pool.chrec(z, o, crate::ir::cfg::LoopId::new(0));
        let entry = ir.entry;
        let err = materialize(&mut ir, &pool, c, i32_, entry).unwrap_err();
        assert!(!err.is_internal());
    }
}
