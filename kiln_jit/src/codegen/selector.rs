//! Block-level instruction selection.
//!
//! Scans each block's instructions in order and issues exactly one
//! [`InstructionCallback`] call per instruction. The handle produced for an
//! instruction's destination is cached, so later uses reuse it instead of
//! generating code again.
//!
//! # Constant sinking
//!
//! Constant-like instructions (constant, null, field-offset and vtable loads)
//! are either generated in scan order and cached for the whole method, or,
//! with [`SelectorConfig::sink_constants`], skipped during the scan and
//! generated at their first use. Sunk constants live in a block-local cache
//! that every non-constant instruction flushes.
//!
//! A constant requested before it has been generated is generated on the
//! spot. The bytecode offset reported to the backend is switched to the
//! constant's own and restored afterwards.

use super::callback::{
    ArithOp, AutoCompress, CallTarget, CmpOp, CmpType, CodeGenCallback, DivOp, IntOp, OpType, RefArithOp,
    VarHandle, VecOp,
};
use super::{SelectStats, SelectorConfig};
use crate::ir::inst::{ConstValue, InstId, OpndId, Payload};
use crate::ir::method::{BlockId, MethodIr};
use crate::ir::opcode::{CmpMod, InstFlags, Opcode};
use kiln_core::{ice, CompileResult, Location};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

const PASS: &str = "select";

/// Lowers instructions of one method, block by block.
pub struct InstSelector<'a, C: CodeGenCallback> {
    ir: &'a MethodIr,
    cb: &'a mut C,
    config: SelectorConfig,
    vars: &'a FxHashMap<OpndId, VarHandle>,
    nodes: &'a FxHashMap<BlockId, u32>,
    /// Method-wide handle cache.
    handles: FxHashMap<OpndId, C::Handle>,
    /// Sunk constants of the current stretch of the current block.
    local: FxHashMap<OpndId, C::Handle>,
    bc_offset: Option<u32>,
    pub(crate) stats: SelectStats,
}

impl<'a, C: CodeGenCallback> InstSelector<'a, C> {
    pub fn new(
        ir: &'a MethodIr,
        cb: &'a mut C,
        config: SelectorConfig,
        vars: &'a FxHashMap<OpndId, VarHandle>,
        nodes: &'a FxHashMap<BlockId, u32>,
    ) -> Self {
        InstSelector {
            ir,
            cb,
            config,
            vars,
            nodes,
            handles: FxHashMap::default(),
            local: FxHashMap::default(),
            bc_offset: None,
            stats: SelectStats::default(),
        }
    }

    pub fn callback(&mut self) -> &mut C {
        &mut *self.cb
    }

    /// Lower every instruction of `block` into backend node `node`.
    pub fn select_block(&mut self, block: BlockId, node: u32) -> CompileResult<()> {
        let ir = self.ir;
        self.cb.begin_node(node);
        self.local.clear();
        for &inst in &ir.block(block).insts {
            let opcode = ir.inst(inst).opcode;
            let constant = opcode.is_constant_like();
            if constant && self.config.sink_constants {
                self.stats.constants_sunk += 1;
                continue;
            }
            self.gen_inst(inst)?;
            if self.config.sink_constants && !constant {
                self.local.clear();
            }
        }
        self.cb.end_node(node);
        Ok(())
    }

    fn set_bc(&mut self, offset: Option<u32>) {
        self.bc_offset = offset;
        self.cb.set_bc_offset(offset);
    }

    /// Handle of `v`, generating its constant definition if needed.
    fn opnd(&mut self, v: OpndId) -> CompileResult<C::Handle> {
        if let Some(&h) = self.handles.get(&v).or_else(|| self.local.get(&v)) {
            return Ok(h);
        }
        let ir = self.ir;
        match ir.opnd(v).def {
            Some(def) if ir.inst(def).opcode.is_constant_like() => {
                let saved = self.bc_offset;
                self.gen_inst(def)?;
                self.set_bc(saved);
                self.stats.rematerialized += 1;
                match self.handles.get(&v).or_else(|| self.local.get(&v)) {
                    Some(&h) => Ok(h),
                    None => ice!(PASS, Location::Inst(def.index()), "constant produced no value"),
                }
            }
            Some(def) => ice!(PASS, Location::Inst(def.index()), "t{} used before it was lowered", v.index()),
            None => ice!(PASS, Location::Method, "t{} has no definition", v.index()),
        }
    }

    fn opnd_opt(&mut self, v: Option<OpndId>) -> CompileResult<Option<C::Handle>> {
        v.map(|v| self.opnd(v)).transpose()
    }

    fn ty(&self, v: OpndId) -> OpType {
        OpType::of(&self.ir.types, self.ir.opnd_ty(v))
    }

    fn var(&self, inst: InstId, v: OpndId) -> CompileResult<VarHandle> {
        match self.vars.get(&v) {
            Some(&h) => Ok(h),
            None => ice!(PASS, Location::Inst(inst.index()), "t{} is not a declared variable", v.index()),
        }
    }

    fn arith(&self, inst: InstId, ty: OpType) -> CompileResult<ArithOp> {
        let m = self.ir.inst(inst).modifier;
        match ArithOp::new(ty, m.overflow, m.flags.contains(InstFlags::EXCEPTION_NEVER)) {
            Some(op) => Ok(op),
            None => ice!(PASS, Location::Inst(inst.index()), "no arithmetic form for {:?}", ty),
        }
    }

    fn int(&self, inst: InstId, ty: OpType) -> CompileResult<IntOp> {
        match IntOp::new(ty) {
            Some(op) => Ok(op),
            None => ice!(PASS, Location::Inst(inst.index()), "no integer form for {:?}", ty),
        }
    }

    fn div(&self, inst: InstId, ty: OpType) -> CompileResult<DivOp> {
        let signed = self.ir.inst(inst).modifier.flags.contains(InstFlags::SIGNED);
        match DivOp::new(ty, signed) {
            Some(op) => Ok(op),
            None => ice!(PASS, Location::Inst(inst.index()), "no division form for {:?}", ty),
        }
    }

    /// Relation and operand order. `Lt`/`Le` swap their operands.
    fn relation(&self, inst: InstId) -> CompileResult<(CmpOp, CmpType, bool)> {
        let i = self.ir.inst(inst);
        let Some(cmp) = i.modifier.cmp else {
            ice!(PASS, Location::Inst(inst.index()), "comparison without relation");
        };
        let (op, swap) = match cmp {
            CmpMod::Eq => (CmpOp::Eq, false),
            CmpMod::Ne => (CmpOp::Ne, false),
            CmpMod::Gt => (CmpOp::Gt, false),
            CmpMod::Ge => (CmpOp::Ge, false),
            CmpMod::Lt => (CmpOp::Gt, true),
            CmpMod::Le => (CmpOp::Ge, true),
            CmpMod::GtUn => (CmpOp::GtUn, false),
            CmpMod::GeUn => (CmpOp::GeUn, false),
            CmpMod::LtUn => (CmpOp::GtUn, true),
            CmpMod::LeUn => (CmpOp::GeUn, true),
            CmpMod::Zero => (CmpOp::Zero, false),
            CmpMod::NonZero => (CmpOp::NonZero, false),
        };
        let ty = self.ty(i.src(0));
        match CmpType::new(ty) {
            Some(ct) => Ok((op, ct, swap)),
            None => ice!(PASS, Location::Inst(inst.index()), "cannot compare {:?}", ty),
        }
    }

    /// Comparison operands `(a, b)` in callback order.
    fn cmp_operands(
        &mut self,
        inst: InstId,
        op: CmpOp,
        swap: bool,
    ) -> CompileResult<(C::Handle, Option<C::Handle>)> {
        let ir = self.ir;
        let i = ir.inst(inst);
        let a = self.opnd(i.src(0))?;
        if op.is_unary() {
            return Ok((a, None));
        }
        let b = self.opnd(i.src(1))?;
        Ok(if swap { (b, Some(a)) } else { (a, Some(b)) })
    }

    fn ref_op(ty: OpType) -> RefArithOp {
        match ty {
            OpType::I1 | OpType::I2 | OpType::I4 | OpType::U1 | OpType::U2 | OpType::U4 => RefArithOp::I4,
            _ => RefArithOp::I,
        }
    }

    /// `add`/`sub`, routing reference operands to reference arithmetic.
    fn additive(&mut self, inst: InstId, ty: OpType) -> CompileResult<C::Handle> {
        let ir = self.ir;
        let i = ir.inst(inst);
        let (a, b) = (i.src(0), i.src(1));
        let (ta, tb) = (self.ty(a), self.ty(b));
        let (ha, hb) = (self.opnd(a)?, self.opnd(b)?);
        let add = i.opcode == Opcode::Add;
        if let OpType::Vector { .. } = ty {
            let op = if add { VecOp::Add } else { VecOp::Sub };
            return Ok(self.cb.vec_arith(op, ty, ha, hb));
        }
        Ok(match (add, ta.is_ref(), tb.is_ref()) {
            (true, true, false) => self.cb.add_ref(Self::ref_op(tb), ha, hb),
            (true, false, true) => self.cb.add_ref(Self::ref_op(ta), hb, ha),
            (false, true, true) => self.cb.diff_ref(ha, hb),
            (false, true, false) => self.cb.sub_ref(Self::ref_op(tb), ha, hb),
            (true, true, true) => ice!(PASS, Location::Inst(inst.index()), "sum of two references"),
            _ => {
                let op = self.arith(inst, ty)?;
                if add {
                    self.cb.add(op, ha, hb)
                } else {
                    self.cb.sub(op, ha, hb)
                }
            }
        })
    }

    /// Binary operation that has a vector form.
    fn lanewise(
        &mut self,
        inst: InstId,
        ty: OpType,
        vec: VecOp,
        scalar: impl FnOnce(&mut C, C::Handle, C::Handle) -> CompileResult<C::Handle>,
    ) -> CompileResult<C::Handle> {
        let ir = self.ir;
        let i = ir.inst(inst);
        let a = self.opnd(i.src(0))?;
        let b = self.opnd(i.src(1))?;
        match ty {
            OpType::Vector { .. } => Ok(self.cb.vec_arith(vec, ty, a, b)),
            _ => scalar(&mut *self.cb, a, b),
        }
    }

    fn elem_of_pointer(&self, inst: InstId) -> CompileResult<OpType> {
        let types = &self.ir.types;
        match types.pointed_to_type(self.ir.inst(inst).ty) {
            Some(e) => Ok(OpType::of(types, e)),
            None => ice!(PASS, Location::Inst(inst.index()), "address without pointee type"),
        }
    }

    fn type_payload(&self, inst: InstId) -> CompileResult<crate::ir::types::TypeId> {
        match self.ir.inst(inst).type_payload() {
            Some(t) => Ok(t),
            None => ice!(PASS, Location::Inst(inst.index()), "missing type payload"),
        }
    }

    /// Lower one instruction and cache its result.
    fn gen_inst(&mut self, inst: InstId) -> CompileResult<()> {
        let ir = self.ir;
        let i = ir.inst(inst);
        self.set_bc(i.bc_offset);
        let ty = OpType::of(&ir.types, i.ty);
        let compress = if i.modifier.flags.contains(InstFlags::AUTO_COMPRESS) {
            AutoCompress::Yes
        } else {
            AutoCompress::No
        };
        let loc = Location::Inst(inst.index());

        let h: Option<C::Handle> = match i.opcode {
            // Constants and arguments
            Opcode::LdConstant => Some(match i.payload {
                Payload::Const(ConstValue::Int(v)) => self.cb.ld_const_int(ty, v),
                Payload::Const(ConstValue::Float(v)) => self.cb.ld_const_float(ty, v),
                _ => ice!(PASS, loc, "constant without value"),
            }),
            Opcode::LdNull => Some(self.cb.ld_null(ty == OpType::CompressedRef)),
            Opcode::LdRef => match i.payload {
                Payload::Str(s) => Some(self.cb.ld_ref(s, ty == OpType::CompressedRef)),
                _ => ice!(PASS, loc, "ldref without string index"),
            },
            Opcode::LdFieldOffset => match i.payload {
                Payload::Field(f) => Some(self.cb.ld_field_offset(f, ir.types.field(f).offset)),
                _ => ice!(PASS, loc, "field offset without field"),
            },
            Opcode::TauLdVTableAddr => {
                let compressed = self.ty(i.src(0)) == OpType::CompressedRef;
                let obj = self.opnd(i.src(0))?;
                Some(self.cb.ld_vtable(obj, compressed))
            }
            Opcode::DefArg => match i.payload {
                Payload::Arg(n) => Some(self.cb.def_arg(n, ty)),
                _ => ice!(PASS, loc, "argument without position"),
            },

            // Arithmetic
            Opcode::Add | Opcode::Sub => Some(self.additive(inst, ty)?),
            Opcode::Mul => {
                let op = if matches!(ty, OpType::Vector { .. }) { None } else { Some(self.arith(inst, ty)?) };
                Some(self.lanewise(inst, ty, VecOp::Mul, |cb, a, b| match op {
                    Some(op) => Ok(cb.mul(op, a, b)),
                    None => ice!(PASS, loc, "vector multiply reached scalar form"),
                })?)
            }
            Opcode::Min | Opcode::Max => {
                let is_min = i.opcode == Opcode::Min;
                let vec = if is_min { VecOp::Min } else { VecOp::Max };
                let op = if matches!(ty, OpType::Vector { .. }) { None } else { Some(self.arith(inst, ty)?) };
                Some(self.lanewise(inst, ty, vec, |cb, a, b| match op {
                    Some(op) if is_min => Ok(cb.min(op, a, b)),
                    Some(op) => Ok(cb.max(op, a, b)),
                    None => ice!(PASS, loc, "vector min/max reached scalar form"),
                })?)
            }
            Opcode::And | Opcode::Or | Opcode::Xor => {
                let (vec, opcode) = match i.opcode {
                    Opcode::And => (VecOp::And, Opcode::And),
                    Opcode::Or => (VecOp::Or, Opcode::Or),
                    _ => (VecOp::Xor, Opcode::Xor),
                };
                let op = if matches!(ty, OpType::Vector { .. }) { None } else { Some(self.int(inst, ty)?) };
                Some(self.lanewise(inst, ty, vec, |cb, a, b| match (op, opcode) {
                    (Some(op), Opcode::And) => Ok(cb.and(op, a, b)),
                    (Some(op), Opcode::Or) => Ok(cb.or(op, a, b)),
                    (Some(op), _) => Ok(cb.xor(op, a, b)),
                    (None, _) => ice!(PASS, loc, "vector bitwise op reached scalar form"),
                })?)
            }
            Opcode::MulHi => {
                let op = self.div(inst, ty)?;
                let (a, b) = (self.opnd(i.src(0))?, self.opnd(i.src(1))?);
                Some(self.cb.mul_hi(op, a, b))
            }
            Opcode::TauDiv | Opcode::TauRem => {
                let op = self.div(inst, ty)?;
                let (a, b) = (self.opnd(i.src(0))?, self.opnd(i.src(1))?);
                Some(if i.opcode == Opcode::TauDiv {
                    self.cb.div(op, a, b)
                } else {
                    self.cb.rem(op, a, b)
                })
            }
            Opcode::Neg | Opcode::Abs => {
                let op = self.arith(inst, ty)?;
                let a = self.opnd(i.src(0))?;
                Some(if i.opcode == Opcode::Neg {
                    self.cb.neg(op, a)
                } else {
                    self.cb.abs(op, a)
                })
            }
            Opcode::Not => {
                let op = self.int(inst, ty)?;
                let a = self.opnd(i.src(0))?;
                Some(self.cb.not(op, a))
            }
            Opcode::Shl | Opcode::Shr => {
                let op = self.int(inst, ty)?;
                let (a, n) = (self.opnd(i.src(0))?, self.opnd(i.src(1))?);
                Some(if i.opcode == Opcode::Shl {
                    self.cb.shl(op, a, n)
                } else {
                    self.cb.shr(op, a, n, i.modifier.flags.contains(InstFlags::SIGNED))
                })
            }
            Opcode::ShlAdd => {
                let op = self.int(inst, ty)?;
                let (a, s, b) = (self.opnd(i.src(0))?, self.opnd(i.src(1))?, self.opnd(i.src(2))?);
                Some(self.cb.shl_add(op, a, s, b))
            }

            // Comparison and conversion
            Opcode::Cmp => {
                let (op, ct, swap) = self.relation(inst)?;
                let (a, b) = self.cmp_operands(inst, op, swap)?;
                Some(self.cb.cmp(op, ct, a, b))
            }
            Opcode::Select => {
                let (op, ct, swap) = self.relation(inst)?;
                let (a, b) = self.cmp_operands(inst, op, swap)?;
                let n = i.srcs.len();
                let (x, y) = (self.opnd(i.src(n - 2))?, self.opnd(i.src(n - 1))?);
                Some(self.cb.select(op, ct, a, b, x, y))
            }
            Opcode::Conv => {
                let from = self.ty(i.src(0));
                let a = self.opnd(i.src(0))?;
                Some(self.cb.conv(ty, from, a))
            }
            Opcode::Copy => {
                let a = self.opnd(i.src(0))?;
                Some(self.cb.copy(a))
            }

            // Variables
            Opcode::LdVar => {
                let var = self.var(inst, i.src(0))?;
                Some(self.cb.ld_var(ty, var))
            }
            Opcode::StVar => {
                let Some(dst) = i.dst else {
                    ice!(PASS, loc, "store without variable");
                };
                let var = self.var(inst, dst)?;
                let v = self.opnd(i.src(0))?;
                self.cb.st_var(var, v);
                None
            }
            Opcode::Phi => ice!(PASS, loc, "phi reached instruction selection"),

            // Control
            Opcode::Branch => {
                let (op, ct, swap) = self.relation(inst)?;
                let (a, b) = self.cmp_operands(inst, op, swap)?;
                self.cb.branch(op, ct, a, b);
                None
            }
            Opcode::Switch => {
                let Payload::Cases(cases) = &i.payload else {
                    ice!(PASS, loc, "switch without cases");
                };
                let mut targets: SmallVec<[u32; 8]> = SmallVec::new();
                for &e in cases {
                    match self.nodes.get(&ir.edge(e).target) {
                        Some(&n) => targets.push(n),
                        None => ice!(PASS, loc, "switch target has no node"),
                    }
                }
                let index = self.opnd(i.src(0))?;
                self.cb.switch(index, &targets);
                None
            }
            Opcode::Return => {
                let v = self.opnd_opt(i.srcs.first().copied())?;
                self.cb.ret(v);
                None
            }
            Opcode::Throw => {
                let obj = self.opnd(i.src(0))?;
                self.cb.throw(obj);
                None
            }
            Opcode::DirectCall | Opcode::IndirectCall | Opcode::VmHelperCall => {
                let tau = ir.types.tau();
                let mut args: SmallVec<[C::Handle; 8]> = SmallVec::new();
                let skip = usize::from(i.opcode == Opcode::IndirectCall);
                for &s in i.srcs.iter().skip(skip) {
                    if ir.opnd_ty(s) != tau {
                        args.push(self.opnd(s)?);
                    }
                }
                let target = match (i.opcode, &i.payload) {
                    (Opcode::DirectCall, Payload::Method(m)) => CallTarget::Direct(*m),
                    (Opcode::VmHelperCall, Payload::Helper(h)) => CallTarget::Helper(*h),
                    (Opcode::IndirectCall, _) => CallTarget::Indirect(self.opnd(i.src(0))?),
                    _ => ice!(PASS, loc, "call without callee"),
                };
                self.cb.call(target, &args, ty)
            }

            // Memory
            Opcode::LdFieldAddr => {
                let Payload::Field(f) = i.payload else {
                    ice!(PASS, loc, "field address without field");
                };
                let obj = self.opnd(i.src(0))?;
                Some(self.cb.ld_field_addr(obj, ir.types.field(f).offset))
            }
            Opcode::LdStaticAddr => match i.payload {
                Payload::Field(f) => Some(self.cb.ld_static_addr(f)),
                _ => ice!(PASS, loc, "static address without field"),
            },
            Opcode::LdElemAddr => {
                let elem = self.elem_of_pointer(inst)?;
                let (a, idx) = (self.opnd(i.src(0))?, self.opnd(i.src(1))?);
                Some(self.cb.ld_elem_addr(elem, a, idx))
            }
            Opcode::LdArrayBaseAddr => {
                let elem = self.elem_of_pointer(inst)?;
                let a = self.opnd(i.src(0))?;
                Some(self.cb.ld_array_base(elem, a))
            }
            Opcode::AddScaledIndex => {
                let elem = self.elem_of_pointer(inst)?;
                let (p, idx) = (self.opnd(i.src(0))?, self.opnd(i.src(1))?);
                Some(self.cb.add_scaled_index(elem, p, idx))
            }
            Opcode::LdArrayLen => {
                let a = self.opnd(i.src(0))?;
                Some(self.cb.ld_array_len(a))
            }
            Opcode::TauLdInd => {
                let addr = self.opnd(i.src(0))?;
                Some(self.cb.ld_ind(ty, addr, compress))
            }
            Opcode::TauStInd => {
                let vty = self.ty(i.src(0));
                let (v, addr) = (self.opnd(i.src(0))?, self.opnd(i.src(1))?);
                self.cb.st_ind(vty, addr, v, compress);
                None
            }
            Opcode::CompressRef => {
                let a = self.opnd(i.src(0))?;
                Some(self.cb.compress_ref(a))
            }
            Opcode::UncompressRef => {
                let a = self.opnd(i.src(0))?;
                Some(self.cb.uncompress_ref(a))
            }

            // Objects
            Opcode::NewObj => Some(self.cb.new_obj(i.ty)),
            Opcode::NewArray => {
                let len = self.opnd(i.src(0))?;
                Some(self.cb.new_array(i.ty, len))
            }
            Opcode::TauMonitorEnter | Opcode::TauMonitorExit => {
                let obj = self.opnd(i.src(0))?;
                if i.opcode == Opcode::TauMonitorEnter {
                    self.cb.monitor_enter(obj);
                } else {
                    self.cb.monitor_exit(obj);
                }
                None
            }

            // Proofs and checks
            Opcode::TauSafe
            | Opcode::TauUnsafe
            | Opcode::TauPoint
            | Opcode::TauEdge
            | Opcode::TauAnd
            | Opcode::TauHasType
            | Opcode::TauHasExactType
            | Opcode::TauIsNonNull => Some(self.cb.tau_point()),
            Opcode::TauCheckNull => {
                let obj = self.opnd(i.src(0))?;
                Some(self.cb.check_null(obj))
            }
            Opcode::TauCheckBounds => {
                let (len, idx) = (self.opnd(i.src(0))?, self.opnd(i.src(1))?);
                Some(self.cb.check_bounds(len, idx))
            }
            Opcode::TauCheckZero => {
                let v = self.opnd(i.src(0))?;
                Some(self.cb.check_zero(v))
            }
            Opcode::TauCheckCast | Opcode::TauStaticCast | Opcode::TauAsType | Opcode::TauInstanceOf => {
                let t = self.type_payload(inst)?;
                let obj = self.opnd(i.src(0))?;
                Some(match i.opcode {
                    Opcode::TauCheckCast => self.cb.check_cast(obj, t),
                    Opcode::TauStaticCast => self.cb.static_cast(obj, t),
                    Opcode::TauAsType => self.cb.as_type(obj, t),
                    _ => self.cb.instance_of(obj, t),
                })
            }

            // Vectors
            Opcode::VecPack => {
                let mut lanes: SmallVec<[C::Handle; 8]> = SmallVec::new();
                for &s in &i.srcs {
                    lanes.push(self.opnd(s)?);
                }
                Some(self.cb.vec_pack(ty, &lanes))
            }
            Opcode::VecExtract => {
                let Payload::Lane(k) = i.payload else {
                    ice!(PASS, loc, "extract without lane");
                };
                let v = self.opnd(i.src(0))?;
                Some(self.cb.vec_extract(ty, v, k))
            }
        };

        self.stats.insts_lowered += 1;
        if let (Some(h), Some(dst)) = (h, i.dst) {
            if i.opcode.is_constant_like() && self.config.sink_constants {
                self.local.insert(dst, h);
            } else {
                self.handles.insert(dst, h);
            }
            trace!(inst = inst.index(), opcode = i.opcode.name(), "lowered");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::callback::recorder::Recorder;
    use crate::codegen::{select_method, SelectorConfig};
    use crate::ir::builder::IrBuilder;
    use crate::ir::method::MethodIr;
    use crate::ir::opcode::Opcode;
    use crate::ir::types::TypeManager;

    /// `return (a + 5) * (a + 5)` with the constant in the entry block.
    fn reused_constant() -> MethodIr {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("reuse", tm, i32_);
        let mut b = IrBuilder::new(&mut ir);
        b.set_bc_offset(Some(1));
        let a = b.def_arg(i32_, 0);
        b.set_bc_offset(Some(2));
        let five = b.i32(5);
        b.set_bc_offset(Some(3));
        let x = b.add(a, five);
        b.set_bc_offset(Some(4));
        let y = b.mul(x, five);
        b.set_bc_offset(Some(5));
        b.ret(Some(y));
        ir
    }

    #[test]
    fn test_handles_are_reused_without_sinking() {
        let ir = reused_constant();
        let mut rec = Recorder::default();
        let stats = select_method(&ir, &mut rec, &SelectorConfig::default()).unwrap();
        assert_eq!(rec.count("const"), 1);
        assert_eq!(rec.count("add"), 1);
        assert_eq!(rec.count("mul"), 1);
        assert_eq!(stats.constants_sunk, 0);
        assert!(rec.log.iter().any(|l| l.ends_with("mul I4 h3 h2")));
    }

    #[test]
    fn test_sunk_constant_is_flushed_by_computation() {
        let ir = reused_constant();
        let mut rec = Recorder::default();
        let config = SelectorConfig { sink_constants: true };
        let stats = select_method(&ir, &mut rec, &config).unwrap();
        // Generated once for the add and again for the mul.
        assert_eq!(rec.count("const"), 2);
        assert_eq!(stats.constants_sunk, 1);
        assert_eq!(stats.rematerialized, 2);
        // Each sunk constant sits right before its user.
        let add = rec.log.iter().position(|l| l.contains("add I4")).unwrap();
        let mul = rec.log.iter().position(|l| l.contains("mul I4")).unwrap();
        assert!(rec.log[add - 1].contains("const"));
        assert!(rec.log[mul - 1].contains("const"));
    }

    #[test]
    fn test_rematerialized_constant_reports_its_own_offset() {
        let ir = reused_constant();
        let mut rec = Recorder::default();
        select_method(&ir, &mut rec, &SelectorConfig { sink_constants: true }).unwrap();
        let mul = rec.log.iter().position(|l| l.contains("mul I4")).unwrap();
        assert_eq!(rec.bc_offsets[mul - 1], Some(2));
        assert_eq!(rec.bc_offsets[mul], Some(4));
    }

    #[test]
    fn test_reference_arithmetic_dispatch() {
        let mut tm = TypeManager::new();
        let i32_ = tm.int32();
        let i64_ = tm.int64();
        let arr = tm.array_of(i32_);
        let mut ir = MethodIr::new("refs", tm, i64_);
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(arr, 0);
        let c = b.def_arg(arr, 1);
        let off = b.i32(16);
        let p = b.binary(Opcode::Add, arr, off, a);
        let q = b.sub(p, off);
        let d = b.sub(q, c);
        b.ret(Some(d));

        let mut rec = Recorder::default();
        select_method(&ir, &mut rec, &SelectorConfig::default()).unwrap();
        assert_eq!(rec.count("addref I4"), 1);
        assert_eq!(rec.count("subref I4"), 1);
        assert_eq!(rec.count("diffref"), 1);
        assert_eq!(rec.count("add "), 0);
        // The reference is always the base.
        assert!(rec.log.iter().any(|l| l.ends_with("addref I4 h1 h3")));
    }

    #[test]
    fn test_less_than_swaps_operands() {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("lt", tm, i32_);
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(i32_, 0);
        let c = b.def_arg(i32_, 1);
        let r = b.cmp(crate::ir::opcode::CmpMod::Lt, a, c);
        b.ret(Some(r));
        let mut rec = Recorder::default();
        select_method(&ir, &mut rec, &SelectorConfig::default()).unwrap();
        assert!(rec.log.iter().any(|l| l.ends_with("cmp Gt I4 h2 Some(1)")));
    }

    #[test]
    fn test_phi_is_internal_error() {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("phi", tm, i32_);
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(i32_, 0);
        let next = b.new_block();
        b.jump(next);
        b.switch_to(next);
        let p = b.phi(i32_, &[a]);
        b.ret(Some(p));
        let err = select_method(&ir, &mut Recorder::default(), &SelectorConfig::default()).unwrap_err();
        assert!(err.is_internal());
    }
}
