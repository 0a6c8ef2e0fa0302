//! IPF lowering behind the selector callbacks.
//!
//! Each callback appends symbolic IPF instructions over virtual registers to
//! the current machine node. Values live in general registers, or float
//! registers for `F4`/`F8`. 32-bit integers are kept sign-extended in 64-bit
//! registers, so every 32-bit producer ends with `sxt4`.
//!
//! Integer multiply goes through the float unit (`setf.sig`, `xma`,
//! `getf.sig`); division and the allocation, monitor, cast and throw paths
//! call the runtime. Comparisons write a predicate pair and conditional
//! code runs under one of the two predicates.

use super::registers::{Reg, RegClass};
use crate::backend::machine::{CmpRel, MFlags, MInst, MachineCfg, Mnemonic, NodeId, Operand, RuntimeFn, Symbol};
use crate::codegen::callback::{
    ArithOp, AutoCompress, CallTarget, CfgCallback, CmpOp, CmpType, DivOp, EdgeTag, InstructionCallback, IntOp,
    MethodCallback, NodeKind, OpType, RefArithOp, VarHandle, VecOp,
};
use crate::codegen::NO_PROFILE;
use crate::ir::types::{FieldId, TypeId};
use smallvec::SmallVec;

/// Array length field offset.
pub const ARRAY_LENGTH_OFFSET: i64 = 8;
/// First array element offset.
pub const ARRAY_DATA_OFFSET: i64 = 16;
/// Offset of the first stack-passed argument from sp.
const STACK_ARGS_OFFSET: i64 = 16;

/// Value handle: a register, or a proof that carries no code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpfOpnd {
    Reg(Reg),
    Tau,
}

impl IpfOpnd {
    fn reg(self) -> Reg {
        match self {
            IpfOpnd::Reg(r) => r,
            IpfOpnd::Tau => Reg::ZERO,
        }
    }

    fn op(self) -> Operand {
        Operand::Reg(self.reg())
    }

    fn is_float(self) -> bool {
        matches!(
            self,
            IpfOpnd::Reg(Reg::Fr(_))
                | IpfOpnd::Reg(Reg::Virtual {
                    class: RegClass::Float,
                    ..
                })
        )
    }
}

/// Counters kept while lowering.
#[derive(Debug, Clone, Default)]
pub struct IpfStats {
    pub insts: usize,
    pub calls: usize,
    pub vregs: u32,
}

/// Lowers selector callbacks into a [`MachineCfg`].
#[derive(Debug)]
pub struct IpfCodeGen {
    cfg: MachineCfg,
    /// Dense node id to machine node.
    nodes: Vec<NodeId>,
    cur: Option<NodeId>,
    args: Vec<OpType>,
    vars: Vec<Reg>,
    bc: Option<u32>,
    stats: IpfStats,
}

impl Default for IpfCodeGen {
    fn default() -> Self {
        Self::new()
    }
}

impl IpfCodeGen {
    pub fn new() -> Self {
        IpfCodeGen {
            cfg: MachineCfg::new(""),
            nodes: Vec::new(),
            cur: None,
            args: Vec::new(),
            vars: Vec::new(),
            bc: None,
            stats: IpfStats::default(),
        }
    }

    pub fn cfg(&self) -> &MachineCfg {
        &self.cfg
    }

    pub fn stats(&self) -> &IpfStats {
        &self.stats
    }

    /// Machine node for a dense node id.
    pub fn node(&self, id: u32) -> Option<NodeId> {
        self.nodes.get(id as usize).copied()
    }

    pub fn finish(self) -> MachineCfg {
        self.cfg
    }

    // -------------------------------------------------------------------------
    // Emission helpers
    // -------------------------------------------------------------------------

    fn vreg(&mut self, class: RegClass) -> Reg {
        let index = self.stats.vregs;
        self.stats.vregs += 1;
        Reg::Virtual { class, index }
    }

    fn value_reg(&mut self, float: bool) -> Reg {
        self.vreg(if float { RegClass::Float } else { RegClass::General })
    }

    fn emit(&mut self, mut inst: MInst) {
        inst.bc_offset = self.bc;
        let node = self.cur.unwrap_or(self.cfg.entry);
        self.cfg.append(node, inst);
        self.stats.insts += 1;
    }

    /// Emit `op d = srcs` into a fresh register.
    fn def(&mut self, op: Mnemonic, float: bool, srcs: &[Operand]) -> Reg {
        let d = self.value_reg(float);
        self.emit(MInst::new(op, &[d.into()], srcs));
        d
    }

    fn def_flags(&mut self, op: Mnemonic, srcs: &[Operand], flags: MFlags) -> Reg {
        let d = self.vreg(RegClass::General);
        self.emit(MInst::new(op, &[d.into()], srcs).with_flags(flags));
        d
    }

    fn sxt4(&mut self, r: Reg) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::Sxt(4), false, &[r.into()]))
    }

    fn narrow(&mut self, r: Reg, is_32bit: bool) -> IpfOpnd {
        if is_32bit {
            self.sxt4(r)
        } else {
            IpfOpnd::Reg(r)
        }
    }

    fn heap_base(&mut self) -> Reg {
        self.def(Mnemonic::Movl, false, &[Operand::Sym(Symbol::HeapBase)])
    }

    fn compare(&mut self, op: CmpOp, ty: CmpType, a: IpfOpnd, b: Option<IpfOpnd>) -> (Reg, Reg) {
        let float = matches!(ty, CmpType::F4 | CmpType::F8);
        let zero = if float { Reg::F0 } else { Reg::ZERO };
        let rhs = b.map(IpfOpnd::reg).unwrap_or(zero);
        let rel = match op {
            CmpOp::Eq | CmpOp::Zero => CmpRel::Eq,
            CmpOp::Ne | CmpOp::NonZero => CmpRel::Ne,
            CmpOp::Gt => CmpRel::Gt,
            CmpOp::Ge => CmpRel::Ge,
            CmpOp::GtUn if float => CmpRel::Gt,
            CmpOp::GeUn if float => CmpRel::Ge,
            CmpOp::GtUn => CmpRel::Gtu,
            CmpOp::GeUn => CmpRel::Geu,
        };
        let mnemonic = if float {
            Mnemonic::Fcmp(rel)
        } else {
            let width = if matches!(ty, CmpType::I4 | CmpType::CompressedRef) { 4 } else { 8 };
            Mnemonic::Cmp { rel, width }
        };
        let (pt, pf) = (self.vreg(RegClass::Predicate), self.vreg(RegClass::Predicate));
        self.emit(MInst::new(mnemonic, &[pt.into(), pf.into()], &[a.op(), rhs.into()]));
        (pt, pf)
    }

    /// Two predicated moves joining into one register.
    fn choose(&mut self, pt: Reg, pf: Reg, x: Operand, y: Operand, float: bool) -> IpfOpnd {
        let d = self.value_reg(float);
        self.emit(MInst::new(Mnemonic::Mov, &[d.into()], &[x]).with_qp(pt));
        self.emit(MInst::new(Mnemonic::Mov, &[d.into()], &[y]).with_qp(pf));
        IpfOpnd::Reg(d)
    }

    /// Guarded runtime call, taken when `p` holds.
    fn trap_if(&mut self, p: Reg, target: RuntimeFn) {
        self.emit(
            MInst::new(Mnemonic::BrCall, &[Reg::B0.into()], &[Operand::Sym(Symbol::Runtime(target))]).with_qp(p),
        );
        self.stats.calls += 1;
    }

    /// Move arguments into place, call `target` and fetch the result.
    fn call_out(&mut self, target: Operand, args: &[IpfOpnd], ret: Option<bool>) -> Option<IpfOpnd> {
        let mut fargs = 0u8;
        for (k, &a) in args.iter().enumerate() {
            if k >= Reg::MAX_REG_ARGS as usize {
                let off = STACK_ARGS_OFFSET + 8 * (k as i64 - Reg::MAX_REG_ARGS as i64);
                let addr = self.def(Mnemonic::Adds, false, &[Operand::Imm(off), Reg::SP.into()]);
                let st = if a.is_float() { Mnemonic::Stf(8) } else { Mnemonic::St(8) };
                self.emit(MInst::new(st, &[Operand::Mem(addr)], &[a.op()]));
            } else if a.is_float() {
                self.emit(MInst::new(Mnemonic::Mov, &[Reg::Fr(8 + fargs).into()], &[a.op()]));
                fargs += 1;
            } else {
                self.emit(MInst::new(Mnemonic::Mov, &[Reg::Out(k as u8).into()], &[a.op()]));
            }
        }
        self.cfg.max_out_args = self.cfg.max_out_args.max(args.len() as u8);
        self.emit(MInst::new(Mnemonic::BrCall, &[Reg::B0.into()], &[target]));
        self.stats.calls += 1;
        let float = ret?;
        let src = if float { Reg::FRET } else { Reg::RET };
        Some(IpfOpnd::Reg(self.def(Mnemonic::Mov, float, &[src.into()])))
    }

    fn runtime(&mut self, f: RuntimeFn, args: &[IpfOpnd], ret: Option<bool>) -> Option<IpfOpnd> {
        self.call_out(Operand::Sym(Symbol::Runtime(f)), args, ret)
    }

    fn type_arg(&mut self, ty: TypeId) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::Movl, false, &[Operand::Sym(Symbol::Type(ty))]))
    }

    fn ovf_flags(op: ArithOp) -> MFlags {
        match op {
            ArithOp::I4Ovf | ArithOp::I8Ovf | ArithOp::IOvf => MFlags::OVF_SIGNED,
            ArithOp::U4Ovf | ArithOp::U8Ovf | ArithOp::UOvf => MFlags::OVF_UNSIGNED,
            _ => MFlags::empty(),
        }
    }

    fn int_arith(&mut self, m: Mnemonic, op: ArithOp, srcs: &[Operand]) -> IpfOpnd {
        let r = self.def_flags(m, srcs, Self::ovf_flags(op));
        self.narrow(r, op.is_32bit())
    }

    /// Multiply through the float unit.
    fn xma(&mut self, m: Mnemonic, a: IpfOpnd, b: IpfOpnd) -> Reg {
        let fa = self.def(Mnemonic::Setf, true, &[a.op()]);
        let fb = self.def(Mnemonic::Setf, true, &[b.op()]);
        let fd = self.def(m, true, &[fa.into(), fb.into(), Reg::F0.into()]);
        self.def(Mnemonic::Getf, false, &[fd.into()])
    }

    fn log2_size(elem: OpType) -> i64 {
        elem.size().max(1).trailing_zeros() as i64
    }
}

// =============================================================================
// Method and CFG callbacks
// =============================================================================

impl MethodCallback for IpfCodeGen {
    fn method_start(&mut self, name: &str, args: &[OpType], _ret: OpType) {
        self.cfg.name = name.to_string();
        self.cfg.num_args = args.len() as u8;
        self.args = args.to_vec();
    }

    fn declare_var(&mut self, ty: OpType) -> VarHandle {
        let home = self.value_reg(ty.is_float());
        self.vars.push(home);
        VarHandle(self.vars.len() as u32 - 1)
    }

    fn method_end(&mut self) {
        self.cur = None;
    }
}

impl CfgCallback for IpfCodeGen {
    fn gen_node(&mut self, kind: NodeKind, persistent_id: u32, exec_count: f64) -> u32 {
        let n = self.cfg.add_node(kind, persistent_id, exec_count.max(0.0));
        self.nodes.push(n);
        self.nodes.len() as u32 - 1
    }

    fn gen_edge(&mut self, from: u32, to: u32, tag: EdgeTag, prob: f64) {
        if prob != NO_PROFILE {
            self.cfg.has_profile = true;
        }
        if let (Some(s), Some(t)) = (self.node(from), self.node(to)) {
            self.cfg.add_edge(s, t, tag, prob);
        }
    }

    fn begin_node(&mut self, node: u32) {
        self.cur = self.node(node);
    }

    fn end_node(&mut self, _node: u32) {
        self.cur = None;
    }
}

// =============================================================================
// Instruction callbacks
// =============================================================================

impl InstructionCallback for IpfCodeGen {
    type Handle = IpfOpnd;

    fn set_bc_offset(&mut self, offset: Option<u32>) {
        self.bc = offset;
    }

    // -------------------------------------------------------------------------
    // Constants and arguments
    // -------------------------------------------------------------------------

    fn ld_const_int(&mut self, _ty: OpType, value: i64) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::Movl, false, &[Operand::Imm(value)]))
    }

    fn ld_const_float(&mut self, _ty: OpType, value: f64) -> IpfOpnd {
        // Bit pattern through a general register.
        let bits = self.def(Mnemonic::Movl, false, &[Operand::Imm(value.to_bits() as i64)]);
        IpfOpnd::Reg(self.def(Mnemonic::Setf, true, &[bits.into()]))
    }

    fn ld_null(&mut self, _compressed: bool) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::Mov, false, &[Reg::ZERO.into()]))
    }

    fn ld_ref(&mut self, index: u32, compressed: bool) -> IpfOpnd {
        let flags = if compressed { MFlags::COMPRESSED } else { MFlags::empty() };
        IpfOpnd::Reg(self.def_flags(Mnemonic::Movl, &[Operand::Sym(Symbol::Str(index))], flags))
    }

    fn ld_field_offset(&mut self, _field: FieldId, offset: u32) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::Movl, false, &[Operand::Imm(offset as i64)]))
    }

    fn ld_vtable(&mut self, obj: IpfOpnd, compressed: bool) -> IpfOpnd {
        if compressed {
            IpfOpnd::Reg(self.def_flags(Mnemonic::Ld(4), &[Operand::Mem(obj.reg())], MFlags::COMPRESSED))
        } else {
            IpfOpnd::Reg(self.def(Mnemonic::Ld(8), false, &[Operand::Mem(obj.reg())]))
        }
    }

    fn def_arg(&mut self, index: u32, ty: OpType) -> IpfOpnd {
        let k = index as usize;
        if k >= Reg::MAX_REG_ARGS as usize {
            let off = STACK_ARGS_OFFSET + 8 * (k as i64 - Reg::MAX_REG_ARGS as i64);
            let addr = self.def(Mnemonic::Adds, false, &[Operand::Imm(off), Reg::SP.into()]);
            let ld = if ty.is_float() { Mnemonic::Ldf(8) } else { Mnemonic::Ld(8) };
            return IpfOpnd::Reg(self.def(ld, ty.is_float(), &[Operand::Mem(addr)]));
        }
        let src = if ty.is_float() {
            let before = self.args.iter().take(k).filter(|t| t.is_float()).count() as u8;
            Reg::Fr(8 + before)
        } else {
            Reg::Gr(Reg::FIRST_STACKED + index as u8)
        };
        IpfOpnd::Reg(self.def(Mnemonic::Mov, ty.is_float(), &[src.into()]))
    }

    // -------------------------------------------------------------------------
    // Arithmetic
    // -------------------------------------------------------------------------

    fn add(&mut self, op: ArithOp, a: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        match op {
            ArithOp::F4 | ArithOp::F8 => IpfOpnd::Reg(self.def(Mnemonic::Fadd, true, &[a.op(), b.op()])),
            _ => self.int_arith(Mnemonic::Add, op, &[a.op(), b.op()]),
        }
    }

    fn sub(&mut self, op: ArithOp, a: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        match op {
            ArithOp::F4 | ArithOp::F8 => IpfOpnd::Reg(self.def(Mnemonic::Fsub, true, &[a.op(), b.op()])),
            _ => self.int_arith(Mnemonic::Sub, op, &[a.op(), b.op()]),
        }
    }

    fn mul(&mut self, op: ArithOp, a: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        match op {
            ArithOp::F4 | ArithOp::F8 => IpfOpnd::Reg(self.def(Mnemonic::Fmpy, true, &[a.op(), b.op()])),
            _ => {
                let r = self.xma(Mnemonic::XmaL, a, b);
                if op.checks_overflow() {
                    self.cfg_last_flags(Self::ovf_flags(op));
                }
                self.narrow(r, op.is_32bit())
            }
        }
    }

    fn mul_hi(&mut self, op: DivOp, a: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        let unsigned = matches!(op, DivOp::U4 | DivOp::U8 | DivOp::U);
        IpfOpnd::Reg(self.xma(Mnemonic::XmaH { unsigned }, a, b))
    }

    fn div(&mut self, op: DivOp, a: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        let (f, float) = match op {
            DivOp::F4 | DivOp::F8 => (RuntimeFn::FDiv, true),
            DivOp::U4 | DivOp::U8 | DivOp::U => (RuntimeFn::UDiv, false),
            _ => (RuntimeFn::Div, false),
        };
        self.runtime(f, &[a, b], Some(float)).unwrap_or(IpfOpnd::Tau)
    }

    fn rem(&mut self, op: DivOp, a: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        let (f, float) = match op {
            DivOp::F4 | DivOp::F8 => (RuntimeFn::FRem, true),
            DivOp::U4 | DivOp::U8 | DivOp::U => (RuntimeFn::URem, false),
            _ => (RuntimeFn::Rem, false),
        };
        self.runtime(f, &[a, b], Some(float)).unwrap_or(IpfOpnd::Tau)
    }

    fn neg(&mut self, op: ArithOp, a: IpfOpnd) -> IpfOpnd {
        match op {
            ArithOp::F4 | ArithOp::F8 => IpfOpnd::Reg(self.def(Mnemonic::Fneg, true, &[a.op()])),
            _ => self.int_arith(Mnemonic::Sub, op, &[Reg::ZERO.into(), a.op()]),
        }
    }

    fn min(&mut self, op: ArithOp, a: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        match op {
            ArithOp::F4 | ArithOp::F8 => IpfOpnd::Reg(self.def(Mnemonic::Fmin, true, &[a.op(), b.op()])),
            _ => {
                let (pt, pf) = self.compare(CmpOp::Gt, cmp_type(op), b, Some(a));
                self.choose(pt, pf, a.op(), b.op(), false)
            }
        }
    }

    fn max(&mut self, op: ArithOp, a: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        match op {
            ArithOp::F4 | ArithOp::F8 => IpfOpnd::Reg(self.def(Mnemonic::Fmax, true, &[a.op(), b.op()])),
            _ => {
                let (pt, pf) = self.compare(CmpOp::Gt, cmp_type(op), a, Some(b));
                self.choose(pt, pf, a.op(), b.op(), false)
            }
        }
    }

    fn abs(&mut self, op: ArithOp, a: IpfOpnd) -> IpfOpnd {
        match op {
            ArithOp::F4 | ArithOp::F8 => IpfOpnd::Reg(self.def(Mnemonic::Fabs, true, &[a.op()])),
            _ => {
                let neg = self.def(Mnemonic::Sub, false, &[Reg::ZERO.into(), a.op()]);
                let (pt, pf) = self.compare(CmpOp::Gt, cmp_type(op), IpfOpnd::Reg(Reg::ZERO), Some(a));
                self.choose(pt, pf, neg.into(), a.op(), false)
            }
        }
    }

    fn and(&mut self, _op: IntOp, a: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::And, false, &[a.op(), b.op()]))
    }

    fn or(&mut self, _op: IntOp, a: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::Or, false, &[a.op(), b.op()]))
    }

    fn xor(&mut self, _op: IntOp, a: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::Xor, false, &[a.op(), b.op()]))
    }

    fn not(&mut self, _op: IntOp, a: IpfOpnd) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::Xor, false, &[Operand::Imm(-1), a.op()]))
    }

    fn shl(&mut self, op: IntOp, a: IpfOpnd, amount: IpfOpnd) -> IpfOpnd {
        let r = self.def(Mnemonic::Shl, false, &[a.op(), amount.op()]);
        self.narrow(r, op == IntOp::I4)
    }

    fn shr(&mut self, op: IntOp, a: IpfOpnd, amount: IpfOpnd, signed: bool) -> IpfOpnd {
        if signed {
            return IpfOpnd::Reg(self.def(Mnemonic::Shr, false, &[a.op(), amount.op()]));
        }
        let src = if op == IntOp::I4 {
            self.def(Mnemonic::Zxt(4), false, &[a.op()])
        } else {
            a.reg()
        };
        let r = self.def(Mnemonic::ShrU, false, &[src.into(), amount.op()]);
        self.narrow(r, op == IntOp::I4)
    }

    fn shl_add(&mut self, op: IntOp, a: IpfOpnd, shift: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        let r = self.def(Mnemonic::Shladd, false, &[a.op(), shift.op(), b.op()]);
        self.narrow(r, op == IntOp::I4)
    }

    fn vec_arith(&mut self, op: VecOp, ty: OpType, a: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        let lane = match ty {
            OpType::Vector { elem_bits, .. } => elem_bits / 8,
            _ => 8,
        };
        let m = match op {
            VecOp::Add => Mnemonic::Padd(lane),
            VecOp::Sub => Mnemonic::Psub(lane),
            VecOp::Mul => Mnemonic::Pmpy(lane),
            VecOp::Min => Mnemonic::Pmin(lane),
            VecOp::Max => Mnemonic::Pmax(lane),
            VecOp::And => Mnemonic::And,
            VecOp::Or => Mnemonic::Or,
            VecOp::Xor => Mnemonic::Xor,
        };
        IpfOpnd::Reg(self.def(m, false, &[a.op(), b.op()]))
    }

    // -------------------------------------------------------------------------
    // Reference arithmetic
    // -------------------------------------------------------------------------

    fn add_ref(&mut self, op: RefArithOp, base: IpfOpnd, offset: IpfOpnd) -> IpfOpnd {
        let off = match op {
            RefArithOp::I4 => self.def(Mnemonic::Sxt(4), false, &[offset.op()]),
            RefArithOp::I => offset.reg(),
        };
        IpfOpnd::Reg(self.def(Mnemonic::Add, false, &[base.op(), off.into()]))
    }

    fn sub_ref(&mut self, op: RefArithOp, base: IpfOpnd, offset: IpfOpnd) -> IpfOpnd {
        let off = match op {
            RefArithOp::I4 => self.def(Mnemonic::Sxt(4), false, &[offset.op()]),
            RefArithOp::I => offset.reg(),
        };
        IpfOpnd::Reg(self.def(Mnemonic::Sub, false, &[base.op(), off.into()]))
    }

    fn diff_ref(&mut self, a: IpfOpnd, b: IpfOpnd) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::Sub, false, &[a.op(), b.op()]))
    }

    // -------------------------------------------------------------------------
    // Comparison and conversion
    // -------------------------------------------------------------------------

    fn cmp(&mut self, op: CmpOp, ty: CmpType, a: IpfOpnd, b: Option<IpfOpnd>) -> IpfOpnd {
        let (pt, pf) = self.compare(op, ty, a, b);
        self.choose(pt, pf, Operand::Imm(1), Operand::Imm(0), false)
    }

    fn select(
        &mut self,
        op: CmpOp,
        ty: CmpType,
        a: IpfOpnd,
        b: Option<IpfOpnd>,
        if_true: IpfOpnd,
        if_false: IpfOpnd,
    ) -> IpfOpnd {
        let (pt, pf) = self.compare(op, ty, a, b);
        self.choose(pt, pf, if_true.op(), if_false.op(), if_true.is_float())
    }

    fn conv(&mut self, to: OpType, from: OpType, src: IpfOpnd) -> IpfOpnd {
        let r = match (from.is_float(), to.is_float()) {
            (false, false) => {
                let size = to.size();
                if size > 0 && size < 8 {
                    let m = if to.is_unsigned() { Mnemonic::Zxt(size as u8) } else { Mnemonic::Sxt(size as u8) };
                    self.def(m, false, &[src.op()])
                } else if from.is_unsigned() && from.size() < 8 {
                    self.def(Mnemonic::Zxt(from.size() as u8), false, &[src.op()])
                } else {
                    self.def(Mnemonic::Mov, false, &[src.op()])
                }
            }
            (false, true) => {
                let f = self.def(Mnemonic::Setf, true, &[src.op()]);
                self.def(Mnemonic::FcvtXf, true, &[f.into()])
            }
            (true, false) => {
                let f = self.def(Mnemonic::FcvtFx, true, &[src.op()]);
                self.def(Mnemonic::Getf, false, &[f.into()])
            }
            (true, true) => self.def(Mnemonic::Fnorm, true, &[src.op()]),
        };
        IpfOpnd::Reg(r)
    }

    fn copy(&mut self, src: IpfOpnd) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::Mov, src.is_float(), &[src.op()]))
    }

    // -------------------------------------------------------------------------
    // Variables
    // -------------------------------------------------------------------------

    fn ld_var(&mut self, ty: OpType, var: VarHandle) -> IpfOpnd {
        let home = self.vars.get(var.0 as usize).copied().unwrap_or(Reg::ZERO);
        IpfOpnd::Reg(self.def(Mnemonic::Mov, ty.is_float(), &[home.into()]))
    }

    fn st_var(&mut self, var: VarHandle, value: IpfOpnd) {
        if let Some(&home) = self.vars.get(var.0 as usize) {
            self.emit(MInst::new(Mnemonic::Mov, &[home.into()], &[value.op()]));
        }
    }

    // -------------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------------

    fn branch(&mut self, op: CmpOp, ty: CmpType, a: IpfOpnd, b: Option<IpfOpnd>) {
        let (pt, _) = self.compare(op, ty, a, b);
        self.emit(MInst::new(Mnemonic::BrCond, &[], &[]).with_qp(pt));
    }

    fn switch(&mut self, index: IpfOpnd, targets: &[u32]) {
        let mut srcs: SmallVec<[Operand; 4]> = SmallVec::new();
        srcs.push(index.op());
        srcs.extend(targets.iter().filter_map(|&t| self.node(t)).map(Operand::Node));
        self.emit(MInst::new(Mnemonic::BrTable, &[], &srcs));
    }

    fn ret(&mut self, value: Option<IpfOpnd>) {
        if let Some(v) = value {
            let dst = if v.is_float() { Reg::FRET } else { Reg::RET };
            self.emit(MInst::new(Mnemonic::Mov, &[dst.into()], &[v.op()]));
        }
        self.emit(MInst::new(Mnemonic::BrRet, &[], &[Reg::B0.into()]));
    }

    fn throw(&mut self, obj: IpfOpnd) {
        self.runtime(RuntimeFn::Throw, &[obj], None);
    }

    fn call(&mut self, target: CallTarget<IpfOpnd>, args: &[IpfOpnd], ret: OpType) -> Option<IpfOpnd> {
        let target = match target {
            CallTarget::Direct(m) => Operand::Sym(Symbol::Method(m)),
            CallTarget::Helper(h) => Operand::Sym(Symbol::Helper(h)),
            CallTarget::Indirect(f) => {
                self.emit(MInst::new(Mnemonic::Mov, &[Reg::B6.into()], &[f.op()]));
                Reg::B6.into()
            }
        };
        let ret = match ret {
            OpType::Void => None,
            t => Some(t.is_float()),
        };
        self.call_out(target, args, ret)
    }

    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------

    fn ld_field_addr(&mut self, obj: IpfOpnd, offset: u32) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::Adds, false, &[Operand::Imm(offset as i64), obj.op()]))
    }

    fn ld_static_addr(&mut self, field: FieldId) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::Movl, false, &[Operand::Sym(Symbol::Static(field))]))
    }

    fn ld_elem_addr(&mut self, elem: OpType, array: IpfOpnd, index: IpfOpnd) -> IpfOpnd {
        let base = self.ld_array_base(elem, array);
        self.add_scaled_index(elem, base, index)
    }

    fn ld_array_base(&mut self, _elem: OpType, array: IpfOpnd) -> IpfOpnd {
        IpfOpnd::Reg(self.def(Mnemonic::Adds, false, &[Operand::Imm(ARRAY_DATA_OFFSET), array.op()]))
    }

    fn add_scaled_index(&mut self, elem: OpType, ptr: IpfOpnd, index: IpfOpnd) -> IpfOpnd {
        let shift = Self::log2_size(elem);
        if shift == 0 {
            return IpfOpnd::Reg(self.def(Mnemonic::Add, false, &[ptr.op(), index.op()]));
        }
        IpfOpnd::Reg(self.def(Mnemonic::Shladd, false, &[index.op(), Operand::Imm(shift), ptr.op()]))
    }

    fn ld_array_len(&mut self, array: IpfOpnd) -> IpfOpnd {
        let addr = self.def(Mnemonic::Adds, false, &[Operand::Imm(ARRAY_LENGTH_OFFSET), array.op()]);
        IpfOpnd::Reg(self.def(Mnemonic::Ld(4), false, &[Operand::Mem(addr)]))
    }

    fn ld_ind(&mut self, ty: OpType, addr: IpfOpnd, compress: AutoCompress) -> IpfOpnd {
        let mem = Operand::Mem(addr.reg());
        if ty.is_float() {
            return IpfOpnd::Reg(self.def(Mnemonic::Ldf(ty.size() as u8), true, &[mem]));
        }
        if compress == AutoCompress::Yes && ty == OpType::Ref {
            let narrow = self.def_flags(Mnemonic::Ld(4), &[mem], MFlags::COMPRESSED);
            let base = self.heap_base();
            return IpfOpnd::Reg(self.def(Mnemonic::Add, false, &[narrow.into(), base.into()]));
        }
        let size = ty.size().clamp(1, 8) as u8;
        let r = self.def(Mnemonic::Ld(size), false, &[mem]);
        // Loads zero-extend.
        if size < 8 && !ty.is_unsigned() && !ty.is_ref() {
            return IpfOpnd::Reg(self.def(Mnemonic::Sxt(size), false, &[r.into()]));
        }
        IpfOpnd::Reg(r)
    }

    fn st_ind(&mut self, ty: OpType, addr: IpfOpnd, value: IpfOpnd, compress: AutoCompress) {
        let mem = Operand::Mem(addr.reg());
        if ty.is_float() {
            self.emit(MInst::new(Mnemonic::Stf(ty.size() as u8), &[mem], &[value.op()]));
            return;
        }
        if compress == AutoCompress::Yes && ty == OpType::Ref {
            let base = self.heap_base();
            let narrow = self.def(Mnemonic::Sub, false, &[value.op(), base.into()]);
            self.emit(MInst::new(Mnemonic::St(4), &[mem], &[narrow.into()]).with_flags(MFlags::COMPRESSED));
            return;
        }
        let size = ty.size().clamp(1, 8) as u8;
        self.emit(MInst::new(Mnemonic::St(size), &[mem], &[value.op()]));
    }

    fn compress_ref(&mut self, obj: IpfOpnd) -> IpfOpnd {
        let base = self.heap_base();
        IpfOpnd::Reg(self.def_flags(Mnemonic::Sub, &[obj.op(), base.into()], MFlags::COMPRESSED))
    }

    fn uncompress_ref(&mut self, obj: IpfOpnd) -> IpfOpnd {
        let base = self.heap_base();
        IpfOpnd::Reg(self.def(Mnemonic::Add, false, &[obj.op(), base.into()]))
    }

    // -------------------------------------------------------------------------
    // Objects
    // -------------------------------------------------------------------------

    fn new_obj(&mut self, ty: TypeId) -> IpfOpnd {
        let t = self.type_arg(ty);
        self.runtime(RuntimeFn::NewObj, &[t], Some(false)).unwrap_or(IpfOpnd::Tau)
    }

    fn new_array(&mut self, ty: TypeId, len: IpfOpnd) -> IpfOpnd {
        let t = self.type_arg(ty);
        self.runtime(RuntimeFn::NewArray, &[t, len], Some(false)).unwrap_or(IpfOpnd::Tau)
    }

    fn monitor_enter(&mut self, obj: IpfOpnd) {
        self.runtime(RuntimeFn::MonitorEnter, &[obj], None);
    }

    fn monitor_exit(&mut self, obj: IpfOpnd) {
        self.runtime(RuntimeFn::MonitorExit, &[obj], None);
    }

    // -------------------------------------------------------------------------
    // Proofs and checks
    // -------------------------------------------------------------------------

    fn tau_point(&mut self) -> IpfOpnd {
        IpfOpnd::Tau
    }

    fn check_null(&mut self, obj: IpfOpnd) -> IpfOpnd {
        let (pt, _) = self.compare(CmpOp::Zero, CmpType::Ref, obj, None);
        self.trap_if(pt, RuntimeFn::ThrowNull);
        IpfOpnd::Tau
    }

    fn check_bounds(&mut self, len: IpfOpnd, index: IpfOpnd) -> IpfOpnd {
        // One unsigned compare also catches negative indices.
        let (pt, _) = self.compare(CmpOp::GeUn, CmpType::I4, index, Some(len));
        self.trap_if(pt, RuntimeFn::ThrowBounds);
        IpfOpnd::Tau
    }

    fn check_zero(&mut self, value: IpfOpnd) -> IpfOpnd {
        let (pt, _) = self.compare(CmpOp::Zero, CmpType::I8, value, None);
        self.trap_if(pt, RuntimeFn::ThrowDivZero);
        IpfOpnd::Tau
    }

    fn check_cast(&mut self, obj: IpfOpnd, ty: TypeId) -> IpfOpnd {
        let t = self.type_arg(ty);
        self.runtime(RuntimeFn::CheckCast, &[obj, t], None);
        IpfOpnd::Tau
    }

    fn static_cast(&mut self, obj: IpfOpnd, _ty: TypeId) -> IpfOpnd {
        obj
    }

    fn as_type(&mut self, obj: IpfOpnd, ty: TypeId) -> IpfOpnd {
        let t = self.type_arg(ty);
        self.runtime(RuntimeFn::AsType, &[obj, t], Some(false)).unwrap_or(IpfOpnd::Tau)
    }

    fn instance_of(&mut self, obj: IpfOpnd, ty: TypeId) -> IpfOpnd {
        let t = self.type_arg(ty);
        self.runtime(RuntimeFn::InstanceOf, &[obj, t], Some(false)).unwrap_or(IpfOpnd::Tau)
    }

    // -------------------------------------------------------------------------
    // Vectors
    // -------------------------------------------------------------------------

    fn vec_pack(&mut self, _ty: OpType, lanes: &[IpfOpnd]) -> IpfOpnd {
        let srcs: SmallVec<[Operand; 4]> = lanes.iter().map(|l| l.op()).collect();
        IpfOpnd::Reg(self.def(Mnemonic::Pack, false, &srcs))
    }

    fn vec_extract(&mut self, ty: OpType, vec: IpfOpnd, lane: u32) -> IpfOpnd {
        let float = matches!(ty, OpType::Vector { float: true, .. });
        IpfOpnd::Reg(self.def(Mnemonic::Extr, float, &[vec.op(), Operand::Imm(lane as i64)]))
    }
}

impl IpfCodeGen {
    /// Add `flags` to the last instruction emitted into the current node.
    fn cfg_last_flags(&mut self, flags: MFlags) {
        let node = self.cur.unwrap_or(self.cfg.entry);
        if let Some(last) = self.cfg.node_mut(node).insts.last_mut() {
            last.flags |= flags;
        }
    }
}

fn cmp_type(op: ArithOp) -> CmpType {
    match op {
        ArithOp::I4 | ArithOp::I4Ovf | ArithOp::U4Ovf => CmpType::I4,
        ArithOp::I8 | ArithOp::I8Ovf | ArithOp::U8Ovf => CmpType::I8,
        ArithOp::F4 => CmpType::F4,
        ArithOp::F8 => CmpType::F8,
        _ => CmpType::I,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::layout::{linearize, LayoutConfig, LayoutStrategy};
    use crate::codegen::{select_method, SelectorConfig};
    use crate::ir::builder::IrBuilder;
    use crate::ir::method::MethodIr;
    use crate::ir::opcode::CmpMod;
    use crate::ir::types::TypeManager;

    fn lower(ir: &MethodIr) -> MachineCfg {
        let mut cg = IpfCodeGen::new();
        select_method(ir, &mut cg, &SelectorConfig::default()).unwrap();
        cg.finish()
    }

    fn ops(cfg: &MachineCfg) -> Vec<Mnemonic> {
        cfg.node_ids()
            .flat_map(|n| cfg.node(n).insts.iter().map(|i| i.op))
            .collect()
    }

    fn abs_method() -> MethodIr {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("abs", tm, i32_);
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(i32_, 0);
        let zero = b.i32(0);
        let (neg, pos) = (b.new_block(), b.new_block());
        b.branch(CmpMod::Lt, a, Some(zero), neg, pos, 0.5);
        b.switch_to(neg);
        let n = b.sub(zero, a);
        b.ret(Some(n));
        b.switch_to(pos);
        b.ret(Some(a));
        ir
    }

    #[test]
    fn test_branch_is_compare_plus_predicated_jump() {
        let cfg = lower(&abs_method());
        let entry = cfg.node(cfg.entry);
        let br = entry.insts.last().unwrap();
        assert_eq!(br.op, Mnemonic::BrCond);
        let cmp = entry
            .insts
            .iter()
            .find(|i| matches!(i.op, Mnemonic::Cmp { width: 4, .. }))
            .unwrap();
        assert_eq!(cmp.dsts.len(), 2);
        assert_eq!(cmp.dsts[0], Operand::Reg(br.qp));
        assert!(cfg.can_invert(cfg.entry));
    }

    #[test]
    fn test_arguments_come_from_stacked_registers() {
        let cfg = lower(&abs_method());
        let arg = cfg.node(cfg.entry).insts.first().unwrap();
        assert_eq!(arg.op, Mnemonic::Mov);
        assert_eq!(arg.srcs[0], Operand::Reg(Reg::Gr(32)));
        assert_eq!(cfg.num_args, 1);
    }

    #[test]
    fn test_returns_move_into_r8() {
        let cfg = lower(&abs_method());
        let rets = ops(&cfg).iter().filter(|&&m| m == Mnemonic::BrRet).count();
        assert_eq!(rets, 2);
        let moves_to_r8 = cfg
            .node_ids()
            .flat_map(|n| cfg.node(n).insts.iter())
            .filter(|i| i.dsts.first() == Some(&Operand::Reg(Reg::RET)))
            .count();
        assert_eq!(moves_to_r8, 2);
    }

    #[test]
    fn test_int32_results_are_sign_extended() {
        let cfg = lower(&abs_method());
        let all = ops(&cfg);
        let sub = all.iter().position(|&m| m == Mnemonic::Sub).unwrap();
        assert_eq!(all[sub + 1], Mnemonic::Sxt(4));
    }

    #[test]
    fn test_call_records_out_args_and_result() {
        let mut tm = TypeManager::new();
        let i32_ = tm.int32();
        let callee = tm.define_method("callee", None, vec![i32_, i32_], i32_, true);
        let mut ir = MethodIr::new("caller", tm, i32_);
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(i32_, 0);
        let one = b.i32(1);
        let r = b.call(callee, &[a, one], &[]).unwrap();
        b.ret(Some(r));
        let cfg = lower(&ir);
        assert!(cfg.has_call());
        assert_eq!(cfg.max_out_args, 2);
        let insts = &cfg.node(cfg.entry).insts;
        let call = insts.iter().position(|i| i.op == Mnemonic::BrCall).unwrap();
        assert_eq!(insts[call - 1].dsts[0], Operand::Reg(Reg::Out(1)));
        assert_eq!(insts[call + 1].srcs[0], Operand::Reg(Reg::RET));
    }

    #[test]
    fn test_profile_marks_machine_cfg() {
        let mut ir = abs_method();
        ir.has_profile = true;
        let cfg = lower(&ir);
        assert!(cfg.has_profile);
        assert!(!lower(&abs_method()).has_profile);
    }

    #[test]
    fn test_lowered_cfg_lays_out_under_every_strategy() {
        for strategy in [LayoutStrategy::Topological, LayoutStrategy::TopDown, LayoutStrategy::BottomUp] {
            let mut cfg = lower(&abs_method());
            let stats = linearize(&mut cfg, &LayoutConfig::for_testing(strategy)).unwrap();
            assert!(stats.blocks >= 4);
            assert_eq!(cfg.layout_order().len(), stats.blocks);
        }
    }

    #[test]
    fn test_bc_offsets_are_carried() {
        let tm = TypeManager::new();
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("bc", tm, i32_);
        let mut b = IrBuilder::new(&mut ir);
        b.set_bc_offset(Some(3));
        let a = b.def_arg(i32_, 0);
        b.set_bc_offset(Some(9));
        let y = b.add(a, a);
        b.ret(Some(y));
        let cfg = lower(&ir);
        let insts = &cfg.node(cfg.entry).insts;
        assert_eq!(insts[0].bc_offset, Some(3));
        let add = insts.iter().find(|i| i.op == Mnemonic::Add).unwrap();
        assert_eq!(add.bc_offset, Some(9));
    }
}
