//! Typed construction of HIR.
//!
//! The builder appends to a current block and wires terminators to their CFG
//! edges. Passes use it for the code they synthesize; tests use it to write
//! methods by hand.

use super::inst::{ConstValue, InstId, OpndId, Payload, VmHelper};
use super::method::{BlockId, EdgeId, EdgeKind, MethodIr};
use super::opcode::{CmpMod, InstFlags, Modifier, Opcode, OverflowMod};
use super::types::{FieldId, MethodId, TypeId};
use smallvec::SmallVec;

/// Appends instructions to a block of a [`MethodIr`].
pub struct IrBuilder<'a> {
    ir: &'a mut MethodIr,
    block: BlockId,
    bc_offset: Option<u32>,
}

impl<'a> IrBuilder<'a> {
    /// Start building at the end of the entry block.
    pub fn new(ir: &'a mut MethodIr) -> Self {
        let block = ir.entry;
        IrBuilder {
            ir,
            block,
            bc_offset: None,
        }
    }

    pub fn ir(&mut self) -> &mut MethodIr {
        self.ir
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.block = block;
    }

    pub fn new_block(&mut self) -> BlockId {
        self.ir.new_block()
    }

    /// Bytecode offset stamped on subsequent instructions.
    pub fn set_bc_offset(&mut self, offset: Option<u32>) {
        self.bc_offset = offset;
    }

    fn emit(
        &mut self,
        opcode: Opcode,
        modifier: Modifier,
        ty: TypeId,
        srcs: &[OpndId],
        payload: Payload,
    ) -> (InstId, OpndId) {
        let dst = self.ir.new_temp(ty);
        let inst = self.ir.create_inst(opcode, modifier, ty, Some(dst), srcs, payload);
        self.ir.inst_mut(inst).bc_offset = self.bc_offset;
        self.ir.append_inst(self.block, inst);
        (inst, dst)
    }

    fn emit_void(&mut self, opcode: Opcode, modifier: Modifier, srcs: &[OpndId], payload: Payload) -> InstId {
        let void = self.ir.types.void();
        let inst = self.ir.create_inst(opcode, modifier, void, None, srcs, payload);
        self.ir.inst_mut(inst).bc_offset = self.bc_offset;
        self.ir.append_inst(self.block, inst);
        inst
    }

    fn value(&mut self, opcode: Opcode, ty: TypeId, srcs: &[OpndId], payload: Payload) -> OpndId {
        self.emit(opcode, Modifier::NONE, ty, srcs, payload).1
    }

    // -------------------------------------------------------------------------
    // Constants and arguments
    // -------------------------------------------------------------------------

    pub fn iconst(&mut self, ty: TypeId, v: i64) -> OpndId {
        self.value(Opcode::LdConstant, ty, &[], Payload::Const(ConstValue::Int(v)))
    }

    pub fn i32(&mut self, v: i32) -> OpndId {
        let t = self.ir.types.int32();
        self.iconst(t, v as i64)
    }

    pub fn i64(&mut self, v: i64) -> OpndId {
        let t = self.ir.types.int64();
        self.iconst(t, v)
    }

    pub fn fconst(&mut self, ty: TypeId, v: f64) -> OpndId {
        self.value(Opcode::LdConstant, ty, &[], Payload::Const(ConstValue::Float(v)))
    }

    pub fn null(&mut self) -> OpndId {
        let t = self.ir.types.null_object();
        self.value(Opcode::LdNull, t, &[], Payload::None)
    }

    pub fn ld_ref(&mut self, index: u32) -> OpndId {
        let t = self.ir.types.root_object();
        self.value(Opcode::LdRef, t, &[], Payload::Str(index))
    }

    pub fn def_arg(&mut self, ty: TypeId, index: u32) -> OpndId {
        self.value(Opcode::DefArg, ty, &[], Payload::Arg(index))
    }

    pub fn ld_field_offset(&mut self, field: FieldId) -> OpndId {
        let t = self.ir.types.int_ptr();
        self.value(Opcode::LdFieldOffset, t, &[], Payload::Field(field))
    }

    // -------------------------------------------------------------------------
    // Arithmetic
    // -------------------------------------------------------------------------

    pub fn binary(&mut self, op: Opcode, ty: TypeId, a: OpndId, b: OpndId) -> OpndId {
        self.value(op, ty, &[a, b], Payload::None)
    }

    pub fn binary_mod(&mut self, op: Opcode, modifier: Modifier, ty: TypeId, a: OpndId, b: OpndId) -> OpndId {
        self.emit(op, modifier, ty, &[a, b], Payload::None).1
    }

    /// `a + b` typed like `a`.
    pub fn add(&mut self, a: OpndId, b: OpndId) -> OpndId {
        let ty = self.ir.opnd_ty(a);
        self.binary(Opcode::Add, ty, a, b)
    }

    /// Overflow-checked addition.
    pub fn add_ovf(&mut self, a: OpndId, b: OpndId, overflow: OverflowMod) -> OpndId {
        let ty = self.ir.opnd_ty(a);
        self.binary_mod(Opcode::Add, Modifier::overflow(overflow), ty, a, b)
    }

    pub fn sub(&mut self, a: OpndId, b: OpndId) -> OpndId {
        let ty = self.ir.opnd_ty(a);
        self.binary(Opcode::Sub, ty, a, b)
    }

    pub fn mul(&mut self, a: OpndId, b: OpndId) -> OpndId {
        let ty = self.ir.opnd_ty(a);
        self.binary(Opcode::Mul, ty, a, b)
    }

    pub fn shl(&mut self, a: OpndId, b: OpndId) -> OpndId {
        let ty = self.ir.opnd_ty(a);
        self.binary(Opcode::Shl, ty, a, b)
    }

    /// `(a << shift) + b`.
    pub fn shl_add(&mut self, a: OpndId, shift: OpndId, b: OpndId) -> OpndId {
        let ty = self.ir.opnd_ty(a);
        self.value(Opcode::ShlAdd, ty, &[a, shift, b], Payload::None)
    }

    pub fn unary(&mut self, op: Opcode, a: OpndId) -> OpndId {
        let ty = self.ir.opnd_ty(a);
        self.value(op, ty, &[a], Payload::None)
    }

    /// Signed division guarded by `tau`.
    pub fn div(&mut self, a: OpndId, b: OpndId, tau: OpndId) -> OpndId {
        let ty = self.ir.opnd_ty(a);
        let m = Modifier::NONE.with_flags(InstFlags::SIGNED);
        self.emit(Opcode::TauDiv, m, ty, &[a, b, tau], Payload::None).1
    }

    pub fn rem(&mut self, a: OpndId, b: OpndId, tau: OpndId) -> OpndId {
        let ty = self.ir.opnd_ty(a);
        let m = Modifier::NONE.with_flags(InstFlags::SIGNED);
        self.emit(Opcode::TauRem, m, ty, &[a, b, tau], Payload::None).1
    }

    pub fn cmp(&mut self, cmp: CmpMod, a: OpndId, b: OpndId) -> OpndId {
        let t = self.ir.types.boolean();
        self.emit(Opcode::Cmp, Modifier::cmp(cmp), t, &[a, b], Payload::None).1
    }

    /// `cmp(a, b) ? x : y`.
    pub fn select(&mut self, cmp: CmpMod, a: OpndId, b: OpndId, x: OpndId, y: OpndId) -> OpndId {
        let ty = self.ir.opnd_ty(x);
        self.emit(Opcode::Select, Modifier::cmp(cmp), ty, &[a, b, x, y], Payload::None).1
    }

    pub fn conv(&mut self, ty: TypeId, src: OpndId, signed: bool) -> OpndId {
        let m = if signed {
            Modifier::NONE.with_flags(InstFlags::SIGNED)
        } else {
            Modifier::NONE
        };
        self.emit(Opcode::Conv, m, ty, &[src], Payload::Type(ty)).1
    }

    pub fn copy(&mut self, src: OpndId) -> OpndId {
        let ty = self.ir.opnd_ty(src);
        self.value(Opcode::Copy, ty, &[src], Payload::None)
    }

    // -------------------------------------------------------------------------
    // Variables and phis
    // -------------------------------------------------------------------------

    pub fn ld_var(&mut self, var: OpndId) -> OpndId {
        let ty = self.ir.opnd_ty(var);
        self.value(Opcode::LdVar, ty, &[var], Payload::None)
    }

    /// `dst_version = stvar src`.
    pub fn st_var(&mut self, dst: OpndId, src: OpndId) -> InstId {
        let ty = self.ir.opnd_ty(dst);
        let inst = self
            .ir
            .create_inst(Opcode::StVar, Modifier::NONE, ty, Some(dst), &[src], Payload::None);
        self.ir.inst_mut(inst).bc_offset = self.bc_offset;
        self.ir.append_inst(self.block, inst);
        inst
    }

    /// Temp phi at the start of the current block.
    pub fn phi(&mut self, ty: TypeId, srcs: &[OpndId]) -> OpndId {
        let dst = self.ir.new_temp(ty);
        self.phi_into(dst, srcs);
        dst
    }

    /// Phi defining an existing operand, e.g. an SSA variable version.
    pub fn phi_into(&mut self, dst: OpndId, srcs: &[OpndId]) -> InstId {
        let ty = self.ir.opnd_ty(dst);
        let inst = self
            .ir
            .create_inst(Opcode::Phi, Modifier::NONE, ty, Some(dst), srcs, Payload::None);
        let pos = self.ir.phis(self.block).count();
        self.ir.insert_at(self.block, pos, inst);
        inst
    }

    // -------------------------------------------------------------------------
    // Objects and memory
    // -------------------------------------------------------------------------

    pub fn new_obj(&mut self, ty: TypeId) -> OpndId {
        self.value(Opcode::NewObj, ty, &[], Payload::Type(ty))
    }

    pub fn new_array(&mut self, array_ty: TypeId, len: OpndId) -> OpndId {
        self.value(Opcode::NewArray, array_ty, &[len], Payload::Type(array_ty))
    }

    pub fn array_len(&mut self, array: OpndId, tau_nonnull: OpndId) -> OpndId {
        let t = self.ir.types.int32();
        self.value(Opcode::LdArrayLen, t, &[array, tau_nonnull], Payload::None)
    }

    /// Managed pointer to element 0.
    pub fn ld_array_base(&mut self, array: OpndId) -> OpndId {
        let arr_ty = self.ir.opnd_ty(array);
        let elem = self
            .ir
            .types
            .element_type(arr_ty)
            .unwrap_or_else(|| self.ir.types.int32());
        let ptr = self.ir.types.managed_ptr(elem);
        self.value(Opcode::LdArrayBaseAddr, ptr, &[array], Payload::None)
    }

    /// `ptr + index * sizeof(*ptr)`.
    pub fn add_scaled_index(&mut self, ptr: OpndId, index: OpndId) -> OpndId {
        let ty = self.ir.opnd_ty(ptr);
        self.value(Opcode::AddScaledIndex, ty, &[ptr, index], Payload::None)
    }

    pub fn ld_elem_addr(&mut self, array: OpndId, index: OpndId) -> OpndId {
        let arr_ty = self.ir.opnd_ty(array);
        let elem = self
            .ir
            .types
            .element_type(arr_ty)
            .unwrap_or_else(|| self.ir.types.int32());
        let ptr = self.ir.types.managed_ptr(elem);
        self.value(Opcode::LdElemAddr, ptr, &[array, index], Payload::None)
    }

    pub fn ld_field_addr(&mut self, obj: OpndId, field: FieldId) -> OpndId {
        let fty = self.ir.types.field(field).ty;
        let ptr = self.ir.types.managed_ptr(fty);
        self.value(Opcode::LdFieldAddr, ptr, &[obj], Payload::Field(field))
    }

    pub fn ld_static_addr(&mut self, field: FieldId) -> OpndId {
        let fty = self.ir.types.field(field).ty;
        let ptr = self.ir.types.managed_ptr(fty);
        self.value(Opcode::LdStaticAddr, ptr, &[], Payload::Field(field))
    }

    /// Load through `addr`, justified by a non-null and an in-range proof.
    pub fn ld_ind(&mut self, ty: TypeId, addr: OpndId, tau_base: OpndId, tau_range: OpndId) -> OpndId {
        self.value(Opcode::TauLdInd, ty, &[addr, tau_base, tau_range], Payload::None)
    }

    pub fn st_ind(&mut self, value: OpndId, addr: OpndId, tau_base: OpndId, tau_range: OpndId) -> InstId {
        self.emit_void(Opcode::TauStInd, Modifier::NONE, &[value, addr, tau_base, tau_range], Payload::None)
    }

    pub fn compress(&mut self, obj: OpndId) -> OpndId {
        let t = self.ir.opnd_ty(obj);
        let ct = self.ir.types.compressed(t);
        self.value(Opcode::CompressRef, ct, &[obj], Payload::None)
    }

    pub fn uncompress(&mut self, obj: OpndId) -> OpndId {
        let t = self.ir.opnd_ty(obj);
        let ut = self.ir.types.uncompressed(t);
        self.value(Opcode::UncompressRef, ut, &[obj], Payload::None)
    }

    pub fn ld_vtable(&mut self, obj: OpndId, tau_nonnull: OpndId) -> OpndId {
        let t = self.ir.opnd_ty(obj);
        let vt = self.ir.types.vtable_ptr(t);
        self.value(Opcode::TauLdVTableAddr, vt, &[obj, tau_nonnull], Payload::None)
    }

    pub fn monitor_enter(&mut self, obj: OpndId, tau_nonnull: OpndId) -> InstId {
        self.emit_void(Opcode::TauMonitorEnter, Modifier::NONE, &[obj, tau_nonnull], Payload::None)
    }

    pub fn monitor_exit(&mut self, obj: OpndId, tau_nonnull: OpndId) -> InstId {
        self.emit_void(Opcode::TauMonitorExit, Modifier::NONE, &[obj, tau_nonnull], Payload::None)
    }

    // -------------------------------------------------------------------------
    // Taus
    // -------------------------------------------------------------------------

    pub fn tau_safe(&mut self) -> OpndId {
        self.ir.find_or_create_tau_safe()
    }

    fn tau(&mut self, op: Opcode, srcs: &[OpndId], payload: Payload) -> OpndId {
        let t = self.ir.types.tau();
        self.value(op, t, srcs, payload)
    }

    pub fn tau_has_type(&mut self, src: OpndId, ty: TypeId) -> OpndId {
        self.tau(Opcode::TauHasType, &[src], Payload::Type(ty))
    }

    pub fn tau_has_exact_type(&mut self, src: OpndId, ty: TypeId) -> OpndId {
        self.tau(Opcode::TauHasExactType, &[src], Payload::Type(ty))
    }

    pub fn tau_is_non_null(&mut self, src: OpndId) -> OpndId {
        self.tau(Opcode::TauIsNonNull, &[src], Payload::None)
    }

    pub fn tau_check_null(&mut self, src: OpndId) -> OpndId {
        self.tau(Opcode::TauCheckNull, &[src], Payload::None)
    }

    pub fn tau_check_bounds(&mut self, len: OpndId, index: OpndId) -> OpndId {
        self.tau(Opcode::TauCheckBounds, &[len, index], Payload::None)
    }

    pub fn tau_check_cast(&mut self, src: OpndId, tau_nonnull: OpndId, ty: TypeId) -> OpndId {
        self.tau(Opcode::TauCheckCast, &[src, tau_nonnull], Payload::Type(ty))
    }

    pub fn tau_and(&mut self, taus: &[OpndId]) -> OpndId {
        self.tau(Opcode::TauAnd, taus, Payload::None)
    }

    pub fn tau_point(&mut self) -> OpndId {
        self.tau(Opcode::TauPoint, &[], Payload::None)
    }

    /// Cast already proven valid by `tau_cast`.
    pub fn tau_static_cast(&mut self, src: OpndId, tau_cast: OpndId, ty: TypeId) -> OpndId {
        self.value(Opcode::TauStaticCast, ty, &[src, tau_cast], Payload::Type(ty))
    }

    /// Cast yielding null when `src` is not an instance of `ty`.
    pub fn tau_as_type(&mut self, src: OpndId, tau_nonnull: OpndId, ty: TypeId) -> OpndId {
        self.value(Opcode::TauAsType, ty, &[src, tau_nonnull], Payload::Type(ty))
    }

    pub fn tau_instance_of(&mut self, src: OpndId, tau_nonnull: OpndId, ty: TypeId) -> OpndId {
        let b = self.ir.types.int32();
        self.value(Opcode::TauInstanceOf, b, &[src, tau_nonnull], Payload::Type(ty))
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    /// Direct call; `taus` are appended after the arguments.
    pub fn call(&mut self, method: MethodId, args: &[OpndId], taus: &[OpndId]) -> Option<OpndId> {
        let ret = self.ir.types.method(method).ret;
        let mut srcs: SmallVec<[OpndId; 8]> = SmallVec::from_slice(args);
        srcs.extend_from_slice(taus);
        self.call_inst(Opcode::DirectCall, ret, &srcs, Payload::Method(method))
    }

    /// Call through a function pointer, which is the first source.
    pub fn call_indirect(&mut self, ret: TypeId, target: OpndId, args: &[OpndId]) -> Option<OpndId> {
        let mut srcs: SmallVec<[OpndId; 8]> = SmallVec::new();
        srcs.push(target);
        srcs.extend_from_slice(args);
        self.call_inst(Opcode::IndirectCall, ret, &srcs, Payload::None)
    }

    pub fn call_helper(&mut self, helper: VmHelper, ret: TypeId, args: &[OpndId]) -> Option<OpndId> {
        self.call_inst(Opcode::VmHelperCall, ret, args, Payload::Helper(helper))
    }

    fn call_inst(&mut self, op: Opcode, ret: TypeId, srcs: &[OpndId], payload: Payload) -> Option<OpndId> {
        if ret == self.ir.types.void() {
            self.emit_void(op, Modifier::NONE, srcs, payload);
            None
        } else {
            Some(self.value(op, ret, srcs, payload))
        }
    }

    // -------------------------------------------------------------------------
    // Vectors
    // -------------------------------------------------------------------------

    pub fn vec_pack(&mut self, vec_ty: TypeId, lanes: &[OpndId]) -> OpndId {
        self.value(Opcode::VecPack, vec_ty, lanes, Payload::None)
    }

    pub fn vec_extract(&mut self, vec: OpndId, lane: u32) -> OpndId {
        let vt = self.ir.opnd_ty(vec);
        let et = self
            .ir
            .types
            .element_type(vt)
            .unwrap_or_else(|| self.ir.types.int32());
        self.value(Opcode::VecExtract, et, &[vec], Payload::Lane(lane))
    }

    // -------------------------------------------------------------------------
    // Terminators
    // -------------------------------------------------------------------------

    /// Unconditional fall into `target`; no instruction is needed.
    pub fn jump(&mut self, target: BlockId) -> EdgeId {
        self.ir.add_edge(self.block, target, EdgeKind::Unconditional, 1.0)
    }

    /// Two-way branch on `cmp(a, b)`; `b` is ignored by unary relations.
    pub fn branch(
        &mut self,
        cmp: CmpMod,
        a: OpndId,
        b: Option<OpndId>,
        on_true: BlockId,
        on_false: BlockId,
        true_prob: f64,
    ) -> InstId {
        let mut srcs: SmallVec<[OpndId; 2]> = SmallVec::new();
        srcs.push(a);
        if let Some(b) = b.filter(|_| !cmp.is_unary()) {
            srcs.push(b);
        }
        let inst = self.emit_void(Opcode::Branch, Modifier::cmp(cmp), &srcs, Payload::None);
        self.ir.add_edge(self.block, on_true, EdgeKind::True, true_prob);
        self.ir.add_edge(self.block, on_false, EdgeKind::False, 1.0 - true_prob);
        inst
    }

    /// Multi-way branch; the last target is the default.
    pub fn switch(&mut self, index: OpndId, targets: &[BlockId]) -> InstId {
        let prob = 1.0 / targets.len().max(1) as f64;
        let mut cases: SmallVec<[EdgeId; 4]> = SmallVec::new();
        for &t in targets {
            let existing = self.ir.block(self.block).out_edges.iter().copied().find(|&e| self.ir.edge(e).target == t);
            let e = match existing {
                Some(e) => {
                    self.ir.edge_mut(e).prob += prob;
                    e
                }
                None => self.ir.add_edge(self.block, t, EdgeKind::Switch, prob),
            };
            cases.push(e);
        }
        self.emit_void(Opcode::Switch, Modifier::NONE, &[index], Payload::Cases(cases))
    }

    pub fn ret(&mut self, value: Option<OpndId>) -> InstId {
        let srcs: SmallVec<[OpndId; 1]> = value.into_iter().collect();
        let inst = self.emit_void(Opcode::Return, Modifier::NONE, &srcs, Payload::None);
        let exit = self.ir.exit;
        self.ir.add_edge(self.block, exit, EdgeKind::Unconditional, 1.0);
        inst
    }

    /// Throw `obj` to `dispatch`, or to the unwind node.
    pub fn throw(&mut self, obj: OpndId, dispatch: Option<BlockId>) -> InstId {
        let inst = self.emit_void(Opcode::Throw, Modifier::NONE, &[obj], Payload::None);
        let target = match dispatch {
            Some(d) => d,
            None => self.ir.unwind_node(),
        };
        self.ir.add_edge(self.block, target, EdgeKind::Dispatch, 1.0);
        inst
    }
}
