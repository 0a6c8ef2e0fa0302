//! Callback contracts between the instruction selector and a backend.
//!
//! The selector never looks inside a backend value. Every lowered value is an
//! opaque [`InstructionCallback::Handle`] that the selector only stores and
//! passes back. Inputs are typed by the small closed enums in this module,
//! never by strings.
//!
//! Three levels mirror the shape of a method:
//!
//! - [`MethodCallback`]: method start/end and variable declarations
//! - [`CfgCallback`]: node creation (dense ids) and edges
//! - [`InstructionCallback`]: one call per HIR instruction

use crate::ir::inst::VmHelper;
use crate::ir::types::{FieldId, MethodId, TypeId, TypeKind, TypeManager};
use std::fmt;

// =============================================================================
// Type tags
// =============================================================================

/// Operand class as seen by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    I1,
    I2,
    I4,
    I8,
    /// Pointer-sized signed integer.
    I,
    U1,
    U2,
    U4,
    U8,
    F4,
    F8,
    Ref,
    CompressedRef,
    /// Managed, unmanaged or vtable pointer.
    Ptr,
    Vector { elem_bits: u8, lanes: u8, float: bool },
    Tau,
    Void,
}

impl OpType {
    /// Classify an HIR type.
    pub fn of(types: &TypeManager, ty: TypeId) -> OpType {
        match types.kind(ty) {
            TypeKind::Void => OpType::Void,
            TypeKind::Boolean | TypeKind::UInt8 => OpType::U1,
            TypeKind::Char | TypeKind::UInt16 => OpType::U2,
            TypeKind::Int8 => OpType::I1,
            TypeKind::Int16 => OpType::I2,
            TypeKind::Int32 => OpType::I4,
            TypeKind::Int64 => OpType::I8,
            TypeKind::IntPtr => OpType::I,
            TypeKind::UInt32 => OpType::U4,
            TypeKind::UInt64 => OpType::U8,
            TypeKind::Single => OpType::F4,
            TypeKind::Double => OpType::F8,
            TypeKind::Tau => OpType::Tau,
            TypeKind::NullObject | TypeKind::Object | TypeKind::Array => OpType::Ref,
            TypeKind::CompressedNull | TypeKind::CompressedObject | TypeKind::CompressedArray => OpType::CompressedRef,
            TypeKind::ManagedPtr | TypeKind::UnmanagedPtr | TypeKind::VTablePtr => OpType::Ptr,
            TypeKind::Vector => {
                let elem = types.element_type(ty);
                let bits = elem.and_then(|e| types.bit_width(e)).unwrap_or(32);
                OpType::Vector {
                    elem_bits: bits as u8,
                    lanes: types.lanes(ty) as u8,
                    float: elem.is_some_and(|e| types.is_floating(e)),
                }
            }
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, OpType::F4 | OpType::F8)
    }

    pub fn is_ref(self) -> bool {
        matches!(self, OpType::Ref | OpType::CompressedRef | OpType::Ptr)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, OpType::U1 | OpType::U2 | OpType::U4 | OpType::U8)
    }

    /// Width in bytes of a scalar, 0 for `Tau` and `Void`.
    pub fn size(self) -> u32 {
        match self {
            OpType::I1 | OpType::U1 => 1,
            OpType::I2 | OpType::U2 => 2,
            OpType::I4 | OpType::U4 | OpType::F4 | OpType::CompressedRef => 4,
            OpType::I8 | OpType::U8 | OpType::I | OpType::F8 | OpType::Ref | OpType::Ptr => 8,
            OpType::Vector { elem_bits, lanes, .. } => elem_bits as u32 / 8 * lanes as u32,
            OpType::Tau | OpType::Void => 0,
        }
    }
}

/// Integer arithmetic form: base width plus overflow checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    I4,
    I4Ovf,
    U4Ovf,
    I8,
    I8Ovf,
    U8Ovf,
    I,
    IOvf,
    UOvf,
    F4,
    F8,
}

impl ArithOp {
    /// Combine an operand class with the overflow modifier. An operation
    /// marked exception-never drops its overflow check.
    pub fn new(ty: OpType, overflow: crate::ir::opcode::OverflowMod, exception_never: bool) -> Option<ArithOp> {
        use crate::ir::opcode::OverflowMod;
        let ovf = if exception_never { OverflowMod::None } else { overflow };
        Some(match (ty, ovf) {
            (OpType::F4, _) => ArithOp::F4,
            (OpType::F8, _) => ArithOp::F8,
            (OpType::I1 | OpType::I2 | OpType::I4 | OpType::U1 | OpType::U2 | OpType::U4, OverflowMod::None) => {
                ArithOp::I4
            }
            (OpType::I1 | OpType::I2 | OpType::I4 | OpType::U1 | OpType::U2 | OpType::U4, OverflowMod::Signed) => {
                ArithOp::I4Ovf
            }
            (OpType::I1 | OpType::I2 | OpType::I4 | OpType::U1 | OpType::U2 | OpType::U4, OverflowMod::Unsigned) => {
                ArithOp::U4Ovf
            }
            (OpType::I8 | OpType::U8, OverflowMod::None) => ArithOp::I8,
            (OpType::I8 | OpType::U8, OverflowMod::Signed) => ArithOp::I8Ovf,
            (OpType::I8 | OpType::U8, OverflowMod::Unsigned) => ArithOp::U8Ovf,
            (OpType::I, OverflowMod::None) => ArithOp::I,
            (OpType::I, OverflowMod::Signed) => ArithOp::IOvf,
            (OpType::I, OverflowMod::Unsigned) => ArithOp::UOvf,
            _ => return None,
        })
    }

    pub fn checks_overflow(self) -> bool {
        matches!(
            self,
            ArithOp::I4Ovf | ArithOp::U4Ovf | ArithOp::I8Ovf | ArithOp::U8Ovf | ArithOp::IOvf | ArithOp::UOvf
        )
    }

    pub fn is_32bit(self) -> bool {
        matches!(self, ArithOp::I4 | ArithOp::I4Ovf | ArithOp::U4Ovf | ArithOp::F4)
    }
}

/// Division, remainder and high-multiply form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DivOp {
    I4,
    U4,
    I8,
    U8,
    I,
    U,
    F4,
    F8,
}

impl DivOp {
    pub fn new(ty: OpType, signed: bool) -> Option<DivOp> {
        Some(match ty {
            OpType::F4 => DivOp::F4,
            OpType::F8 => DivOp::F8,
            OpType::I1 | OpType::I2 | OpType::I4 | OpType::U1 | OpType::U2 | OpType::U4 => {
                if signed {
                    DivOp::I4
                } else {
                    DivOp::U4
                }
            }
            OpType::I8 | OpType::U8 => {
                if signed {
                    DivOp::I8
                } else {
                    DivOp::U8
                }
            }
            OpType::I => {
                if signed {
                    DivOp::I
                } else {
                    DivOp::U
                }
            }
            _ => return None,
        })
    }
}

/// Integer class of bitwise operations and shifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntOp {
    I4,
    I8,
    I,
}

impl IntOp {
    pub fn new(ty: OpType) -> Option<IntOp> {
        Some(match ty {
            OpType::I1 | OpType::I2 | OpType::I4 | OpType::U1 | OpType::U2 | OpType::U4 => IntOp::I4,
            OpType::I8 | OpType::U8 => IntOp::I8,
            OpType::I | OpType::Ptr => IntOp::I,
            _ => return None,
        })
    }
}

/// Offset type of reference arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefArithOp {
    I4,
    I,
}

/// Comparison relation. `Lt`/`Le` forms are expressed by swapping operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    GtUn,
    Ge,
    GeUn,
    Zero,
    NonZero,
}

impl CmpOp {
    pub fn is_unary(self) -> bool {
        matches!(self, CmpOp::Zero | CmpOp::NonZero)
    }

    /// The relation holding exactly when `self` does not.
    pub fn negate(self) -> Option<CmpOp> {
        Some(match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Zero => CmpOp::NonZero,
            CmpOp::NonZero => CmpOp::Zero,
            _ => return None,
        })
    }
}

/// Operand class of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpType {
    I4,
    I8,
    I,
    Ref,
    CompressedRef,
    F4,
    F8,
}

impl CmpType {
    pub fn new(ty: OpType) -> Option<CmpType> {
        Some(match ty {
            OpType::I1 | OpType::I2 | OpType::I4 | OpType::U1 | OpType::U2 | OpType::U4 => CmpType::I4,
            OpType::I8 | OpType::U8 => CmpType::I8,
            OpType::I | OpType::Ptr => CmpType::I,
            OpType::Ref => CmpType::Ref,
            OpType::CompressedRef => CmpType::CompressedRef,
            OpType::F4 => CmpType::F4,
            OpType::F8 => CmpType::F8,
            _ => return None,
        })
    }
}

/// Lane-wise vector operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VecOp {
    Add,
    Sub,
    Mul,
    Min,
    Max,
    And,
    Or,
    Xor,
}

/// Whether a memory access converts between compressed and full references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutoCompress {
    Yes,
    No,
}

/// Callee of a call instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallTarget<H> {
    Direct(MethodId),
    Indirect(H),
    Helper(VmHelper),
}

/// Backend variable, declared once per HIR variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarHandle(pub u32);

// =============================================================================
// CFG tags
// =============================================================================

/// Kind of a backend CFG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Entry,
    Block,
    Dispatch,
    /// Dispatch node receiving exceptions leaving the method.
    Unwind,
    Exit,
}

/// Kind of a backend CFG edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EdgeTag {
    Unconditional,
    True,
    False,
    Switch,
    Dispatch,
    Catch { priority: u32, exception: TypeId },
}

// =============================================================================
// Callbacks
// =============================================================================

/// Method-level events.
pub trait MethodCallback {
    fn method_start(&mut self, name: &str, args: &[OpType], ret: OpType);
    fn declare_var(&mut self, ty: OpType) -> VarHandle;
    fn method_end(&mut self);
}

/// CFG construction. Node ids are dense, assigned in the order nodes are
/// generated.
pub trait CfgCallback {
    /// `persistent_id` names the HIR block the node comes from.
    fn gen_node(&mut self, kind: NodeKind, persistent_id: u32, exec_count: f64) -> u32;
    /// `prob` is `-1.0` when the method has no profile.
    fn gen_edge(&mut self, from: u32, to: u32, tag: EdgeTag, prob: f64);
    /// Subsequent instruction callbacks append to `node`.
    fn begin_node(&mut self, node: u32);
    fn end_node(&mut self, node: u32);
}

/// One lowering call per HIR instruction.
pub trait InstructionCallback {
    type Handle: Copy + fmt::Debug;

    /// Bytecode offset of the instruction about to be lowered.
    fn set_bc_offset(&mut self, offset: Option<u32>);

    // -------------------------------------------------------------------------
    // Constants and arguments
    // -------------------------------------------------------------------------

    fn ld_const_int(&mut self, ty: OpType, value: i64) -> Self::Handle;
    fn ld_const_float(&mut self, ty: OpType, value: f64) -> Self::Handle;
    fn ld_null(&mut self, compressed: bool) -> Self::Handle;
    fn ld_ref(&mut self, index: u32, compressed: bool) -> Self::Handle;
    fn ld_field_offset(&mut self, field: FieldId, offset: u32) -> Self::Handle;
    fn ld_vtable(&mut self, obj: Self::Handle, compressed: bool) -> Self::Handle;
    fn def_arg(&mut self, index: u32, ty: OpType) -> Self::Handle;

    // -------------------------------------------------------------------------
    // Arithmetic
    // -------------------------------------------------------------------------

    fn add(&mut self, op: ArithOp, a: Self::Handle, b: Self::Handle) -> Self::Handle;
    fn sub(&mut self, op: ArithOp, a: Self::Handle, b: Self::Handle) -> Self::Handle;
    fn mul(&mut self, op: ArithOp, a: Self::Handle, b: Self::Handle) -> Self::Handle;
    fn mul_hi(&mut self, op: DivOp, a: Self::Handle, b: Self::Handle) -> Self::Handle;
    fn div(&mut self, op: DivOp, a: Self::Handle, b: Self::Handle) -> Self::Handle;
    fn rem(&mut self, op: DivOp, a: Self::Handle, b: Self::Handle) -> Self::Handle;
    fn neg(&mut self, op: ArithOp, a: Self::Handle) -> Self::Handle;
    fn min(&mut self, op: ArithOp, a: Self::Handle, b: Self::Handle) -> Self::Handle;
    fn max(&mut self, op: ArithOp, a: Self::Handle, b: Self::Handle) -> Self::Handle;
    fn abs(&mut self, op: ArithOp, a: Self::Handle) -> Self::Handle;
    fn and(&mut self, op: IntOp, a: Self::Handle, b: Self::Handle) -> Self::Handle;
    fn or(&mut self, op: IntOp, a: Self::Handle, b: Self::Handle) -> Self::Handle;
    fn xor(&mut self, op: IntOp, a: Self::Handle, b: Self::Handle) -> Self::Handle;
    fn not(&mut self, op: IntOp, a: Self::Handle) -> Self::Handle;
    fn shl(&mut self, op: IntOp, a: Self::Handle, amount: Self::Handle) -> Self::Handle;
    fn shr(&mut self, op: IntOp, a: Self::Handle, amount: Self::Handle, signed: bool) -> Self::Handle;
    /// `(a << shift) + b`.
    fn shl_add(&mut self, op: IntOp, a: Self::Handle, shift: Self::Handle, b: Self::Handle) -> Self::Handle;
    fn vec_arith(&mut self, op: VecOp, ty: OpType, a: Self::Handle, b: Self::Handle) -> Self::Handle;

    // -------------------------------------------------------------------------
    // Reference arithmetic
    // -------------------------------------------------------------------------

    /// Reference plus integer offset.
    fn add_ref(&mut self, op: RefArithOp, base: Self::Handle, offset: Self::Handle) -> Self::Handle;
    /// Reference minus integer offset.
    fn sub_ref(&mut self, op: RefArithOp, base: Self::Handle, offset: Self::Handle) -> Self::Handle;
    /// Distance between two references.
    fn diff_ref(&mut self, a: Self::Handle, b: Self::Handle) -> Self::Handle;

    // -------------------------------------------------------------------------
    // Comparison and conversion
    // -------------------------------------------------------------------------

    fn cmp(&mut self, op: CmpOp, ty: CmpType, a: Self::Handle, b: Option<Self::Handle>) -> Self::Handle;
    #[allow(clippy::too_many_arguments)]
    fn select(
        &mut self,
        op: CmpOp,
        ty: CmpType,
        a: Self::Handle,
        b: Option<Self::Handle>,
        if_true: Self::Handle,
        if_false: Self::Handle,
    ) -> Self::Handle;
    fn conv(&mut self, to: OpType, from: OpType, src: Self::Handle) -> Self::Handle;
    fn copy(&mut self, src: Self::Handle) -> Self::Handle;

    // -------------------------------------------------------------------------
    // Variables
    // -------------------------------------------------------------------------

    fn ld_var(&mut self, ty: OpType, var: VarHandle) -> Self::Handle;
    fn st_var(&mut self, var: VarHandle, value: Self::Handle);

    // -------------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------------

    /// Conditional branch taken along the node's true edge.
    fn branch(&mut self, op: CmpOp, ty: CmpType, a: Self::Handle, b: Option<Self::Handle>);
    /// Table jump; `targets` are node ids in case order, default last.
    fn switch(&mut self, index: Self::Handle, targets: &[u32]);
    fn ret(&mut self, value: Option<Self::Handle>);
    fn throw(&mut self, obj: Self::Handle);
    fn call(&mut self, target: CallTarget<Self::Handle>, args: &[Self::Handle], ret: OpType) -> Option<Self::Handle>;

    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------

    fn ld_field_addr(&mut self, obj: Self::Handle, offset: u32) -> Self::Handle;
    fn ld_static_addr(&mut self, field: FieldId) -> Self::Handle;
    fn ld_elem_addr(&mut self, elem: OpType, array: Self::Handle, index: Self::Handle) -> Self::Handle;
    fn ld_array_base(&mut self, elem: OpType, array: Self::Handle) -> Self::Handle;
    fn add_scaled_index(&mut self, elem: OpType, ptr: Self::Handle, index: Self::Handle) -> Self::Handle;
    fn ld_array_len(&mut self, array: Self::Handle) -> Self::Handle;
    fn ld_ind(&mut self, ty: OpType, addr: Self::Handle, compress: AutoCompress) -> Self::Handle;
    fn st_ind(&mut self, ty: OpType, addr: Self::Handle, value: Self::Handle, compress: AutoCompress);
    fn compress_ref(&mut self, obj: Self::Handle) -> Self::Handle;
    fn uncompress_ref(&mut self, obj: Self::Handle) -> Self::Handle;

    // -------------------------------------------------------------------------
    // Objects
    // -------------------------------------------------------------------------

    fn new_obj(&mut self, ty: TypeId) -> Self::Handle;
    fn new_array(&mut self, ty: TypeId, len: Self::Handle) -> Self::Handle;
    fn monitor_enter(&mut self, obj: Self::Handle);
    fn monitor_exit(&mut self, obj: Self::Handle);

    // -------------------------------------------------------------------------
    // Proofs and checks
    // -------------------------------------------------------------------------

    /// A proof that needs no code.
    fn tau_point(&mut self) -> Self::Handle;
    fn check_null(&mut self, obj: Self::Handle) -> Self::Handle;
    fn check_bounds(&mut self, len: Self::Handle, index: Self::Handle) -> Self::Handle;
    fn check_zero(&mut self, value: Self::Handle) -> Self::Handle;
    fn check_cast(&mut self, obj: Self::Handle, ty: TypeId) -> Self::Handle;
    fn static_cast(&mut self, obj: Self::Handle, ty: TypeId) -> Self::Handle;
    fn as_type(&mut self, obj: Self::Handle, ty: TypeId) -> Self::Handle;
    fn instance_of(&mut self, obj: Self::Handle, ty: TypeId) -> Self::Handle;

    // -------------------------------------------------------------------------
    // Vectors
    // -------------------------------------------------------------------------

    fn vec_pack(&mut self, ty: OpType, lanes: &[Self::Handle]) -> Self::Handle;
    fn vec_extract(&mut self, ty: OpType, vec: Self::Handle, lane: u32) -> Self::Handle;
}

/// Everything the selector drives.
pub trait CodeGenCallback: MethodCallback + CfgCallback + InstructionCallback {}

impl<T: MethodCallback + CfgCallback + InstructionCallback> CodeGenCallback for T {}

// =============================================================================
// Recording callback
// =============================================================================

/// Logs every callback as text. Handles are sequence numbers.
#[cfg(test)]
pub(crate) mod recorder {
    use super::*;

    #[derive(Debug, Default)]
    pub struct Recorder {
        pub log: Vec<String>,
        pub nodes: Vec<NodeKind>,
        pub edges: Vec<(u32, u32, EdgeTag, f64)>,
        pub bc_offsets: Vec<Option<u32>>,
        next: u32,
        bc: Option<u32>,
    }

    impl Recorder {
        fn value(&mut self, what: String) -> u32 {
            self.next += 1;
            self.log.push(format!("h{} = {}", self.next, what));
            self.bc_offsets.push(self.bc);
            self.next
        }

        fn effect(&mut self, what: String) {
            self.log.push(what);
            self.bc_offsets.push(self.bc);
        }

        /// Log lines whose operation name starts with `op`.
        pub fn count(&self, op: &str) -> usize {
            self.log
                .iter()
                .filter(|l| l.split(" = ").last().is_some_and(|r| r.starts_with(op)))
                .count()
        }
    }

    impl MethodCallback for Recorder {
        fn method_start(&mut self, name: &str, args: &[OpType], ret: OpType) {
            self.effect(format!("method {name} {args:?} -> {ret:?}"));
        }
        fn declare_var(&mut self, ty: OpType) -> VarHandle {
            self.effect(format!("var {ty:?}"));
            VarHandle(self.log.len() as u32)
        }
        fn method_end(&mut self) {
            self.effect("end".to_string());
        }
    }

    impl CfgCallback for Recorder {
        fn gen_node(&mut self, kind: NodeKind, _persistent_id: u32, _exec_count: f64) -> u32 {
            self.nodes.push(kind);
            self.nodes.len() as u32 - 1
        }
        fn gen_edge(&mut self, from: u32, to: u32, tag: EdgeTag, prob: f64) {
            self.edges.push((from, to, tag, prob));
        }
        fn begin_node(&mut self, node: u32) {
            self.effect(format!("node {node}"));
        }
        fn end_node(&mut self, _node: u32) {}
    }

    impl InstructionCallback for Recorder {
        type Handle = u32;

        fn set_bc_offset(&mut self, offset: Option<u32>) {
            self.bc = offset;
        }
        fn ld_const_int(&mut self, ty: OpType, value: i64) -> u32 {
            self.value(format!("const {ty:?} {value}"))
        }
        fn ld_const_float(&mut self, ty: OpType, value: f64) -> u32 {
            self.value(format!("const {ty:?} {value}"))
        }
        fn ld_null(&mut self, compressed: bool) -> u32 {
            self.value(format!("null {compressed}"))
        }
        fn ld_ref(&mut self, index: u32, compressed: bool) -> u32 {
            self.value(format!("ldref {index} {compressed}"))
        }
        fn ld_field_offset(&mut self, _field: FieldId, offset: u32) -> u32 {
            self.value(format!("fieldoffset {offset}"))
        }
        fn ld_vtable(&mut self, obj: u32, _compressed: bool) -> u32 {
            self.value(format!("vtable h{obj}"))
        }
        fn def_arg(&mut self, index: u32, ty: OpType) -> u32 {
            self.value(format!("arg {index} {ty:?}"))
        }
        fn add(&mut self, op: ArithOp, a: u32, b: u32) -> u32 {
            self.value(format!("add {op:?} h{a} h{b}"))
        }
        fn sub(&mut self, op: ArithOp, a: u32, b: u32) -> u32 {
            self.value(format!("sub {op:?} h{a} h{b}"))
        }
        fn mul(&mut self, op: ArithOp, a: u32, b: u32) -> u32 {
            self.value(format!("mul {op:?} h{a} h{b}"))
        }
        fn mul_hi(&mut self, op: DivOp, a: u32, b: u32) -> u32 {
            self.value(format!("mulhi {op:?} h{a} h{b}"))
        }
        fn div(&mut self, op: DivOp, a: u32, b: u32) -> u32 {
            self.value(format!("div {op:?} h{a} h{b}"))
        }
        fn rem(&mut self, op: DivOp, a: u32, b: u32) -> u32 {
            self.value(format!("rem {op:?} h{a} h{b}"))
        }
        fn neg(&mut self, op: ArithOp, a: u32) -> u32 {
            self.value(format!("neg {op:?} h{a}"))
        }
        fn min(&mut self, op: ArithOp, a: u32, b: u32) -> u32 {
            self.value(format!("min {op:?} h{a} h{b}"))
        }
        fn max(&mut self, op: ArithOp, a: u32, b: u32) -> u32 {
            self.value(format!("max {op:?} h{a} h{b}"))
        }
        fn abs(&mut self, op: ArithOp, a: u32) -> u32 {
            self.value(format!("abs {op:?} h{a}"))
        }
        fn and(&mut self, op: IntOp, a: u32, b: u32) -> u32 {
            self.value(format!("and {op:?} h{a} h{b}"))
        }
        fn or(&mut self, op: IntOp, a: u32, b: u32) -> u32 {
            self.value(format!("or {op:?} h{a} h{b}"))
        }
        fn xor(&mut self, op: IntOp, a: u32, b: u32) -> u32 {
            self.value(format!("xor {op:?} h{a} h{b}"))
        }
        fn not(&mut self, op: IntOp, a: u32) -> u32 {
            self.value(format!("not {op:?} h{a}"))
        }
        fn shl(&mut self, op: IntOp, a: u32, amount: u32) -> u32 {
            self.value(format!("shl {op:?} h{a} h{amount}"))
        }
        fn shr(&mut self, op: IntOp, a: u32, amount: u32, signed: bool) -> u32 {
            self.value(format!("shr {op:?} h{a} h{amount} {signed}"))
        }
        fn shl_add(&mut self, op: IntOp, a: u32, shift: u32, b: u32) -> u32 {
            self.value(format!("shladd {op:?} h{a} h{shift} h{b}"))
        }
        fn vec_arith(&mut self, op: VecOp, ty: OpType, a: u32, b: u32) -> u32 {
            self.value(format!("vec {op:?} {ty:?} h{a} h{b}"))
        }
        fn add_ref(&mut self, op: RefArithOp, base: u32, offset: u32) -> u32 {
            self.value(format!("addref {op:?} h{base} h{offset}"))
        }
        fn sub_ref(&mut self, op: RefArithOp, base: u32, offset: u32) -> u32 {
            self.value(format!("subref {op:?} h{base} h{offset}"))
        }
        fn diff_ref(&mut self, a: u32, b: u32) -> u32 {
            self.value(format!("diffref h{a} h{b}"))
        }
        fn cmp(&mut self, op: CmpOp, ty: CmpType, a: u32, b: Option<u32>) -> u32 {
            self.value(format!("cmp {op:?} {ty:?} h{a} {b:?}"))
        }
        fn select(&mut self, op: CmpOp, ty: CmpType, a: u32, b: Option<u32>, t: u32, f: u32) -> u32 {
            self.value(format!("select {op:?} {ty:?} h{a} {b:?} h{t} h{f}"))
        }
        fn conv(&mut self, to: OpType, from: OpType, src: u32) -> u32 {
            self.value(format!("conv {from:?}->{to:?} h{src}"))
        }
        fn copy(&mut self, src: u32) -> u32 {
            self.value(format!("copy h{src}"))
        }
        fn ld_var(&mut self, ty: OpType, var: VarHandle) -> u32 {
            self.value(format!("ldvar {ty:?} v{}", var.0))
        }
        fn st_var(&mut self, var: VarHandle, value: u32) {
            self.effect(format!("stvar v{} h{value}", var.0));
        }
        fn branch(&mut self, op: CmpOp, ty: CmpType, a: u32, b: Option<u32>) {
            self.effect(format!("branch {op:?} {ty:?} h{a} {b:?}"));
        }
        fn switch(&mut self, index: u32, targets: &[u32]) {
            self.effect(format!("switch h{index} {targets:?}"));
        }
        fn ret(&mut self, value: Option<u32>) {
            self.effect(format!("ret {value:?}"));
        }
        fn throw(&mut self, obj: u32) {
            self.effect(format!("throw h{obj}"));
        }
        fn call(&mut self, target: CallTarget<u32>, args: &[u32], ret: OpType) -> Option<u32> {
            let text = format!("call {target:?} {args:?}");
            if ret == OpType::Void {
                self.effect(text);
                None
            } else {
                Some(self.value(text))
            }
        }
        fn ld_field_addr(&mut self, obj: u32, offset: u32) -> u32 {
            self.value(format!("fieldaddr h{obj} {offset}"))
        }
        fn ld_static_addr(&mut self, _field: FieldId) -> u32 {
            self.value("staticaddr".to_string())
        }
        fn ld_elem_addr(&mut self, elem: OpType, array: u32, index: u32) -> u32 {
            self.value(format!("elemaddr {elem:?} h{array} h{index}"))
        }
        fn ld_array_base(&mut self, elem: OpType, array: u32) -> u32 {
            self.value(format!("arraybase {elem:?} h{array}"))
        }
        fn add_scaled_index(&mut self, elem: OpType, ptr: u32, index: u32) -> u32 {
            self.value(format!("scaledindex {elem:?} h{ptr} h{index}"))
        }
        fn ld_array_len(&mut self, array: u32) -> u32 {
            self.value(format!("arraylen h{array}"))
        }
        fn ld_ind(&mut self, ty: OpType, addr: u32, compress: AutoCompress) -> u32 {
            self.value(format!("ldind {ty:?} h{addr} {compress:?}"))
        }
        fn st_ind(&mut self, ty: OpType, addr: u32, value: u32, compress: AutoCompress) {
            self.effect(format!("stind {ty:?} h{addr} h{value} {compress:?}"));
        }
        fn compress_ref(&mut self, obj: u32) -> u32 {
            self.value(format!("compress h{obj}"))
        }
        fn uncompress_ref(&mut self, obj: u32) -> u32 {
            self.value(format!("uncompress h{obj}"))
        }
        fn new_obj(&mut self, _ty: TypeId) -> u32 {
            self.value("newobj".to_string())
        }
        fn new_array(&mut self, _ty: TypeId, len: u32) -> u32 {
            self.value(format!("newarray h{len}"))
        }
        fn monitor_enter(&mut self, obj: u32) {
            self.effect(format!("monenter h{obj}"));
        }
        fn monitor_exit(&mut self, obj: u32) {
            self.effect(format!("monexit h{obj}"));
        }
        fn tau_point(&mut self) -> u32 {
            self.value("tau".to_string())
        }
        fn check_null(&mut self, obj: u32) -> u32 {
            self.value(format!("checknull h{obj}"))
        }
        fn check_bounds(&mut self, len: u32, index: u32) -> u32 {
            self.value(format!("checkbounds h{len} h{index}"))
        }
        fn check_zero(&mut self, value: u32) -> u32 {
            self.value(format!("checkzero h{value}"))
        }
        fn check_cast(&mut self, obj: u32, _ty: TypeId) -> u32 {
            self.value(format!("checkcast h{obj}"))
        }
        fn static_cast(&mut self, obj: u32, _ty: TypeId) -> u32 {
            self.value(format!("staticcast h{obj}"))
        }
        fn as_type(&mut self, obj: u32, _ty: TypeId) -> u32 {
            self.value(format!("astype h{obj}"))
        }
        fn instance_of(&mut self, obj: u32, _ty: TypeId) -> u32 {
            self.value(format!("instanceof h{obj}"))
        }
        fn vec_pack(&mut self, ty: OpType, lanes: &[u32]) -> u32 {
            self.value(format!("pack {ty:?} {lanes:?}"))
        }
        fn vec_extract(&mut self, ty: OpType, vec: u32, lane: u32) -> u32 {
            self.value(format!("extract {ty:?} h{vec} {lane}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::opcode::OverflowMod;

    #[test]
    fn test_arith_op_from_modifiers() {
        assert_eq!(ArithOp::new(OpType::I4, OverflowMod::None, false), Some(ArithOp::I4));
        assert_eq!(ArithOp::new(OpType::I4, OverflowMod::Signed, false), Some(ArithOp::I4Ovf));
        assert_eq!(ArithOp::new(OpType::U4, OverflowMod::Unsigned, false), Some(ArithOp::U4Ovf));
        // Exception-never drops the check.
        assert_eq!(ArithOp::new(OpType::I4, OverflowMod::Signed, true), Some(ArithOp::I4));
        assert_eq!(ArithOp::new(OpType::I8, OverflowMod::Unsigned, false), Some(ArithOp::U8Ovf));
        assert_eq!(ArithOp::new(OpType::I, OverflowMod::Signed, false), Some(ArithOp::IOvf));
        assert_eq!(ArithOp::new(OpType::F8, OverflowMod::Signed, false), Some(ArithOp::F8));
        assert_eq!(ArithOp::new(OpType::Ref, OverflowMod::None, false), None);
        assert!(ArithOp::I8Ovf.checks_overflow());
        assert!(!ArithOp::I4.checks_overflow());
    }

    #[test]
    fn test_op_type_classification() {
        let mut tm = TypeManager::new();
        let i32_ = tm.int32();
        let obj = tm.root_object();
        let cobj = tm.compressed(obj);
        let arr = tm.array_of(i32_);
        let v4 = tm.vector(i32_, 4);
        assert_eq!(OpType::of(&tm, i32_), OpType::I4);
        assert_eq!(OpType::of(&tm, obj), OpType::Ref);
        assert_eq!(OpType::of(&tm, cobj), OpType::CompressedRef);
        assert_eq!(OpType::of(&tm, arr), OpType::Ref);
        assert_eq!(
            OpType::of(&tm, v4),
            OpType::Vector {
                elem_bits: 32,
                lanes: 4,
                float: false
            }
        );
        assert_eq!(OpType::of(&tm, v4).size(), 16);
        assert_eq!(OpType::of(&tm, tm.tau()), OpType::Tau);
    }

    #[test]
    fn test_div_and_cmp_types() {
        assert_eq!(DivOp::new(OpType::I4, true), Some(DivOp::I4));
        assert_eq!(DivOp::new(OpType::U8, false), Some(DivOp::U8));
        assert_eq!(DivOp::new(OpType::Ref, true), None);
        assert_eq!(CmpType::new(OpType::Ptr), Some(CmpType::I));
        assert_eq!(CmpType::new(OpType::Tau), None);
        assert_eq!(CmpOp::Zero.negate(), Some(CmpOp::NonZero));
        assert_eq!(CmpOp::Gt.negate(), None);
    }
}
