//! Instructions and operands.

use super::arena::Id;
use super::method::{BlockId, EdgeId};
use super::opcode::{Modifier, Opcode};
use super::types::{FieldId, MethodId, TypeId};
use smallvec::SmallVec;

pub type InstId = Id<Inst>;
pub type OpndId = Id<Opnd>;

// =============================================================================
// Operands
// =============================================================================

/// Storage class of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpndKind {
    /// Single-assignment temporary.
    Temp,
    /// A mutable variable, accessed through `LdVar`/`StVar`.
    Var,
    /// One SSA version of a variable, defined by `StVar` or `Phi`.
    SsaVar { var: OpndId },
}

#[derive(Debug, Clone)]
pub struct Opnd {
    pub ty: TypeId,
    pub kind: OpndKind,
    /// Defining instruction. `None` for variables and for undefined versions.
    pub def: Option<InstId>,
}

impl Opnd {
    pub fn is_var_like(&self) -> bool {
        !matches!(self.kind, OpndKind::Temp)
    }

    /// Base variable of an SSA version, or the variable itself.
    pub fn base_var(&self, me: OpndId) -> OpndId {
        match self.kind {
            OpndKind::SsaVar { var } => var,
            _ => me,
        }
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Literal value of `LdConstant`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
}

/// Runtime helpers reachable through `VmHelperCall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmHelper {
    AllocObject,
    AllocArray,
    ThrowNullPointer,
    ThrowIndexOutOfBounds,
    ArrayCopy,
    IdentityHash,
    MathSqrt,
}

impl VmHelper {
    /// Helpers that neither read nor write memory visible to the method.
    pub fn is_alloc_safe(self) -> bool {
        matches!(self, VmHelper::AllocObject | VmHelper::AllocArray | VmHelper::MathSqrt)
    }

    pub fn name(self) -> &'static str {
        match self {
            VmHelper::AllocObject => "alloc_object",
            VmHelper::AllocArray => "alloc_array",
            VmHelper::ThrowNullPointer => "throw_npe",
            VmHelper::ThrowIndexOutOfBounds => "throw_aioobe",
            VmHelper::ArrayCopy => "array_copy",
            VmHelper::IdentityHash => "identity_hash",
            VmHelper::MathSqrt => "sqrt",
        }
    }
}

/// Opcode-specific immediate data.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    Const(ConstValue),
    /// Target type of casts and guards, allocated type of `NewObj`/`NewArray`.
    Type(TypeId),
    Field(FieldId),
    Method(MethodId),
    Helper(VmHelper),
    /// Argument position of `DefArg`.
    Arg(u32),
    /// Lane of `VecExtract`.
    Lane(u32),
    /// String-table index of `LdRef`.
    Str(u32),
    /// Case edges of `Switch`; the last one is the default.
    Cases(SmallVec<[EdgeId; 4]>),
}

// =============================================================================
// Instruction
// =============================================================================

#[derive(Debug, Clone)]
pub struct Inst {
    pub opcode: Opcode,
    pub modifier: Modifier,
    /// Result type, `void` when there is no destination.
    pub ty: TypeId,
    pub dst: Option<OpndId>,
    pub srcs: SmallVec<[OpndId; 4]>,
    pub payload: Payload,
    /// Containing block; `INVALID` once unlinked.
    pub block: BlockId,
    /// Bytecode offset the instruction was generated from.
    pub bc_offset: Option<u32>,
}

impl Inst {
    #[inline]
    pub fn src(&self, i: usize) -> OpndId {
        self.srcs[i]
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.block.is_valid()
    }

    pub fn type_payload(&self) -> Option<TypeId> {
        match self.payload {
            Payload::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn const_payload(&self) -> Option<ConstValue> {
        match self.payload {
            Payload::Const(c) => Some(c),
            _ => None,
        }
    }
}
